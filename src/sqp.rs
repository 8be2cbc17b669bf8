//! Sequential quadratic programming iteration.
//!
//! Each step linearizes the constraints and models the Lagrangian curvature
//! by a positive definite quasi-Newton approximation, solves the resulting
//! [quadratic subproblem](crate::qp) for a search direction and multiplier
//! estimates, and globalizes the step by a [merit line
//! search](crate::linesearch). See [`Sqp`] for the per-iteration state and
//! [`SqpOptions`] for the knobs.
//!
//! This module drives a single iteration; the outer loop with budgets,
//! scaling and reporting lives in [`driver`](crate::driver).

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{
    convert,
    storage::StorageMut,
    ComplexField as _, DimName, Dyn, IsContiguous, OMatrix, OVector, Vector, U1,
};
use num_traits::{One, Zero};

use crate::convergence::{self, ConvergencePolicy, Metrics, Tolerances};
use crate::core::{Domain, NonlinearProblem, Problem, RealField};
use crate::derivatives::DiffOptions;
use crate::hessian::{self, Update};
use crate::linesearch::{self, Merit, MeritKind};
use crate::qp;

/// Options of the SQP iteration.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct SqpOptions<T: RealField + Copy> {
    /// Convergence test. Default: [`ConvergencePolicy::Standard`].
    policy: ConvergencePolicy,
    /// Merit function for the line search. Default:
    /// [`MeritKind::ExactPenalty`].
    merit: MeritKind,
    /// Tolerance on the step in the variables. Default: `1e-6`.
    tol_x: T,
    /// Tolerance on the optimality measure. Default: `1e-6`.
    tol_f: T,
    /// Tolerance on the constraint violation. Default: `1e-6`.
    tol_con: T,
    /// Armijo sufficient decrease coefficient. Default: `1e-4`.
    armijo: T,
    /// Initial penalty weight of the merit function. Default: `1`.
    initial_penalty: T,
    /// Quadratic penalty of the augmented Lagrangian merit. Default: `10`.
    penalty_rho: T,
    /// Maximum number of function evaluations per line search. Default: `20`.
    max_linesearch_evals: usize,
    /// Maximum number of iterations of the outer loop. Default: `100`.
    max_iterations: usize,
    /// Maximum total number of function evaluations. Default: `10000`.
    max_fun_evals: usize,
    /// Whether to compare provided derivatives against finite differences in
    /// the initial point. Default: `false`.
    check_derivatives: bool,
    /// Whether to scale the variables to unit magnitude internally. Default:
    /// `false`.
    scale_variables: bool,
    /// Magnitude above which objective and constraint values are scaled to
    /// unit order. Default: `infinity` (disabled).
    function_scale_threshold: T,
    /// Finite-difference options.
    diff: DiffOptions<T>,
}

impl<T: RealField + Copy> Default for SqpOptions<T> {
    fn default() -> Self {
        Self {
            policy: ConvergencePolicy::default(),
            merit: MeritKind::default(),
            tol_x: convert(1e-6),
            tol_f: convert(1e-6),
            tol_con: convert(1e-6),
            armijo: convert(1e-4),
            initial_penalty: T::one(),
            penalty_rho: convert(10.0),
            max_linesearch_evals: 20,
            max_iterations: 100,
            max_fun_evals: 10_000,
            check_derivatives: false,
            scale_variables: false,
            function_scale_threshold: T::from_subset(&f64::INFINITY),
            diff: DiffOptions::default(),
        }
    }
}

impl<T: RealField + Copy> SqpOptions<T> {
    /// Builds options from a positional array of numeric settings, with zero
    /// meaning "keep the default".
    ///
    /// The indices are: 0 `tol_x`, 1 `tol_f`, 2 `tol_con`, 3 convergence
    /// policy (1 Schittkowski, 2 Grace, 3 standard, 4 Lagrangian norm), 4
    /// merit function (1 exact penalty, 2 augmented Lagrangian), 5 maximum
    /// iterations, 6 maximum function evaluations, 7 maximum line search
    /// evaluations, 8 derivative check, 9 variable scaling, 10 function
    /// scale threshold, 11 finite-difference perturbation, 12 minimum and 13
    /// maximum finite-difference step. Trailing entries can be omitted.
    pub fn from_legacy(values: &[f64]) -> Self {
        let mut options = Self::default();

        for (index, &value) in values.iter().enumerate() {
            if value == 0.0 {
                continue;
            }

            match index {
                0 => options.tol_x = convert(value),
                1 => options.tol_f = convert(value),
                2 => options.tol_con = convert(value),
                3 => {
                    options.policy = match value as i64 {
                        1 => ConvergencePolicy::Schittkowski,
                        2 => ConvergencePolicy::Grace,
                        4 => ConvergencePolicy::LagrangianNorm,
                        _ => ConvergencePolicy::Standard,
                    }
                }
                4 => {
                    options.merit = match value as i64 {
                        2 => MeritKind::AugmentedLagrangian,
                        _ => MeritKind::ExactPenalty,
                    }
                }
                5 => options.max_iterations = value as usize,
                6 => options.max_fun_evals = value as usize,
                7 => options.max_linesearch_evals = value as usize,
                8 => options.check_derivatives = true,
                9 => options.scale_variables = true,
                10 => options.function_scale_threshold = convert(value),
                11 => {
                    options.diff.set_eps(convert(value));
                }
                12 => {
                    options.diff.set_step_min(convert(value));
                }
                13 => {
                    options.diff.set_step_max(convert(value));
                }
                _ => {}
            }
        }

        options
    }
}

/// Outcome of one SQP iteration.
#[derive(Debug, Clone)]
pub struct Iteration<T: RealField + Copy> {
    /// Objective value after the step.
    pub fx: T,
    /// Whether the convergence test passed.
    pub converged: bool,
    /// Accepted step length.
    pub alpha: T,
    /// Optimality measure after the step.
    pub kkt: T,
    /// Largest constraint violation after the step.
    pub max_violation: T,
    /// Largest component of the taken step.
    pub step_max: T,
    /// Whether the search direction came from the elastic relaxation.
    pub modified_direction: bool,
    /// What happened to the Hessian approximation.
    pub hessian_update: Update,
    /// Whether the line search found a decrease of the merit function.
    pub decreased: bool,
    /// Function evaluations spent by this iteration.
    pub fun_evals: usize,
    /// Gradient evaluations spent by this iteration.
    pub grad_evals: usize,
}

/// SQP iteration state.
pub struct Sqp<F: Problem> {
    options: SqpOptions<F::Field>,
    fx: F::Field,
    gx: OVector<F::Field, Dyn>,
    grad: OVector<F::Field, Dyn>,
    jac: OMatrix<F::Field, Dyn, Dyn>,
    hess: OMatrix<F::Field, Dyn, Dyn>,
    v: OVector<F::Field, Dyn>,
    merit: Merit<F::Field>,
    num_eq: usize,
    evaluated: bool,
}

impl<F: NonlinearProblem> Sqp<F> {
    /// Initializes the iteration with default options.
    pub fn new(f: &F, dom: &Domain<F::Field>) -> Self {
        Self::with_options(f, dom, SqpOptions::default())
    }

    /// Initializes the iteration with given options.
    pub fn with_options(f: &F, dom: &Domain<F::Field>, options: SqpOptions<F::Field>) -> Self {
        let n = dom.dim();
        let m = f.num_constraints();

        let merit = Merit::new(
            options.merit,
            m,
            f.num_eq(),
            options.initial_penalty,
            options.penalty_rho,
        );

        Self {
            options,
            fx: F::Field::zero(),
            gx: OVector::zeros_generic(Dyn(m), U1::name()),
            grad: OVector::zeros_generic(Dyn(n), U1::name()),
            jac: OMatrix::zeros_generic(Dyn(m), Dyn(n)),
            hess: OMatrix::identity_generic(Dyn(n), Dyn(n)),
            v: OVector::zeros_generic(Dyn(m), U1::name()),
            merit,
            num_eq: f.num_eq(),
            evaluated: false,
        }
    }

    /// Replaces the initial Hessian approximation (identity by default).
    ///
    /// The matrix must be symmetric positive definite.
    pub fn with_initial_hessian(mut self, h: OMatrix<F::Field, Dyn, Dyn>) -> Self {
        self.hess = h;
        self
    }

    /// Replaces the initial multiplier estimates (zeros by default).
    pub fn with_initial_multipliers(mut self, v: OVector<F::Field, Dyn>) -> Self {
        self.v = v;
        self
    }

    /// Gets the options.
    pub fn options(&self) -> &SqpOptions<F::Field> {
        &self.options
    }

    /// Current multiplier estimates.
    pub fn multipliers(&self) -> &OVector<F::Field, Dyn> {
        &self.v
    }

    /// Current Hessian approximation.
    pub fn hessian(&self) -> &OMatrix<F::Field, Dyn, Dyn> {
        &self.hess
    }

    /// Performs one iteration, updating `x` in place.
    pub fn next<Sx>(
        &mut self,
        f: &F,
        dom: &Domain<F::Field>,
        x: &mut Vector<F::Field, Dyn, Sx>,
    ) -> Iteration<F::Field>
    where
        Sx: StorageMut<F::Field, Dyn> + IsContiguous,
    {
        let n = x.nrows();
        let m = f.num_constraints();
        let me = self.num_eq;
        let mi = m - me;
        let zero = F::Field::zero();

        let mut fun_evals = 0;
        let mut grad_evals = 0;

        if !self.evaluated {
            self.fx = f.objective(x);
            if m > 0 {
                f.constraints(x, &mut self.gx);
            }
            fun_evals += 1;

            f.gradient(x, self.fx, &mut self.grad, &self.options.diff);
            if m > 0 {
                f.jacobian(x, &self.gx, &mut self.jac, &self.options.diff);
            }
            grad_evals += 1;

            self.evaluated = true;
        }

        // Problems providing the exact Lagrangian Hessian bypass the
        // quasi-Newton approximation entirely, so the very first direction is
        // already the Newton step.
        let exact_hessian = f.lagrangian_hessian(x, &self.v, &mut self.hess);

        // Linearized constraints with the variable bounds folded in as extra
        // inequality rows on the direction.
        let a_eq = self.jac.rows(0, me).clone_owned();
        let b_eq = self.gx.rows(0, me).clone_owned();

        let lower = dom.lower();
        let upper = dom.upper();
        let nb_upper = (0..n).filter(|&j| upper[j].is_finite()).count();
        let nb_lower = (0..n).filter(|&j| lower[j].is_finite()).count();

        let mut a_in = OMatrix::zeros_generic(Dyn(mi + nb_upper + nb_lower), Dyn(n));
        let mut b_in = OVector::zeros_generic(Dyn(mi + nb_upper + nb_lower), U1::name());

        for i in 0..mi {
            for j in 0..n {
                a_in[(i, j)] = self.jac[(me + i, j)];
            }
            b_in[i] = self.gx[me + i];
        }

        let mut row = mi;
        for j in 0..n {
            if upper[j].is_finite() {
                a_in[(row, j)] = F::Field::one();
                b_in[row] = x[j] - upper[j];
                row += 1;
            }
        }
        for j in 0..n {
            if lower[j].is_finite() {
                a_in[(row, j)] = -F::Field::one();
                b_in[row] = lower[j] - x[j];
                row += 1;
            }
        }

        let qp = qp::solve(&self.hess, &self.grad, &a_eq, &b_eq, &a_in, &b_in);

        // Multiplier estimates of the problem constraints (the bound rows
        // stay internal to the subproblem).
        for i in 0..me {
            self.v[i] = qp.eq[i];
        }
        for i in 0..mi {
            self.v[me + i] = qp.ineq[i];
        }

        self.merit.update_weights(&self.v);

        let grad_dot_s = self.grad.dot(&qp.s);
        let js = if m > 0 {
            &self.jac * &qp.s
        } else {
            OVector::zeros_generic(Dyn(0), U1::name())
        };

        let ls = linesearch::backtrack(
            f,
            &x.clone_owned(),
            &qp.s,
            self.fx,
            &self.gx,
            grad_dot_s,
            &js,
            &self.merit,
            self.options.armijo,
            self.options.max_linesearch_evals,
        );
        fun_evals += ls.evals;

        let dx = &qp.s * ls.alpha;

        let mut hessian_update = Update::Skipped;

        if ls.decreased {
            // Lagrangian gradient before the step, for the quasi-Newton
            // curvature pair.
            let mut lag_old = self.grad.clone_owned();
            if m > 0 {
                lag_old += self.jac.transpose() * &self.v;
            }

            for j in 0..n {
                x[j] += dx[j];
            }
            // Guard against roundoff pushing the point out of the bounds.
            dom.project(x);

            self.fx = ls.fx;
            self.gx.copy_from(&ls.gx);

            f.gradient(x, self.fx, &mut self.grad, &self.options.diff);
            if m > 0 {
                f.jacobian(x, &self.gx, &mut self.jac, &self.options.diff);
            }
            grad_evals += 1;

            let mut lag_new = self.grad.clone_owned();
            if m > 0 {
                lag_new += self.jac.transpose() * &self.v;
            }

            hessian_update = if exact_hessian {
                Update::Applied
            } else {
                hessian::damped_bfgs(&mut self.hess, &dx, &(lag_new - lag_old))
            };
        }

        let mut lagrangian = self.grad.clone_owned();
        if m > 0 {
            lagrangian += self.jac.transpose() * &self.v;
        }

        let (kkt, sum_violation, max_violation) =
            convergence::measure(grad_dot_s, &self.gx, &self.v, me);

        let metrics = Metrics {
            kkt,
            sum_violation,
            max_violation,
            direction_max: qp.s.amax(),
            step_max: if ls.decreased { dx.amax() } else { zero },
            grad_dot_s,
            lagrangian_norm: lagrangian.norm(),
        };

        let tolerances = Tolerances {
            tol_x: self.options.tol_x,
            tol_f: self.options.tol_f,
            tol_con: self.options.tol_con,
        };

        // A direction from the elastic relaxation means the linearization was
        // infeasible, which rules the point out as a solution.
        let converged =
            !qp.modified && convergence::converged(self.options.policy, &metrics, &tolerances);

        debug!(
            "fx = {}, kkt = {}, violation = {}, alpha = {}",
            self.fx, kkt, max_violation, ls.alpha
        );

        Iteration {
            fx: self.fx,
            converged,
            alpha: ls.alpha,
            kkt,
            max_violation,
            step_max: metrics.step_max,
            modified_direction: qp.modified,
            hessian_update,
            decreased: ls.decreased,
            fun_evals,
            grad_evals,
        }
    }
}
