//! Driver for the SQP iteration with a convenient builder.
//!
//! The driver validates the inputs, owns the evaluation counters, enforces
//! the iteration and evaluation budgets, applies the optional
//! [scaling](crate::scaling) transparently and turns the iteration stream
//! into a final [`Report`]. A monitoring callback can observe every iterate
//! and abort the run.
//!
//! ## Example
//!
//! ```rust
//! use sqopt::SqpDriver;
//! # use sqopt::testing::UnitDisk;
//!
//! # let f = UnitDisk;
//! let mut driver = SqpDriver::builder(&f)
//!     .with_initial(vec![0.0, 0.0])
//!     .build()?;
//!
//! let report = driver.solve();
//! assert!(report.status.success());
//! # Ok::<(), sqopt::SqpError>(())
//! ```

use log::{debug, warn};
use nalgebra::{ComplexField as _, DimName, Dyn, OMatrix, OVector, U1};
use num_traits::{One, Zero};
use thiserror::Error;

use crate::core::{Domain, NonlinearProblem, Problem, RealField};
use crate::derivatives::check_derivatives;
use crate::scaling::{ScaledProblem, Scaling};
use crate::sqp::{Sqp, SqpOptions};

/// Error of the driver inputs, raised before the iteration starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqpError {
    /// An input has a different dimension than the problem prescribes.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension prescribed by the problem.
        expected: usize,
        /// Dimension of the offending input.
        got: usize,
    },
    /// A lower bound exceeds the corresponding upper bound or a bound is not
    /// a number.
    #[error("invalid bounds for variable {index}")]
    InvalidBounds { index: usize },
    /// An option has a nonsensical value.
    #[error("invalid option: {0}")]
    InvalidOptions(&'static str),
}

/// Termination status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The convergence test passed.
    Converged,
    /// The iteration budget ran out.
    MaxIterations,
    /// The function evaluation budget ran out.
    MaxFunctionEvaluations,
    /// The line search could not decrease the merit function.
    LineSearchFailed,
    /// The monitoring callback requested a stop.
    Aborted,
}

impl Status {
    /// Numeric code of the status: positive for success, zero or negative
    /// otherwise.
    pub fn code(&self) -> i32 {
        match self {
            Status::Converged => 1,
            Status::MaxIterations => 0,
            Status::MaxFunctionEvaluations => -1,
            Status::LineSearchFailed => -2,
            Status::Aborted => -3,
        }
    }

    /// Whether the run found a solution.
    pub fn success(&self) -> bool {
        matches!(self, Status::Converged)
    }
}

/// Work counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Number of iterations taken.
    pub iterations: usize,
    /// Number of objective and constraint evaluations.
    pub fun_evals: usize,
    /// Number of gradient and Jacobian evaluations.
    pub grad_evals: usize,
}

/// Snapshot of the iteration passed to the monitoring callback.
#[derive(Debug)]
pub struct State<'a, T: RealField + Copy> {
    /// Current point.
    pub x: &'a OVector<T, Dyn>,
    /// Current objective value.
    pub fx: T,
    /// One-based iteration number.
    pub iteration: usize,
    /// Optimality measure of the iteration.
    pub kkt: T,
    /// Largest constraint violation.
    pub max_violation: T,
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct Report<T: RealField + Copy> {
    /// Final point.
    pub x: OVector<T, Dyn>,
    /// Objective value in the final point.
    pub fx: T,
    /// Multiplier estimates of the constraints, equalities first.
    pub multipliers: OVector<T, Dyn>,
    /// Final Hessian approximation of the Lagrangian.
    pub hessian: OMatrix<T, Dyn, Dyn>,
    /// Why the run stopped.
    pub status: Status,
    /// Work spent.
    pub counters: Counters,
}

/// Builder for [`SqpDriver`].
pub struct SqpDriverBuilder<'a, F: NonlinearProblem> {
    f: &'a F,
    dom: Option<Domain<F::Field>>,
    x0: Option<Vec<F::Field>>,
    v0: Option<Vec<F::Field>>,
    h0: Option<OMatrix<F::Field, Dyn, Dyn>>,
    options: SqpOptions<F::Field>,
}

impl<'a, F: NonlinearProblem> SqpDriverBuilder<'a, F> {
    /// Overrides the domain of the problem.
    pub fn with_domain(mut self, dom: Domain<F::Field>) -> Self {
        self.dom = Some(dom);
        self
    }

    /// Sets the initial point. Defaults to the origin projected into the
    /// domain.
    pub fn with_initial(mut self, x0: Vec<F::Field>) -> Self {
        self.x0 = Some(x0);
        self
    }

    /// Sets the initial multiplier estimates. Defaults to zeros.
    pub fn with_initial_multipliers(mut self, v0: Vec<F::Field>) -> Self {
        self.v0 = Some(v0);
        self
    }

    /// Sets the initial Hessian approximation, which must be symmetric
    /// positive definite. Defaults to identity.
    pub fn with_initial_hessian(mut self, h0: OMatrix<F::Field, Dyn, Dyn>) -> Self {
        self.h0 = Some(h0);
        self
    }

    /// Sets the options.
    pub fn with_options(mut self, options: SqpOptions<F::Field>) -> Self {
        self.options = options;
        self
    }

    /// Validates the inputs and builds the driver.
    pub fn build(self) -> Result<SqpDriver<'a, F>, SqpError> {
        let dom = self.dom.unwrap_or_else(|| self.f.domain());
        let n = dom.dim();
        let m = self.f.num_constraints();

        for index in 0..n {
            let l = dom.lower()[index];
            let u = dom.upper()[index];
            // Also catches NaN bounds, which compare false with everything.
            if !(l <= u) {
                return Err(SqpError::InvalidBounds { index });
            }
        }

        let mut x = match self.x0 {
            Some(x0) => {
                if x0.len() != n {
                    return Err(SqpError::DimensionMismatch {
                        expected: n,
                        got: x0.len(),
                    });
                }
                OVector::from_iterator_generic(Dyn(n), U1::name(), x0)
            }
            None => OVector::zeros_generic(Dyn(n), U1::name()),
        };
        dom.project(&mut x);

        let v0 = match self.v0 {
            Some(v0) => {
                if v0.len() != m {
                    return Err(SqpError::DimensionMismatch {
                        expected: m,
                        got: v0.len(),
                    });
                }
                Some(OVector::from_iterator_generic(Dyn(m), U1::name(), v0))
            }
            None => None,
        };

        if let Some(h0) = self.h0.as_ref() {
            if h0.nrows() != n || h0.ncols() != n {
                return Err(SqpError::DimensionMismatch {
                    expected: n,
                    got: h0.nrows().max(h0.ncols()),
                });
            }
        }

        let zero = F::Field::zero();
        let options = &self.options;

        if !(options.tol_x() > zero && options.tol_f() > zero && options.tol_con() > zero) {
            return Err(SqpError::InvalidOptions("tolerances must be positive"));
        }
        if !(options.armijo() > zero && options.armijo() < F::Field::one()) {
            return Err(SqpError::InvalidOptions("armijo must be in (0, 1)"));
        }
        if options.max_iterations() == 0
            || options.max_fun_evals() == 0
            || options.max_linesearch_evals() == 0
        {
            return Err(SqpError::InvalidOptions("budgets must be positive"));
        }

        Ok(SqpDriver {
            f: self.f,
            dom,
            x,
            v0,
            h0: self.h0,
            options: self.options,
        })
    }
}

/// The entry point of the solver.
///
/// A driver is built by [`SqpDriver::builder`], holds the current point
/// between runs and produces a [`Report`] per run.
pub struct SqpDriver<'a, F: NonlinearProblem> {
    f: &'a F,
    dom: Domain<F::Field>,
    x: OVector<F::Field, Dyn>,
    v0: Option<OVector<F::Field, Dyn>>,
    h0: Option<OMatrix<F::Field, Dyn, Dyn>>,
    options: SqpOptions<F::Field>,
}

impl<'a, F: NonlinearProblem> SqpDriver<'a, F> {
    /// Starts building a driver for given problem.
    pub fn builder(f: &'a F) -> SqpDriverBuilder<'a, F> {
        SqpDriverBuilder {
            f,
            dom: None,
            x0: None,
            v0: None,
            h0: None,
            options: SqpOptions::default(),
        }
    }

    /// Current point, the solution estimate after a run.
    pub fn x(&self) -> &OVector<F::Field, Dyn> {
        &self.x
    }

    /// Runs the iteration until convergence or a budget runs out.
    pub fn solve(&mut self) -> Report<F::Field> {
        self.solve_with(|_| false)
    }

    /// Like [`solve`](SqpDriver::solve), invoking the callback after every
    /// iteration. Returning `true` from the callback aborts the run.
    pub fn solve_with<C>(&mut self, mut monitor: C) -> Report<F::Field>
    where
        C: FnMut(&State<'_, F::Field>) -> bool,
    {
        let n = self.dom.dim();
        let m = self.f.num_constraints();

        let mut counters = Counters::default();

        if self.options.check_derivatives() && !check_derivatives(self.f, &self.x, &self.options.diff()) {
            warn!("provided derivatives disagree with finite differences");
        }

        let function_scaling = self.options.function_scale_threshold().is_finite();

        if !self.options.scale_variables() && !function_scaling {
            let (status, fx, multipliers, hessian) = run(
                self.f,
                &self.dom,
                &mut self.x,
                &self.options,
                self.v0.as_ref(),
                self.h0.as_ref(),
                &mut counters,
                &mut monitor,
            );

            return Report {
                x: self.x.clone_owned(),
                fx,
                multipliers,
                hessian,
                status,
                counters,
            };
        }

        let mut scaling = Scaling::identity(n, m);

        if self.options.scale_variables() {
            scaling = scaling.estimate_variables(&self.dom, &self.x);
        }

        if function_scaling {
            let fx = self.f.objective(&self.x);
            let mut gx = OVector::zeros_generic(Dyn(m), U1::name());
            if m > 0 {
                self.f.constraints(&self.x, &mut gx);
            }
            counters.fun_evals += 1;

            scaling =
                scaling.estimate_functions(fx, &gx, self.options.function_scale_threshold());
        }

        let wrapped = ScaledProblem::new(self.f, scaling.clone());
        let dom = wrapped.domain();
        let mut x = scaling.scale_x(&self.x);

        // Initial estimates move to the internal space as well.
        let v0 = self.v0.as_ref().map(|v0| {
            let mut v = v0.clone_owned();
            for (vi, sgi) in v.iter_mut().zip(scaling.sg().iter()) {
                *vi *= *sgi / scaling.sf();
            }
            v
        });
        let h0 = self.h0.as_ref().map(|h0| {
            let mut h = h0.clone_owned();
            for i in 0..n {
                for j in 0..n {
                    h[(i, j)] *= scaling.sx()[i] * scaling.sx()[j] / scaling.sf();
                }
            }
            h
        });

        let mut scaled_monitor = |state: &State<'_, F::Field>| {
            let x_ext = scaling.unscale_x(state.x);
            monitor(&State {
                x: &x_ext,
                fx: state.fx * scaling.sf(),
                iteration: state.iteration,
                kkt: state.kkt,
                max_violation: state.max_violation,
            })
        };

        let (status, fx, multipliers, hessian) = run(
            &wrapped,
            &dom,
            &mut x,
            &self.options,
            v0.as_ref(),
            h0.as_ref(),
            &mut counters,
            &mut scaled_monitor,
        );

        self.x = scaling.unscale_x(&x);

        Report {
            x: self.x.clone_owned(),
            fx: fx * scaling.sf(),
            multipliers: scaling.unscale_multipliers(&multipliers),
            hessian: scaling.unscale_hessian(&hessian),
            status,
            counters,
        }
    }
}

/// The outer loop shared by the plain and the scaled run.
#[allow(clippy::too_many_arguments)]
fn run<F, C>(
    f: &F,
    dom: &Domain<F::Field>,
    x: &mut OVector<F::Field, Dyn>,
    options: &SqpOptions<F::Field>,
    v0: Option<&OVector<F::Field, Dyn>>,
    h0: Option<&OMatrix<F::Field, Dyn, Dyn>>,
    counters: &mut Counters,
    monitor: &mut C,
) -> (
    Status,
    F::Field,
    OVector<F::Field, Dyn>,
    OMatrix<F::Field, Dyn, Dyn>,
)
where
    F: NonlinearProblem,
    C: FnMut(&State<'_, F::Field>) -> bool,
{
    let mut sqp = Sqp::with_options(f, dom, options.clone());

    if let Some(v0) = v0 {
        sqp = sqp.with_initial_multipliers(v0.clone_owned());
    }
    if let Some(h0) = h0 {
        sqp = sqp.with_initial_hessian(h0.clone_owned());
    }

    let mut status = Status::MaxIterations;
    let mut fx = F::Field::zero();

    for iteration in 1..=options.max_iterations() {
        let it = sqp.next(f, dom, x);

        counters.iterations = iteration;
        counters.fun_evals += it.fun_evals;
        counters.grad_evals += it.grad_evals;
        fx = it.fx;

        if it.converged {
            debug!("converged after {} iterations", iteration);
            status = Status::Converged;
            break;
        }

        let stop = monitor(&State {
            x,
            fx,
            iteration,
            kkt: it.kkt,
            max_violation: it.max_violation,
        });

        if stop {
            status = Status::Aborted;
            break;
        }

        if counters.fun_evals >= options.max_fun_evals() {
            status = Status::MaxFunctionEvaluations;
            break;
        }

        if !it.decreased {
            status = Status::LineSearchFailed;
            break;
        }
    }

    (
        status,
        fx,
        sqp.multipliers().clone_owned(),
        sqp.hessian().clone_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NearestPointOnLine, Paraboloid, Rosenbrock, UnitDisk, WellInBox};

    use approx::assert_abs_diff_eq;
    use nalgebra::{
        dvector,
        storage::{Storage, StorageMut},
        IsContiguous, Vector,
    };

    // Unit disk problem with objective and constraint blown up far above unit
    // order, for exercising the function scaling.
    struct ScaledDisk;

    impl Problem for ScaledDisk {
        type Field = f64;

        fn domain(&self) -> Domain<Self::Field> {
            Domain::unconstrained(2)
        }
    }

    impl NonlinearProblem for ScaledDisk {
        fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
        where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
        {
            1e5 * (x[0] + x[1])
        }

        fn num_constraints(&self) -> usize {
            1
        }

        fn constraints<Sx, Sg>(
            &self,
            x: &Vector<Self::Field, Dyn, Sx>,
            gx: &mut Vector<Self::Field, Dyn, Sg>,
        ) where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
            Sg: StorageMut<Self::Field, Dyn>,
        {
            gx[0] = 4e5 * (x[0] * x[0] + x[1] * x[1] - 1.0);
        }
    }

    // The analytic gradient claims ascent is descent, so the subproblem
    // direction cannot decrease the merit function for any step length.
    struct MisleadingGradient;

    impl Problem for MisleadingGradient {
        type Field = f64;

        fn domain(&self) -> Domain<Self::Field> {
            Domain::unconstrained(1)
        }
    }

    impl NonlinearProblem for MisleadingGradient {
        fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
        where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
        {
            x[0] * x[0]
        }

        fn gradient<Sx, Sg>(
            &self,
            _x: &Vector<Self::Field, Dyn, Sx>,
            _fx: Self::Field,
            grad: &mut Vector<Self::Field, Dyn, Sg>,
            _diff: &crate::derivatives::DiffOptions<Self::Field>,
        ) where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
            Sg: StorageMut<Self::Field, Dyn>,
        {
            grad[0] = -1.0;
        }
    }

    #[test]
    fn unconstrained_paraboloid() {
        let f = Paraboloid::new(2.0, 3.0);
        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        assert_eq!(report.status.code(), 1);
        assert_abs_diff_eq!(report.x, dvector![2.0, 3.0], epsilon = 1e-4);
        assert!(report.counters.fun_evals > 0);
        assert!(report.counters.grad_evals > 0);
    }

    #[test]
    fn inequality_constrained_unit_disk() {
        let mut driver = SqpDriver::builder(&UnitDisk)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        let expected = -(0.5f64).sqrt();
        assert_abs_diff_eq!(report.x, dvector![expected, expected], epsilon = 1e-4);

        // The constraint is active with a nonnegative multiplier and
        // complementary slackness holds.
        let g = report.x[0] * report.x[0] + report.x[1] * report.x[1] - 1.0;
        assert!(report.multipliers[0] >= 0.0);
        assert_abs_diff_eq!(report.multipliers[0] * g, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn equality_constrained_line() {
        let mut driver = SqpDriver::builder(&NearestPointOnLine)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x, dvector![0.5, 0.5], epsilon = 1e-4);
        assert_abs_diff_eq!(report.multipliers[0], -1.0, epsilon = 1e-3);
    }

    #[test]
    fn active_bound() {
        let f = WellInBox;
        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![5.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x[0], 1.0, epsilon = 1e-6);
        // The final point satisfies the bounds exactly.
        assert!(report.x[0] >= 1.0);
    }

    #[test]
    fn iteration_budget() {
        let f = Rosenbrock::default();
        let mut options = SqpOptions::default();
        options.set_max_iterations(2);

        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![-1.2, 1.0])
            .with_options(options)
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::MaxIterations);
        assert_eq!(report.status.code(), 0);
        assert_eq!(report.counters.iterations, 2);
    }

    #[test]
    fn aborted_by_monitor() {
        let f = Rosenbrock::default();
        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![-1.2, 1.0])
            .build()
            .unwrap();

        let report = driver.solve_with(|state| state.iteration >= 3);

        assert_eq!(report.status, Status::Aborted);
        assert_eq!(report.status.code(), -3);
        assert_eq!(report.counters.iterations, 3);
    }

    #[test]
    fn solving_again_from_the_solution_converges_immediately() {
        let f = Paraboloid::new(2.0, 3.0);
        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let first = driver.solve();
        let second = driver.solve();

        assert_eq!(second.status, Status::Converged);
        assert_abs_diff_eq!(second.x, first.x, epsilon = 1e-6);
    }

    #[test]
    fn mismatched_initial_point_is_rejected() {
        let err = SqpDriver::builder(&UnitDisk)
            .with_initial(vec![0.0])
            .build()
            .err()
            .unwrap();

        assert_eq!(err, SqpError::DimensionMismatch { expected: 2, got: 1 });
    }

    #[test]
    fn crossed_bounds_are_rejected() {
        let f = Paraboloid::new(2.0, 3.0);
        let err = SqpDriver::builder(&f)
            .with_domain(Domain::rect(vec![1.0, 0.0], vec![-1.0, 1.0]))
            .build()
            .err()
            .unwrap();

        assert_eq!(err, SqpError::InvalidBounds { index: 0 });
    }

    #[test]
    fn invalid_tolerance_is_rejected() {
        let f = Paraboloid::new(2.0, 3.0);
        let mut options = SqpOptions::default();
        options.set_tol_x(0.0);

        let err = SqpDriver::builder(&f)
            .with_options(options)
            .build()
            .err()
            .unwrap();

        assert_eq!(err, SqpError::InvalidOptions("tolerances must be positive"));
    }

    #[test]
    fn function_evaluation_budget() {
        let f = Rosenbrock::default();
        let mut options = SqpOptions::default();
        options.set_max_fun_evals(3);

        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![-1.2, 1.0])
            .with_options(options)
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::MaxFunctionEvaluations);
        assert_eq!(report.status.code(), -1);
        assert!(report.counters.fun_evals >= 3);
    }

    #[test]
    fn failing_line_search_is_reported() {
        let mut driver = SqpDriver::builder(&MisleadingGradient)
            .with_initial(vec![2.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::LineSearchFailed);
        assert_eq!(report.status.code(), -2);
    }

    #[test]
    fn function_scaling_reaches_the_same_solution() {
        let mut options = SqpOptions::default();
        options.set_function_scale_threshold(1.0);

        let mut driver = SqpDriver::builder(&ScaledDisk)
            .with_initial(vec![-0.5, -0.5])
            .with_options(options)
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        let expected = -(0.5f64).sqrt();
        assert_abs_diff_eq!(report.x, dvector![expected, expected], epsilon = 1e-4);

        // The multiplier is reported in the external space, where the
        // stationarity condition reads 1e5 + v * 4e5 * 2 x1 = 0.
        assert_abs_diff_eq!(report.multipliers[0], (0.125f64).sqrt() / 2.0, epsilon = 1e-3);
    }

    #[test]
    fn variable_scaling_reaches_the_same_solution() {
        let f = Paraboloid::new(2.0, 3.0);
        let mut options = SqpOptions::default();
        options.set_scale_variables(true);

        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![100.0, 0.5])
            .with_options(options)
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x, dvector![2.0, 3.0], epsilon = 1e-3);
    }
}
