//! Merit functions and the backtracking line search.
//!
//! The search direction from the quadratic subproblem trades off objective
//! decrease against constraint violation, so plain objective comparison
//! cannot decide the step length. A scalar merit function combines both and
//! the step is accepted by an Armijo condition on the merit value. Two merit
//! functions are available, the exact L1 penalty and the augmented
//! Lagrangian, both driven by penalty weights kept consistent with the
//! multiplier estimates by Powell's update rule.

use log::debug;
use nalgebra::{convert, storage::StorageMut, DimName, Dyn, OVector, RealField as _, Vector, U1};
use num_traits::{One, Zero};

use crate::core::{NonlinearProblem, RealField};

/// Merit function used by the line search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeritKind {
    /// Exact L1 penalty `f + sum mu_i |g_i|` over violated constraints.
    #[default]
    ExactPenalty,
    /// Augmented Lagrangian with multiplier terms and quadratic penalty.
    AugmentedLagrangian,
}

/// Merit function state: penalty weights and multiplier estimates.
#[derive(Debug, Clone)]
pub struct Merit<T: RealField + Copy> {
    kind: MeritKind,
    num_eq: usize,
    mu: OVector<T, Dyn>,
    v: OVector<T, Dyn>,
    rho: T,
}

impl<T: RealField + Copy> Merit<T> {
    /// Creates the merit state for a problem with `m` constraints of which
    /// the first `num_eq` are equalities.
    pub fn new(kind: MeritKind, m: usize, num_eq: usize, initial_mu: T, rho: T) -> Self {
        Self {
            kind,
            num_eq,
            mu: OVector::from_element_generic(Dyn(m), U1::name(), initial_mu),
            v: OVector::zeros_generic(Dyn(m), U1::name()),
            rho,
        }
    }

    /// Current penalty weights.
    pub fn weights(&self) -> &OVector<T, Dyn> {
        &self.mu
    }

    /// Reconciles the penalty weights with fresh multiplier estimates.
    ///
    /// Powell's rule `mu_i = max(|v_i|, (mu_i + |v_i|) / 2)` lets a weight
    /// decrease only gradually while keeping it at least as large as the
    /// current multiplier, which keeps the search direction a descent
    /// direction for the merit function.
    pub fn update_weights(&mut self, v: &OVector<T, Dyn>) {
        let half = T::from_subset(&0.5);

        for (mui, vi) in self.mu.iter_mut().zip(v.iter()) {
            *mui = vi.abs().max(half * (*mui + vi.abs()));
        }

        self.v.copy_from(v);
        debug!("penalty weights: {:?}", self.mu.as_slice());
    }

    /// Evaluates the merit function from objective and constraint values.
    pub fn eval(&self, fx: T, gx: &OVector<T, Dyn>) -> T {
        let half = T::from_subset(&0.5);

        match self.kind {
            MeritKind::ExactPenalty => {
                let mut phi = fx;
                for (i, gi) in gx.iter().enumerate() {
                    let viol = if i < self.num_eq { gi.abs() } else { gi.max(T::zero()) };
                    phi += self.mu[i] * viol;
                }
                phi
            }
            MeritKind::AugmentedLagrangian => {
                let mut phi = fx;
                for (i, gi) in gx.iter().enumerate() {
                    let vi = self.v[i];
                    if i < self.num_eq || *gi >= -vi / self.rho {
                        phi += vi * *gi + half * self.rho * *gi * *gi;
                    } else {
                        phi -= half * vi * vi / self.rho;
                    }
                }
                phi
            }
        }
    }

    /// Directional derivative of the merit function along the search
    /// direction.
    ///
    /// `grad_dot_s` is the objective slope and `js` the product of the
    /// constraint Jacobian with the direction, both in the current point.
    pub fn slope(&self, grad_dot_s: T, gx: &OVector<T, Dyn>, js: &OVector<T, Dyn>) -> T {
        match self.kind {
            MeritKind::ExactPenalty => {
                let mut d = grad_dot_s;
                for (i, gi) in gx.iter().enumerate() {
                    let viol = if i < self.num_eq { gi.abs() } else { gi.max(T::zero()) };
                    d -= self.mu[i] * viol;
                }
                d
            }
            MeritKind::AugmentedLagrangian => {
                let mut d = grad_dot_s;
                for (i, gi) in gx.iter().enumerate() {
                    let vi = self.v[i];
                    if i < self.num_eq || *gi >= -vi / self.rho {
                        d += (vi + self.rho * *gi) * js[i];
                    }
                }
                d
            }
        }
    }
}

/// Result of the backtracking line search.
#[derive(Debug, Clone)]
pub struct LineSearch<T: RealField + Copy> {
    /// Accepted step length, zero when no decrease was found.
    pub alpha: T,
    /// Objective value in the accepted point.
    pub fx: T,
    /// Constraint values in the accepted point.
    pub gx: OVector<T, Dyn>,
    /// Number of function evaluations spent.
    pub evals: usize,
    /// Whether the merit function decreased.
    pub decreased: bool,
    /// Whether the evaluation budget ran out before the Armijo condition
    /// held.
    pub exhausted: bool,
}

/// Backtracks along `s` from `x` until the Armijo condition on the merit
/// function holds or the evaluation budget runs out.
///
/// When the budget runs out, the best evaluated point is returned if it
/// decreases the merit function at all; otherwise a zero step is reported.
#[allow(clippy::too_many_arguments)]
pub fn backtrack<F: NonlinearProblem>(
    f: &F,
    x: &OVector<F::Field, Dyn>,
    s: &OVector<F::Field, Dyn>,
    fx0: F::Field,
    gx0: &OVector<F::Field, Dyn>,
    grad_dot_s: F::Field,
    js: &OVector<F::Field, Dyn>,
    merit: &Merit<F::Field>,
    armijo: F::Field,
    max_evals: usize,
) -> LineSearch<F::Field> {
    let half: F::Field = convert(0.5);
    let m = gx0.nrows();

    let phi0 = merit.eval(fx0, gx0);
    // A non-negative slope can only happen in (or numerically at) a
    // stationary point. Accepting any non-increase keeps the step well
    // defined there.
    let slope = merit.slope(grad_dot_s, gx0, js).min(F::Field::zero());

    let mut alpha = F::Field::one();
    let mut evals = 0;
    let mut best: Option<(F::Field, F::Field, OVector<F::Field, Dyn>, F::Field)> = None;

    while evals < max_evals.max(1) {
        let trial = x + s * alpha;
        let fx = f.objective(&trial);
        let mut gx = OVector::zeros_generic(Dyn(m), U1::name());
        eval_constraints(f, &trial, &mut gx);
        evals += 1;

        let phi = merit.eval(fx, &gx);

        if phi <= phi0 + armijo * alpha * slope {
            debug!("step length {} accepted after {} evaluations", alpha, evals);
            return LineSearch {
                alpha,
                fx,
                gx,
                evals,
                decreased: true,
                exhausted: false,
            };
        }

        if best.as_ref().map(|(_, _, _, p)| phi < *p).unwrap_or(true) {
            best = Some((alpha, fx, gx, phi));
        }

        alpha *= half;
    }

    match best {
        Some((alpha, fx, gx, phi)) if phi < phi0 => {
            debug!("evaluation budget exhausted, best step length {}", alpha);
            LineSearch {
                alpha,
                fx,
                gx,
                evals,
                decreased: true,
                exhausted: true,
            }
        }
        _ => {
            debug!("no decrease of the merit function found");
            LineSearch {
                alpha: F::Field::zero(),
                fx: fx0,
                gx: gx0.clone_owned(),
                evals,
                decreased: false,
                exhausted: true,
            }
        }
    }
}

fn eval_constraints<F: NonlinearProblem, Sg: StorageMut<F::Field, Dyn>>(
    f: &F,
    x: &OVector<F::Field, Dyn>,
    gx: &mut Vector<F::Field, Dyn, Sg>,
) {
    if f.num_constraints() > 0 {
        f.constraints(x, gx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Domain, Problem};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dvector, storage::Storage, DVector, IsContiguous};

    struct Quadratic;

    impl Problem for Quadratic {
        type Field = f64;

        fn domain(&self) -> Domain<Self::Field> {
            Domain::unconstrained(1)
        }
    }

    impl NonlinearProblem for Quadratic {
        fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
        where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
        {
            x[0] * x[0]
        }
    }

    #[test]
    fn powell_update() {
        let mut merit = Merit::new(MeritKind::ExactPenalty, 2, 0, 1.0, 10.0);

        merit.update_weights(&dvector![5.0, 0.0]);
        assert_abs_diff_eq!(merit.weights()[0], 5.0);
        assert_abs_diff_eq!(merit.weights()[1], 0.5);

        // A dropped multiplier lowers the weight only halfway.
        merit.update_weights(&dvector![0.0, 0.0]);
        assert_abs_diff_eq!(merit.weights()[0], 2.5);
        assert_abs_diff_eq!(merit.weights()[1], 0.25);
    }

    #[test]
    fn exact_penalty_value() {
        let merit = Merit::new(MeritKind::ExactPenalty, 2, 1, 2.0, 10.0);
        let gx = dvector![-0.5, 0.25];

        // Equality violated by 0.5, inequality by 0.25, both weighted by 2.
        assert_abs_diff_eq!(merit.eval(1.0, &gx), 1.0 + 1.0 + 0.5);
    }

    #[test]
    fn augmented_lagrangian_inactive_branch() {
        let mut merit = Merit::new(MeritKind::AugmentedLagrangian, 1, 0, 1.0, 2.0);
        merit.update_weights(&dvector![4.0]);

        // Strictly satisfied inequality (g < -v / rho) contributes the
        // constant term only.
        assert_abs_diff_eq!(merit.eval(3.0, &dvector![-5.0]), 3.0 - 4.0);
    }

    #[test]
    fn overshooting_direction_is_halved() {
        let x = dvector![1.0];
        let s = dvector![-2.0];
        let fx0 = 1.0;
        let gx0 = DVector::zeros(0);
        let js = DVector::zeros(0);
        let merit = Merit::new(MeritKind::ExactPenalty, 0, 0, 1.0, 10.0);

        let ls = backtrack(&Quadratic, &x, &s, fx0, &gx0, -4.0, &js, &merit, 1e-4, 20);

        assert!(ls.decreased);
        assert_abs_diff_eq!(ls.alpha, 0.5);
        assert_abs_diff_eq!(ls.fx, 0.0);
    }

    #[test]
    fn budget_of_one_reports_no_decrease() {
        let x = dvector![1.0];
        let s = dvector![-4.0];
        let gx0 = DVector::zeros(0);
        let js = DVector::zeros(0);
        let merit = Merit::new(MeritKind::ExactPenalty, 0, 0, 1.0, 10.0);

        let ls = backtrack(&Quadratic, &x, &s, 1.0, &gx0, -8.0, &js, &merit, 1e-4, 1);

        assert!(!ls.decreased);
        assert!(ls.exhausted);
        assert_abs_diff_eq!(ls.alpha, 0.0);
        assert_abs_diff_eq!(ls.fx, 1.0);
    }
}
