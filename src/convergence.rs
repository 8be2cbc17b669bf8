//! Convergence tests for the iteration.
//!
//! All policies combine a stationarity measure with a feasibility measure,
//! they differ in which quantities they compare against which tolerances.
//! The default policy follows the Karush-Kuhn-Tucker optimality measure
//! `|s' grad f| + sum |v_i g_i|`, which vanishes in a point satisfying the
//! first-order optimality conditions.

use nalgebra::{Dyn, OVector};

use crate::core::RealField;

/// Policy deciding when the iteration has converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvergencePolicy {
    /// Schittkowski's test: optimality measure below the objective tolerance
    /// and summed violation below its square root.
    Schittkowski,
    /// A conservative test on halved direction norm and slope together with
    /// the violation tolerance.
    Grace,
    /// Step change, optimality measure and violation each below their
    /// tolerance.
    #[default]
    Standard,
    /// Like [`Standard`](ConvergencePolicy::Standard), with the Lagrangian
    /// gradient norm replacing the optimality measure. Useful when the
    /// optimality measure stalls above the tolerance on ill-conditioned
    /// problems.
    LagrangianNorm,
}

/// Per-iteration quantities consumed by the convergence tests.
#[derive(Debug, Clone, Copy)]
pub struct Metrics<T: RealField + Copy> {
    /// Optimality measure `|s' grad f| + sum |v_i g_i|`.
    pub kkt: T,
    /// Sum of constraint violations.
    pub sum_violation: T,
    /// Largest constraint violation.
    pub max_violation: T,
    /// Largest component of the proposed direction.
    pub direction_max: T,
    /// Largest component of the taken step.
    pub step_max: T,
    /// Objective slope along the direction.
    pub grad_dot_s: T,
    /// Norm of the Lagrangian gradient.
    pub lagrangian_norm: T,
}

/// Tolerances for the convergence tests.
#[derive(Debug, Clone, Copy)]
pub struct Tolerances<T: RealField + Copy> {
    /// Tolerance on the step in the variables.
    pub tol_x: T,
    /// Tolerance on the optimality measure.
    pub tol_f: T,
    /// Tolerance on the constraint violation.
    pub tol_con: T,
}

/// Computes the optimality measure and violation statistics.
pub fn measure<T: RealField + Copy>(
    grad_dot_s: T,
    gx: &OVector<T, Dyn>,
    v: &OVector<T, Dyn>,
    num_eq: usize,
) -> (T, T, T) {
    let mut kkt = grad_dot_s.abs();
    let mut sum_violation = T::zero();
    let mut max_violation = T::zero();

    for (i, gi) in gx.iter().enumerate() {
        kkt += (v[i] * *gi).abs();

        let viol = if i < num_eq { gi.abs() } else { gi.max(T::zero()) };
        sum_violation += viol;
        max_violation = max_violation.max(viol);
    }

    (kkt, sum_violation, max_violation)
}

/// Decides whether the iteration has converged under given policy.
pub fn converged<T: RealField + Copy>(
    policy: ConvergencePolicy,
    metrics: &Metrics<T>,
    tol: &Tolerances<T>,
) -> bool {
    let half = T::from_subset(&0.5);

    match policy {
        ConvergencePolicy::Schittkowski => {
            metrics.kkt <= tol.tol_f && metrics.sum_violation <= tol.tol_f.sqrt()
        }
        ConvergencePolicy::Grace => {
            half * metrics.direction_max < tol.tol_x
                && half * metrics.grad_dot_s.abs() < tol.tol_f
                && metrics.max_violation < tol.tol_con
        }
        ConvergencePolicy::Standard => {
            metrics.step_max <= tol.tol_x
                && metrics.kkt <= tol.tol_f
                && metrics.max_violation <= tol.tol_con
        }
        ConvergencePolicy::LagrangianNorm => {
            metrics.step_max <= tol.tol_x
                && metrics.lagrangian_norm <= tol.tol_f
                && metrics.max_violation <= tol.tol_con
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    fn stationary() -> Metrics<f64> {
        Metrics {
            kkt: 1e-9,
            sum_violation: 1e-8,
            max_violation: 1e-8,
            direction_max: 1e-9,
            step_max: 1e-9,
            grad_dot_s: -1e-9,
            lagrangian_norm: 1e-8,
        }
    }

    #[test]
    fn optimality_measure() {
        let gx = dvector![0.5, -0.25];
        let v = dvector![2.0, 0.0];

        let (kkt, sum_violation, max_violation) = measure(-0.125, &gx, &v, 1);

        assert_abs_diff_eq!(kkt, 0.125 + 1.0);
        assert_abs_diff_eq!(sum_violation, 0.5);
        assert_abs_diff_eq!(max_violation, 0.5);
    }

    #[test]
    fn all_policies_accept_a_stationary_point() {
        let tol = Tolerances {
            tol_x: 1e-6,
            tol_f: 1e-6,
            tol_con: 1e-6,
        };

        for policy in [
            ConvergencePolicy::Schittkowski,
            ConvergencePolicy::Grace,
            ConvergencePolicy::Standard,
            ConvergencePolicy::LagrangianNorm,
        ] {
            assert!(converged(policy, &stationary(), &tol));
        }
    }

    #[test]
    fn standard_rejects_violated_constraints() {
        let tol = Tolerances {
            tol_x: 1e-6,
            tol_f: 1e-6,
            tol_con: 1e-6,
        };

        let metrics = Metrics {
            max_violation: 1e-3,
            sum_violation: 1e-3,
            ..stationary()
        };

        assert!(!converged(ConvergencePolicy::Standard, &metrics, &tol));
        // Schittkowski tolerates violation up to sqrt(tol_f).
        assert!(converged(ConvergencePolicy::Schittkowski, &metrics, &tol));
    }
}
