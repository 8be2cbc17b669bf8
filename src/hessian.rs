//! Damped quasi-Newton approximation of the Lagrangian Hessian.
//!
//! The quadratic subproblems need a positive definite model of the Lagrangian
//! curvature. A plain BFGS update breaks down on constrained problems where
//! the Lagrangian can have negative curvature along the step, so the update
//! is damped in Powell's manner: the gradient difference is blended with the
//! model prediction until the curvature condition holds. An update that would
//! still lose positive definiteness (through roundoff) is rejected and the
//! previous approximation kept.

use log::debug;
use nalgebra::{Dyn, OMatrix, OVector};

use crate::core::RealField;

/// Outcome of a quasi-Newton update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// The standard BFGS update was applied.
    Applied,
    /// The gradient difference was damped to preserve positive definiteness.
    Damped,
    /// The update was skipped and the previous approximation kept.
    Skipped,
}

/// Applies the damped BFGS update to the approximation `h`.
///
/// `d` is the taken step in the variables and `y` the difference of
/// Lagrangian gradients across the step. The update keeps `h` symmetric
/// positive definite; when that cannot be guaranteed, `h` is left unchanged
/// and [`Update::Skipped`] returned.
pub fn damped_bfgs<T: RealField + Copy>(
    h: &mut OMatrix<T, Dyn, Dyn>,
    d: &OVector<T, Dyn>,
    y: &OVector<T, Dyn>,
) -> Update {
    let one_fifth = T::from_subset(&0.2);
    let four_fifths = T::from_subset(&0.8);

    let hd = &*h * d;
    let dhd = d.dot(&hd);

    // A vanishing step carries no curvature information.
    if !(dhd > T::EPSILON * d.norm_squared().max(T::EPSILON)) {
        return Update::Skipped;
    }

    let dy = d.dot(y);

    let (r, damped) = if dy >= one_fifth * dhd {
        (y.clone_owned(), false)
    } else {
        // Powell damping: r = theta y + (1 - theta) H d keeps d'r at
        // one fifth of d'Hd.
        let theta = four_fifths * dhd / (dhd - dy);
        debug!("damping quasi-Newton update (theta = {})", theta);
        (y * theta + &hd * (T::one() - theta), true)
    };

    let dr = d.dot(&r);
    if !(dr > T::zero()) {
        return Update::Skipped;
    }

    let mut candidate = h.clone_owned();

    // H <- H - (H d)(H d)' / d'Hd + r r' / d'r
    for i in 0..candidate.nrows() {
        for j in 0..candidate.ncols() {
            candidate[(i, j)] += r[i] * r[j] / dr - hd[i] * hd[j] / dhd;
        }
    }

    // Symmetrize to counter roundoff drift.
    for i in 0..candidate.nrows() {
        for j in 0..i {
            let avg = (candidate[(i, j)] + candidate[(j, i)])
                * T::from_subset(&0.5);
            candidate[(i, j)] = avg;
            candidate[(j, i)] = avg;
        }
    }

    if candidate.clone_owned().cholesky().is_none() {
        debug!("quasi-Newton update rejected, approximation not positive definite");
        return Update::Skipped;
    }

    *h = candidate;

    if damped {
        Update::Damped
    } else {
        Update::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn secant_condition_holds_for_plain_update() {
        let mut h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let d = dvector![1.0, 0.5];
        let y = dvector![2.0, 1.5];

        assert_eq!(damped_bfgs(&mut h, &d, &y), Update::Applied);
        assert_abs_diff_eq!(&h * &d, y, epsilon = 1e-12);
    }

    #[test]
    fn negative_curvature_is_damped() {
        let mut h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let d = dvector![1.0, 0.0];
        let y = dvector![-1.0, 0.0];

        assert_eq!(damped_bfgs(&mut h, &d, &y), Update::Damped);
        assert!(h.clone().cholesky().is_some());
    }

    #[test]
    fn zero_step_is_skipped() {
        let mut h = dmatrix![2.0, 0.0; 0.0, 3.0];
        let before = h.clone();
        let d = dvector![0.0, 0.0];
        let y = dvector![1.0, 1.0];

        assert_eq!(damped_bfgs(&mut h, &d, &y), Update::Skipped);
        assert_eq!(h, before);
    }

    #[test]
    fn approximation_stays_positive_definite() {
        let mut h = dmatrix![1.0, 0.0; 0.0, 1.0];

        let steps = [
            (dvector![0.8, -0.1], dvector![1.1, 0.2]),
            (dvector![-0.3, 0.5], dvector![-0.2, -0.9]),
            (dvector![0.1, 0.1], dvector![0.4, -0.3]),
        ];

        for (d, y) in steps {
            damped_bfgs(&mut h, &d, &y);
            assert!(h.clone().cholesky().is_some());
        }
    }
}
