//! Finite-difference fallbacks for derivative-based computations.
//!
//! The solver consumes gradients and constraint Jacobians through the
//! [`NonlinearProblem`] trait whose derivative methods default to the forward
//! differences implemented here. Problems with analytic derivatives override
//! those methods and this module is bypassed entirely.

use getset::{CopyGetters, Setters};
use log::warn;
use nalgebra::{
    storage::{Storage, StorageMut},
    ComplexField as _, DimName, Dyn, IsContiguous, Matrix, OMatrix, OVector, RealField as _,
    Vector, U1,
};
use num_traits::One;

use crate::core::{NonlinearProblem, RealField};

/// Options for finite-difference approximations.
#[derive(Debug, Clone, Copy, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct DiffOptions<T: RealField + Copy> {
    /// Relative perturbation. Default: `sqrt(EPSILON)`.
    eps: T,
    /// Minimum absolute perturbation. Default: `0`.
    step_min: T,
    /// Maximum absolute perturbation. Default: `infinity`.
    step_max: T,
}

impl<T: RealField + Copy> Default for DiffOptions<T> {
    fn default() -> Self {
        Self {
            eps: T::EPSILON_SQRT,
            step_min: T::zero(),
            step_max: T::from_subset(&f64::INFINITY),
        }
    }
}

/// Computes the forward-difference step for a variable.
///
/// We would like to have the step as small as possible (to be as close to the
/// real derivative as possible), but a very small step causes
/// f(x + e_j step_j) ~= f(x) with a very small number of good digits. A
/// reasonable balance is scaling the step by the magnitude of x_j itself,
/// clamped to the configured bounds. Variable scaling (see
/// [`scaling`](crate::scaling)) brings poorly scaled problems to unit order
/// before this heuristic applies.
pub(crate) fn step_size<T: RealField + Copy>(xj: T, diff: &DiffOptions<T>) -> T {
    let step = (diff.eps * xj.abs().max(T::one()))
        .max(diff.step_min)
        .min(diff.step_max);
    let step = if step == T::zero() { diff.eps } else { step };
    step * T::one().copysign(xj)
}

/// Approximates the gradient of the objective by forward differences.
///
/// `fx` must be the objective value in `x`.
pub fn objective_gradient<F, Sx, Sg>(
    f: &F,
    x: &Vector<F::Field, Dyn, Sx>,
    fx: F::Field,
    grad: &mut Vector<F::Field, Dyn, Sg>,
    diff: &DiffOptions<F::Field>,
) where
    F: NonlinearProblem + ?Sized,
    Sx: Storage<F::Field, Dyn> + IsContiguous,
    Sg: StorageMut<F::Field, Dyn>,
{
    let mut x = x.clone_owned();

    for j in 0..x.nrows() {
        let xj = x[j];
        let step = step_size(xj, diff);

        x[j] = xj + step;
        let fxj = f.objective(&x);
        x[j] = xj;

        grad[j] = (fxj - fx) / step;
    }
}

/// Approximates the constraint Jacobian (one row per constraint) by forward
/// differences.
///
/// `gx` must hold the constraint values in `x`.
pub fn constraint_jacobian<F, Sx, Sg, Sj>(
    f: &F,
    x: &Vector<F::Field, Dyn, Sx>,
    gx: &Vector<F::Field, Dyn, Sg>,
    jac: &mut Matrix<F::Field, Dyn, Dyn, Sj>,
    diff: &DiffOptions<F::Field>,
) where
    F: NonlinearProblem + ?Sized,
    Sx: Storage<F::Field, Dyn> + IsContiguous,
    Sg: Storage<F::Field, Dyn>,
    Sj: StorageMut<F::Field, Dyn, Dyn>,
{
    let m = gx.nrows();
    if m == 0 {
        return;
    }

    let mut x = x.clone_owned();
    let mut gxj = OVector::zeros_generic(Dyn(m), U1::name());

    for j in 0..x.nrows() {
        let xj = x[j];
        let step = step_size(xj, diff);

        x[j] = xj + step;
        f.constraints(&x, &mut gxj);
        x[j] = xj;

        for i in 0..m {
            jac[(i, j)] = (gxj[i] - gx[i]) / step;
        }
    }
}

/// Compares the problem's derivative methods against finite differences in
/// given point and logs a warning for every discrepancy found.
///
/// Returns `false` when any component disagrees beyond a loose tolerance
/// proportional to `cbrt(EPSILON)`. For problems that do not override the
/// derivative methods this check passes trivially.
pub fn check_derivatives<F>(f: &F, x: &OVector<F::Field, Dyn>, diff: &DiffOptions<F::Field>) -> bool
where
    F: NonlinearProblem + ?Sized,
{
    let n = x.nrows();
    let m = f.num_constraints();
    let tol = F::Field::EPSILON_CBRT;

    let fx = f.objective(x);
    let mut grad = OVector::zeros_generic(Dyn(n), U1::name());
    let mut grad_fd = grad.clone_owned();
    f.gradient(x, fx, &mut grad, diff);
    objective_gradient(f, x, fx, &mut grad_fd, diff);

    let mut consistent = true;

    for j in 0..n {
        let denom = F::Field::one().max(grad_fd[j].abs());
        if (grad[j] - grad_fd[j]).abs() / denom > tol {
            warn!(
                "gradient component {} differs from finite difference: {} vs {}",
                j, grad[j], grad_fd[j]
            );
            consistent = false;
        }
    }

    if m > 0 {
        let mut gx = OVector::zeros_generic(Dyn(m), U1::name());
        f.constraints(x, &mut gx);

        let mut jac = OMatrix::zeros_generic(Dyn(m), Dyn(n));
        let mut jac_fd = jac.clone_owned();
        f.jacobian(x, &gx, &mut jac, diff);
        constraint_jacobian(f, x, &gx, &mut jac_fd, diff);

        for i in 0..m {
            for j in 0..n {
                let denom = F::Field::one().max(jac_fd[(i, j)].abs());
                if (jac[(i, j)] - jac_fd[(i, j)]).abs() / denom > tol {
                    warn!(
                        "jacobian component ({}, {}) differs from finite difference: {} vs {}",
                        i,
                        j,
                        jac[(i, j)],
                        jac_fd[(i, j)]
                    );
                    consistent = false;
                }
            }
        }
    }

    consistent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Domain, Problem};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, storage::Storage};

    struct MixedVars;

    impl Problem for MixedVars {
        type Field = f64;

        fn domain(&self) -> Domain<Self::Field> {
            Domain::unconstrained(2)
        }
    }

    impl NonlinearProblem for MixedVars {
        fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
        where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
        {
            // A simple, arbitrary function with non-trivial cross terms.
            let x1 = x[0];
            let x2 = x[1];

            x1.powi(2) + x1 * x2 + x2.powi(3)
        }

        fn num_constraints(&self) -> usize {
            2
        }

        fn constraints<Sx, Sg>(
            &self,
            x: &Vector<Self::Field, Dyn, Sx>,
            gx: &mut Vector<Self::Field, Dyn, Sg>,
        ) where
            Sx: Storage<Self::Field, Dyn> + IsContiguous,
            Sg: StorageMut<Self::Field, Dyn>,
        {
            gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0;
            gx[1] = x[0] - x[1];
        }
    }

    #[test]
    fn mixed_vars_gradient() {
        let x = dvector![3.0, -3.0];
        let diff = DiffOptions::default();

        let f = MixedVars;
        let fx = f.objective(&x);

        let mut grad = dvector![0.0, 0.0];
        objective_gradient(&f, &x, fx, &mut grad, &diff);

        let expected = dvector![3.0, 30.0];
        assert_abs_diff_eq!(grad, expected, epsilon = 1e-5);
    }

    #[test]
    fn mixed_vars_jacobian() {
        let x = dvector![3.0, -3.0];
        let diff = DiffOptions::default();

        let f = MixedVars;
        let mut gx = dvector![0.0, 0.0];
        f.constraints(&x, &mut gx);

        let mut jac = dmatrix![0.0, 0.0; 0.0, 0.0];
        constraint_jacobian(&f, &x, &gx, &mut jac, &diff);

        let expected = dmatrix![6.0, -6.0; 1.0, -1.0];
        assert_abs_diff_eq!(jac, expected, epsilon = 1e-5);
    }

    #[test]
    fn derivative_check_passes_for_defaults() {
        let x = dvector![0.5, 0.25];
        assert!(check_derivatives(&MixedVars, &x, &DiffOptions::default()));
    }
}
