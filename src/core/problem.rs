use nalgebra::{
    storage::{Storage, StorageMut},
    Dyn, IsContiguous, Matrix, OMatrix, Vector,
};

use super::base::Problem;
use crate::derivatives::{constraint_jacobian, objective_gradient, DiffOptions};

/// Definition of a constrained nonlinear optimization problem.
///
/// The problem is
///
/// ```text
/// minimize f(x)
/// subject to g_i(x)  = 0   for i < num_eq,
///            g_i(x) <= 0   for num_eq <= i < num_constraints,
///            lower <= x <= upper (the domain).
/// ```
///
/// Only [`objective`](NonlinearProblem::objective) is required. A problem
/// without constraints leaves the defaults in place. The derivative methods
/// have finite-difference default implementations; override them when
/// analytic derivatives are available.
///
/// ## Defining a problem
///
/// ```rust
/// use sqopt::nalgebra as na;
/// use sqopt::{Domain, NonlinearProblem, Problem};
/// use na::{Dyn, IsContiguous};
///
/// // Minimize x1 + x2 on the unit disk.
/// struct UnitDisk;
///
/// impl Problem for UnitDisk {
///     type Field = f64;
///
///     fn domain(&self) -> Domain<Self::Field> {
///         Domain::unconstrained(2)
///     }
/// }
///
/// impl NonlinearProblem for UnitDisk {
///     fn objective<Sx>(&self, x: &na::Vector<Self::Field, Dyn, Sx>) -> Self::Field
///     where
///         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
///     {
///         x[0] + x[1]
///     }
///
///     fn num_constraints(&self) -> usize {
///         1
///     }
///
///     fn constraints<Sx, Sg>(
///         &self,
///         x: &na::Vector<Self::Field, Dyn, Sx>,
///         gx: &mut na::Vector<Self::Field, Dyn, Sg>,
///     ) where
///         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
///         Sg: na::storage::StorageMut<Self::Field, Dyn>,
///     {
///         gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0;
///     }
/// }
/// ```
pub trait NonlinearProblem: Problem {
    /// Calculates the objective value in given point.
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous;

    /// Number of constraints, equalities ordered first. Zero (the default)
    /// means an unconstrained problem, possibly up to variable bounds.
    fn num_constraints(&self) -> usize {
        0
    }

    /// Number of leading equality constraints.
    fn num_eq(&self) -> usize {
        0
    }

    /// Calculates the constraint values in given point, filling `gx` of
    /// length [`num_constraints`](NonlinearProblem::num_constraints).
    fn constraints<Sx, Sg>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        gx: &mut Vector<Self::Field, Dyn, Sg>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: StorageMut<Self::Field, Dyn>,
    {
        let _ = (x, gx);
    }

    /// Calculates the gradient of the objective in given point.
    ///
    /// The default implementation uses forward finite differences with steps
    /// determined by `diff` and needs `fx`, the objective value in `x`.
    /// Analytic implementations are free to ignore `fx` and `diff`.
    fn gradient<Sx, Sg>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        fx: Self::Field,
        grad: &mut Vector<Self::Field, Dyn, Sg>,
        diff: &DiffOptions<Self::Field>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: StorageMut<Self::Field, Dyn>,
    {
        objective_gradient(self, x, fx, grad, diff);
    }

    /// Calculates the constraint Jacobian (one row per constraint) in given
    /// point.
    ///
    /// The default implementation uses forward finite differences with steps
    /// determined by `diff` and needs `gx`, the constraint values in `x`.
    /// Analytic implementations are free to ignore `gx` and `diff`.
    fn jacobian<Sx, Sg, Sj>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        gx: &Vector<Self::Field, Dyn, Sg>,
        jac: &mut Matrix<Self::Field, Dyn, Dyn, Sj>,
        diff: &DiffOptions<Self::Field>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: Storage<Self::Field, Dyn>,
        Sj: StorageMut<Self::Field, Dyn, Dyn>,
    {
        constraint_jacobian(self, x, gx, jac, diff);
    }

    /// Calculates the exact Hessian of the Lagrangian in given point with
    /// given multipliers, returning `true` when provided.
    ///
    /// The default returns `false`, in which case the solver maintains a
    /// quasi-Newton approximation instead.
    fn lagrangian_hessian<Sx, Sv>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        v: &Vector<Self::Field, Dyn, Sv>,
        h: &mut OMatrix<Self::Field, Dyn, Dyn>,
    ) -> bool
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sv: Storage<Self::Field, Dyn>,
    {
        let _ = (x, v, h);
        false
    }
}
