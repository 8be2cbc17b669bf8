//! Testing problems with known solutions.
//!
//! This module contains a small collection of optimization problems used by
//! the tests of this crate and handy for experimenting with the solver. Each
//! problem documents its minimizer; the [`TestProblem`] extension provides it
//! programmatically together with sensible starting points.

use nalgebra::{
    storage::{Storage, StorageMut},
    DVector, Dyn, IsContiguous, OMatrix, Vector,
};

use crate::core::{Domain, NonlinearProblem, Problem};
use crate::derivatives::DiffOptions;

/// Extension of [`NonlinearProblem`] with the known solution and starting
/// points.
pub trait TestProblem: NonlinearProblem<Field = f64> {
    /// Standard starting points for the problem.
    fn initials(&self) -> Vec<DVector<f64>>;

    /// The known minimizer.
    fn optimum(&self) -> DVector<f64>;
}

/// Shifted paraboloid `(x1 - a)^2 + (x2 - b)^2` with analytic gradient.
///
/// The minimizer is `(a, b)`.
#[derive(Debug, Clone, Copy)]
pub struct Paraboloid {
    a: f64,
    b: f64,
}

impl Paraboloid {
    /// Creates the paraboloid centered at `(a, b)`.
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }
}

impl Default for Paraboloid {
    fn default() -> Self {
        Self::new(2.0, 3.0)
    }
}

impl Problem for Paraboloid {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::unconstrained(2)
    }
}

impl NonlinearProblem for Paraboloid {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        (x[0] - self.a).powi(2) + (x[1] - self.b).powi(2)
    }

    fn gradient<Sx, Sg>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        _fx: Self::Field,
        grad: &mut Vector<Self::Field, Dyn, Sg>,
        _diff: &DiffOptions<Self::Field>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: StorageMut<Self::Field, Dyn>,
    {
        grad[0] = 2.0 * (x[0] - self.a);
        grad[1] = 2.0 * (x[1] - self.b);
    }
}

impl TestProblem for Paraboloid {
    fn initials(&self) -> Vec<DVector<f64>> {
        vec![DVector::from_vec(vec![0.0, 0.0])]
    }

    fn optimum(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.a, self.b])
    }
}

/// Linear objective `x1 + x2` over the unit disk `x1^2 + x2^2 <= 1`.
///
/// The minimizer is `(-sqrt(1/2), -sqrt(1/2))` with the constraint active and
/// multiplier `sqrt(1/2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitDisk;

impl Problem for UnitDisk {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::unconstrained(2)
    }
}

impl NonlinearProblem for UnitDisk {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        x[0] + x[1]
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
        gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0;
    }
}

impl TestProblem for UnitDisk {
    fn initials(&self) -> Vec<DVector<f64>> {
        vec![DVector::from_vec(vec![0.0, 0.0])]
    }

    fn optimum(&self) -> DVector<f64> {
        let c = -(0.5f64).sqrt();
        DVector::from_vec(vec![c, c])
    }
}

/// Nearest point to the origin on the line `x1 + x2 = 1`.
///
/// The minimizer of `x1^2 + x2^2` is `(1/2, 1/2)` with the equality
/// multiplier `-1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestPointOnLine;

impl Problem for NearestPointOnLine {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::unconstrained(2)
    }
}

impl NonlinearProblem for NearestPointOnLine {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        x[0] * x[0] + x[1] * x[1]
    }

    fn num_constraints(&self) -> usize {
        1
    }

    fn num_eq(&self) -> usize {
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
        gx[0] = x[0] + x[1] - 1.0;
    }
}

impl TestProblem for NearestPointOnLine {
    fn initials(&self) -> Vec<DVector<f64>> {
        vec![DVector::from_vec(vec![0.0, 0.0])]
    }

    fn optimum(&self) -> DVector<f64> {
        DVector::from_vec(vec![0.5, 0.5])
    }
}

/// Linear objective `x1` on the box `x1 >= 1`.
///
/// Unbounded without the box; the bound makes the minimizer `1` with the
/// bound active.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellInBox;

impl Problem for WellInBox {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::rect(vec![1.0], vec![f64::INFINITY])
    }
}

impl NonlinearProblem for WellInBox {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        x[0]
    }
}

impl TestProblem for WellInBox {
    fn initials(&self) -> Vec<DVector<f64>> {
        vec![DVector::from_vec(vec![5.0])]
    }

    fn optimum(&self) -> DVector<f64> {
        DVector::from_vec(vec![1.0])
    }
}

/// [Rosenbrock](https://en.wikipedia.org/wiki/Rosenbrock_function) valley
/// `(a - x1)^2 + b (x2 - x1^2)^2`.
///
/// The minimizer is `(a, a^2)` at the bottom of a curved, badly conditioned
/// valley.
#[derive(Debug, Clone, Copy)]
pub struct Rosenbrock {
    a: f64,
    b: f64,
}

impl Rosenbrock {
    /// Creates the function with given coefficients; `new(1.0, 100.0)` is
    /// the classic variant.
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }
}

impl Default for Rosenbrock {
    fn default() -> Self {
        Self::new(1.0, 100.0)
    }
}

impl Problem for Rosenbrock {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::unconstrained(2)
    }
}

impl NonlinearProblem for Rosenbrock {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        (self.a - x[0]).powi(2) + self.b * (x[1] - x[0] * x[0]).powi(2)
    }
}

impl TestProblem for Rosenbrock {
    fn initials(&self) -> Vec<DVector<f64>> {
        vec![DVector::from_vec(vec![-1.2, 1.0])]
    }

    fn optimum(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.a, self.a * self.a])
    }
}

/// Convex quadratic `1/2 x' Q x + b' x` providing the exact Hessian.
///
/// With the exact Hessian the solver takes one Newton step to the minimizer
/// `-Q^-1 b`.
#[derive(Debug, Clone)]
pub struct ConvexQuadratic {
    q: OMatrix<f64, Dyn, Dyn>,
    b: DVector<f64>,
}

impl ConvexQuadratic {
    /// Creates the problem from a symmetric positive definite `q`.
    pub fn new(q: OMatrix<f64, Dyn, Dyn>, b: DVector<f64>) -> Self {
        Self { q, b }
    }
}

impl Problem for ConvexQuadratic {
    type Field = f64;

    fn domain(&self) -> Domain<Self::Field> {
        Domain::unconstrained(self.b.nrows())
    }
}

impl NonlinearProblem for ConvexQuadratic {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        let x = x.clone_owned();
        0.5 * (&self.q * &x).dot(&x) + self.b.dot(&x)
    }

    fn gradient<Sx, Sg>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        _fx: Self::Field,
        grad: &mut Vector<Self::Field, Dyn, Sg>,
        _diff: &DiffOptions<Self::Field>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: StorageMut<Self::Field, Dyn>,
    {
        grad.copy_from(&(&self.q * &x.clone_owned() + &self.b));
    }

    fn lagrangian_hessian<Sx, Sv>(
        &self,
        _x: &Vector<Self::Field, Dyn, Sx>,
        _v: &Vector<Self::Field, Dyn, Sv>,
        h: &mut OMatrix<Self::Field, Dyn, Dyn>,
    ) -> bool
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sv: Storage<Self::Field, Dyn>,
    {
        h.copy_from(&self.q);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SqpDriver, Status};

    use approx::assert_abs_diff_eq;
    use nalgebra::dmatrix;

    fn solve_from_initials<F: TestProblem>(f: &F) {
        for x0 in f.initials() {
            let mut driver = SqpDriver::builder(f)
                .with_initial(x0.iter().copied().collect())
                .build()
                .unwrap();

            let report = driver.solve();

            assert_eq!(report.status, Status::Converged);
            assert_abs_diff_eq!(report.x, f.optimum(), epsilon = 1e-3);
        }
    }

    #[test]
    fn known_solutions_are_found() {
        solve_from_initials(&Paraboloid::default());
        solve_from_initials(&UnitDisk);
        solve_from_initials(&NearestPointOnLine);
        solve_from_initials(&WellInBox);
    }

    #[test]
    fn exact_hessian_problem_converges_fast() {
        let f = ConvexQuadratic::new(dmatrix![4.0, 1.0; 1.0, 3.0], DVector::from_vec(vec![-1.0, -2.0]));

        let mut driver = SqpDriver::builder(&f)
            .with_initial(vec![3.0, -4.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        // x = -Q^-1 b = (1/11, 7/11).
        assert_abs_diff_eq!(report.x[0], 1.0 / 11.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.x[1], 7.0 / 11.0, epsilon = 1e-6);
        assert!(report.counters.iterations <= 5);
    }
}
