//! Closure-based problem definition.
//!
//! Implementing [`NonlinearProblem`] is the primary way of defining a
//! problem, but it requires a type per problem. This module offers a
//! structural alternative assembled from closures, linear constraint rows
//! and bounds, convenient for one-off problems and for porting code that
//! describes problems as data:
//!
//! ```rust
//! use sqopt::{Nlp, SqpDriver};
//!
//! // Minimize x1 + x2 on the unit disk.
//! let nlp = Nlp::builder(2, |x| x[0] + x[1])
//!     .with_nonlinear(1, 0, |x, gx| gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0)
//!     .build()?;
//!
//! let mut driver = SqpDriver::builder(&nlp).with_initial(vec![0.0, 0.0]).build()?;
//! let report = driver.solve();
//! # Ok::<(), sqopt::SqpError>(())
//! ```
//!
//! Constraints are ordered as linear equalities, nonlinear equalities,
//! linear inequalities, nonlinear inequalities; multipliers in the final
//! report follow the same order.

use nalgebra::{
    storage::{Storage, StorageMut},
    DMatrix, DVector, DimName, Dyn, IsContiguous, Matrix, OMatrix, OVector, Vector, U1,
};

use crate::core::{Domain, NonlinearProblem, Problem, RealField};
use crate::derivatives::{step_size, DiffOptions};
use crate::driver::SqpError;

type ObjectiveFn<T> = Box<dyn Fn(&DVector<T>) -> T>;
type GradientFn<T> = Box<dyn Fn(&DVector<T>, &mut DVector<T>)>;
type ConstraintsFn<T> = Box<dyn Fn(&DVector<T>, &mut DVector<T>)>;
type JacobianFn<T> = Box<dyn Fn(&DVector<T>, &mut DMatrix<T>)>;
type HessianFn<T> = Box<dyn Fn(&DVector<T>, &DVector<T>, &mut DMatrix<T>)>;

/// A problem assembled from closures, linear constraint rows and bounds.
///
/// Build instances with [`Nlp::builder`].
pub struct Nlp<T: RealField + Copy> {
    n: usize,
    objective: ObjectiveFn<T>,
    gradient: Option<GradientFn<T>>,
    lin_eq: Option<(DMatrix<T>, DVector<T>)>,
    lin_in: Option<(DMatrix<T>, DVector<T>)>,
    nonlinear: Option<NonlinearBlock<T>>,
    hessian: Option<HessianFn<T>>,
    bounds: Option<(Vec<T>, Vec<T>)>,
}

struct NonlinearBlock<T: RealField + Copy> {
    m: usize,
    m_eq: usize,
    constraints: ConstraintsFn<T>,
    jacobian: Option<JacobianFn<T>>,
}

impl<T: RealField + Copy> Nlp<T> {
    /// Starts building a problem with `n` variables and given objective.
    pub fn builder(
        n: usize,
        objective: impl Fn(&DVector<T>) -> T + 'static,
    ) -> NlpBuilder<T> {
        NlpBuilder {
            nlp: Nlp {
                n,
                objective: Box::new(objective),
                gradient: None,
                lin_eq: None,
                lin_in: None,
                nonlinear: None,
                hessian: None,
                bounds: None,
            },
        }
    }

    fn counts(&self) -> BlockCounts {
        BlockCounts {
            lin_eq: self.lin_eq.as_ref().map(|(_, b)| b.nrows()).unwrap_or(0),
            lin_in: self.lin_in.as_ref().map(|(_, b)| b.nrows()).unwrap_or(0),
            nl: self.nonlinear.as_ref().map(|b| b.m).unwrap_or(0),
            nl_eq: self.nonlinear.as_ref().map(|b| b.m_eq).unwrap_or(0),
        }
    }
}

#[derive(Clone, Copy)]
struct BlockCounts {
    lin_eq: usize,
    lin_in: usize,
    nl: usize,
    nl_eq: usize,
}

impl BlockCounts {
    fn total(&self) -> usize {
        self.lin_eq + self.lin_in + self.nl
    }

    /// Maps a row of the nonlinear block to its position in the combined
    /// constraint vector.
    fn scatter(&self, row: usize) -> usize {
        if row < self.nl_eq {
            self.lin_eq + row
        } else {
            self.lin_eq + self.nl_eq + self.lin_in + (row - self.nl_eq)
        }
    }
}

/// Builder for [`Nlp`].
pub struct NlpBuilder<T: RealField + Copy> {
    nlp: Nlp<T>,
}

impl<T: RealField + Copy> NlpBuilder<T> {
    /// Provides the analytic gradient of the objective. Forward differences
    /// are used otherwise.
    pub fn with_gradient(
        mut self,
        gradient: impl Fn(&DVector<T>, &mut DVector<T>) + 'static,
    ) -> Self {
        self.nlp.gradient = Some(Box::new(gradient));
        self
    }

    /// Adds linear equality constraints `a x = b`.
    pub fn with_linear_eq(mut self, a: DMatrix<T>, b: DVector<T>) -> Self {
        self.nlp.lin_eq = Some((a, b));
        self
    }

    /// Adds linear inequality constraints `a x <= b`.
    pub fn with_linear_ineq(mut self, a: DMatrix<T>, b: DVector<T>) -> Self {
        self.nlp.lin_in = Some((a, b));
        self
    }

    /// Adds `m` nonlinear constraints of which the first `m_eq` are
    /// equalities; the closure fills the values `g(x)` with the convention
    /// `g = 0` and `g <= 0`.
    pub fn with_nonlinear(
        mut self,
        m: usize,
        m_eq: usize,
        constraints: impl Fn(&DVector<T>, &mut DVector<T>) + 'static,
    ) -> Self {
        self.nlp.nonlinear = Some(NonlinearBlock {
            m,
            m_eq,
            constraints: Box::new(constraints),
            jacobian: None,
        });
        self
    }

    /// Provides the analytic Jacobian of the nonlinear constraints (one row
    /// per constraint, in the order given to
    /// [`with_nonlinear`](NlpBuilder::with_nonlinear)).
    pub fn with_nonlinear_jacobian(
        mut self,
        jacobian: impl Fn(&DVector<T>, &mut DMatrix<T>) + 'static,
    ) -> Self {
        if let Some(block) = self.nlp.nonlinear.as_mut() {
            block.jacobian = Some(Box::new(jacobian));
        }
        self
    }

    /// Provides the exact Hessian of the Lagrangian as a closure of the
    /// point and the multipliers (ordered like the constraints). A
    /// quasi-Newton approximation is maintained otherwise.
    pub fn with_lagrangian_hessian(
        mut self,
        hessian: impl Fn(&DVector<T>, &DVector<T>, &mut DMatrix<T>) + 'static,
    ) -> Self {
        self.nlp.hessian = Some(Box::new(hessian));
        self
    }

    /// Adds bounds `lower <= x <= upper`, with infinities for unbounded
    /// directions.
    pub fn with_bounds(mut self, lower: Vec<T>, upper: Vec<T>) -> Self {
        self.nlp.bounds = Some((lower, upper));
        self
    }

    /// Validates the dimensions and finishes the problem.
    pub fn build(self) -> Result<Nlp<T>, SqpError> {
        let nlp = self.nlp;
        let n = nlp.n;

        for (a, b) in nlp.lin_eq.iter().chain(nlp.lin_in.iter()) {
            if a.ncols() != n {
                return Err(SqpError::DimensionMismatch {
                    expected: n,
                    got: a.ncols(),
                });
            }
            if a.nrows() != b.nrows() {
                return Err(SqpError::DimensionMismatch {
                    expected: a.nrows(),
                    got: b.nrows(),
                });
            }
        }

        if let Some(block) = nlp.nonlinear.as_ref() {
            if block.m_eq > block.m {
                return Err(SqpError::DimensionMismatch {
                    expected: block.m,
                    got: block.m_eq,
                });
            }
        }

        if let Some((lower, upper)) = nlp.bounds.as_ref() {
            if lower.len() != n || upper.len() != n {
                return Err(SqpError::DimensionMismatch {
                    expected: n,
                    got: lower.len().max(upper.len()),
                });
            }
        }

        Ok(nlp)
    }
}

impl<T: RealField + Copy> Problem for Nlp<T> {
    type Field = T;

    fn domain(&self) -> Domain<T> {
        match self.bounds.as_ref() {
            Some((lower, upper)) => Domain::rect(lower.clone(), upper.clone()),
            None => Domain::unconstrained(self.n),
        }
    }
}

impl<T: RealField + Copy> NonlinearProblem for Nlp<T> {
    fn objective<Sx>(&self, x: &Vector<T, Dyn, Sx>) -> T
    where
        Sx: Storage<T, Dyn> + IsContiguous,
    {
        (self.objective)(&x.clone_owned())
    }

    fn num_constraints(&self) -> usize {
        self.counts().total()
    }

    fn num_eq(&self) -> usize {
        let counts = self.counts();
        counts.lin_eq + counts.nl_eq
    }

    fn constraints<Sx, Sg>(&self, x: &Vector<T, Dyn, Sx>, gx: &mut Vector<T, Dyn, Sg>)
    where
        Sx: Storage<T, Dyn> + IsContiguous,
        Sg: StorageMut<T, Dyn>,
    {
        let counts = self.counts();
        let x = x.clone_owned();

        if let Some((a, b)) = self.lin_eq.as_ref() {
            let values = a * &x - b;
            for (i, value) in values.iter().enumerate() {
                gx[i] = *value;
            }
        }

        if let Some((a, b)) = self.lin_in.as_ref() {
            let values = a * &x - b;
            for (i, value) in values.iter().enumerate() {
                gx[counts.lin_eq + counts.nl_eq + i] = *value;
            }
        }

        if let Some(block) = self.nonlinear.as_ref() {
            let mut values = OVector::zeros_generic(Dyn(block.m), U1::name());
            (block.constraints)(&x, &mut values);
            for (row, value) in values.iter().enumerate() {
                gx[counts.scatter(row)] = *value;
            }
        }
    }

    fn gradient<Sx, Sg>(
        &self,
        x: &Vector<T, Dyn, Sx>,
        fx: T,
        grad: &mut Vector<T, Dyn, Sg>,
        diff: &DiffOptions<T>,
    ) where
        Sx: Storage<T, Dyn> + IsContiguous,
        Sg: StorageMut<T, Dyn>,
    {
        match self.gradient.as_ref() {
            Some(gradient) => {
                let mut out = OVector::zeros_generic(Dyn(self.n), U1::name());
                gradient(&x.clone_owned(), &mut out);
                for (i, value) in out.iter().enumerate() {
                    grad[i] = *value;
                }
            }
            None => crate::derivatives::objective_gradient(self, x, fx, grad, diff),
        }
    }

    fn jacobian<Sx, Sg, Sj>(
        &self,
        x: &Vector<T, Dyn, Sx>,
        gx: &Vector<T, Dyn, Sg>,
        jac: &mut Matrix<T, Dyn, Dyn, Sj>,
        diff: &DiffOptions<T>,
    ) where
        Sx: Storage<T, Dyn> + IsContiguous,
        Sg: Storage<T, Dyn>,
        Sj: StorageMut<T, Dyn, Dyn>,
    {
        let counts = self.counts();
        let n = self.n;

        // Linear rows are exact regardless of the differencing options.
        if let Some((a, _)) = self.lin_eq.as_ref() {
            for i in 0..a.nrows() {
                for j in 0..n {
                    jac[(i, j)] = a[(i, j)];
                }
            }
        }

        if let Some((a, _)) = self.lin_in.as_ref() {
            for i in 0..a.nrows() {
                for j in 0..n {
                    jac[(counts.lin_eq + counts.nl_eq + i, j)] = a[(i, j)];
                }
            }
        }

        let block = match self.nonlinear.as_ref() {
            Some(block) => block,
            None => return,
        };

        if let Some(jacobian) = block.jacobian.as_ref() {
            let mut rows = OMatrix::zeros_generic(Dyn(block.m), Dyn(n));
            jacobian(&x.clone_owned(), &mut rows);
            for row in 0..block.m {
                for j in 0..n {
                    jac[(counts.scatter(row), j)] = rows[(row, j)];
                }
            }
            return;
        }

        // Forward differences of the nonlinear block only. The values in `x`
        // are recovered from `gx` to avoid re-evaluating the closure.
        let mut x = x.clone_owned();
        let mut values = OVector::zeros_generic(Dyn(block.m), U1::name());

        for j in 0..n {
            let xj = x[j];
            let step = step_size(xj, diff);

            x[j] = xj + step;
            (block.constraints)(&x, &mut values);
            x[j] = xj;

            for row in 0..block.m {
                let at = counts.scatter(row);
                jac[(at, j)] = (values[row] - gx[at]) / step;
            }
        }
    }

    fn lagrangian_hessian<Sx, Sv>(
        &self,
        x: &Vector<T, Dyn, Sx>,
        v: &Vector<T, Dyn, Sv>,
        h: &mut OMatrix<T, Dyn, Dyn>,
    ) -> bool
    where
        Sx: Storage<T, Dyn> + IsContiguous,
        Sv: Storage<T, Dyn>,
    {
        match self.hessian.as_ref() {
            Some(hessian) => {
                hessian(&x.clone_owned(), &v.clone_owned(), h);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SqpDriver, Status};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn unit_disk_from_closures() {
        let nlp = Nlp::builder(2, |x| x[0] + x[1])
            .with_gradient(|_, grad| {
                grad[0] = 1.0;
                grad[1] = 1.0;
            })
            .with_nonlinear(1, 0, |x, gx| gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0)
            .with_nonlinear_jacobian(|x, jac| {
                jac[(0, 0)] = 2.0 * x[0];
                jac[(0, 1)] = 2.0 * x[1];
            })
            .build()
            .unwrap();

        let mut driver = SqpDriver::builder(&nlp)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        let expected = -(0.5f64).sqrt();
        assert_abs_diff_eq!(report.x, dvector![expected, expected], epsilon = 1e-4);
    }

    #[test]
    fn linear_inequality_projection() {
        // Projecting (2, 3) onto the half-plane x1 + x2 <= 1 gives (0, 1).
        let nlp = Nlp::<f64>::builder(2, |x| (x[0] - 2.0).powi(2) + (x[1] - 3.0).powi(2))
            .with_linear_ineq(dmatrix![1.0, 1.0], dvector![1.0])
            .build()
            .unwrap();

        let mut driver = SqpDriver::builder(&nlp)
            .with_initial(vec![0.0, 0.0])
            .build()
            .unwrap();

        let report = driver.solve();

        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x, dvector![0.0, 1.0], epsilon = 1e-4);
    }

    #[test]
    fn constraint_ordering_is_equalities_first() {
        let nlp = Nlp::builder(2, |x| x[0])
            .with_linear_eq(dmatrix![1.0, 0.0], dvector![1.0])
            .with_linear_ineq(dmatrix![0.0, 1.0], dvector![2.0])
            .with_nonlinear(2, 1, |x, gx| {
                gx[0] = x[0] * x[1];
                gx[1] = x[0] - x[1];
            })
            .build()
            .unwrap();

        assert_eq!(nlp.num_constraints(), 4);
        assert_eq!(nlp.num_eq(), 2);

        let x = dvector![3.0, 5.0];
        let mut gx = dvector![0.0, 0.0, 0.0, 0.0];
        nlp.constraints(&x, &mut gx);

        // Linear eq, nonlinear eq, linear ineq, nonlinear ineq.
        assert_abs_diff_eq!(gx, dvector![2.0, 15.0, 3.0, -2.0]);
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        let result = Nlp::<f64>::builder(2, |x| x[0])
            .with_linear_eq(dmatrix![1.0, 0.0, 0.0], dvector![1.0])
            .build();

        assert!(result.is_err());
    }
}
