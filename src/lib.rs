#![allow(clippy::many_single_char_names)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

//! # Sqopt
//!
//! A pure Rust implementation of sequential quadratic programming (SQP) for
//! smooth constrained nonlinear optimization.
//!
//! The solver minimizes a nonlinear objective subject to nonlinear equality
//! and inequality constraints and bounds on the variables. Derivatives can be
//! provided analytically or approximated by finite differences, and every
//! component of the iteration (merit function, convergence policy, scaling,
//! budgets) is configurable through options.
//!
//! ## Problem
//!
//! Mathematically, the problem is formulated as
//!
//! ```text
//! minimize f(x)
//! subject to g_i(x)  = 0   for the equality constraints,
//!            g_i(x) <= 0   for the inequality constraints,
//!            L <= x <= U   for some bounds [L, U].
//! ```
//!
//! The bounds can be negative/positive infinity, effectively making the
//! variable unconstrained.
//!
//! When it comes to code, the problem is any type that implements the
//! [`NonlinearProblem`] and [`Problem`] traits.
//!
//! ```rust
//! // Sqopt is based on `nalgebra` crate.
//! use sqopt::nalgebra as na;
//! use sqopt::{Domain, NonlinearProblem, Problem};
//! use na::{Dyn, IsContiguous};
//!
//! // A problem is represented by a type.
//! struct UnitDisk;
//!
//! impl Problem for UnitDisk {
//!     // The numeric type. Usually f64 or f32.
//!     type Field = f64;
//!
//!     // The domain of the problem: dimensionality and optional bounds.
//!     fn domain(&self) -> Domain<Self::Field> {
//!         Domain::unconstrained(2)
//!     }
//! }
//!
//! impl NonlinearProblem for UnitDisk {
//!     // Minimize x1 + x2 ...
//!     fn objective<Sx>(&self, x: &na::Vector<Self::Field, Dyn, Sx>) -> Self::Field
//!     where
//!         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//!     {
//!         x[0] + x[1]
//!     }
//!
//!     fn num_constraints(&self) -> usize {
//!         1
//!     }
//!
//!     // ... subject to x1^2 + x2^2 - 1 <= 0.
//!     fn constraints<Sx, Sg>(
//!         &self,
//!         x: &na::Vector<Self::Field, Dyn, Sx>,
//!         gx: &mut na::Vector<Self::Field, Dyn, Sg>,
//!     ) where
//!         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//!         Sg: na::storage::StorageMut<Self::Field, Dyn>,
//!     {
//!         gx[0] = x[0] * x[0] + x[1] * x[1] - 1.0;
//!     }
//! }
//! ```
//!
//! Derivatives are approximated by forward differences unless the
//! [`gradient`](NonlinearProblem::gradient),
//! [`jacobian`](NonlinearProblem::jacobian) or
//! [`lagrangian_hessian`](NonlinearProblem::lagrangian_hessian) methods are
//! overridden with analytic implementations.
//!
//! ## Solving
//!
//! The easiest way to solve a problem is the [driver](SqpDriver):
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
//!
//! if report.status.success() {
//!     println!("found minimum {} in {}", report.fx, report.x);
//! }
//! # Ok::<(), sqopt::SqpError>(())
//! ```
//!
//! The report carries the final point, the multiplier estimates of the
//! constraints, the Hessian approximation of the Lagrangian, the termination
//! [status](driver::Status) and the work counters. A monitoring callback
//! passed to [`solve_with`](SqpDriver::solve_with) observes every iterate and
//! can abort the run.
//!
//! Problems described by data rather than types can be assembled from
//! closures, linear constraint rows and bounds with [`Nlp`]; see the
//! [`nlp`] module.
//!
//! ## Roadmap
//!
//! Batteries are currently not included, but the plan is to provide a
//! collection of well-known problems for benchmarking, sparsity support in
//! the quadratic subproblem and warm starting across parametric solves.
//!
//! ## License
//!
//! Licensed under MIT.

pub mod convergence;
mod core;
pub mod derivatives;
pub mod driver;
pub mod hessian;
pub mod linesearch;
pub mod nlp;
pub mod qp;
pub mod scaling;
pub mod sqp;
pub mod testing;

pub use core::*;
pub use driver::{Report, SqpDriver, SqpError, Status};
pub use nlp::Nlp;
pub use sqp::{Sqp, SqpOptions};

pub use nalgebra;
