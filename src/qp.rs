//! Dense quadratic programming subproblem solver.
//!
//! Solves the subproblem produced by each SQP iteration:
//!
//! ```text
//! minimize   1/2 s^T H s + c^T s
//! subject to A_eq s + b_eq  = 0,
//!            A_in s + b_in <= 0,
//! ```
//!
//! where `H` is positive definite (the SQP driver maintains this invariant
//! for its Hessian approximation). Variable bounds are folded into `A_in` by
//! the caller.
//!
//! The method is a primal-dual active-set iteration: the KKT system of the
//! currently active constraints is solved directly, constraints with negative
//! multipliers are released and the most violated inactive constraint is
//! activated, until the iterate is feasible and dual feasible. Multipliers of
//! inactive inequalities are exactly zero, so the returned multiplier vector
//! is consistent with complementary slackness and as sparse as the active
//! set.
//!
//! When the constraint set is infeasible, the subproblem is relaxed with a
//! single elastic variable `t >= 0` shared by all constraints (see
//! [`solve`]), which is always feasible. The relaxed solution is flagged as a
//! modified search direction.

use log::debug;
use nalgebra::{convert, DimName, Dyn, OMatrix, OVector, U1};

use crate::core::RealField;

/// Solution of a QP subproblem.
#[derive(Debug, Clone)]
pub struct QpSolution<T: RealField + Copy> {
    /// The minimizer (search direction).
    pub s: OVector<T, Dyn>,
    /// Multipliers of the equality constraints (unconstrained in sign).
    pub eq: OVector<T, Dyn>,
    /// Multipliers of the inequality constraints (nonnegative, zero for
    /// inactive constraints).
    pub ineq: OVector<T, Dyn>,
    /// Whether the elastic relaxation had to be used because the constraints
    /// were infeasible.
    pub modified: bool,
}

struct ActiveSetSolution<T: RealField + Copy> {
    s: OVector<T, Dyn>,
    eq: OVector<T, Dyn>,
    ineq: OVector<T, Dyn>,
}

/// The linearized constraint set admits no feasible point.
struct Infeasible;

/// Solves the QP subproblem, falling back to the elastic relaxation when the
/// constraints are infeasible.
///
/// The elastic relaxation replaces the subproblem by
///
/// ```text
/// minimize   1/2 s^T H s + c^T s + rho t + 1/2 eps t^2
/// subject to -t <= A_eq s + b_eq <= t,
///            A_in s + b_in <= t,
///            t >= 0,
/// ```
///
/// with `rho` proportional to the magnitude of the gradient, which is always
/// feasible and keeps the quadratic positive definite. This never fails: in
/// the (theoretically unreachable) case that the relaxation cannot be solved
/// either, the negative gradient is returned as a safeguard direction.
pub fn solve<T: RealField + Copy>(
    h: &OMatrix<T, Dyn, Dyn>,
    c: &OVector<T, Dyn>,
    a_eq: &OMatrix<T, Dyn, Dyn>,
    b_eq: &OVector<T, Dyn>,
    a_in: &OMatrix<T, Dyn, Dyn>,
    b_in: &OVector<T, Dyn>,
) -> QpSolution<T> {
    match active_set(h, c, a_eq, b_eq, a_in, b_in) {
        Ok(sol) => QpSolution {
            s: sol.s,
            eq: sol.eq,
            ineq: sol.ineq,
            modified: false,
        },
        Err(Infeasible) => {
            debug!("linearized constraints infeasible, solving elastic relaxation");
            elastic(h, c, a_eq, b_eq, a_in, b_in)
        }
    }
}

/// Primal-dual active-set iteration on the KKT system.
fn active_set<T: RealField + Copy>(
    h: &OMatrix<T, Dyn, Dyn>,
    c: &OVector<T, Dyn>,
    a_eq: &OMatrix<T, Dyn, Dyn>,
    b_eq: &OVector<T, Dyn>,
    a_in: &OMatrix<T, Dyn, Dyn>,
    b_in: &OVector<T, Dyn>,
) -> Result<ActiveSetSolution<T>, Infeasible> {
    let n = c.nrows();
    let me = b_eq.nrows();
    let mi = b_in.nrows();

    let zero = T::zero();
    let one = T::one();

    // Feasibility tolerance relative to the constraint right-hand sides.
    let b_mag = b_eq
        .iter()
        .chain(b_in.iter())
        .fold(one, |acc, bi| acc.max(bi.abs()));
    let feas_tol = T::EPSILON_SQRT * b_mag;
    let mult_tol = T::EPSILON_SQRT;

    let mut active: Vec<usize> = Vec::new();
    let max_iter = 10 * (n + me + mi) + 10;

    for _ in 0..max_iter {
        let k = me + active.len();

        // Assemble the KKT system of the active constraints:
        //
        //     [ H  A^T ] [ s ]   [ -c ]
        //     [ A  0   ] [ v ] = [ -b ]
        let mut kkt = OMatrix::zeros_generic(Dyn(n + k), Dyn(n + k));
        let mut rhs = OVector::zeros_generic(Dyn(n + k), U1::name());

        for i in 0..n {
            for j in 0..n {
                kkt[(i, j)] = h[(i, j)];
            }
            rhs[i] = -c[i];
        }

        for i in 0..me {
            for j in 0..n {
                kkt[(n + i, j)] = a_eq[(i, j)];
                kkt[(j, n + i)] = a_eq[(i, j)];
            }
            rhs[n + i] = -b_eq[i];
        }

        for (row, &i) in active.iter().enumerate() {
            for j in 0..n {
                kkt[(n + me + row, j)] = a_in[(i, j)];
                kkt[(j, n + me + row)] = a_in[(i, j)];
            }
            rhs[n + me + row] = -b_in[i];
        }

        let z = solve_linear(kkt, &rhs);

        let s = z.rows(0, n).clone_owned();
        let v = z.rows(n, k).clone_owned();

        // Release the active inequality with the most negative multiplier,
        // if any. A negative multiplier means the constraint blocks descent
        // and should not be binding.
        let mut drop: Option<(usize, T)> = None;
        for row in 0..active.len() {
            let vi = v[me + row];
            if vi < -mult_tol && drop.map(|(_, worst)| vi < worst).unwrap_or(true) {
                drop = Some((row, vi));
            }
        }

        if let Some((row, vi)) = drop {
            debug!(
                "releasing inequality {} with negative multiplier {}",
                active[row], vi
            );
            active.remove(row);
            continue;
        }

        // Activate the most violated inactive inequality, if any.
        let mut add: Option<(usize, T)> = None;
        for i in 0..mi {
            if active.contains(&i) {
                continue;
            }

            let viol = a_in.row(i).transpose().dot(&s) + b_in[i];
            if viol > feas_tol && add.map(|(_, worst)| viol > worst).unwrap_or(true) {
                add = Some((i, viol));
            }
        }

        match add {
            Some((i, viol)) => {
                debug!("activating inequality {} with violation {}", i, viol);
                active.push(i);
            }
            None => {
                // The KKT solve may have gone through the least-squares
                // branch for an inconsistent active set; in that case the
                // equality or active rows are not actually satisfied and the
                // constraint set is infeasible.
                let eq_viol = (0..me)
                    .map(|i| (a_eq.row(i).transpose().dot(&s) + b_eq[i]).abs())
                    .fold(zero, |acc, r| acc.max(r));
                let act_viol = active
                    .iter()
                    .map(|&i| a_in.row(i).transpose().dot(&s) + b_in[i])
                    .fold(zero, |acc, r| acc.max(r));

                if eq_viol.max(act_viol) > feas_tol {
                    return Err(Infeasible);
                }

                // Feasible and dual feasible: assemble multipliers with
                // zeros for all inactive inequalities.
                let eq = v.rows(0, me).clone_owned();
                let mut ineq = OVector::zeros_generic(Dyn(mi), U1::name());
                for (row, &i) in active.iter().enumerate() {
                    ineq[i] = v[me + row].max(zero);
                }

                return Ok(ActiveSetSolution { s, eq, ineq });
            }
        }
    }

    Err(Infeasible)
}

/// Solves the elastic relaxation of an infeasible subproblem.
fn elastic<T: RealField + Copy>(
    h: &OMatrix<T, Dyn, Dyn>,
    c: &OVector<T, Dyn>,
    a_eq: &OMatrix<T, Dyn, Dyn>,
    b_eq: &OVector<T, Dyn>,
    a_in: &OMatrix<T, Dyn, Dyn>,
    b_in: &OVector<T, Dyn>,
) -> QpSolution<T> {
    let n = c.nrows();
    let me = b_eq.nrows();
    let mi = b_in.nrows();

    let zero = T::zero();
    let one = T::one();

    let c_mag = c.iter().fold(zero, |acc, ci| acc.max(ci.abs()));
    let rho = convert::<_, T>(1e3) * (one + c_mag);

    // Augmented quadratic over (s, t); a small positive curvature on t keeps
    // it positive definite.
    let mut h_el = OMatrix::zeros_generic(Dyn(n + 1), Dyn(n + 1));
    for i in 0..n {
        for j in 0..n {
            h_el[(i, j)] = h[(i, j)];
        }
    }
    h_el[(n, n)] = T::EPSILON_SQRT * (one + c_mag);

    let mut c_el = OVector::zeros_generic(Dyn(n + 1), U1::name());
    for i in 0..n {
        c_el[i] = c[i];
    }
    c_el[n] = rho;

    // Each equality row splits into two one-sided elastic rows, every
    // inequality row gets the elastic variable, and t itself is nonnegative.
    let m_el = 2 * me + mi + 1;
    let mut a_el = OMatrix::zeros_generic(Dyn(m_el), Dyn(n + 1));
    let mut b_el = OVector::zeros_generic(Dyn(m_el), U1::name());

    for i in 0..me {
        for j in 0..n {
            a_el[(2 * i, j)] = a_eq[(i, j)];
            a_el[(2 * i + 1, j)] = -a_eq[(i, j)];
        }
        a_el[(2 * i, n)] = -one;
        a_el[(2 * i + 1, n)] = -one;
        b_el[2 * i] = b_eq[i];
        b_el[2 * i + 1] = -b_eq[i];
    }

    for i in 0..mi {
        for j in 0..n {
            a_el[(2 * me + i, j)] = a_in[(i, j)];
        }
        a_el[(2 * me + i, n)] = -one;
        b_el[2 * me + i] = b_in[i];
    }

    a_el[(m_el - 1, n)] = -one;

    let empty_a = OMatrix::zeros_generic(Dyn(0), Dyn(n + 1));
    let empty_b = OVector::zeros_generic(Dyn(0), U1::name());

    match active_set(&h_el, &c_el, &empty_a, &empty_b, &a_el, &b_el) {
        Ok(sol) => {
            debug!("elastic relaxation solved with t = {}", sol.s[n]);

            let s = sol.s.rows(0, n).clone_owned();

            let mut eq = OVector::zeros_generic(Dyn(me), U1::name());
            for i in 0..me {
                eq[i] = sol.ineq[2 * i] - sol.ineq[2 * i + 1];
            }

            let mut ineq = OVector::zeros_generic(Dyn(mi), U1::name());
            for i in 0..mi {
                ineq[i] = sol.ineq[2 * me + i];
            }

            QpSolution {
                s,
                eq,
                ineq,
                modified: true,
            }
        }
        Err(Infeasible) => {
            // The relaxation is feasible by construction, so this branch is a
            // safeguard against active-set cycling. Fall back to the steepest
            // descent direction of the quadratic.
            debug!("elastic relaxation not solved, falling back to steepest descent");

            QpSolution {
                s: -c.clone_owned(),
                eq: OVector::zeros_generic(Dyn(me), U1::name()),
                ineq: OVector::zeros_generic(Dyn(mi), U1::name()),
                modified: true,
            }
        }
    }
}

/// Solves a square linear system by LU with partial pivoting, falling back to
/// the SVD pseudoinverse when the system is singular.
///
/// The pseudoinverse branch yields the minimum-norm solution, which resolves
/// degenerate and redundant active constraints without failing.
fn solve_linear<T: RealField + Copy>(
    a: OMatrix<T, Dyn, Dyn>,
    b: &OVector<T, Dyn>,
) -> OVector<T, Dyn> {
    if let Some(x) = a.clone().lu().solve(b) {
        if x.iter().all(|xi| xi.is_finite()) {
            return x;
        }
    }

    debug!("KKT system is singular, using SVD pseudoinverse");

    a.svd(true, true)
        .solve(b, T::EPSILON_SQRT)
        .unwrap_or_else(|_| OVector::zeros_generic(Dyn(b.nrows()), U1::name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, DMatrix, DVector};

    fn no_eq() -> (DMatrix<f64>, DVector<f64>) {
        (DMatrix::zeros(0, 2), DVector::zeros(0))
    }

    fn no_in() -> (DMatrix<f64>, DVector<f64>) {
        (DMatrix::zeros(0, 2), DVector::zeros(0))
    }

    #[test]
    fn unconstrained_newton_step() {
        let h = dmatrix![2.0, 0.0; 0.0, 2.0];
        let c = dvector![-4.0, -6.0];
        let (a_eq, b_eq) = no_eq();
        let (a_in, b_in) = no_in();

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        assert!(!sol.modified);
        assert_abs_diff_eq!(sol.s, dvector![2.0, 3.0], epsilon = 1e-10);
    }

    #[test]
    fn equality_constrained() {
        // min 1/2 ||s||^2  s.t.  s1 + s2 = 1.
        let h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let c = dvector![0.0, 0.0];
        let a_eq = dmatrix![1.0, 1.0];
        let b_eq = dvector![-1.0];
        let (a_in, b_in) = no_in();

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        assert!(!sol.modified);
        assert_abs_diff_eq!(sol.s, dvector![0.5, 0.5], epsilon = 1e-10);
        assert_abs_diff_eq!(sol.eq[0], -0.5, epsilon = 1e-10);
    }

    #[test]
    fn active_inequality() {
        // min 1/2 ||s||^2 - s1 - s2  s.t.  s1 + s2 <= 1.
        let h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let c = dvector![-1.0, -1.0];
        let (a_eq, b_eq) = no_eq();
        let a_in = dmatrix![1.0, 1.0];
        let b_in = dvector![-1.0];

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        assert!(!sol.modified);
        assert_abs_diff_eq!(sol.s, dvector![0.5, 0.5], epsilon = 1e-10);
        assert_abs_diff_eq!(sol.ineq[0], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn inactive_inequality_has_zero_multiplier() {
        let h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let c = dvector![1.0, 1.0];
        let (a_eq, b_eq) = no_eq();
        let a_in = dmatrix![1.0, 1.0];
        let b_in = dvector![-1.0];

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        // Unconstrained minimum (-1, -1) satisfies the constraint strictly.
        assert!(!sol.modified);
        assert_abs_diff_eq!(sol.s, dvector![-1.0, -1.0], epsilon = 1e-10);
        assert_eq!(sol.ineq[0], 0.0);
    }

    #[test]
    fn infeasible_falls_back_to_elastic() {
        // s <= -1 and s >= 1 cannot hold together.
        let h: DMatrix<f64> = dmatrix![1.0];
        let c = dvector![0.0];
        let a_eq = DMatrix::zeros(0, 1);
        let b_eq = DVector::zeros(0);
        let a_in = dmatrix![1.0; -1.0];
        let b_in = dvector![1.0, 1.0];

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        assert!(sol.modified);
        // The relaxation balances both violations around zero.
        assert!(sol.s[0].abs() <= 1.0);
    }

    #[test]
    fn redundant_constraints_resolved() {
        // The same constraint twice; the duplicate must not confuse the
        // active set and the multipliers must stay complementary.
        let h = dmatrix![1.0, 0.0; 0.0, 1.0];
        let c = dvector![-1.0, -1.0];
        let (a_eq, b_eq) = no_eq();
        let a_in = dmatrix![1.0, 1.0; 1.0, 1.0];
        let b_in = dvector![-1.0, -1.0];

        let sol = solve(&h, &c, &a_eq, &b_eq, &a_in, &b_in);

        assert_abs_diff_eq!(sol.s, dvector![0.5, 0.5], epsilon = 1e-8);
        // Complementary slackness holds for every inequality.
        for i in 0..2 {
            let slack = sol.s[0] + sol.s[1] - 1.0;
            assert!(sol.ineq[i] >= 0.0);
            assert_abs_diff_eq!(sol.ineq[i] * slack, 0.0, epsilon = 1e-8);
        }
    }
}
