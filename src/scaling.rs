//! Variable and function scaling for numerical conditioning.
//!
//! Poorly scaled problems (variables or function values of wildly different
//! magnitudes) degrade finite differences, Hessian conditioning and
//! line-search behavior. This module rescales the problem to unit order:
//! variables are divided by per-variable magnitudes and overly large
//! objective/constraint values by per-function factors. The transformation is
//! invertible and applied only at evaluation crossings; all other components
//! operate purely in the internal scaled space.

use log::debug;
use nalgebra::{
    storage::{Storage, StorageMut},
    DimName, Dyn, IsContiguous, Matrix, OMatrix, OVector, Vector, U1,
};

use crate::core::{Domain, NonlinearProblem, Problem, RealField};
use crate::derivatives::DiffOptions;

/// Estimates magnitude of the variable given lower and upper bounds.
pub fn estimate_magnitude_from_bounds<T: RealField + Copy>(lower: T, upper: T) -> T {
    let ten = T::from_subset(&10.0);
    let half = T::from_subset(&0.5);

    let avg = half * (lower.abs() + upper.abs());
    let magnitude = ten.powf(avg.abs().log10().trunc());

    // For [0, 0] range, the computed magnitude is undefined. We allow such
    // ranges to support fixing a variable to a value with existing API.
    if magnitude.is_finite() && magnitude > T::zero() {
        magnitude
    } else {
        T::one()
    }
}

/// Estimates magnitude of a variable from its initial value.
pub fn estimate_magnitude_from_value<T: RealField + Copy>(value: T) -> T {
    let ten = T::from_subset(&10.0);

    let magnitude = ten.powf(value.abs().log10().trunc());

    if magnitude.is_finite() && magnitude > T::zero() {
        magnitude
    } else {
        T::one()
    }
}

/// Diagonal scaling of variables and function values.
///
/// Internal variables relate to external ones by `x_int = x_ext / sx`,
/// internal function values by `f_int = f_ext / sf` and `g_int = g_ext / sg`
/// componentwise.
#[derive(Debug, Clone)]
pub struct Scaling<T: RealField + Copy> {
    sx: OVector<T, Dyn>,
    sf: T,
    sg: OVector<T, Dyn>,
}

impl<T: RealField + Copy> Scaling<T> {
    /// Creates identity scaling for a problem with `n` variables and `m`
    /// constraints.
    pub fn identity(n: usize, m: usize) -> Self {
        Self {
            sx: OVector::from_element_generic(Dyn(n), U1::name(), T::one()),
            sf: T::one(),
            sg: OVector::from_element_generic(Dyn(m), U1::name(), T::one()),
        }
    }

    /// Derives variable scale factors from the domain scale (when available)
    /// and the initial point.
    pub fn estimate_variables(mut self, dom: &Domain<T>, x0: &OVector<T, Dyn>) -> Self {
        match dom.scale() {
            // Domain scale is the inverse of the expected magnitude.
            Some(scale) => {
                for (sxi, si) in self.sx.iter_mut().zip(scale.iter()) {
                    *sxi = T::one() / *si;
                }
            }
            None => {
                for (sxi, x0i) in self.sx.iter_mut().zip(x0.iter()) {
                    *sxi = estimate_magnitude_from_value(*x0i);
                }
            }
        }

        debug!("variable scale factors: {:?}", self.sx.as_slice());
        self
    }

    /// Derives function scale factors from values in the initial point:
    /// every value whose magnitude exceeds `threshold` is brought back to
    /// unit order.
    pub fn estimate_functions(mut self, fx: T, gx: &OVector<T, Dyn>, threshold: T) -> Self {
        if fx.abs() > threshold {
            self.sf = fx.abs();
            debug!("objective scale factor: {}", self.sf);
        }

        for (sgi, gi) in self.sg.iter_mut().zip(gx.iter()) {
            if gi.abs() > threshold {
                *sgi = gi.abs();
            }
        }

        self
    }

    /// Per-variable scale factors.
    pub fn sx(&self) -> &OVector<T, Dyn> {
        &self.sx
    }

    /// Objective scale factor.
    pub fn sf(&self) -> T {
        self.sf
    }

    /// Per-constraint scale factors.
    pub fn sg(&self) -> &OVector<T, Dyn> {
        &self.sg
    }

    /// Maps an external point to the internal space.
    pub fn scale_x(&self, x: &OVector<T, Dyn>) -> OVector<T, Dyn> {
        x.component_div(&self.sx)
    }

    /// Maps an internal point back to the external space.
    pub fn unscale_x(&self, x: &OVector<T, Dyn>) -> OVector<T, Dyn> {
        x.component_mul(&self.sx)
    }

    /// Maps internal multipliers back to the external space.
    ///
    /// With `f_int = f_ext / sf` and `g_int = g_ext / sg`, matching the
    /// Lagrangians of both spaces gives `v_ext = v_int * sf / sg`.
    pub fn unscale_multipliers(&self, v: &OVector<T, Dyn>) -> OVector<T, Dyn> {
        let mut out = v.clone_owned();
        for (vi, sgi) in out.iter_mut().zip(self.sg.iter()) {
            *vi *= self.sf / *sgi;
        }
        out
    }

    /// Maps an internal Hessian approximation back to the external space.
    pub fn unscale_hessian(&self, h: &OMatrix<T, Dyn, Dyn>) -> OMatrix<T, Dyn, Dyn> {
        let mut out = h.clone_owned();
        for i in 0..out.nrows() {
            for j in 0..out.ncols() {
                out[(i, j)] *= self.sf / (self.sx[i] * self.sx[j]);
            }
        }
        out
    }

    /// Builds the internal domain with scaled bounds.
    pub fn scale_domain(&self, dom: &Domain<T>) -> Domain<T> {
        let lower = dom
            .lower()
            .iter()
            .zip(self.sx.iter())
            .map(|(l, s)| *l / *s)
            .collect::<Vec<_>>();
        let upper = dom
            .upper()
            .iter()
            .zip(self.sx.iter())
            .map(|(u, s)| *u / *s)
            .collect::<Vec<_>>();

        if lower.iter().all(|l| !l.is_finite()) && upper.iter().all(|u| !u.is_finite()) {
            Domain::unconstrained(lower.len())
        } else {
            Domain::rect(lower, upper)
        }
    }
}

/// A problem wrapper that exposes a scaled view of the inner problem.
///
/// All trait methods operate in the internal space; the wrapper unscales the
/// point before delegating to the inner problem and rescales values and
/// derivatives on the way back (chain rule: `d f_int / d x_int_j =
/// (d f_ext / d x_ext_j) * sx_j / sf`).
pub struct ScaledProblem<'a, F: NonlinearProblem> {
    f: &'a F,
    scaling: Scaling<F::Field>,
}

impl<'a, F: NonlinearProblem> ScaledProblem<'a, F> {
    /// Wraps a problem with given scaling.
    pub fn new(f: &'a F, scaling: Scaling<F::Field>) -> Self {
        Self { f, scaling }
    }

    /// Gets the scaling used by the wrapper.
    pub fn scaling(&self) -> &Scaling<F::Field> {
        &self.scaling
    }

    fn unscale<Sx>(&self, x: &Vector<F::Field, Dyn, Sx>) -> OVector<F::Field, Dyn>
    where
        Sx: Storage<F::Field, Dyn> + IsContiguous,
    {
        let mut out = x.clone_owned();
        for (xi, si) in out.iter_mut().zip(self.scaling.sx.iter()) {
            *xi *= *si;
        }
        out
    }
}

impl<'a, F: NonlinearProblem> Problem for ScaledProblem<'a, F> {
    type Field = F::Field;

    fn domain(&self) -> Domain<Self::Field> {
        self.scaling.scale_domain(&self.f.domain())
    }
}

impl<'a, F: NonlinearProblem> NonlinearProblem for ScaledProblem<'a, F> {
    fn objective<Sx>(&self, x: &Vector<Self::Field, Dyn, Sx>) -> Self::Field
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
    {
        self.f.objective(&self.unscale(x)) / self.scaling.sf
    }

    fn num_constraints(&self) -> usize {
        self.f.num_constraints()
    }

    fn num_eq(&self) -> usize {
        self.f.num_eq()
    }

    fn constraints<Sx, Sg>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        gx: &mut Vector<Self::Field, Dyn, Sg>,
    ) where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sg: StorageMut<Self::Field, Dyn>,
    {
        self.f.constraints(&self.unscale(x), gx);
        for (gi, sgi) in gx.iter_mut().zip(self.scaling.sg.iter()) {
            *gi /= *sgi;
        }
    }

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
        let x_ext = self.unscale(x);
        self.f
            .gradient(&x_ext, fx * self.scaling.sf, grad, diff);
        for (gi, sxi) in grad.iter_mut().zip(self.scaling.sx.iter()) {
            *gi *= *sxi / self.scaling.sf;
        }
    }

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
        let x_ext = self.unscale(x);
        let mut gx_ext = gx.clone_owned();
        for (gi, sgi) in gx_ext.iter_mut().zip(self.scaling.sg.iter()) {
            *gi *= *sgi;
        }

        self.f.jacobian(&x_ext, &gx_ext, jac, diff);

        for i in 0..jac.nrows() {
            for j in 0..jac.ncols() {
                jac[(i, j)] *= self.scaling.sx[j] / self.scaling.sg[i];
            }
        }
    }

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
        let x_ext = self.unscale(x);
        let v_ext = self.scaling.unscale_multipliers(&v.clone_owned());

        if !self.f.lagrangian_hessian(&x_ext, &v_ext, h) {
            return false;
        }

        for i in 0..h.nrows() {
            for j in 0..h.ncols() {
                h[(i, j)] *= self.scaling.sx[i] * self.scaling.sx[j] / self.scaling.sf;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    #[test]
    fn magnitude() {
        assert_eq!(estimate_magnitude_from_bounds(-1e10f64, 1e10).log10(), 10.0);
        assert_eq!(estimate_magnitude_from_bounds(-1e4f64, -1e2).log10(), 3.0);
        assert_eq!(estimate_magnitude_from_bounds(0.0f64, 0.0), 1.0);
        assert_eq!(estimate_magnitude_from_value(3.4e3f64).log10(), 3.0);
        assert_eq!(estimate_magnitude_from_value(0.0f64), 1.0);
    }

    #[test]
    fn round_trip() {
        let scaling = Scaling::identity(2, 0).estimate_variables(
            &Domain::unconstrained(2),
            &dvector![1000.0, 0.01],
        );

        let x = dvector![1500.0, 0.025];
        let back = scaling.unscale_x(&scaling.scale_x(&x));

        assert_abs_diff_eq!(back, x, epsilon = 1e-12);
    }

    #[test]
    fn scaled_bounds() {
        let scaling = Scaling {
            sx: dvector![100.0, 1.0],
            sf: 1.0,
            sg: OVector::zeros_generic(Dyn(0), U1::name()),
        };

        let dom = Domain::rect(vec![-100.0, -1.0], vec![100.0, 1.0]);
        let scaled = scaling.scale_domain(&dom);

        assert_abs_diff_eq!(scaled.lower()[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled.upper()[0], 1.0, epsilon = 1e-12);
    }
}
