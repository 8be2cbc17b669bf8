use crate::core::domain::Domain;

/// Extension of [`nalgebra::RealField`] with additional constants used
/// throughout the crate.
pub trait RealField: nalgebra::RealField {
    /// Machine epsilon.
    const EPSILON: Self;

    /// Square root of machine epsilon. This value is a standard constant for
    /// epsilons in approximating first-order derivative-based concepts.
    const EPSILON_SQRT: Self;

    /// Cubic root of machine epsilon. This value is a standard constant for
    /// epsilons in approximating second-order derivative-based concepts.
    const EPSILON_CBRT: Self;
}

impl RealField for f32 {
    const EPSILON: Self = f32::EPSILON;
    const EPSILON_SQRT: Self = 0.00034526698;
    const EPSILON_CBRT: Self = 0.0049215667;
}

impl RealField for f64 {
    const EPSILON: Self = f64::EPSILON;
    const EPSILON_SQRT: Self = 0.000000014901161193847656;
    const EPSILON_CBRT: Self = 0.0000060554544523933395;
}

/// The base trait for optimization problems.
///
/// A problem determines the scalar type used for computations and the domain
/// (dimensionality and bound constraints) of its variables. The objective and
/// constraints themselves are defined by the
/// [`NonlinearProblem`](super::NonlinearProblem) trait.
pub trait Problem {
    /// Type of the scalar, usually f32 or f64.
    type Field: RealField + Copy;

    /// Gets the domain (dimensionality and bound constraints) of the problem.
    fn domain(&self) -> Domain<Self::Field>;
}
