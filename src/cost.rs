use crate::autofunc::Vector;

/// A scalar cost comparing an actual output against a target.
pub trait CostFunc {
    fn cost(&self, target: &Vector, actual: &Vector) -> f64;

    /// Derivative of the cost with respect to `actual`.
    fn deriv(&self, target: &Vector, actual: &Vector) -> Vector;

    /// The derivative together with its own derivative with respect to R,
    /// given the R derivative of `actual`.
    fn r_deriv(&self, target: &Vector, actual: &Vector, r_actual: &Vector) -> (Vector, Vector);
}

/// Half the squared euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl CostFunc for SquaredError {
    fn cost(&self, target: &Vector, actual: &Vector) -> f64 {
        0.5 * (actual - target).mapv(|x| x * x).sum()
    }

    fn deriv(&self, target: &Vector, actual: &Vector) -> Vector {
        actual - target
    }

    fn r_deriv(&self, target: &Vector, actual: &Vector, r_actual: &Vector) -> (Vector, Vector) {
        (actual - target, r_actual.clone())
    }
}
