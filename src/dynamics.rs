//! Right-hand sides of the systems being propagated.

use ndarray::prelude::*;
use thiserror::Error;

/// Failure of a dynamics model to evaluate a derivative.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum EvaluationError {
    /// The state lies outside the domain of the model (e.g. a collision with
    /// the central body).
    #[error("state outside model domain: {0}")]
    Domain(String),
    /// The model produced a non-finite derivative component.
    #[error("non-finite derivative in component {0}")]
    NonFinite(usize),
}

/// A system of first-order ODEs, `dy/dt = f(t, y)`.
///
/// Implementations must be pure functions of `(t, state)`: the integrators
/// evaluate them once per stage and reuse cached stage buffers.
pub trait Dynamics {
    /// Returns the number of elements in the state.
    fn dimension(&self) -> usize;

    /// Fills `deriv` with the derivative of `state` at time `t`.
    ///
    /// `state` and `deriv` both have length `self.dimension()`.
    fn evaluate(
        &self,
        t: f64,
        state: ArrayView1<'_, f64>,
        deriv: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvaluationError>;
}

impl<'a, D> Dynamics for &'a D
where
    D: Dynamics + ?Sized,
{
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn evaluate(
        &self,
        t: f64,
        state: ArrayView1<'_, f64>,
        deriv: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvaluationError> {
        (**self).evaluate(t, state, deriv)
    }
}

/// Dynamics defined by a closure, see [`from_fn`].
#[derive(Clone, Debug)]
pub struct FnDynamics<F> {
    dimension: usize,
    fun: F,
}

/// Wraps a closure `fun(t, y, deriv_y)` as [`Dynamics`] of the given
/// dimension.
pub fn from_fn<F>(dimension: usize, fun: F) -> FnDynamics<F>
where
    F: Fn(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>) -> Result<(), EvaluationError>,
{
    FnDynamics { dimension, fun }
}

impl<F> Dynamics for FnDynamics<F>
where
    F: Fn(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>) -> Result<(), EvaluationError>,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn evaluate(
        &self,
        t: f64,
        state: ArrayView1<'_, f64>,
        deriv: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvaluationError> {
        (self.fun)(t, state, deriv)
    }
}

/// Point-mass gravity: state `[x, y, z, vx, vy, vz]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TwoBody {
    /// Gravitational parameter of the central body.
    pub mu: f64,
}

impl TwoBody {
    pub fn new(mu: f64) -> TwoBody {
        TwoBody { mu }
    }
}

impl Dynamics for TwoBody {
    fn dimension(&self) -> usize {
        6
    }

    fn evaluate(
        &self,
        _t: f64,
        state: ArrayView1<'_, f64>,
        mut deriv: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EvaluationError> {
        let r2 = state[0] * state[0] + state[1] * state[1] + state[2] * state[2];
        if !(r2 > 0.) || !r2.is_finite() {
            return Err(EvaluationError::Domain(format!(
                "radius squared {} is not positive and finite",
                r2
            )));
        }
        let r = r2.sqrt();
        let k = -self.mu / (r2 * r);
        deriv[0] = state[3];
        deriv[1] = state[4];
        deriv[2] = state[5];
        deriv[3] = k * state[0];
        deriv[4] = k * state[1];
        deriv[5] = k * state[2];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn closure_dynamics() {
        let decay = from_fn(2, |_t, y, mut dy| {
            dy[0] = -y[0];
            dy[1] = -y[1];
            Ok(())
        });
        let mut dy = Array1::zeros(2);
        decay
            .evaluate(0., array![1., -2.].view(), dy.view_mut())
            .unwrap();
        assert_eq!(decay.dimension(), 2);
        assert_eq!(dy, array![-1., 2.]);
    }

    #[test]
    fn two_body_acceleration() {
        let mu = 398600.4418;
        let model = TwoBody::new(mu);
        let mut dy = Array1::zeros(6);
        model
            .evaluate(0., array![7000., 0., 0., 0., 7.5, 0.].view(), dy.view_mut())
            .unwrap();
        assert_eq!(dy[1], 7.5);
        assert_relative_eq!(dy[3], -mu / (7000. * 7000.), max_relative = 1e-14);
        assert_eq!(dy[4], 0.);
    }

    #[test]
    fn two_body_rejects_origin() {
        let model = TwoBody::new(1.);
        let mut dy = Array1::zeros(6);
        let err = model
            .evaluate(0., Array1::zeros(6).view(), dy.view_mut())
            .unwrap_err();
        match err {
            EvaluationError::Domain(_) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }
}
