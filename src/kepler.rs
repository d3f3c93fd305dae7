//! Closed-form two-body propagation with universal variables.
//!
//! The universal Kepler equation is solved for the universal anomaly `X` by
//! Newton iteration, and the new position and velocity follow from the
//! Lagrange coefficients `f`, `g`, `ḟ`, `ġ`. One formulation covers elliptic,
//! parabolic and hyperbolic orbits.
//!
//! # References
//!
//! 1. D. A. Vallado, "Fundamentals of Astrodynamics and Applications",
//!    Algorithms 1 and 8.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::controller::resolvable_step;
use crate::error::Error;
use crate::events::Retrace;
use crate::OdeIntegrate;

/// `|alpha|` below which an orbit is treated as parabolic.
const PARABOLIC_ALPHA: f64 = 1e-12;
/// `|psi|` below which the Stumpff functions use their series expansion.
const STUMPFF_SERIES_PSI: f64 = 1e-6;

/// Stumpff functions `(c2(psi), c3(psi))`.
pub fn stumpff(psi: f64) -> (f64, f64) {
    if psi > STUMPFF_SERIES_PSI {
        let sqrt_psi = psi.sqrt();
        (
            (1. - sqrt_psi.cos()) / psi,
            (sqrt_psi - sqrt_psi.sin()) / (psi * sqrt_psi),
        )
    } else if psi < -STUMPFF_SERIES_PSI {
        let sqrt_neg_psi = (-psi).sqrt();
        (
            (1. - sqrt_neg_psi.cosh()) / psi,
            (sqrt_neg_psi.sinh() - sqrt_neg_psi) / (-psi * sqrt_neg_psi),
        )
    } else {
        (
            1. / 2. - psi / 24. + psi * psi / 720.,
            1. / 6. - psi / 120. + psi * psi / 5040.,
        )
    }
}

/// Orbit type, as given by the sign of `alpha = 2/r - v²/mu`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conic {
    Elliptic,
    Parabolic,
    Hyperbolic,
}

impl Conic {
    pub fn from_alpha(alpha: f64) -> Conic {
        if alpha > PARABOLIC_ALPHA {
            Conic::Elliptic
        } else if alpha < -PARABOLIC_ALPHA {
            Conic::Hyperbolic
        } else {
            Conic::Parabolic
        }
    }

    /// Classifies the orbit through position `r` with velocity `v`.
    pub fn of(mu: f64, r: &[f64; 3], v: &[f64; 3]) -> Conic {
        Conic::from_alpha(reciprocal_semi_major_axis(mu, r, v))
    }
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

/// `alpha = 2/r - v²/mu`, the reciprocal of the semi-major axis.
fn reciprocal_semi_major_axis(mu: f64, r: &[f64; 3], v: &[f64; 3]) -> f64 {
    2. / norm(r) - dot(v, v) / mu
}

/// Newton solver for the universal Kepler equation.
///
/// Every field has a default, so a partial configuration deserializes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniversalVariable {
    /// Convergence threshold on the magnitude of a Newton increment of `X`.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for UniversalVariable {
    fn default() -> UniversalVariable {
        UniversalVariable {
            tolerance: 1e-10,
            max_iterations: 100,
        }
    }
}

impl UniversalVariable {
    /// Propagates position `r` and velocity `v` by time `t` (which may be
    /// negative) about a body with gravitational parameter `mu`.
    ///
    /// `r` and `v` are only written on success.
    pub fn propagate(
        &self,
        t: f64,
        mu: f64,
        r: &mut [f64; 3],
        v: &mut [f64; 3],
    ) -> Result<(), Error> {
        if !(mu > 0.) || !mu.is_finite() {
            return Err(Error::InvalidGravitationalParameter(mu));
        }
        if !t.is_finite() {
            return Err(Error::NonFiniteTime(t));
        }
        if let Some(i) = r.iter().chain(v.iter()).position(|x| !x.is_finite()) {
            return Err(Error::NonFiniteInitialState(i));
        }
        let r0 = norm(r);
        if r0 == 0. {
            return Err(Error::DegeneratePosition);
        }
        if t == 0. {
            return Ok(());
        }

        let sqrt_mu = mu.sqrt();
        let alpha = reciprocal_semi_major_axis(mu, r, v);
        let rv = dot(r, v);
        let conic = Conic::from_alpha(alpha);

        let guess = match conic {
            Conic::Elliptic => sqrt_mu * t * alpha,
            Conic::Hyperbolic => {
                let a = 1. / alpha;
                t.signum()
                    * (-a).sqrt()
                    * (-2. * mu * alpha * t
                        / (rv + t.signum() * (-mu * a).sqrt() * (1. - r0 * alpha)))
                        .ln()
            }
            Conic::Parabolic => {
                // Barker's equation.
                let h = norm(&cross(r, v));
                let p = h * h / mu;
                let s = (1. / (3. * (mu / (p * p * p)).sqrt() * t)).atan() / 2.;
                let w = s.tan().cbrt().atan();
                2. * p.sqrt() / (2. * w).tan()
            }
        };
        // Radial orbits have no usable closed-form guess.
        let mut x = if guess.is_finite() {
            guess
        } else {
            sqrt_mu * t / r0
        };

        let rv_sqrt_mu = rv / sqrt_mu;
        let mut iterations = 0;
        loop {
            let x2 = x * x;
            let psi = x2 * alpha;
            let (c2, c3) = stumpff(psi);
            let x_one_minus_psi_c3 = x * (1. - psi * c3);
            let x2_c2 = x2 * c2;
            let radius = x2_c2 + rv_sqrt_mu * x_one_minus_psi_c3 + r0 * (1. - psi * c2);
            let increment =
                (sqrt_mu * t - x2 * x * c3 - rv_sqrt_mu * x2_c2 - r0 * x_one_minus_psi_c3)
                    / radius;
            x += increment;
            iterations += 1;

            if increment.abs() <= self.tolerance {
                break;
            }
            if iterations >= self.max_iterations || !increment.is_finite() {
                log::warn!(
                    "universal Kepler iteration stopped after {} iterations, increment {:e}",
                    iterations,
                    increment
                );
                return Err(Error::KeplerNotConverged {
                    iterations,
                    increment,
                });
            }
        }
        log::trace!(
            "{:?} Kepler solve over t = {} converged in {} iterations, X = {}",
            conic,
            t,
            iterations,
            x
        );

        // Lagrange coefficients at the converged anomaly.
        let x2 = x * x;
        let psi = x2 * alpha;
        let (c2, c3) = stumpff(psi);
        let radius = x2 * c2 + rv_sqrt_mu * x * (1. - psi * c3) + r0 * (1. - psi * c2);
        let f = 1. - x2 * c2 / r0;
        let g = t - x2 * x * c3 / sqrt_mu;
        let f_dot = sqrt_mu / (radius * r0) * x * (psi * c3 - 1.);
        let g_dot = 1. - x2 * c2 / radius;

        let position = [
            f * r[0] + g * v[0],
            f * r[1] + g * v[1],
            f * r[2] + g * v[2],
        ];
        for i in 0..3 {
            v[i] = f_dot * r[i] + g_dot * v[i];
        }
        *r = position;
        Ok(())
    }

    /// Propagates a state `[x, y, z, vx, vy, vz, ...]` in place by time `t`.
    ///
    /// Components after the sixth (mass, for example) are left untouched.
    pub fn propagate_state(
        &self,
        t: f64,
        mu: f64,
        mut state: ArrayViewMut1<'_, f64>,
    ) -> Result<(), Error> {
        if state.len() < 6 {
            return Err(Error::ShapeMismatch {
                expected: 6,
                found: state.len(),
            });
        }
        let mut r = [state[0], state[1], state[2]];
        let mut v = [state[3], state[4], state[5]];
        self.propagate(t, mu, &mut r, &mut v)?;
        for i in 0..3 {
            state[i] = r[i];
            state[i + 3] = v[i];
        }
        Ok(())
    }
}

/// Propagates `r` and `v` by time `t` with the default solver settings.
pub fn propagate(t: f64, mu: f64, r: &mut [f64; 3], v: &mut [f64; 3]) -> Result<(), Error> {
    UniversalVariable::default().propagate(t, mu, r, v)
}

/// Two-body propagator that reports states at fixed output intervals.
///
/// Every output state is propagated directly from the initial epoch, so no
/// error accumulates between steps.
pub struct TwoBodyPropagator {
    solver: UniversalVariable,
    mu: f64,
    t0: f64,
    y0: Array1<f64>,
    t: f64,
    y: Array1<f64>,
    /// Start of the last step, or `None` before the first step.
    t_old: Option<f64>,
    t_bound: f64,
    direction: f64,
    /// Output interval, or `None` to jump straight to the boundary.
    step: Option<f64>,
}

impl TwoBodyPropagator {
    /// Creates a propagator for state `y0` (length at least 6) at `t0`.
    pub fn new(
        mu: f64,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        step: Option<f64>,
        solver: UniversalVariable,
    ) -> Result<TwoBodyPropagator, Error> {
        if !(mu > 0.) || !mu.is_finite() {
            return Err(Error::InvalidGravitationalParameter(mu));
        }
        if !t_bound.is_finite() {
            return Err(Error::TimeBoundNotFinite);
        }
        if y0.len() < 6 {
            return Err(Error::ShapeMismatch {
                expected: 6,
                found: y0.len(),
            });
        }
        if let Some(i) = y0.iter().position(|y| !y.is_finite()) {
            return Err(Error::NonFiniteInitialState(i));
        }
        if let Some(h) = step {
            if !h.is_finite() || h == 0. {
                return Err(Error::InvalidStep(h));
            }
        }
        Ok(TwoBodyPropagator {
            solver,
            mu,
            t0,
            y: y0.clone(),
            y0,
            t: t0,
            t_old: None,
            t_bound,
            direction: if t_bound < t0 { -1. } else { 1. },
            step: step.map(f64::abs),
        })
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }
}

impl OdeIntegrate for TwoBodyPropagator {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), Error> {
        if self.finished() {
            return Ok(());
        }
        let t_new = match self.step {
            Some(h) if h < (self.t_bound - self.t).abs() => {
                let floor = resolvable_step(self.t, self.direction);
                if h < floor {
                    return Err(Error::TooSmallStep {
                        required: h,
                        allowable: floor,
                    });
                }
                self.t + h * self.direction
            }
            _ => self.t_bound,
        };
        let mut y = self.y0.clone();
        self.solver
            .propagate_state(t_new - self.t0, self.mu, y.view_mut())?;
        self.t_old = Some(self.t);
        self.t = t_new;
        self.y = y;
        Ok(())
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn time_bound(&self) -> f64 {
        self.t_bound
    }

    fn state(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }
}

impl Retrace for TwoBodyPropagator {
    fn step_start(&self) -> Option<f64> {
        self.t_old
    }

    fn state_in_step(&mut self, t: f64, mut out: ArrayViewMut1<'_, f64>) -> Result<(), Error> {
        Error::check_within_step(t, self.t_old.unwrap_or(self.t), self.t)?;
        Error::check_dimension(self.y0.len(), out.len())?;
        out.assign(&self.y0);
        self.solver.propagate_state(t - self.t0, self.mu, out)
    }

    fn truncate_step(&mut self, t: f64) -> Result<(), Error> {
        Error::check_within_step(t, self.t_old.unwrap_or(self.t), self.t)?;
        let mut y = self.y0.clone();
        self.solver
            .propagate_state(t - self.t0, self.mu, y.view_mut())?;
        self.t = t;
        self.y = y;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const MU_EARTH: f64 = 398600.4418;

    fn energy(r: &[f64; 3], v: &[f64; 3]) -> f64 {
        dot(v, v) / 2. - MU_EARTH / norm(r)
    }

    fn assert_invariants(r0: [f64; 3], v0: [f64; 3], t: f64) {
        let (mut r, mut v) = (r0, v0);
        propagate(t, MU_EARTH, &mut r, &mut v).unwrap();
        assert!(norm(&r) > 0.);
        assert_relative_eq!(energy(&r, &v), energy(&r0, &v0), epsilon = 1e-9);
        let (h0, h) = (cross(&r0, &v0), cross(&r, &v));
        for i in 0..3 {
            assert_relative_eq!(h[i], h0[i], epsilon = 1e-6, max_relative = 1e-10);
        }
    }

    #[test]
    fn stumpff_branches() {
        assert_eq!(stumpff(0.), (0.5, 1. / 6.));
        let (c2, c3) = stumpff(PI * PI);
        assert_relative_eq!(c2, 2. / (PI * PI), max_relative = 1e-14);
        assert_relative_eq!(c3, 1. / (PI * PI), max_relative = 1e-14);
        let (c2, c3) = stumpff(-1.);
        assert_relative_eq!(c2, 1f64.cosh() - 1., max_relative = 1e-14);
        assert_relative_eq!(c3, 1f64.sinh() - 1., max_relative = 1e-14);
    }

    #[test]
    fn stumpff_is_continuous_at_series_threshold() {
        for &psi in &[STUMPFF_SERIES_PSI, -STUMPFF_SERIES_PSI] {
            let inside = stumpff(psi * 0.999);
            let outside = stumpff(psi * 1.001);
            assert_relative_eq!(inside.0, outside.0, epsilon = 1e-8);
            assert_relative_eq!(inside.1, outside.1, epsilon = 1e-8);
        }
    }

    #[test]
    fn conic_classification() {
        let r = [7000., 0., 0.];
        let v_escape = (2. * MU_EARTH / 7000.).sqrt();
        assert_eq!(Conic::of(MU_EARTH, &r, &[0., 7.5, 0.]), Conic::Elliptic);
        assert_eq!(Conic::of(MU_EARTH, &r, &[0., v_escape, 0.]), Conic::Parabolic);
        assert_eq!(Conic::of(MU_EARTH, &r, &[0., 12., 0.]), Conic::Hyperbolic);
    }

    #[test]
    fn forward_then_back_returns_home() {
        let (r0, v0) = ([7000., 0., 0.], [0., 7.5, 0.]);
        let (mut r, mut v) = (r0, v0);
        propagate(3600., MU_EARTH, &mut r, &mut v).unwrap();
        assert!(norm(&[r[0] - r0[0], r[1] - r0[1], r[2] - r0[2]]) > 1000.);
        propagate(-3600., MU_EARTH, &mut r, &mut v).unwrap();
        for i in 0..3 {
            assert!((r[i] - r0[i]).abs() < 1e-6, "r[{}] = {}", i, r[i]);
            assert!((v[i] - v0[i]).abs() < 1e-9, "v[{}] = {}", i, v[i]);
        }
    }

    #[test]
    fn one_period_is_identity() {
        let (r0, v0) = ([7000., 0., 0.], [0., 7.5, 0.]);
        let a = 1. / reciprocal_semi_major_axis(MU_EARTH, &r0, &v0);
        let period = 2. * PI * (a * a * a / MU_EARTH).sqrt();
        let (mut r, mut v) = (r0, v0);
        propagate(period, MU_EARTH, &mut r, &mut v).unwrap();
        for i in 0..3 {
            assert!((r[i] - r0[i]).abs() < 1e-6, "r[{}] = {}", i, r[i]);
            assert!((v[i] - v0[i]).abs() < 1e-9, "v[{}] = {}", i, v[i]);
        }
        propagate(-period, MU_EARTH, &mut r, &mut v).unwrap();
        for i in 0..3 {
            assert!((r[i] - r0[i]).abs() < 1e-6, "r[{}] = {}", i, r[i]);
            assert!((v[i] - v0[i]).abs() < 1e-9, "v[{}] = {}", i, v[i]);
        }
    }

    #[test]
    fn invariants_hold_for_every_conic() {
        let r0 = [7000., 1000., -500.];
        let v_escape = (2. * MU_EARTH / norm(&r0)).sqrt();
        let dir = [0., 0.8, 0.6];
        for &speed in &[7.5, v_escape, 12.] {
            let v0 = [speed * dir[0], speed * dir[1], speed * dir[2]];
            assert_invariants(r0, v0, 1800.);
            assert_invariants(r0, v0, -1800.);
        }
    }

    #[test]
    fn zero_time_is_identity() {
        let (mut r, mut v) = ([7000., 0., 0.], [0., 7.5, 0.]);
        propagate(0., MU_EARTH, &mut r, &mut v).unwrap();
        assert_eq!(r, [7000., 0., 0.]);
        assert_eq!(v, [0., 7.5, 0.]);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let solver = UniversalVariable {
            max_iterations: 1,
            ..UniversalVariable::default()
        };
        let (mut r, mut v) = ([7000., 0., 0.], [0., 7.5, 0.]);
        match solver.propagate(3600., MU_EARTH, &mut r, &mut v) {
            Err(err @ Error::KeplerNotConverged { iterations: 1, .. }) => {
                assert!(err.is_convergence_failure())
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r, [7000., 0., 0.]);
        assert_eq!(v, [0., 7.5, 0.]);
    }

    #[test]
    fn invalid_inputs() {
        let (mut r, mut v) = ([7000., 0., 0.], [0., 7.5, 0.]);
        match propagate(60., 0., &mut r, &mut v) {
            Err(Error::InvalidGravitationalParameter(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match propagate(std::f64::NAN, MU_EARTH, &mut r, &mut v) {
            Err(Error::NonFiniteTime(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        let mut origin = [0.; 3];
        match propagate(60., MU_EARTH, &mut origin, &mut v) {
            Err(Error::DegeneratePosition) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn state_propagation_keeps_extra_components() {
        let solver = UniversalVariable::default();
        let mut state = array![7000., 0., 0., 0., 7.5, 0., 1250.];
        solver.propagate_state(600., MU_EARTH, state.view_mut()).unwrap();
        assert_eq!(state[6], 1250.);

        let (mut r, mut v) = ([7000., 0., 0.], [0., 7.5, 0.]);
        propagate(600., MU_EARTH, &mut r, &mut v).unwrap();
        assert_eq!(state.slice(s![..3]), aview1(&r));
        assert_eq!(state.slice(s![3..6]), aview1(&v));

        let mut short = array![7000., 0., 0., 0., 7.5];
        match solver.propagate_state(600., MU_EARTH, short.view_mut()) {
            Err(Error::ShapeMismatch {
                expected: 6,
                found: 5,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn propagator_steps_from_epoch() {
        let y0 = array![7000., 0., 0., 0., 7.5, 0.];
        let mut stepped = TwoBodyPropagator::new(
            MU_EARTH,
            100.,
            y0.clone(),
            1000.,
            Some(250.),
            UniversalVariable::default(),
        )
        .unwrap();
        let mut times = Vec::new();
        while !stepped.finished() {
            stepped.step().unwrap();
            times.push(stepped.time());
        }
        assert_eq!(times, vec![350., 600., 850., 1000.]);

        let mut direct =
            TwoBodyPropagator::new(MU_EARTH, 100., y0, 1000., None, UniversalVariable::default())
                .unwrap();
        direct.step().unwrap();
        assert!(direct.finished());
        assert_eq!(direct.state(), stepped.state());
    }

    #[test]
    fn unresolvable_output_interval() {
        let mut propagator = TwoBodyPropagator::new(
            MU_EARTH,
            1e9,
            array![7000., 0., 0., 0., 7.5, 0.],
            1e9 + 10.,
            Some(1e-9),
            UniversalVariable::default(),
        )
        .unwrap();
        match propagator.step() {
            Err(Error::TooSmallStep { required, .. }) => assert_eq!(required, 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(propagator.time(), 1e9);
        assert_eq!(propagator.step_start(), None);
    }

    #[test]
    fn solver_config_defaults() {
        let solver: UniversalVariable = serde_json::from_str(r#"{ "max_iterations": 20 }"#).unwrap();
        assert_eq!(solver.max_iterations, 20);
        assert_eq!(solver.tolerance, 1e-10);
    }
}
