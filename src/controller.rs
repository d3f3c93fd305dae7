//! Step size policy for adaptive integration.

use ndarray::prelude::*;
use ndarray::{FoldWhile, Zip};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Multiply steps computed from asymptotic behaviour of errors by this.
const SAFETY: f64 = 0.9;
/// Minimum allowed decrease in a step size.
const MIN_FACTOR: f64 = 0.2;
/// Maximum allowed increase in a step size.
const MAX_FACTOR: f64 = 10.;
/// Consecutive rejections after which a step is abandoned.
const MAX_ATTEMPTS: usize = 50;

/// Outcome of judging one trial step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    /// The step met tolerance; `next` is the step size to try next.
    Accept { next: f64 },
    /// The step must be retried from the same time with step size `next`.
    Reject { next: f64 },
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        match self {
            Verdict::Accept { .. } => true,
            Verdict::Reject { .. } => false,
        }
    }

    /// The suggested step size, whatever the verdict.
    pub fn next_step(&self) -> f64 {
        match *self {
            Verdict::Accept { next } | Verdict::Reject { next } => next,
        }
    }
}

/// Error tolerances and step size adaptation parameters.
///
/// The local error of a step of length `h` is accepted when, for every
/// component `i`,
///
/// ```text
/// |h| |err_i| <= max(rel_tol * max(|y_i|, |y_new_i|), abs_tol)
/// ```
///
/// where `err_i` is the embedded method's truncation error per unit step
/// length. Every field has a default, so a partial configuration
/// deserializes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepController {
    /// Absolute tolerance.
    pub abs_tol: f64,
    /// Relative tolerance; must be at least `100. * f64::EPSILON`.
    pub rel_tol: f64,
    /// Safety factor applied to the asymptotically optimal step.
    pub safety: f64,
    /// Smallest factor a rejected step may shrink by.
    pub min_factor: f64,
    /// Largest factor an accepted step may grow by.
    pub max_factor: f64,
    /// Consecutive rejections of one step that are treated as divergence.
    pub max_attempts: usize,
    /// Largest allowed step magnitude, unbounded if `None`.
    pub max_step: Option<f64>,
    /// Smallest allowed step magnitude. If `None`, ten times the spacing of
    /// floating point numbers at the current time is used.
    pub min_step: Option<f64>,
}

impl Default for StepController {
    fn default() -> StepController {
        StepController {
            abs_tol: 1e-10,
            rel_tol: 1e-10,
            safety: SAFETY,
            min_factor: MIN_FACTOR,
            max_factor: MAX_FACTOR,
            max_attempts: MAX_ATTEMPTS,
            max_step: None,
            min_step: None,
        }
    }
}

impl StepController {
    /// Creates a controller with the given tolerances and default adaptation
    /// parameters.
    pub fn new(abs_tol: f64, rel_tol: f64) -> StepController {
        StepController {
            abs_tol,
            rel_tol,
            ..StepController::default()
        }
    }

    pub fn with_max_step(mut self, max_step: f64) -> StepController {
        self.max_step = Some(max_step);
        self
    }

    pub fn with_min_step(mut self, min_step: f64) -> StepController {
        self.min_step = Some(min_step);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> StepController {
        self.max_attempts = max_attempts;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.rel_tol >= 100. * std::f64::EPSILON) || !self.rel_tol.is_finite() {
            return Err(Error::TooSmallRelTol);
        }
        if !(self.abs_tol > 0.) || !self.abs_tol.is_finite() {
            return Err(Error::InvalidTolerance);
        }
        if let Some(max_step) = self.max_step {
            if !(max_step > 0.) {
                return Err(Error::MaxStepZeroOrNeg);
            }
        }
        if let Some(min_step) = self.min_step {
            if !(min_step > 0.) || !min_step.is_finite() {
                return Err(Error::InvalidStep(min_step));
            }
            if min_step > self.max_step() {
                return Err(Error::StepBoundsInverted {
                    min_step,
                    max_step: self.max_step(),
                });
            }
        }
        Ok(())
    }

    /// Largest allowed step magnitude.
    pub fn max_step(&self) -> f64 {
        self.max_step.unwrap_or(std::f64::INFINITY)
    }

    /// Smallest allowed step magnitude at time `t` when stepping in
    /// `direction`.
    ///
    /// Never less than ten times the spacing of floating point numbers at
    /// `t`, whatever `min_step` is configured to.
    pub fn min_step(&self, t: f64, direction: f64) -> f64 {
        let floor = resolvable_step(t, direction);
        match self.min_step {
            Some(min_step) => min_step.max(floor),
            None => floor,
        }
    }

    /// Scaled error of a step of magnitude `h_abs` from `y` to `y_new`.
    ///
    /// Values `<= 1` meet tolerance. Returns infinity if any quantity is NaN.
    pub fn error_ratio(
        &self,
        error_per_len: ArrayView1<'_, f64>,
        h_abs: f64,
        y: ArrayView1<'_, f64>,
        y_new: ArrayView1<'_, f64>,
    ) -> f64 {
        debug_assert_eq!(error_per_len.len(), y.len());
        debug_assert_eq!(y.len(), y_new.len());
        let threshold = self.abs_tol / self.rel_tol;
        let max_scaled = Zip::from(error_per_len)
            .and(y)
            .and(y_new)
            .fold_while(0., |acc: f64, &err, &y, &y_new| {
                let scaled = err.abs() / y.abs().max(y_new.abs()).max(threshold);
                if scaled.is_nan() {
                    FoldWhile::Done(std::f64::INFINITY)
                } else {
                    FoldWhile::Continue(acc.max(scaled))
                }
            })
            .into_inner();
        h_abs * max_scaled / self.rel_tol
    }

    /// Decides whether a step of magnitude `h_abs` with scaled error `ratio`
    /// is accepted, for an embedded formula of order `error_order`.
    ///
    /// Accepted steps grow by `safety * ratio^(-1/(p+1))`, clamped to
    /// `[1, max_factor]`; rejected steps shrink by `safety * ratio^(-1/p)`,
    /// but never below `min_factor`.
    pub fn assess(&self, ratio: f64, h_abs: f64, error_order: usize) -> Verdict {
        let p = error_order as f64;
        if ratio <= 1. {
            let factor = if ratio == 0. {
                self.max_factor
            } else {
                self.max_factor
                    .min((self.safety * ratio.powf(-1. / (p + 1.))).max(1.))
            };
            Verdict::Accept {
                next: (h_abs * factor).min(self.max_step()),
            }
        } else {
            let factor = if ratio.is_finite() {
                self.min_factor.max(self.safety * ratio.powf(-1. / p))
            } else {
                self.min_factor
            };
            Verdict::Reject {
                next: h_abs * factor,
            }
        }
    }
}

/// Smallest step that moves `t` by a resolvable amount: ten times the
/// spacing of floating point numbers at `t` in `direction`.
pub(crate) fn resolvable_step(t: f64, direction: f64) -> f64 {
    10. * (next_after(t, direction * std::f64::INFINITY) - t).abs()
}

/// Computes the next representable floating-point value following `x` in the
/// direction of `y`.
///
/// Special cases:
///
/// * If `x` equals `y`, then `y` is returned.
/// * If `x` or `y` is NAN, a NAN is returned.
///
/// There is no special handling for overflow of finite values to ±∞ or
/// subnormals.
pub(crate) fn next_after(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        std::f64::NAN
    } else if x == y {
        y
    } else if x == 0. {
        if y < 0. {
            -f64::from_bits(1)
        } else {
            f64::from_bits(1)
        }
    } else if (y > x) == (x > 0.) {
        f64::from_bits(x.to_bits().wrapping_add(1))
    } else {
        f64::from_bits(x.to_bits().wrapping_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn accepts_within_tolerance_and_grows() {
        let ctl = StepController::new(1e-8, 1e-8);
        let y = array![1.];
        let y_new = array![0.9];
        // |h| |err| = 0.1 * 1e-8 / 1 = 1e-9 -> ratio 0.1
        let ratio = ctl.error_ratio(array![1e-8].view(), 0.1, y.view(), y_new.view());
        assert_relative_eq!(ratio, 0.1, max_relative = 1e-12);
        match ctl.assess(ratio, 0.1, 4) {
            Verdict::Accept { next } => {
                assert_relative_eq!(next, 0.1 * 0.9 * 10f64.powf(0.2), max_relative = 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_and_shrinks() {
        let ctl = StepController::default();
        match ctl.assess(16., 1., 4) {
            Verdict::Reject { next } => assert_relative_eq!(next, 0.45, max_relative = 1e-12),
            other => panic!("unexpected {:?}", other),
        }
        // Shrinking is clamped.
        assert_eq!(ctl.assess(1e12, 1., 4).next_step(), MIN_FACTOR);
    }

    #[test]
    fn growth_is_clamped() {
        let ctl = StepController::default().with_max_step(3.);
        assert_eq!(ctl.assess(0., 1., 4), Verdict::Accept { next: 3. });
        let ctl = StepController::default();
        assert_eq!(ctl.assess(0., 1., 4).next_step(), MAX_FACTOR);
        // Barely accepted steps never shrink.
        assert_eq!(ctl.assess(1., 1., 4), Verdict::Accept { next: 1. });
    }

    #[test]
    fn absolute_tolerance_governs_small_components() {
        let ctl = StepController::new(1e-6, 1e-3);
        let y = array![0.];
        // Scale is abs_tol / rel_tol = 1e-3.
        let ratio = ctl.error_ratio(array![1e-6].view(), 1., y.view(), y.view());
        assert_relative_eq!(ratio, 1., max_relative = 1e-12);
    }

    #[test]
    fn nan_error_is_never_accepted() {
        let ctl = StepController::default();
        let y = array![1., 1.];
        let ratio = ctl.error_ratio(array![0., std::f64::NAN].view(), 0.1, y.view(), y.view());
        assert!(ratio.is_infinite());
        assert!(!ctl.assess(ratio, 0.1, 4).is_accepted());
    }

    #[test]
    fn validation() {
        assert!(StepController::default().validate().is_ok());
        match StepController::new(1e-10, 1e-20).validate() {
            Err(Error::TooSmallRelTol) => {}
            other => panic!("unexpected {:?}", other),
        }
        match StepController::new(0., 1e-10).validate() {
            Err(Error::InvalidTolerance) => {}
            other => panic!("unexpected {:?}", other),
        }
        match StepController::default().with_max_step(-1.).validate() {
            Err(Error::MaxStepZeroOrNeg) => {}
            other => panic!("unexpected {:?}", other),
        }
        match StepController::default()
            .with_max_step(1.)
            .with_min_step(2.)
            .validate()
        {
            Err(Error::StepBoundsInverted { min_step, max_step }) => {
                assert_eq!((min_step, max_step), (2., 1.));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(StepController::default()
            .with_max_step(1.)
            .with_min_step(1.)
            .validate()
            .is_ok());
    }

    #[test]
    fn min_step_has_floating_point_floor() {
        let ctl = StepController::default().with_min_step(1e-30);
        let floor = ctl.min_step(1e6, 1.);
        assert!(floor > 1e-10, "floor {:e}", floor);
        assert!(1e6 + floor > 1e6);
        assert!(1e6 - ctl.min_step(1e6, -1.) < 1e6);
        // A larger configured minimum wins.
        let ctl = StepController::default().with_min_step(0.5);
        assert_eq!(ctl.min_step(1e6, 1.), 0.5);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let ctl: StepController =
            serde_json::from_str(r#"{ "abs_tol": 1e-12, "max_step": 60.0 }"#).unwrap();
        assert_eq!(ctl.abs_tol, 1e-12);
        assert_eq!(ctl.max_step(), 60.);
        assert_eq!(ctl.rel_tol, 1e-10);
        assert_eq!(ctl.max_attempts, MAX_ATTEMPTS);
        let round_trip: StepController =
            serde_json::from_str(&serde_json::to_string(&ctl).unwrap()).unwrap();
        assert_eq!(round_trip, ctl);
    }

    #[test]
    fn next_after_steps_one_ulp() {
        assert!(next_after(1., 2.) > 1.);
        assert!(next_after(1., 0.) < 1.);
        assert_eq!(next_after(1., 1.), 1.);
        assert!(next_after(std::f64::NAN, 1.).is_nan());
        assert_eq!(next_after(0., -1.), -f64::from_bits(1));
    }
}
