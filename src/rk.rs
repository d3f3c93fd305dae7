//! Runge–Kutta steppers.

use ndarray::prelude::*;
use std::marker::PhantomData;

use crate::dynamics::{Dynamics, EvaluationError};
use crate::error::{Error, StageMask};
use crate::tableau::{EmbeddedRKMethod, RKMethod};
use crate::workspace::Workspace;

/// A single-step integration method.
pub trait StepMethod {
    /// Sizes the method's workspace for `dynamics`.
    ///
    /// Must be called before [`StepMethod::single_step`] and again whenever
    /// the dimension of the dynamics changes. Calling it repeatedly with the
    /// same dimension does not reallocate.
    fn initialize<D>(&mut self, dynamics: &D) -> Result<(), Error>
    where
        D: Dynamics + ?Sized;

    /// Advances `state` in place from `t0` to `t0 + h`.
    ///
    /// Every stage is evaluated even if an earlier one failed; failures are
    /// OR-combined into the returned [`Error::Evaluation`]. In that case
    /// `state` has still been overwritten and must be treated as unreliable.
    fn single_step<D>(
        &mut self,
        dynamics: &D,
        state: ArrayViewMut1<'_, f64>,
        t0: f64,
        h: f64,
    ) -> Result<(), Error>
    where
        D: Dynamics + ?Sized;

    /// Scratch storage of the method.
    fn workspace(&self) -> &Workspace;
}

/// Explicit Runge–Kutta stepper driven by the tableau `O`.
///
/// Owns one [`Workspace`]; use one stepper per integration stream.
pub struct RungeKutta<O>
where
    O: RKMethod,
{
    workspace: Workspace,
    method: PhantomData<O>,
}

impl<O> Default for RungeKutta<O>
where
    O: RKMethod,
{
    fn default() -> Self {
        RungeKutta::new()
    }
}

impl<O> RungeKutta<O>
where
    O: RKMethod,
{
    pub fn new() -> RungeKutta<O> {
        RungeKutta {
            workspace: Workspace::new(),
            method: PhantomData,
        }
    }

    /// Number of dynamics evaluations per step.
    pub fn num_stages(&self) -> usize {
        O::NUM_STAGES
    }
}

impl<O> RungeKutta<O>
where
    O: EmbeddedRKMethod,
{
    /// Truncation error per unit step length of the last step.
    pub fn error_estimate(&self) -> ArrayView1<'_, f64> {
        self.workspace.error()
    }
}

impl<O> StepMethod for RungeKutta<O>
where
    O: RKMethod,
{
    fn initialize<D>(&mut self, dynamics: &D) -> Result<(), Error>
    where
        D: Dynamics + ?Sized,
    {
        self.workspace.reset(dynamics.dimension(), O::NUM_STAGES);
        Ok(())
    }

    fn single_step<D>(
        &mut self,
        dynamics: &D,
        mut state: ArrayViewMut1<'_, f64>,
        t0: f64,
        h: f64,
    ) -> Result<(), Error>
    where
        D: Dynamics + ?Sized,
    {
        Error::check_dimension(O::NUM_STAGES, self.workspace.num_stages())?;
        Error::check_dimension(self.workspace.dimension(), dynamics.dimension())?;
        Error::check_dimension(self.workspace.dimension(), state.len())?;

        let Workspace {
            stages,
            midpoint,
            error,
            ..
        } = &mut self.workspace;

        let mut failed = StageMask::empty();
        let mut first_failure = None;
        let mut record = |stage: usize, result: Result<(), EvaluationError>| {
            if let Err(err) = result {
                failed.insert(stage);
                first_failure.get_or_insert(err);
            }
        };

        record(0, dynamics.evaluate(t0, state.view(), stages.row_mut(0)));
        for (s, (a, c)) in O::a().iter().zip(O::c()).enumerate() {
            midpoint.assign(&state);
            for (j, &a_j) in a.iter().enumerate() {
                if a_j != 0. {
                    midpoint.scaled_add(h * a_j, &stages.row(j));
                }
            }
            record(
                s + 1,
                dynamics.evaluate(t0 + c * h, midpoint.view(), stages.row_mut(s + 1)),
            );
        }

        if let Some(e) = O::e() {
            error.fill(0.);
            for (i, &e_i) in e.iter().enumerate() {
                if e_i != 0. {
                    error.scaled_add(e_i, &stages.row(i));
                }
            }
        }
        for (i, &b_i) in O::b().iter().enumerate() {
            if b_i != 0. {
                state.scaled_add(h * b_i, &stages.row(i));
            }
        }

        match first_failure {
            None => Ok(()),
            Some(source) => Err(Error::Evaluation {
                stages: failed,
                source,
            }),
        }
    }

    fn workspace(&self) -> &Workspace {
        &self.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::from_fn;
    use crate::tableau::{RK4, RK8, RKCK, RKF45, RKF56, RKF78, RKV8};
    use std::cell::Cell;

    fn decay() -> impl Dynamics {
        from_fn(1, |_t, y, mut dy| {
            dy[0] = -y[0];
            Ok(())
        })
    }

    fn one_step<O: RKMethod>(h: f64) -> f64 {
        let dynamics = decay();
        let mut rk = RungeKutta::<O>::new();
        rk.initialize(&dynamics).unwrap();
        let mut y = array![1.];
        rk.single_step(&dynamics, y.view_mut(), 0., h).unwrap();
        y[0]
    }

    #[test]
    fn rk8_one_step_accuracy() {
        let err = (one_step::<RK8>(0.1) - (-0.1f64).exp()).abs();
        assert!(err < 1e-10, "error {:e}", err);
    }

    #[test]
    fn cooper_verner_one_step_accuracy() {
        let err = (one_step::<RKV8>(0.1) - (-0.1f64).exp()).abs();
        assert!(err < 1e-10, "error {:e}", err);
    }

    #[test]
    fn rk4_one_step_accuracy() {
        let err = (one_step::<RK4>(0.1) - (-0.1f64).exp()).abs();
        assert!(err < 1e-6, "error {:e}", err);
    }

    #[test]
    fn cash_karp_local_error_scales_as_h6() {
        let err = |h: f64| (one_step::<RKCK>(h) - (-h).exp()).abs();
        let ratio = err(0.1) / err(0.05);
        assert!(ratio > 32. && ratio < 128., "ratio {}", ratio);
    }

    #[test]
    fn embedded_methods_advance_with_high_order() {
        for &(y, order) in &[
            (one_step::<RKF45>(0.1), 5),
            (one_step::<RKF56>(0.1), 6),
            (one_step::<RKF78>(0.1), 8),
        ] {
            let err = (y - (-0.1f64).exp()).abs();
            assert!(err < 0.1f64.powi(order as i32), "error {:e}", err);
        }
    }

    #[test]
    fn exactly_one_evaluation_per_stage() {
        let calls = Cell::new(0);
        let dynamics = from_fn(2, |_t, y, mut dy| {
            calls.set(calls.get() + 1);
            dy[0] = y[1];
            dy[1] = -y[0];
            Ok(())
        });
        let mut rk = RungeKutta::<RK8>::new();
        rk.initialize(&dynamics).unwrap();
        let mut y = array![1., 0.];
        rk.single_step(&dynamics, y.view_mut(), 0., 0.5).unwrap();
        assert_eq!(calls.get(), 10);

        let mut ck = RungeKutta::<RKCK>::new();
        ck.initialize(&dynamics).unwrap();
        ck.single_step(&dynamics, y.view_mut(), 0.5, 0.5).unwrap();
        assert_eq!(calls.get(), 16);
    }

    #[test]
    fn failing_stages_are_or_combined() {
        let dynamics = from_fn(1, |t, y, mut dy| {
            if t > 0.4 && t < 0.9 {
                return Err(EvaluationError::Domain(format!("t = {}", t)));
            }
            dy[0] = -y[0];
            Ok(())
        });
        let mut rk = RungeKutta::<RK8>::new();
        rk.initialize(&dynamics).unwrap();
        let mut y = array![1.];
        let err = rk.single_step(&dynamics, y.view_mut(), 0., 1.).unwrap_err();
        match err {
            // Stages at c = 1/2, 2/3 and 5/6.
            Error::Evaluation { stages, source } => {
                assert_eq!(stages.count(), 3);
                assert!(stages.contains(4));
                assert!(stages.contains(5));
                assert!(stages.contains(8));
                assert_eq!(source, EvaluationError::Domain("t = 0.5".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The state is still overwritten.
        assert_ne!(y[0], 1.);
    }

    #[test]
    fn dimension_mismatch_fails_fast() {
        let dynamics = decay();
        let mut rk = RungeKutta::<RKCK>::new();
        let mut y = array![1.];
        match rk.single_step(&dynamics, y.view_mut(), 0., 0.1) {
            Err(Error::ShapeMismatch { .. }) => {}
            other => panic!("uninitialized stepper returned {:?}", other),
        }
        rk.initialize(&dynamics).unwrap();
        let mut y2 = array![1., 2.];
        match rk.single_step(&dynamics, y2.view_mut(), 0., 0.1) {
            Err(Error::ShapeMismatch {
                expected: 1,
                found: 2,
            }) => {}
            other => panic!("mismatched state returned {:?}", other),
        }
        assert_eq!(y2, array![1., 2.]);
    }

    #[test]
    fn error_estimate_vanishes_for_quartic_solutions() {
        // y' = 4 t^3 + 3 t^2, y = t^4 + t^3.
        let dynamics = from_fn(1, |t, _y, mut dy| {
            dy[0] = 4. * t.powi(3) + 3. * t * t;
            Ok(())
        });
        let mut rk = RungeKutta::<RKCK>::new();
        rk.initialize(&dynamics).unwrap();
        let mut y = array![0.];
        rk.single_step(&dynamics, y.view_mut(), 0., 0.7).unwrap();
        assert!(rk.error_estimate()[0].abs() < 1e-12);
        assert!((y[0] - (0.7f64.powi(4) + 0.7f64.powi(3))).abs() < 1e-12);
    }

    #[test]
    fn error_estimate_decreases_with_step() {
        let dynamics = decay();
        let mut rk = RungeKutta::<RKCK>::new();
        rk.initialize(&dynamics).unwrap();
        let mut previous = std::f64::INFINITY;
        for &h in &[0.8, 0.4, 0.2, 0.1, 0.05] {
            let mut y = array![1.];
            rk.single_step(&dynamics, y.view_mut(), 0., h).unwrap();
            let estimate = rk.error_estimate()[0].abs();
            assert!(estimate < previous, "h = {}: {:e} >= {:e}", h, estimate, previous);
            previous = estimate;
        }
    }

    #[test]
    fn repeated_steps_are_bit_identical() {
        let dynamics = from_fn(3, |t, y, mut dy| {
            dy[0] = y[1] * t.cos();
            dy[1] = -y[0] + y[2];
            dy[2] = -0.1 * y[2];
            Ok(())
        });
        let mut rk = RungeKutta::<RK8>::new();
        rk.initialize(&dynamics).unwrap();
        let y0 = array![1., 0.5, -0.25];
        let mut first = y0.clone();
        rk.single_step(&dynamics, first.view_mut(), 1.5, 0.3).unwrap();
        let mut second = y0.clone();
        rk.single_step(&dynamics, second.view_mut(), 1.5, 0.3).unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}
