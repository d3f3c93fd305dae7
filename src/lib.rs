//! Explicit Runge–Kutta integration of ordinary differential equations on
//! `ndarray` states, with adaptive step size control and closed-form
//! two-body propagation.
//!
//! The building blocks are:
//!
//! * [`Dynamics`]: the right-hand side `dy/dt = f(t, y)`.
//! * [`tableau`]: Butcher tableaus (RK4, RK8, Cooper–Verner, Cash–Karp,
//!   RKF45, RKF56, RKF78).
//! * [`RungeKutta`]: a single-step stepper over a tableau, owning its
//!   [`Workspace`].
//! * [`StepController`]: the accept/reject policy for embedded methods.
//! * [`Adaptive`] and [`FixedStep`]: span drivers implementing
//!   [`OdeIntegrate`].
//! * [`events`]: location of switching-function crossings within a step.
//! * [`kepler`]: universal-variable two-body propagation.

pub mod controller;
pub mod dynamics;
pub mod error;
pub mod events;
pub mod kepler;
pub mod propagate;
pub mod rk;
pub mod tableau;
pub mod workspace;

use ndarray::prelude::*;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

pub use crate::controller::{StepController, Verdict};
pub use crate::dynamics::{from_fn, Dynamics, EvaluationError, TwoBody};
pub use crate::error::{Error, StageMask};
pub use crate::events::{event_fn, Crossing, Event, EventDetector, Retrace};
pub use crate::kepler::{TwoBodyPropagator, UniversalVariable};
pub use crate::propagate::{Adaptive, FixedStep, Stats};
pub use crate::rk::{RungeKutta, StepMethod};
pub use crate::workspace::Workspace;

/// How a run of an [`OdeIntegrate`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// `time_bound` was reached.
    Reached,
    /// The observer asked to stop.
    Stopped,
    /// The cancellation flag was set.
    Cancelled,
}

/// Times and states recorded by [`OdeIntegrate::run_collect`].
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    pub times: Vec<f64>,
    /// One row per entry of `times`.
    pub states: Array2<f64>,
}

pub trait OdeIntegrate {
    /// Returns the number of elements in the state.
    fn len(&self) -> usize;
    /// Perform one step.
    fn step(&mut self) -> Result<(), Error>;
    /// Current time.
    fn time(&self) -> f64;
    /// The ending time.
    fn time_bound(&self) -> f64;
    /// Current state.
    fn state(&self) -> ArrayView1<'_, f64>;
    /// Returns `true` if the integration has reached `time_bound`.
    fn finished(&self) -> bool {
        self.time() == self.time_bound()
    }
    /// Integrate until reaching `time_bound`.
    fn run_to_bound(&mut self) -> Result<(), Error> {
        while !self.finished() {
            self.step()?;
        }
        Ok(())
    }
    /// Integrate until reaching `time_bound`, handing the initial state and
    /// the state after every step to `observer`, which may stop the run.
    fn run_with<F>(&mut self, mut observer: F) -> Result<Completion, Error>
    where
        Self: Sized,
        F: FnMut(f64, ArrayView1<'_, f64>) -> ControlFlow<()>,
    {
        if observer(self.time(), self.state()).is_break() {
            return Ok(Completion::Stopped);
        }
        while !self.finished() {
            self.step()?;
            if observer(self.time(), self.state()).is_break() {
                return Ok(Completion::Stopped);
            }
        }
        Ok(Completion::Reached)
    }
    /// Integrate until reaching `time_bound` or until `cancel` is set. The
    /// flag is checked before every step.
    fn run_until_cancelled(&mut self, cancel: &AtomicBool) -> Result<Completion, Error> {
        while !self.finished() {
            if cancel.load(Ordering::Relaxed) {
                log::debug!("run cancelled at t = {}", self.time());
                return Ok(Completion::Cancelled);
            }
            self.step()?;
        }
        Ok(Completion::Reached)
    }
    /// Integrate until reaching `time_bound`, recording the initial state and
    /// the state after every step.
    fn run_collect(&mut self) -> Result<Trajectory, Error> {
        let n = self.len();
        let mut times = vec![self.time()];
        let mut flat = self.state().to_vec();
        while !self.finished() {
            self.step()?;
            times.push(self.time());
            flat.extend(self.state().iter());
        }
        let found = flat.len();
        let states = Array2::from_shape_vec((times.len(), n), flat).map_err(|_| {
            Error::ShapeMismatch {
                expected: times.len() * n,
                found,
            }
        })?;
        Ok(Trajectory { times, states })
    }
}
