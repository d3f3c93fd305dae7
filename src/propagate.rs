//! Propagation of a state across a time span.

use ndarray::prelude::*;
use ndarray::{FoldWhile, Zip};

use crate::controller::{resolvable_step, StepController, Verdict};
use crate::dynamics::{Dynamics, EvaluationError};
use crate::error::{Error, StageMask};
use crate::events::Retrace;
use crate::rk::{RungeKutta, StepMethod};
use crate::tableau::{EmbeddedRKMethod, RKMethod};
use crate::OdeIntegrate;

/// Integration statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    /// Number of dynamics evaluations, including those of rejected steps.
    pub evaluations: u64,
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    /// Largest accepted step magnitude, zero before the first step.
    pub largest_step: f64,
    /// Smallest accepted step magnitude, infinite before the first step.
    pub smallest_step: f64,
}

impl Default for Stats {
    fn default() -> Stats {
        Stats {
            evaluations: 0,
            accepted_steps: 0,
            rejected_steps: 0,
            largest_step: 0.,
            smallest_step: std::f64::INFINITY,
        }
    }
}

impl Stats {
    fn record_accepted(&mut self, h_abs: f64) {
        self.accepted_steps += 1;
        self.largest_step = self.largest_step.max(h_abs);
        self.smallest_step = self.smallest_step.min(h_abs);
    }
}

/// Computes RMS norm of scaled values.
fn norm(x: ArrayView1<f64>, scale: ArrayView1<f64>) -> f64 {
    debug_assert_eq!(x.len(), scale.len());
    (Zip::from(x)
        .and(scale)
        .fold_while(0., |acc, &x, &scale| {
            let scaled = x / scale;
            FoldWhile::Continue(acc + scaled * scaled)
        })
        .into_inner() / x.len() as f64)
        .sqrt()
}

/// Wraps a failure to evaluate the dynamics outside of a Runge–Kutta step.
fn first_stage_failure(source: EvaluationError) -> Error {
    let mut stages = StageMask::empty();
    stages.insert(0);
    Error::Evaluation { stages, source }
}

/// Empirically select a good initial step.
///
/// The algorithm is described in (ref 1).
///
/// # Parameters
///
/// * dynamics: Right-hand side of the system.
/// * t0: Initial value of the independent variable.
/// * y0: Initial value of the dependent variable.
/// * direction: Integration direction.
/// * order: Order of the error estimate.
/// * controller: Supplies the relative and absolute tolerances.
///
/// # Returns
///
/// Absolute value of the suggested initial step.
///
/// # References
///
/// 1. E. Hairer, S. P. Norsett G. Wanner, "Solving Ordinary Differential
///    Equations I: Nonstiff Problems", Sec. II.4.
fn select_initial_step<D>(
    dynamics: &D,
    t0: f64,
    y0: ArrayView1<f64>,
    direction: f64,
    order: usize,
    controller: &StepController,
) -> Result<f64, Error>
where
    D: Dynamics + ?Sized,
{
    if y0.is_empty() {
        return Ok(std::f64::INFINITY);
    }

    let mut f0 = Array1::zeros(y0.len());
    dynamics
        .evaluate(t0, y0, f0.view_mut())
        .map_err(first_stage_failure)?;

    let scale = y0.mapv(|y| y.abs() * controller.rel_tol + controller.abs_tol);
    let d0 = norm(y0, scale.view());
    let d1 = norm(f0.view(), scale.view());
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };

    let y1 = h0 * direction * &f0 + y0;
    let mut f1 = Array1::zeros(y0.len());
    dynamics
        .evaluate(t0 + h0 * direction, y1.view(), f1.view_mut())
        .map_err(first_stage_failure)?;
    let d2 = norm((f1 - f0).view(), scale.view()) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1. / (order as f64 + 1.))
    };

    Ok((100. * h0).min(h1))
}

fn check_initial_state<D>(dynamics: &D, y0: ArrayView1<f64>, t_bound: f64) -> Result<(), Error>
where
    D: Dynamics + ?Sized,
{
    if !t_bound.is_finite() {
        return Err(Error::TimeBoundNotFinite);
    }
    Error::check_dimension(dynamics.dimension(), y0.len())?;
    match y0.iter().position(|y| !y.is_finite()) {
        Some(i) => Err(Error::NonFiniteInitialState(i)),
        None => Ok(()),
    }
}

/// Adaptive step size propagator over an embedded Runge–Kutta method.
///
/// Each call of [`OdeIntegrate::step`] proposes a step, evaluates it on a
/// scratch copy of the state, and either commits it or shrinks the step and
/// tries again from the same time, as decided by the [`StepController`].
/// The committed state only changes when a step is accepted.
pub struct Adaptive<D, O>
where
    D: Dynamics,
    O: EmbeddedRKMethod,
{
    dynamics: D,
    method: RungeKutta<O>,
    controller: StepController,
    /// Current time.
    t: f64,
    /// Current state.
    y: Array1<f64>,
    /// Candidate state of the step being attempted.
    trial: Array1<f64>,
    /// Previous time, or `None` if there haven't been any steps.
    t_old: Option<f64>,
    /// State at `t_old`.
    y_old: Array1<f64>,
    /// Boundary time.
    t_bound: f64,
    /// Integration direction: +1 or -1.
    direction: f64,
    /// Initial step size for next `.step()`.
    h_abs: f64,
    stats: Stats,
}

impl<D, O> Adaptive<D, O>
where
    D: Dynamics,
    O: EmbeddedRKMethod,
{
    /// Creates a new adaptive propagator.
    ///
    /// # Parameters
    ///
    /// * `dynamics`: Right-hand side of the system.
    ///
    /// * `t0`: Initial value of the independent variable.
    ///
    /// * `y0`: Initial values of the dependent variable.
    ///
    /// * `t_bound`: Boundary time; the integration won't continue beyond
    ///   it. It also determines the direction of the integration.
    ///
    /// * `h0`: Initial step size. Only its magnitude is used. If `None`, a
    ///   step is selected from the behaviour of the dynamics at `t0`.
    ///
    /// * `controller`: Tolerances and step size adaptation parameters.
    pub fn new(
        dynamics: D,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        h0: Option<f64>,
        controller: StepController,
    ) -> Result<Adaptive<D, O>, Error> {
        controller.validate()?;
        check_initial_state(&dynamics, y0.view(), t_bound)?;

        let direction = if t_bound < t0 { -1. } else { 1. };

        let h_abs = match h0 {
            Some(h) if h.is_finite() && h != 0. => h.abs(),
            Some(h) => return Err(Error::InvalidStep(h)),
            None => select_initial_step(
                &dynamics,
                t0,
                y0.view(),
                direction,
                O::ERROR_ORDER,
                &controller,
            )?,
        };

        let mut method = RungeKutta::<O>::new();
        method.initialize(&dynamics)?;
        log::debug!(
            "adaptive propagator: {} stages, dimension {}, t0 = {}, t_bound = {}, h0 = {}",
            O::NUM_STAGES,
            y0.len(),
            t0,
            t_bound,
            h_abs
        );

        Ok(Adaptive {
            dynamics,
            method,
            controller,
            t: t0,
            trial: y0.clone(),
            y_old: y0.clone(),
            y: y0,
            t_old: None,
            t_bound,
            direction,
            h_abs,
            stats: Stats::default(),
        })
    }

    /// Size of last successful step or `None` if no steps were made yet.
    pub fn step_size(&self) -> Option<f64> {
        self.t_old.map(|t_old| (self.t - t_old).abs())
    }

    /// Magnitude of the step that will be tried first by the next `.step()`.
    pub fn next_step_size(&self) -> f64 {
        self.h_abs
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn controller(&self) -> &StepController {
        &self.controller
    }

    pub fn method(&self) -> &RungeKutta<O> {
        &self.method
    }

    pub fn dynamics(&self) -> &D {
        &self.dynamics
    }

    /// Consumes the propagator, returning the current state.
    pub fn into_state(self) -> Array1<f64> {
        self.y
    }
}

impl<D, O> OdeIntegrate for Adaptive<D, O>
where
    D: Dynamics,
    O: EmbeddedRKMethod,
{
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), Error> {
        if self.finished() {
            return Ok(());
        }
        let min_step = self.controller.min_step(self.t, self.direction);
        let mut h_abs = self.h_abs.min(self.controller.max_step()).max(min_step);
        let mut attempts = 0;

        loop {
            if h_abs < min_step {
                return Err(Error::TooSmallStep {
                    required: h_abs,
                    allowable: min_step,
                });
            }

            // Propose a step, landing exactly on the boundary if it is in
            // reach.
            let proposed = h_abs;
            let t_new = if h_abs >= (self.t_bound - self.t).abs() {
                self.t_bound
            } else {
                self.t + h_abs * self.direction
            };
            if t_new == self.t {
                return Err(Error::TooSmallStep {
                    required: h_abs,
                    allowable: min_step,
                });
            }
            let h = t_new - self.t;
            h_abs = h.abs();

            // Evaluate it on the scratch state.
            self.trial.assign(&self.y);
            let result =
                self.method
                    .single_step(&self.dynamics, self.trial.view_mut(), self.t, h);
            self.stats.evaluations += O::NUM_STAGES as u64;
            result?;
            let ratio = self.controller.error_ratio(
                self.method.error_estimate(),
                h_abs,
                self.y.view(),
                self.trial.view(),
            );

            match self.controller.assess(ratio, h_abs, O::ERROR_ORDER) {
                Verdict::Accept { next } => {
                    log::trace!(
                        "accepted step t = {} -> {}, error ratio {:.3e}",
                        self.t,
                        t_new,
                        ratio
                    );
                    self.t_old = Some(self.t);
                    self.t = t_new;
                    std::mem::swap(&mut self.y_old, &mut self.trial);
                    std::mem::swap(&mut self.y, &mut self.y_old);
                    self.h_abs = next;
                    // Rounding of `t_new` may stretch the step by an ulp.
                    self.stats.record_accepted(h_abs.min(proposed));
                    return Ok(());
                }
                Verdict::Reject { next } => {
                    attempts += 1;
                    self.stats.rejected_steps += 1;
                    log::trace!(
                        "rejected step of {:e} at t = {}, error ratio {:.3e}",
                        h_abs,
                        self.t,
                        ratio
                    );
                    if attempts >= self.controller.max_attempts {
                        log::warn!(
                            "giving up at t = {} after {} rejected steps",
                            self.t,
                            attempts
                        );
                        self.h_abs = next;
                        return Err(Error::StepRejected {
                            t: self.t,
                            attempts,
                        });
                    }
                    h_abs = next;
                }
            }
        }
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

impl<D, O> Retrace for Adaptive<D, O>
where
    D: Dynamics,
    O: EmbeddedRKMethod,
{
    fn step_start(&self) -> Option<f64> {
        self.t_old
    }

    fn state_in_step(&mut self, t: f64, mut out: ArrayViewMut1<'_, f64>) -> Result<(), Error> {
        let t_old = self.t_old.unwrap_or(self.t);
        Error::check_within_step(t, t_old, self.t)?;
        Error::check_dimension(self.y_old.len(), out.len())?;
        out.assign(&self.y_old);
        let result = self
            .method
            .single_step(&self.dynamics, out, t_old, t - t_old);
        self.stats.evaluations += O::NUM_STAGES as u64;
        result
    }

    fn truncate_step(&mut self, t: f64) -> Result<(), Error> {
        let t_old = self.t_old.unwrap_or(self.t);
        Error::check_within_step(t, t_old, self.t)?;
        if t == self.t {
            return Ok(());
        }
        self.trial.assign(&self.y_old);
        let result =
            self.method
                .single_step(&self.dynamics, self.trial.view_mut(), t_old, t - t_old);
        self.stats.evaluations += O::NUM_STAGES as u64;
        result?;
        self.t = t;
        std::mem::swap(&mut self.y, &mut self.trial);
        Ok(())
    }
}

/// Constant step size propagator.
///
/// Steps of the given magnitude are taken towards the boundary time; the
/// last one is shortened to land exactly on it. A step whose dynamics
/// evaluation fails is discarded and reported.
pub struct FixedStep<D, O>
where
    D: Dynamics,
    O: RKMethod,
{
    dynamics: D,
    method: RungeKutta<O>,
    t: f64,
    y: Array1<f64>,
    trial: Array1<f64>,
    t_old: Option<f64>,
    y_old: Array1<f64>,
    t_bound: f64,
    direction: f64,
    h_abs: f64,
    stats: Stats,
}

impl<D, O> FixedStep<D, O>
where
    D: Dynamics,
    O: RKMethod,
{
    /// Creates a new fixed step propagator from `t0` to `t_bound` with step
    /// magnitude `|step|`.
    pub fn new(
        dynamics: D,
        t0: f64,
        y0: Array1<f64>,
        t_bound: f64,
        step: f64,
    ) -> Result<FixedStep<D, O>, Error> {
        check_initial_state(&dynamics, y0.view(), t_bound)?;
        if !step.is_finite() || step == 0. {
            return Err(Error::InvalidStep(step));
        }
        let mut method = RungeKutta::<O>::new();
        method.initialize(&dynamics)?;
        Ok(FixedStep {
            dynamics,
            method,
            t: t0,
            trial: y0.clone(),
            y_old: y0.clone(),
            y: y0,
            t_old: None,
            t_bound,
            direction: if t_bound < t0 { -1. } else { 1. },
            h_abs: step.abs(),
            stats: Stats::default(),
        })
    }

    pub fn step_size(&self) -> f64 {
        self.h_abs
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn method(&self) -> &RungeKutta<O> {
        &self.method
    }

    pub fn into_state(self) -> Array1<f64> {
        self.y
    }
}

impl<D, O> OdeIntegrate for FixedStep<D, O>
where
    D: Dynamics,
    O: RKMethod,
{
    fn len(&self) -> usize {
        self.y.len()
    }

    fn step(&mut self) -> Result<(), Error> {
        if self.finished() {
            return Ok(());
        }
        // Absorb a remainder within rounding of the step into this one.
        let slack = resolvable_step(self.t, self.direction);
        let t_new = if self.h_abs + slack >= (self.t_bound - self.t).abs() {
            self.t_bound
        } else if self.h_abs < slack {
            return Err(Error::TooSmallStep {
                required: self.h_abs,
                allowable: slack,
            });
        } else {
            self.t + self.h_abs * self.direction
        };
        let h = t_new - self.t;

        self.trial.assign(&self.y);
        let result = self
            .method
            .single_step(&self.dynamics, self.trial.view_mut(), self.t, h);
        self.stats.evaluations += O::NUM_STAGES as u64;
        result?;

        self.t_old = Some(self.t);
        self.t = t_new;
        std::mem::swap(&mut self.y_old, &mut self.trial);
        std::mem::swap(&mut self.y, &mut self.y_old);
        self.stats.record_accepted(h.abs());
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

impl<D, O> Retrace for FixedStep<D, O>
where
    D: Dynamics,
    O: RKMethod,
{
    fn step_start(&self) -> Option<f64> {
        self.t_old
    }

    fn state_in_step(&mut self, t: f64, mut out: ArrayViewMut1<'_, f64>) -> Result<(), Error> {
        let t_old = self.t_old.unwrap_or(self.t);
        Error::check_within_step(t, t_old, self.t)?;
        Error::check_dimension(self.y_old.len(), out.len())?;
        out.assign(&self.y_old);
        let result = self
            .method
            .single_step(&self.dynamics, out, t_old, t - t_old);
        self.stats.evaluations += O::NUM_STAGES as u64;
        result
    }

    fn truncate_step(&mut self, t: f64) -> Result<(), Error> {
        let t_old = self.t_old.unwrap_or(self.t);
        Error::check_within_step(t, t_old, self.t)?;
        if t == self.t {
            return Ok(());
        }
        self.trial.assign(&self.y_old);
        let result =
            self.method
                .single_step(&self.dynamics, self.trial.view_mut(), t_old, t - t_old);
        self.stats.evaluations += O::NUM_STAGES as u64;
        result?;
        self.t = t;
        std::mem::swap(&mut self.y, &mut self.trial);
        Ok(())
    }
}
