//! Detection and location of events during propagation.
//!
//! An event is a crossing of a switching quantity `value(t, y)` through a
//! goal value. After every step the difference `value - goal` is compared
//! with its value at the start of the step; on a sign change the crossing
//! time is located with Brent's method by recomputing the step from its
//! start, and the step is cut short at the event.

use ndarray::prelude::*;

use crate::controller::resolvable_step;
use crate::error::Error;
use crate::OdeIntegrate;

/// Default time tolerance of the event location.
pub const DEFAULT_THRESHOLD: f64 = 1e-10;

/// Iteration cap of the root finder.
const MAX_ITERATIONS: usize = 100;

/// Direction in which the difference has to cross zero to trigger an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crossing {
    /// From negative to positive.
    Increasing,
    /// From positive to negative.
    Decreasing,
    Both,
}

impl Default for Crossing {
    fn default() -> Crossing {
        Crossing::Both
    }
}

impl Crossing {
    /// Returns `true` if the difference going from `before` to `after`
    /// crosses zero in this direction.
    ///
    /// A difference that starts at exactly zero does not count, so a run
    /// that stopped at an event does not report it again.
    pub fn crossed(self, before: f64, after: f64) -> bool {
        if before == 0. || before.is_nan() || after.is_nan() || before * after > 0. {
            return false;
        }
        match self {
            Crossing::Increasing => before < 0.,
            Crossing::Decreasing => before > 0.,
            Crossing::Both => true,
        }
    }
}

/// Switching function monitored for events.
pub trait EventDetector {
    /// Value of the switching function at `(t, state)`.
    fn value(&self, t: f64, state: ArrayView1<'_, f64>) -> f64;

    /// Value of the switching function at which the event occurs.
    fn goal(&self) -> f64 {
        0.
    }

    fn crossing(&self) -> Crossing {
        Crossing::Both
    }

    /// Tolerance on the event time.
    fn threshold(&self) -> f64 {
        DEFAULT_THRESHOLD
    }

    /// Distance of the switching function from the goal.
    fn difference(&self, t: f64, state: ArrayView1<'_, f64>) -> f64 {
        self.value(t, state) - self.goal()
    }
}

/// Event detector built from a closure with [`event_fn`].
#[derive(Clone, Debug)]
pub struct FnDetector<F> {
    value: F,
    goal: f64,
    crossing: Crossing,
    threshold: f64,
}

/// Creates an event detector for the switching function `value`, with a
/// goal of zero, either crossing direction and the default threshold.
pub fn event_fn<F>(value: F) -> FnDetector<F>
where
    F: Fn(f64, ArrayView1<'_, f64>) -> f64,
{
    FnDetector {
        value,
        goal: 0.,
        crossing: Crossing::Both,
        threshold: DEFAULT_THRESHOLD,
    }
}

impl<F> FnDetector<F> {
    pub fn with_goal(mut self, goal: f64) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_crossing(mut self, crossing: Crossing) -> Self {
        self.crossing = crossing;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl<F> EventDetector for FnDetector<F>
where
    F: Fn(f64, ArrayView1<'_, f64>) -> f64,
{
    fn value(&self, t: f64, state: ArrayView1<'_, f64>) -> f64 {
        (self.value)(t, state)
    }

    fn goal(&self) -> f64 {
        self.goal
    }

    fn crossing(&self) -> Crossing {
        self.crossing
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// An event located by [`Retrace::run_until_event`].
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Index of the detector that triggered.
    pub detector: usize,
    pub t: f64,
    pub state: Array1<f64>,
}

/// Propagators that can recompute their last step to an earlier end time.
pub trait Retrace: OdeIntegrate {
    /// Time at the start of the last step, or `None` before the first step.
    fn step_start(&self) -> Option<f64>;

    /// Writes the state at `t`, recomputed from the start of the last step,
    /// to `out`. `t` must lie within the last step.
    fn state_in_step(&mut self, t: f64, out: ArrayViewMut1<'_, f64>) -> Result<(), Error>;

    /// Ends the last step at `t` instead, recomputing the current state.
    /// `t` must lie within the last step.
    fn truncate_step(&mut self, t: f64) -> Result<(), Error>;

    /// Integrate until one of `detectors` triggers or `time_bound` is
    /// reached.
    ///
    /// When several detectors trigger within the same step, the earliest
    /// event is reported and the propagator stops at its time. Calling again
    /// continues past the event.
    fn run_until_event(
        &mut self,
        detectors: &[&dyn EventDetector],
    ) -> Result<Option<Event>, Error> {
        let mut before: Vec<f64> = detectors
            .iter()
            .map(|d| d.difference(self.time(), self.state()))
            .collect();
        let mut buffer = Array1::zeros(self.len());
        while !self.finished() {
            self.step()?;
            let (t0, t1) = match self.step_start() {
                Some(t0) => (t0, self.time()),
                None => continue,
            };
            let mut earliest: Option<(usize, f64)> = None;
            for (i, detector) in detectors.iter().enumerate() {
                let after = detector.difference(t1, self.state());
                if !detector.crossing().crossed(before[i], after) {
                    before[i] = after;
                    continue;
                }
                let t_event = locate(
                    |t| {
                        self.state_in_step(t, buffer.view_mut())?;
                        Ok(detector.difference(t, buffer.view()))
                    },
                    (t0, before[i]),
                    (t1, after),
                    detector.threshold(),
                )?;
                if earliest.map_or(true, |(_, t)| (t_event - t0).abs() < (t - t0).abs()) {
                    earliest = Some((i, t_event));
                }
            }
            if let Some((detector, t)) = earliest {
                self.truncate_step(t)?;
                log::debug!("event of detector {} located at t = {}", detector, t);
                return Ok(Some(Event {
                    detector,
                    t: self.time(),
                    state: self.state().to_owned(),
                }));
            }
        }
        Ok(None)
    }
}

/// Locates the zero of `f` between `lower` and `upper`, given as
/// `(t, f(t))` pairs with `f` of opposite signs (or zero at `upper`).
///
/// Brent's method, combining bisection, the secant method and inverse
/// quadratic interpolation (R. P. Brent, "Algorithms for Minimization
/// without Derivatives", 1973). The returned time is the end of the final
/// bracket on the side of `upper`, so the difference there has already
/// crossed zero.
fn locate<F>(mut f: F, lower: (f64, f64), upper: (f64, f64), threshold: f64) -> Result<f64, Error>
where
    F: FnMut(f64) -> Result<f64, Error>,
{
    let (mut a, mut fa) = lower;
    let (mut b, mut fb) = upper;
    let far_side = fb;
    let tol = threshold.max(resolvable_step(b, 1.));

    if fa.abs() < fb.abs() {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut bisected = true;

    for _ in 0..MAX_ITERATIONS {
        if fa.abs() < fb.abs() {
            std::mem::swap(&mut a, &mut b);
            std::mem::swap(&mut fa, &mut fb);
        }
        if fb == 0. || (b - a).abs() <= tol {
            // Whichever bracket end has crossed.
            return Ok(if fb == 0. || fb * far_side > 0. { b } else { a });
        }

        let s = if fa != fc && fb != fc {
            a * fb * fc / ((fa - fb) * (fa - fc))
                + b * fa * fc / ((fb - fa) * (fb - fc))
                + c * fa * fb / ((fc - fa) * (fc - fb))
        } else if fb != fa {
            b - fb * (b - a) / (fb - fa)
        } else {
            (a + b) / 2.
        };

        let bisect = (s - (3. * a + b) / 4.) * (s - b) > 0.
            || (bisected && (s - b).abs() >= (b - c).abs() / 2.)
            || (!bisected && (s - b).abs() >= (c - d).abs() / 2.)
            || (bisected && (b - c).abs() < tol)
            || (!bisected && (c - d).abs() < tol);
        let s = if bisect { (a + b) / 2. } else { s };
        bisected = bisect;

        let fs = f(s)?;
        d = c;
        c = b;
        fc = fb;
        if fa * fs < 0. {
            b = s;
            fb = fs;
        } else {
            a = s;
            fa = fs;
        }
    }

    log::warn!(
        "event location did not converge within [{}, {}]",
        a.min(b),
        a.max(b)
    );
    Err(Error::EventNotLocated {
        lower: a.min(b),
        upper: a.max(b),
    })
}
