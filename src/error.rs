//! Error types.

use std::fmt;

use thiserror::Error;

use crate::dynamics::EvaluationError;

/// Set of Runge–Kutta stages whose dynamics evaluation failed during one
/// step.
///
/// Stage `i` is recorded as bit `i`, so the failures of all stages of a step
/// are OR-combined into a single value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StageMask(u32);

impl StageMask {
    /// Returns the mask with no stages set.
    pub fn empty() -> StageMask {
        StageMask(0)
    }

    /// Marks stage `stage` as failed.
    pub fn insert(&mut self, stage: usize) {
        debug_assert!(stage < 32);
        self.0 |= 1 << stage;
    }

    /// Returns `true` if stage `stage` failed.
    pub fn contains(&self, stage: usize) -> bool {
        stage < 32 && self.0 & (1 << stage) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of failed stages.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Raw bit representation.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for stage in (0..32).filter(|&s| self.contains(s)) {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", stage)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// Errors produced while stepping, propagating or configuring a solver.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more stage evaluations of the dynamics failed.
    ///
    /// `source` is the first failure encountered; `stages` records every
    /// stage that failed. The state produced by the step is unreliable.
    #[error("dynamics evaluation failed in stage(s) {stages}: {source}")]
    Evaluation {
        stages: StageMask,
        #[source]
        source: EvaluationError,
    },
    /// The adaptive controller rejected too many consecutive trial steps.
    #[error("step at t = {t} rejected {attempts} times in a row without meeting tolerance")]
    StepRejected { t: f64, attempts: usize },
    /// Newton iteration of the universal Kepler equation hit its cap.
    #[error("universal Kepler iteration did not converge after {iterations} iterations (last increment {increment:e})")]
    KeplerNotConverged { iterations: usize, increment: f64 },
    /// A state or workspace had a different dimension than required.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("required step size {required} is smaller than min allowable step size {allowable}")]
    TooSmallStep { required: f64, allowable: f64 },
    #[error("t_bound is not finite")]
    TimeBoundNotFinite,
    #[error("max_step is zero or negative")]
    MaxStepZeroOrNeg,
    #[error("min_step {min_step} exceeds max_step {max_step}")]
    StepBoundsInverted { min_step: f64, max_step: f64 },
    /// The relative tolerance was too small.
    ///
    /// It must be at least `100. * f64::EPSILON`.
    #[error("rel_tol is too small")]
    TooSmallRelTol,
    #[error("abs_tol must be positive and finite")]
    InvalidTolerance,
    #[error("initial state component {0} is not finite")]
    NonFiniteInitialState(usize),
    #[error("step size {0} is not a finite non-zero value")]
    InvalidStep(f64),
    #[error("gravitational parameter {0} must be positive and finite")]
    InvalidGravitationalParameter(f64),
    #[error("propagation time {0} is not finite")]
    NonFiniteTime(f64),
    /// The position vector has zero length, so the orbit is undefined.
    #[error("position vector has zero magnitude")]
    DegeneratePosition,
    #[error("time {t} lies outside the last step [{start}, {end}]")]
    OutsideStep { t: f64, start: f64, end: f64 },
    /// The root finder hit its iteration cap while locating an event.
    #[error("event time could not be located within [{lower}, {upper}]")]
    EventNotLocated { lower: f64, upper: f64 },
}

impl Error {
    /// Returns `true` for failures of an iterative process to converge
    /// (step rejection cap, Kepler iteration cap or event location).
    pub fn is_convergence_failure(&self) -> bool {
        match self {
            Error::StepRejected { .. }
            | Error::KeplerNotConverged { .. }
            | Error::EventNotLocated { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn check_dimension(expected: usize, found: usize) -> Result<(), Error> {
        if expected == found {
            Ok(())
        } else {
            Err(Error::ShapeMismatch { expected, found })
        }
    }

    pub(crate) fn check_within_step(t: f64, start: f64, end: f64) -> Result<(), Error> {
        if t >= start.min(end) && t <= start.max(end) {
            Ok(())
        } else {
            Err(Error::OutsideStep { t, start, end })
        }
    }
}
