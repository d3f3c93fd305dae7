//! Scratch storage shared by the stages of a Runge–Kutta step.

use ndarray::prelude::*;

/// Stage derivatives, midpoint state and error estimate for one integration
/// stream.
///
/// A workspace is sized for a state dimension `n` and a stage count `s` and
/// is reused across any number of steps. [`Workspace::reset`] is the only
/// operation that changes its shape, and it reallocates only when the shape
/// actually differs.
#[derive(Clone, Debug)]
pub struct Workspace {
    /// Stage derivatives, shape `(s, n)`; row `i` holds `k_i`.
    pub(crate) stages: Array2<f64>,
    /// Input state of the stage being evaluated, length `n`.
    pub(crate) midpoint: Array1<f64>,
    /// Truncation error per unit step length, length `n`.
    pub(crate) error: Array1<f64>,
    allocations: usize,
}

impl Default for Workspace {
    fn default() -> Workspace {
        Workspace::new()
    }
}

impl Workspace {
    /// Creates an empty workspace (dimension and stage count zero).
    pub fn new() -> Workspace {
        Workspace {
            stages: Array2::zeros((0, 0)),
            midpoint: Array1::zeros(0),
            error: Array1::zeros(0),
            allocations: 0,
        }
    }

    /// Creates a workspace already sized for `dimension` and `num_stages`.
    pub fn with_shape(dimension: usize, num_stages: usize) -> Workspace {
        let mut workspace = Workspace::new();
        workspace.reset(dimension, num_stages);
        workspace
    }

    /// Sizes the buffers for a state of length `dimension` and a method with
    /// `num_stages` stages.
    ///
    /// All buffers are replaced together when the shape differs from the
    /// current one; otherwise this is a no-op and existing contents are kept.
    pub fn reset(&mut self, dimension: usize, num_stages: usize) {
        if self.dimension() == dimension && self.num_stages() == num_stages {
            return;
        }
        log::debug!(
            "reallocating workspace: {}x{} -> {}x{}",
            self.num_stages(),
            self.dimension(),
            num_stages,
            dimension
        );
        self.stages = Array2::zeros((num_stages, dimension));
        self.midpoint = Array1::zeros(dimension);
        self.error = Array1::zeros(dimension);
        self.allocations += 1;
    }

    /// Length of the state vectors the buffers are sized for.
    pub fn dimension(&self) -> usize {
        self.midpoint.len()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.nrows()
    }

    /// Number of times the buffers have been (re)allocated.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Derivative computed by stage `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.num_stages()`.
    pub fn stage(&self, i: usize) -> ArrayView1<'_, f64> {
        self.stages.row(i)
    }

    pub fn stage_mut(&mut self, i: usize) -> ArrayViewMut1<'_, f64> {
        self.stages.row_mut(i)
    }

    /// All stage derivatives, shape `(num_stages, dimension)`.
    pub fn stages(&self) -> ArrayView2<'_, f64> {
        self.stages.view()
    }

    pub fn midpoint(&self) -> ArrayView1<'_, f64> {
        self.midpoint.view()
    }

    pub fn midpoint_mut(&mut self) -> ArrayViewMut1<'_, f64> {
        self.midpoint.view_mut()
    }

    /// Per-component truncation error per unit step length of the last step
    /// taken by an embedded method.
    ///
    /// Multiply by the step length to get an absolute error estimate.
    pub fn error(&self) -> ArrayView1<'_, f64> {
        self.error.view()
    }

    pub fn error_mut(&mut self) -> ArrayViewMut1<'_, f64> {
        self.error.view_mut()
    }
}
