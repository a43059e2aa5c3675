//! Progress update callbacks

/// Observer for long-running flash operations.
///
/// All methods default to no-ops, implement whichever events the frontend
/// cares about. Percentages are in `0.0..=100.0` and never decrease within
/// one operation.
pub trait ProgressCallbacks {
    /// A chunked operation is about to start
    fn on_start(&mut self) {}
    /// Progress of the current operation
    fn on_progress(&mut self, _percent: f32) {}
    /// The current operation finished successfully
    fn on_end(&mut self) {}
    /// Human-readable detail, timings and throughput included
    fn on_info(&mut self, _text: &str) {}
}

/// Default sink that swallows every event.
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {}
