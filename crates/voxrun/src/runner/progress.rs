//! Progress callback for reporting batch progress.
//!
//! The orchestrator emits one event when the batch starts, one per case on
//! start and completion, and one when the batch settles. Case events arrive
//! in completion order, which is not the input order.

use crate::model::RunId;

/// Event emitted during batch execution for progress tracking.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Batch has passed validation and is about to fan out.
    BatchStarted {
        /// Identifier shared by every run in the batch.
        run_id: RunId,
        /// Number of cases in the batch.
        total_cases: usize,
    },
    /// A case has started processing.
    CaseStarted {
        /// Position of the case in the request (0-based).
        index: usize,
        /// Case identifier.
        case_id: String,
    },
    /// A case has produced its run record.
    CaseCompleted {
        /// Position of the case in the request (0-based).
        index: usize,
        /// Case identifier.
        case_id: String,
        /// Whether the analysis failed for this case.
        failed: bool,
        /// Duration in milliseconds.
        duration_ms: u64,
    },
    /// Every case has settled.
    BatchCompleted {
        /// Identifier shared by every run in the batch.
        run_id: RunId,
        /// Number of cases whose analysis failed.
        failed_cases: usize,
        /// Total duration in milliseconds.
        duration_ms: u64,
    },
}

/// Trait for receiving progress events during execution.
///
/// Callbacks are invoked from concurrently running case tasks.
pub trait ProgressCallback: Send + Sync {
    /// Called for each progress event.
    fn on_progress(&self, event: &ProgressEvent);
}

/// A no-op progress callback that discards all events.
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// A progress callback that collects events for testing.
#[derive(Default)]
pub struct CollectingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    /// Create a new collecting progress callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    ///
    /// A poisoned lock yields the events collected so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressCallback for CollectingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
