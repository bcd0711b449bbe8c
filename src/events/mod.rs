//! Event types emitted during run execution.
//!
//! Events notify subscribers about run and step state changes; the engine
//! monitor persists them, and session-layer callers may subscribe for
//! server-initiated notifications.

mod run;
mod step;

pub use run::*;
pub use step::*;

use crate::{pipeline::StepId, runtime::RunId};

/// Generic event wrapper.
#[derive(Debug, Clone)]
pub struct Event<T> {
    inner: T,
}

/// Top-level event type for run execution.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Run-level events (start, succeeded, failed, aborted).
    Run(RunEvent),
    /// Step-level events (running, succeeded, failed, skipped, retry).
    Step(StepEvent),
}

/// Event message with run and step context.
#[derive(Debug, Clone)]
pub struct Message {
    /// Run that generated this event.
    pub run_id: RunId,
    /// Step that generated this event (empty for run events).
    pub step_id: StepId,
    /// The actual event data.
    pub event: FlowEvent,
}

/// Log entry emitted during step execution.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub run_id: RunId,
    pub step_id: StepId,
    pub content: String,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
}

impl<T> std::ops::Deref for Event<T>
where
    T: std::fmt::Debug + Clone,
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> Event<T>
where
    T: std::fmt::Debug + Clone,
{
    pub fn new(inner: &T) -> Self {
        Self {
            inner: inner.clone(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl FlowEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, FlowEvent::Run(RunEvent::Succeeded))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FlowEvent::Run(RunEvent::Failed(_)))
    }
}
