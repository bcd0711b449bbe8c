use crate::pipeline::StepId;

#[derive(Debug, Clone)]
pub enum RunEvent {
    Start(RunStartEvent),
    Succeeded,
    Failed(RunFailedEvent),
    Aborted(RunAbortedEvent),
}

impl RunEvent {
    pub fn str(&self) -> &str {
        match self {
            RunEvent::Start(_) => "Running",
            RunEvent::Succeeded => "Succeeded",
            RunEvent::Failed(_) => "Failed",
            RunEvent::Aborted(_) => "Aborted",
        }
    }
}

/// Emitted when a run starts, carrying every step id for batch init.
#[derive(Debug, Clone)]
pub struct RunStartEvent {
    pub step_ids: Vec<StepId>,
}

/// Terminal failure: which step produced it and on which attempt.
#[derive(Debug, Clone)]
pub struct RunFailedEvent {
    pub error: String,
    pub step_id: StepId,
    pub attempts: u64,
}

#[derive(Debug, Clone)]
pub struct RunAbortedEvent {
    pub reason: String,
}
