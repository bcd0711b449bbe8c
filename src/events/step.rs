use std::fmt;

#[derive(Debug, Clone)]
pub enum StepEvent {
    Running(i64),
    Succeeded(i64),
    /// Failure absorbed by a continue policy; the run proceeds.
    Continued(String),
    Skipped,
    Retry,
    Stopped(i64),
    Error(ErrorReason),
}

impl StepEvent {
    pub fn str(&self) -> &str {
        match self {
            StepEvent::Running(_) => "Running",
            StepEvent::Succeeded(_) => "Succeeded",
            StepEvent::Continued(_) => "Continued",
            StepEvent::Skipped => "Skipped",
            StepEvent::Retry => "Retry",
            StepEvent::Stopped(_) => "Stopped",
            StepEvent::Error(_) => "Error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ErrorReason {
    Timeout,
    Failed(String),
    SkippedDependency(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ErrorReason::Timeout => write!(f, "Timeout"),
            ErrorReason::Failed(msg) => write!(f, "Failed: {}", msg),
            ErrorReason::SkippedDependency(msg) => write!(f, "Skipped dependency: {}", msg),
        }
    }
}
