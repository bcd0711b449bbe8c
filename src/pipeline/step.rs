use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Result,
    gateway::ErrorPolicy,
    model::StepModel,
    pipeline::steps::{StepAction, StepKind, create_action},
};

/// step id, unique within a pipeline definition
pub type StepId = String;

/// State of a step during run execution.
///
/// Pending → Ready → Running → {Succeeded, Failed, Skipped}. A step becomes
/// Ready once every step it references is terminal; Skipped marks branch
/// subtrees a condition or switch did not select.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Failed | StepState::Skipped)
    }
}

/// Runtime step: the parsed kind-specific action plus execution state.
#[derive(Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    /// Overrides the pipeline default policy when set.
    pub on_error: Option<ErrorPolicy>,
    /// Per-step gateway call timeout override.
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub state: StepState,
    /// True when a failure was absorbed by a continue policy; the step then
    /// satisfies dependents like a success.
    #[serde(default)]
    pub continued: bool,
    /// Raw config, kept for cloning and inspection.
    pub config: serde_json::Value,
    pub action: Box<dyn StepAction>,
}

impl Clone for Step {
    fn clone(&self) -> Self {
        let action = create_action(self.kind, self.config.clone()).unwrap();

        Self {
            id: self.id.clone(),
            kind: self.kind,
            on_error: self.on_error.clone(),
            timeout: self.timeout,
            state: self.state,
            continued: self.continued,
            config: self.config.clone(),
            action,
        }
    }
}

impl Step {
    pub fn new(model: &StepModel) -> Result<Self> {
        let kind: StepKind = model
            .kind
            .parse()
            .map_err(|_| crate::FlowgateError::Step(format!("step '{}': unknown type '{}'", model.id, model.kind)))?;

        let action = create_action(kind, model.config.clone()).map_err(|e| crate::FlowgateError::Step(format!("step '{}': {}", model.id, e)))?;

        Ok(Self {
            id: model.id.clone(),
            kind,
            on_error: model.on_error.clone(),
            timeout: model.timeout_seconds.map(Duration::from_secs),
            state: StepState::Pending,
            continued: false,
            config: model.config.clone(),
            action,
        })
    }
}
