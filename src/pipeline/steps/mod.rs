pub mod condition;
pub mod for_each;
pub mod notify;
pub mod read;
pub mod resolve_mapping;
pub mod script;
pub mod switch;
pub mod transform;
pub mod user_input;
pub mod wait;
pub mod write;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

pub use condition::ConditionStep;
pub use for_each::ForEachStep;
pub use notify::{LogNotifier, Notifier, NotifyStep};
pub use read::ReadStep;
pub use resolve_mapping::ResolveMappingStep;
pub use switch::SwitchStep;
pub use transform::TransformStep;
pub use user_input::UserInputStep;
pub use wait::WaitStep;
pub use write::WriteStep;

/// Output key naming the branch a condition or switch selected.
pub const SELECTED_KEY: &str = "selected";
/// Output key carrying a condition's boolean result.
pub const RESULT_KEY: &str = "result";
/// Branch handle for a condition's true branch.
pub const BRANCH_TRUE: &str = "true";
/// Branch handle for a condition's false branch.
pub const BRANCH_FALSE: &str = "false";
/// Branch handle for a switch's default branch.
pub const BRANCH_DEFAULT: &str = "default";

/// The ten step kinds a pipeline may declare.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepKind {
    Read,
    Write,
    Transform,
    Condition,
    Switch,
    Loop,
    Wait,
    Notify,
    UserInput,
    ResolveMapping,
}

#[async_trait]
#[typetag::serde(tag = "type")]
pub trait StepAction: Send + Sync {
    /// Build the action from its kind-specific config, validating against
    /// the kind's schema. Called at pipeline-load time.
    fn create(config: serde_json::Value) -> Result<Self>
    where
        Self: Sized;

    /// JSON Schema for the kind's config block.
    fn schema() -> serde_json::Value
    where
        Self: Sized;

    fn kind(&self) -> StepKind;

    /// Execute against the run context. Parameter resolution happens here;
    /// the dispatcher wraps this call with the error/retry policy and the
    /// step timeout.
    async fn run(
        &self,
        ctx: Arc<Context>,
        sid: StepId,
    ) -> Result<StepOutput>;

    /// Branch handle → target step pairs this action selects between.
    /// Non-branching kinds return nothing.
    fn branch_targets(&self) -> Vec<(String, StepId)> {
        Vec::new()
    }

    /// Step ids declared inside this action's nested body (loop bodies).
    /// Excluded from top-level dependency scanning.
    fn local_step_ids(&self) -> Vec<StepId> {
        Vec::new()
    }
}

/// Instantiate the action for a step kind.
pub fn create_action(
    kind: StepKind,
    config: serde_json::Value,
) -> Result<Box<dyn StepAction>> {
    match kind {
        StepKind::Read => Ok(Box::new(ReadStep::create(config)?)),
        StepKind::Write => Ok(Box::new(WriteStep::create(config)?)),
        StepKind::Transform => Ok(Box::new(TransformStep::create(config)?)),
        StepKind::Condition => Ok(Box::new(ConditionStep::create(config)?)),
        StepKind::Switch => Ok(Box::new(SwitchStep::create(config)?)),
        StepKind::Loop => Ok(Box::new(ForEachStep::create(config)?)),
        StepKind::Wait => Ok(Box::new(WaitStep::create(config)?)),
        StepKind::Notify => Ok(Box::new(NotifyStep::create(config)?)),
        StepKind::UserInput => Ok(Box::new(UserInputStep::create(config)?)),
        StepKind::ResolveMapping => Ok(Box::new(ResolveMappingStep::create(config)?)),
    }
}
