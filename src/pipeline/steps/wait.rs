use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Result,
    common::Vars,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Suspend this branch for a fixed duration. Independent branches keep
/// running; only dependents of this step wait.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WaitStep {
    duration_seconds: f64,
}

#[async_trait]
#[typetag::serde(name = "wait")]
impl StepAction for WaitStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["duration_seconds"],
            "properties": {
                "duration_seconds": { "type": "number", "minimum": 0 }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Wait
    }

    async fn run(
        &self,
        _ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let duration = Duration::from_secs_f64(self.duration_seconds.max(0.0));
        tokio::time::sleep(duration).await;

        let outputs = Vars::new().with("waited_ms", duration.as_millis() as u64);
        Ok(StepOutput::success(outputs.into()))
    }
}
