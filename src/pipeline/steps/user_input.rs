use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    FlowgateError, Result,
    common::Vars,
    expr,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Suspend the run pending an external response.
///
/// The host delivers a value through `Engine::provide_input`. On timeout the
/// step resolves to its configured default value, or fails with a timeout
/// when none is configured. Other branches keep running while this waits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserInputStep {
    #[serde(default)]
    prompt: String,
    timeout_seconds: u64,
    #[serde(default)]
    default: Option<Value>,
}

#[async_trait]
#[typetag::serde(name = "user_input")]
impl StepAction for UserInputStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["timeout_seconds"],
            "properties": {
                "prompt": { "type": "string", "description": "Supports template references" },
                "timeout_seconds": { "type": "integer", "minimum": 1 },
                "default": { "description": "Value used when the wait times out" }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::UserInput
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        sid: StepId,
    ) -> Result<StepOutput> {
        let prompt = expr::resolve_str(ctx.as_ref(), &self.prompt)?;
        if !prompt.is_empty() {
            ctx.emit_log(sid.clone(), prompt);
        }

        let receiver = ctx.register_input(&sid);
        let timeout = Duration::from_secs(self.timeout_seconds);

        let value = tokio::select! {
            received = receiver => match received {
                Ok(value) => value,
                Err(_) => {
                    return Err(FlowgateError::Runtime(format!("input channel for step '{}' closed", sid)));
                }
            },
            _ = tokio::time::sleep(timeout) => {
                ctx.clear_input(&sid);
                match &self.default {
                    Some(default) => {
                        let outputs = Vars::new().with("value", default.clone()).with("timed_out", true);
                        return Ok(StepOutput::success(outputs.into()));
                    }
                    None => {
                        return Err(FlowgateError::Timeout(format!(
                            "step '{}' received no input within {}s",
                            sid, self.timeout_seconds
                        )));
                    }
                }
            }
        };

        let outputs = Vars::new().with("value", value).with("timed_out", false);
        Ok(StepOutput::success(outputs.into()))
    }
}
