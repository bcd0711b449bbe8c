use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Result,
    common::Vars,
    expr,
    gateway::ActionCall,
    pipeline::{OutputMeta, StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Mutate an external system through one action call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WriteStep {
    system: String,
    resource: String,
    action: String,
    #[serde(default)]
    params: Value,
}

#[async_trait]
#[typetag::serde(name = "write")]
impl StepAction for WriteStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["system", "resource", "action"],
            "properties": {
                "system": { "type": "string", "description": "System alias from the catalog" },
                "resource": { "type": "string" },
                "action": { "type": "string" },
                "params": {
                    "type": "object",
                    "description": "Action parameters; string values support template references"
                }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Write
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let resolved = expr::resolve_json(ctx.as_ref(), &self.params)?;
        let call = ActionCall::new(&self.system, &self.resource, &self.action, Vars::from(resolved));

        ctx.throttle().await;

        let reply = ctx.gateway().invoke(&call).await?;
        Ok(StepOutput {
            data: reply.data,
            meta: OutputMeta {
                count: reply.meta.count,
                pages: 1,
                duration_ms: reply.meta.duration_ms,
                request_id: Some(reply.meta.request_id),
                ..Default::default()
            },
            error: None,
        })
    }
}
