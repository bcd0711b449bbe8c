use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Result,
    common::Vars,
    expr,
    gateway::{ActionCall, fetch_all_pages},
    pipeline::{OutputMeta, StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Read one action's result, optionally aggregating every page.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadStep {
    system: String,
    resource: String,
    action: String,
    #[serde(default)]
    params: Value,
    /// Aggregate all pages through the pagination controller.
    #[serde(default)]
    fetch_all_pages: bool,
    /// Fetch one specific page instead of the first.
    #[serde(default)]
    page: Option<u64>,
}

#[async_trait]
#[typetag::serde(name = "read")]
impl StepAction for ReadStep {
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
                },
                "fetch_all_pages": {
                    "type": "boolean",
                    "description": "Aggregate all pages up to the safety limits",
                    "default": false
                },
                "page": { "type": ["integer", "null"], "minimum": 0 }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Read
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let resolved = expr::resolve_json(ctx.as_ref(), &self.params)?;
        let mut call = ActionCall::new(&self.system, &self.resource, &self.action, Vars::from(resolved));
        call.page = self.page;

        ctx.throttle().await;

        if self.fetch_all_pages {
            let limits = ctx.limits();
            let aggregate = fetch_all_pages(ctx.gateway().as_ref(), &call, &limits).await?;
            let count = aggregate.items.len();
            return Ok(StepOutput {
                data: Value::Array(aggregate.items),
                meta: OutputMeta {
                    count,
                    pages: aggregate.pages,
                    request_id: Some(aggregate.last_request_id),
                    truncated: aggregate.truncated,
                    ..Default::default()
                },
                error: None,
            });
        }

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
