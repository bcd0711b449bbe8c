use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    Result,
    common::Vars,
    expr,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Delivery collaborator the notify step delegates to. Transports (email,
/// chat) live outside this crate; the default implementation logs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        target: &str,
        subject: &str,
        body: &str,
    ) -> Result<()>;
}

/// Default notifier: structured log output only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        target: &str,
        subject: &str,
        body: &str,
    ) -> Result<()> {
        info!(target_channel = %target, subject = %subject, body = %body, "notification");
        Ok(())
    }
}

/// Send a notification through the registered collaborator. Write-like: the
/// output carries only delivery success.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotifyStep {
    /// Delivery target (address, channel name); template-resolvable.
    target: String,
    #[serde(default)]
    subject: String,
    message: String,
}

#[async_trait]
#[typetag::serde(name = "notify")]
impl StepAction for NotifyStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["target", "message"],
            "properties": {
                "target": { "type": "string" },
                "subject": { "type": "string" },
                "message": { "type": "string", "description": "Supports template references" }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Notify
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let target = expr::resolve_str(ctx.as_ref(), &self.target)?;
        let subject = expr::resolve_str(ctx.as_ref(), &self.subject)?;
        let message = expr::resolve_str(ctx.as_ref(), &self.message)?;

        ctx.notifier().notify(&target, &subject, &message).await?;

        let outputs = Vars::new().with("delivered", true).with("target", target.as_str());
        Ok(StepOutput::success(outputs.into()))
    }
}
