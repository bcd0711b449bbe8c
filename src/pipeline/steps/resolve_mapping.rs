use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Result,
    expr,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

use super::{StepAction, StepKind};

/// Look up an entity mapping by canonical name and type, exposing each
/// system's local identifier to later steps.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResolveMappingStep {
    entity_type: String,
    canonical_name: String,
}

#[async_trait]
#[typetag::serde(name = "resolve_mapping")]
impl StepAction for ResolveMappingStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["entity_type", "canonical_name"],
            "properties": {
                "entity_type": { "type": "string" },
                "canonical_name": { "type": "string", "description": "Supports template references" }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::ResolveMapping
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let entity_type = expr::resolve_str(ctx.as_ref(), &self.entity_type)?;
        let canonical_name = expr::resolve_str(ctx.as_ref(), &self.canonical_name)?;

        let mapping = ctx.mappings().get(&entity_type, &canonical_name)?;
        Ok(StepOutput::success(serde_json::to_value(mapping)?))
    }
}
