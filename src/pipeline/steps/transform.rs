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

use super::{
    StepAction, StepKind,
    script::{self, ScriptLanguage},
};

#[derive(Serialize, Deserialize, Debug, Clone)]
struct InputBinding {
    /// Name the snippet sees the value under.
    name: String,
    /// Template resolved against the context.
    value: String,
}

/// Evaluate a sandboxed snippet over declared input bindings.
///
/// The snippet can only read its bindings and return one value; it has no
/// access to the network, the file system, or the rest of the context.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransformStep {
    language: ScriptLanguage,
    code: String,
    #[serde(default)]
    inputs: Vec<InputBinding>,
}

#[async_trait]
#[typetag::serde(name = "transform")]
impl StepAction for TransformStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["language", "code"],
            "properties": {
                "language": {
                    "type": "string",
                    "enum": ["javascript", "python3"],
                    "description": "Interpreted language the snippet targets"
                },
                "code": {
                    "type": "string",
                    "description": "Snippet defining one function; it receives the bindings and returns one value"
                },
                "inputs": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "value"],
                        "properties": {
                            "name": { "type": "string" },
                            "value": { "type": "string", "description": "Template reference, e.g. ${steps.fetch.output.data}" }
                        }
                    }
                }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Transform
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let mut bindings = serde_json::Map::new();
        for input in &self.inputs {
            let value = expr::resolve_value(ctx.as_ref(), &input.value)?;
            bindings.insert(input.name.clone(), value);
        }

        let result = script::execute(self.language, &self.code, Value::Object(bindings))?;
        Ok(StepOutput::success(result))
    }
}
