use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Result,
    common::Vars,
    expr,
    pipeline::{StepId, StepOutput},
    runtime::Context,
};

use super::{BRANCH_DEFAULT, SELECTED_KEY, StepAction, StepKind, condition::evaluate, condition::CompareOp};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CaseArm {
    /// Matched by value equality against the resolved selector.
    pub value: Value,
    pub step: StepId,
}

/// N-way branch point: selects the first case whose value equals the
/// resolved selector, or the default branch when no case matches. Unselected
/// branch subtrees are skipped.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SwitchStep {
    pub selector: String,
    pub cases: Vec<CaseArm>,
    #[serde(default)]
    pub default_step: Option<StepId>,
}

/// Branch handle for a case value.
pub fn case_handle(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
#[typetag::serde(name = "switch")]
impl StepAction for SwitchStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["selector", "cases"],
            "properties": {
                "selector": { "type": "string", "description": "Template whose value picks the case" },
                "cases": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["value", "step"],
                        "properties": {
                            "value": {},
                            "step": { "type": "string" }
                        }
                    }
                },
                "default_step": { "type": ["string", "null"] }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Switch
    }

    fn branch_targets(&self) -> Vec<(String, StepId)> {
        let mut targets: Vec<(String, StepId)> = self.cases.iter().map(|arm| (case_handle(&arm.value), arm.step.clone())).collect();
        if let Some(default_step) = &self.default_step {
            targets.push((BRANCH_DEFAULT.to_string(), default_step.clone()));
        }
        targets
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let resolved = expr::resolve_value(ctx.as_ref(), &self.selector)?;

        let selected = self
            .cases
            .iter()
            .find(|arm| evaluate(&Some(resolved.clone()), CompareOp::Eq, &Some(arm.value.clone())))
            .map(|arm| case_handle(&arm.value))
            .unwrap_or_else(|| BRANCH_DEFAULT.to_string());

        let outputs = Vars::new().with(SELECTED_KEY, selected.as_str()).with("value", resolved);
        Ok(StepOutput::success(outputs.into()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_case_handles() {
        assert_eq!(case_handle(&json!("high")), "high");
        assert_eq!(case_handle(&json!(3)), "3");
        assert_eq!(case_handle(&json!(true)), "true");
    }

    #[test]
    fn test_branch_targets_include_default() {
        let step = SwitchStep {
            selector: "${var:priority}".to_string(),
            cases: vec![
                CaseArm {
                    value: json!("high"),
                    step: "page_oncall".to_string(),
                },
                CaseArm {
                    value: json!("low"),
                    step: "file_ticket".to_string(),
                },
            ],
            default_step: Some("triage".to_string()),
        };
        let targets = step.branch_targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[2], ("default".to_string(), "triage".to_string()));
    }
}
