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

use super::{BRANCH_FALSE, BRANCH_TRUE, RESULT_KEY, SELECTED_KEY, StepAction, StepKind};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Empty,
    NotEmpty,
    Null,
    NotNull,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Predicate {
    /// Template whose resolved value is compared.
    pub selector: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Boolean branch point: evaluates its predicates, marks the chosen branch
/// target ready, and skips the unchosen branch's subtree.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConditionStep {
    pub conditions: Vec<Predicate>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub then_step: StepId,
    #[serde(default)]
    pub else_step: Option<StepId>,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn values_equal(
    actual: &Value,
    expected: &Value,
) -> bool {
    if actual == expected {
        return true;
    }
    // numeric comparison tolerates string-typed numbers
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a == e;
    }
    false
}

fn compare_numbers<F>(
    actual: &Value,
    expected: Option<&Value>,
    cmp: F,
) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (as_number(actual), expected.and_then(as_number)) {
        (Some(a), Some(e)) => cmp(a, e),
        _ => false,
    }
}

fn contains(
    actual: &Value,
    expected: &Value,
) -> bool {
    match actual {
        Value::String(s) => expected.as_str().map(|e| s.contains(e)).unwrap_or(false),
        Value::Array(items) => items.iter().any(|v| values_equal(v, expected)),
        _ => false,
    }
}

fn is_empty(actual: &Value) -> bool {
    match actual {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Evaluate one comparison; `actual` is None when the selector did not
/// resolve (a missing value, not an error, for predicates).
pub fn evaluate(
    actual: &Option<Value>,
    op: CompareOp,
    expected: &Option<Value>,
) -> bool {
    match op {
        CompareOp::Null => actual.is_none() || matches!(actual, Some(Value::Null)),
        CompareOp::NotNull => actual.is_some() && !matches!(actual, Some(Value::Null)),
        CompareOp::Empty => actual.as_ref().map(is_empty).unwrap_or(true),
        CompareOp::NotEmpty => actual.as_ref().map(|v| !is_empty(v)).unwrap_or(false),
        _ => {
            let Some(actual) = actual else {
                return false;
            };
            match op {
                CompareOp::Eq => expected.as_ref().map(|e| values_equal(actual, e)).unwrap_or(false),
                CompareOp::Ne => expected.as_ref().map(|e| !values_equal(actual, e)).unwrap_or(false),
                CompareOp::Gt => compare_numbers(actual, expected.as_ref(), |a, e| a > e),
                CompareOp::Lt => compare_numbers(actual, expected.as_ref(), |a, e| a < e),
                CompareOp::Ge => compare_numbers(actual, expected.as_ref(), |a, e| a >= e),
                CompareOp::Le => compare_numbers(actual, expected.as_ref(), |a, e| a <= e),
                CompareOp::Contains => expected.as_ref().map(|e| contains(actual, e)).unwrap_or(false),
                CompareOp::NotContains => expected.as_ref().map(|e| !contains(actual, e)).unwrap_or(false),
                CompareOp::StartsWith => match (actual.as_str(), expected.as_ref().and_then(|e| e.as_str())) {
                    (Some(a), Some(e)) => a.starts_with(e),
                    _ => false,
                },
                CompareOp::EndsWith => match (actual.as_str(), expected.as_ref().and_then(|e| e.as_str())) {
                    (Some(a), Some(e)) => a.ends_with(e),
                    _ => false,
                },
                CompareOp::In => match expected {
                    Some(Value::Array(options)) => options.iter().any(|e| values_equal(actual, e)),
                    _ => false,
                },
                CompareOp::NotIn => match expected {
                    Some(Value::Array(options)) => !options.iter().any(|e| values_equal(actual, e)),
                    _ => false,
                },
                _ => false,
            }
        }
    }
}

#[async_trait]
#[typetag::serde(name = "condition")]
impl StepAction for ConditionStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["conditions", "then_step"],
            "properties": {
                "conditions": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["selector", "op"],
                        "properties": {
                            "selector": { "type": "string" },
                            "op": {
                                "type": "string",
                                "enum": [
                                    "eq", "ne", "gt", "lt", "ge", "le",
                                    "contains", "not_contains", "starts_with", "ends_with",
                                    "in", "not_in", "empty", "not_empty", "null", "not_null"
                                ]
                            },
                            "value": {}
                        }
                    }
                },
                "logical_operator": { "type": "string", "enum": ["and", "or"] },
                "then_step": { "type": "string" },
                "else_step": { "type": ["string", "null"] }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn branch_targets(&self) -> Vec<(String, StepId)> {
        let mut targets = vec![(BRANCH_TRUE.to_string(), self.then_step.clone())];
        if let Some(else_step) = &self.else_step {
            targets.push((BRANCH_FALSE.to_string(), else_step.clone()));
        }
        targets
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        _sid: StepId,
    ) -> Result<StepOutput> {
        let mut results = Vec::with_capacity(self.conditions.len());
        for predicate in &self.conditions {
            let actual = expr::resolve_value(ctx.as_ref(), &predicate.selector).ok();
            results.push(evaluate(&actual, predicate.op, &predicate.value));
        }

        let outcome = match self.logical_operator {
            LogicalOperator::And => results.iter().all(|r| *r),
            LogicalOperator::Or => results.iter().any(|r| *r),
        };

        let selected = if outcome { BRANCH_TRUE } else { BRANCH_FALSE };
        let outputs = Vars::new().with(RESULT_KEY, outcome).with(SELECTED_KEY, selected);

        Ok(StepOutput::success(outputs.into()))
    }
}
