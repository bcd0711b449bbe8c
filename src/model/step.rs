use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::ErrorPolicy;

/// One declared unit of work inside a pipeline definition.
///
/// `config` is kind-dependent and validated against the step kind's JSON
/// Schema at pipeline-load time, not at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepModel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    /// Overrides the pipeline's default error policy for this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Raises the default gateway call timeout for this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}
