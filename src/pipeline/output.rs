//! The uniform step output envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata committed alongside every step output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputMeta {
    /// Item count for list payloads, 1 for scalar payloads.
    pub count: usize,
    /// Pages fetched when pagination was involved, otherwise 1.
    pub pages: u64,
    pub duration_ms: u64,
    /// Request id of the producing gateway call; absent for steps that make
    /// no external call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// True when a safety ceiling or budget cut a fetch-all-pages short.
    #[serde(default)]
    pub truncated: bool,
    /// Invocations made for this output, counting retries.
    #[serde(default)]
    pub attempts: u64,
}

/// Result of one step. Committed exactly once per attempt by the scheduler;
/// immutable once committed; only a newer attempt may replace it.
///
/// A failure absorbed by a continue policy commits an empty payload with the
/// `error` flag set, so dependents can distinguish it from a genuinely empty
/// successful result without inspecting payload shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepOutput {
    pub data: Value,
    pub meta: OutputMeta,
    /// Always present in the envelope (null on success), so dependents can
    /// reference `output.error` without caring how the step ended.
    pub error: Option<String>,
}

impl StepOutput {
    pub fn success(data: Value) -> Self {
        let count = match &data {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => 1,
        };
        Self {
            data,
            meta: OutputMeta {
                count,
                pages: 1,
                ..Default::default()
            },
            error: None,
        }
    }

    pub fn with_meta(
        mut self,
        meta: OutputMeta,
    ) -> Self {
        self.meta = meta;
        self
    }

    /// An absorbed failure: empty payload, error flag set.
    pub fn continued(error: String) -> Self {
        Self {
            data: Value::Null,
            meta: OutputMeta::default(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The envelope as JSON, as exposed to template references.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_success_counts_items() {
        let output = StepOutput::success(json!([1, 2, 3]));
        assert_eq!(output.meta.count, 3);
        assert!(!output.is_error());

        let scalar = StepOutput::success(json!({"id": 1}));
        assert_eq!(scalar.meta.count, 1);
    }

    #[test]
    fn test_continued_is_flagged() {
        let output = StepOutput::continued("upstream 503".to_string());
        assert!(output.is_error());
        assert_eq!(output.data, Value::Null);
        // an empty success is not flagged
        assert!(!StepOutput::success(Value::Null).is_error());
    }

    #[test]
    fn test_envelope_paths() {
        let output = StepOutput::success(json!({"id": 9}));
        let value = output.to_value();
        assert_eq!(value["data"]["id"], json!(9));
        assert_eq!(value["meta"]["count"], json!(1));
    }
}
