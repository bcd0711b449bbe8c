//! Action invocation contract.
//!
//! An [`ActionGateway`] turns one (system, resource, action) triple plus
//! already-resolved parameters into a data payload and call metadata, or a
//! typed failure. The gateway never retries internally; the retry policy in
//! [`retry`] wraps it so the pipeline executor and the tool layer share one
//! policy. Fetch-all-pages aggregation lives in [`paginate`].

pub mod http;
pub mod paginate;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, common::Vars};

pub use http::HttpGateway;
pub use paginate::{PageAggregate, fetch_all_pages};
pub use retry::{Attempted, ErrorPolicy, PolicyAction, run_with_policy};

/// One request against an external action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCall {
    pub system: String,
    pub resource: String,
    pub action: String,
    pub params: Vars,
    /// Page cursor for paginated list actions.
    #[serde(default)]
    pub page: Option<u64>,
    /// Per-call timeout override, in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ActionCall {
    pub fn new(
        system: &str,
        resource: &str,
        action: &str,
        params: Vars,
    ) -> Self {
        Self {
            system: system.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            params,
            page: None,
            timeout_seconds: None,
        }
    }

    pub fn with_page(
        mut self,
        page: u64,
    ) -> Self {
        self.page = Some(page);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// `system.resource.action` label for logs and errors.
    pub fn target(&self) -> String {
        format!("{}.{}.{}", self.system, self.resource, self.action)
    }
}

/// Metadata attached to every gateway reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMeta {
    /// Unique per call; fresh on every attempt. Used for tracing and for
    /// pagination dedup detection.
    pub request_id: String,
    /// Item count for list replies, 1 for scalar replies.
    pub count: usize,
    pub duration_ms: u64,
    /// Whether the upstream signalled more pages; None when unknown.
    pub has_more: Option<bool>,
    /// Total page count when the upstream reports one.
    pub total_pages: Option<u64>,
}

impl CallMeta {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            count: 0,
            duration_ms: 0,
            has_more: None,
            total_pages: None,
        }
    }
}

/// A successful gateway reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReply {
    pub data: Value,
    pub meta: CallMeta,
}

/// Uniform contract for invoking one external action.
///
/// Implementations map transport-level failures onto the typed error
/// variants: `Authentication`, `NotFound`, `RateLimited`, `Timeout`,
/// `Remote`, and `Validation` for parameters rejected before dispatch.
#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn invoke(
        &self,
        call: &ActionCall,
    ) -> Result<ActionReply>;
}
