//! Fetch-all-pages aggregation over a list action.
//!
//! Repeatedly invokes the gateway with an advancing page cursor and
//! concatenates the pages into one logical result. Within one cursor
//! sequence calls are strictly ordered; independent sequences may run
//! concurrently as separate invocations of this controller.
//!
//! Termination conditions: upstream signals no more pages, an empty page, a
//! page whose content hash repeats a previously seen page (non-advancing
//! cursor guard), the page ceiling, the item ceiling, or the wall-clock
//! budget. Ceiling and budget termination is success with `truncated: true`.

use std::collections::HashSet;
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    Result,
    config::Limits,
    gateway::{ActionCall, ActionGateway},
};

/// Aggregated result of one cursor-following sequence.
#[derive(Debug, Clone)]
pub struct PageAggregate {
    pub items: Vec<Value>,
    /// Pages actually fetched.
    pub pages: u64,
    /// True when a ceiling or budget cut the sequence short.
    pub truncated: bool,
    /// Request id of the final page's call.
    pub last_request_id: String,
}

fn page_hash(data: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    hasher.finalize().into()
}

/// Fetch every page of a list action, up to the configured safety limits.
pub async fn fetch_all_pages(
    gateway: &dyn ActionGateway,
    call: &ActionCall,
    limits: &Limits,
) -> Result<PageAggregate> {
    let started = Instant::now();
    let budget = limits.page_budget();

    let mut items: Vec<Value> = Vec::new();
    let mut seen: HashSet<[u8; 32]> = HashSet::new();
    let mut page = call.page.unwrap_or(0);
    let mut pages: u64 = 0;
    let mut truncated = false;
    let mut last_request_id = String::new();

    loop {
        if pages >= limits.max_pages || items.len() >= limits.max_items || started.elapsed() >= budget {
            truncated = true;
            break;
        }

        let reply = gateway.invoke(&call.clone().with_page(page)).await?;
        last_request_id = reply.meta.request_id.clone();
        pages += 1;

        let page_items = match &reply.data {
            Value::Array(arr) => arr.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };

        if page_items.is_empty() {
            break;
        }

        // A repeated page means the cursor is not advancing upstream; stop
        // with what we have rather than looping forever.
        if !seen.insert(page_hash(&reply.data)) {
            debug!(target = %call.target(), page, "duplicate page content, terminating pagination");
            truncated = true;
            break;
        }

        items.extend(page_items);

        if reply.meta.has_more == Some(false) {
            break;
        }
        if let Some(total) = reply.meta.total_pages {
            if page + 1 >= call.page.unwrap_or(0) + total {
                break;
            }
        }

        page += 1;
    }

    Ok(PageAggregate {
        items,
        pages,
        truncated,
        last_request_id,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::Vars;
    use crate::testkit::ScriptedGateway;

    fn call() -> ActionCall {
        ActionCall::new("tracker", "issue", "list", Vars::new())
    }

    fn items(
        from: u64,
        n: u64,
    ) -> Value {
        json!((from..from + n).map(|i| json!({"id": i})).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_three_pages_then_empty() {
        let gateway = ScriptedGateway::new();
        gateway.push_page(items(0, 10));
        gateway.push_page(items(10, 10));
        gateway.push_page(items(20, 10));
        gateway.push_page(json!([]));

        let result = fetch_all_pages(&gateway, &call(), &Limits::default()).await.unwrap();
        assert_eq!(result.items.len(), 30);
        assert!(!result.truncated);
        assert_eq!(result.pages, 4);
    }

    #[tokio::test]
    async fn test_duplicate_page_terminates_truncated() {
        let gateway = ScriptedGateway::new();
        gateway.push_page(items(0, 10));
        gateway.push_page(items(10, 10));
        gateway.push_page(items(10, 10)); // cursor stuck: page 3 repeats page 2

        let result = fetch_all_pages(&gateway, &call(), &Limits::default()).await.unwrap();
        assert_eq!(result.items.len(), 20);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_page_ceiling_truncates() {
        let gateway = ScriptedGateway::new();
        for i in 0..10 {
            gateway.push_page(items(i * 5, 5));
        }

        let limits = Limits {
            max_pages: 3,
            ..Limits::default()
        };
        let result = fetch_all_pages(&gateway, &call(), &limits).await.unwrap();
        assert_eq!(result.pages, 3);
        assert_eq!(result.items.len(), 15);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_item_ceiling_truncates() {
        let gateway = ScriptedGateway::new();
        for i in 0..10 {
            gateway.push_page(items(i * 10, 10));
        }

        let limits = Limits {
            max_items: 25,
            ..Limits::default()
        };
        let result = fetch_all_pages(&gateway, &call(), &limits).await.unwrap();
        // the page that crossed the ceiling is kept whole
        assert_eq!(result.items.len(), 30);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_has_more_false_stops_cleanly() {
        let gateway = ScriptedGateway::new();
        gateway.push_final_page(items(0, 4));

        let result = fetch_all_pages(&gateway, &call(), &Limits::default()).await.unwrap();
        assert_eq!(result.items.len(), 4);
        assert!(!result.truncated);
        assert_eq!(result.pages, 1);
    }

    #[tokio::test]
    async fn test_sequence_is_strictly_ordered() {
        let gateway = ScriptedGateway::new();
        gateway.push_page(items(0, 2));
        gateway.push_page(items(2, 2));
        gateway.push_page(json!([]));

        fetch_all_pages(&gateway, &call(), &Limits::default()).await.unwrap();
        assert_eq!(gateway.pages_requested(), vec![0, 1, 2]);
    }
}
