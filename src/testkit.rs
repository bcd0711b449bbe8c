//! Test support: a scripted gateway and context builders.

use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    FlowgateError, Result,
    config::Limits,
    gateway::{ActionCall, ActionGateway, ActionReply, CallMeta},
    mapping::MappingStore,
    pipeline::steps::LogNotifier,
    runtime::{Channel, Context, RuntimeParts},
    utils,
};

/// Gateway with scripted replies, failure injection, and concurrency
/// accounting.
pub(crate) struct ScriptedGateway {
    /// Queued page replies `(data, has_more)`; empty queue serves the
    /// default reply.
    pages: Mutex<VecDeque<(Value, Option<bool>)>>,
    default_reply: Mutex<Value>,
    /// Fail this many invocations before succeeding.
    fail_first: AtomicU64,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ActionCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[allow(unused)]
impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(json!({"ok": true})),
            fail_first: AtomicU64::new(0),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn push_page(
        &self,
        data: Value,
    ) {
        self.pages.lock().unwrap().push_back((data, None));
    }

    /// A page the upstream marks as the last one.
    pub fn push_final_page(
        &self,
        data: Value,
    ) {
        self.pages.lock().unwrap().push_back((data, Some(false)));
    }

    pub fn set_default_reply(
        &self,
        data: Value,
    ) {
        *self.default_reply.lock().unwrap() = data;
    }

    pub fn fail_first(
        &self,
        n: u64,
    ) {
        self.fail_first.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(
        &self,
        delay: Duration,
    ) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Order of invoked actions, as `system.resource.action`.
    pub fn targets(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.target()).collect()
    }

    pub fn pages_requested(&self) -> Vec<u64> {
        self.calls.lock().unwrap().iter().map(|c| c.page.unwrap_or(0)).collect()
    }

    /// Peak simultaneous in-flight invocations.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a ScriptedGateway);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActionGateway for ScriptedGateway {
    async fn invoke(
        &self,
        call: &ActionCall,
    ) -> Result<ActionReply> {
        self.calls.lock().unwrap().push(call.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(self);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(FlowgateError::Timeout("scripted failure".to_string()));
        }

        let (data, has_more) = self
            .pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.default_reply.lock().unwrap().clone(), None));

        let count = match &data {
            Value::Array(items) => items.len(),
            _ => 1,
        };

        Ok(ActionReply {
            data,
            meta: CallMeta {
                request_id: utils::longid(),
                count,
                duration_ms: 0,
                has_more,
                total_pages: None,
            },
        })
    }
}

pub(crate) fn test_parts(gateway: Arc<dyn ActionGateway>) -> RuntimeParts {
    RuntimeParts {
        gateway,
        mappings: Arc::new(MappingStore::new()),
        notifier: Arc::new(LogNotifier),
        limits: Arc::new(Limits {
            default_retry_delay_seconds: 0,
            ..Limits::default()
        }),
    }
}

/// A run context on the current tokio runtime.
pub(crate) fn test_context(gateway: Arc<dyn ActionGateway>) -> Arc<Context> {
    let channel = Arc::new(Channel::new(tokio::runtime::Handle::current()));
    Arc::new(Context::new(utils::longid(), channel, test_parts(gateway), Default::default()))
}

/// Build, start, and await a run of the given model on the current runtime.
pub(crate) async fn execute_model(
    model: &crate::model::PipelineModel,
    gateway: Arc<dyn ActionGateway>,
) -> Arc<crate::runtime::Run> {
    let channel = Arc::new(Channel::new(tokio::runtime::Handle::current()));
    channel.listen();

    let run = crate::runtime::Run::new(model, test_parts(gateway), channel, tokio::runtime::Handle::current()).unwrap();
    run.start();

    let done = wait_until(Duration::from_secs(10), || run.is_complete()).await;
    assert!(done, "run did not complete in time");
    run
}

/// Poll a predicate until it holds or the deadline passes.
pub(crate) async fn wait_until<F>(
    timeout: Duration,
    mut check: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
