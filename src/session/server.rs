//! Session-based JSON-RPC tool server.
//!
//! A single endpoint accepts `{jsonrpc, id, method, params}` messages. The
//! first `initialize` exchange returns an opaque session id the caller
//! echoes on subsequent requests; `session/close` tears the session down.
//! Tool calls validate arguments against the tool's schema, check the
//! session's permission mode, and dispatch to the action gateway through
//! the same pagination controller and error/retry policy as the step
//! executor. Single-call tools bypass the graph scheduler entirely.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::{
    Engine, FlowgateError, Result, ShareLock,
    catalog::Catalog,
    common::Vars,
    events::{Event, Message},
    gateway::{ActionCall, Attempted, ErrorPolicy, fetch_all_pages, run_with_policy},
    mapping::EntityMapping,
    session::{ManagementTool, Session, SessionManager, SessionMode, ToolBinding, ToolDescriptor, ToolRegistry},
    utils,
};

const PROTOCOL_VERSION: &str = "2025-06-18";
const SERVER_NAME: &str = "flowgate";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// JSON-RPC error codes; domain failures get codes below the reserved range.
const CODE_INVALID_REQUEST: i64 = -32600;
const CODE_METHOD_NOT_FOUND: i64 = -32601;
const CODE_INVALID_PARAMS: i64 = -32602;
const CODE_INTERNAL: i64 = -32603;
const CODE_UNKNOWN_SESSION: i64 = -32000;
const CODE_PERMISSION: i64 = -32001;
const CODE_NOT_FOUND: i64 = -32004;
const CODE_TOOL_FAILED: i64 = -32011;

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub slug: String,
    pub name: String,
    pub created_at: i64,
}

/// Dispatches tool calls for remote sessions.
pub struct ToolServer {
    registry: ToolRegistry,
    sessions: SessionManager,
    engine: Arc<Engine>,
    workspaces: ShareLock<BTreeMap<String, Workspace>>,
}

impl ToolServer {
    pub fn new(
        engine: Arc<Engine>,
        catalog: &Catalog,
    ) -> Self {
        let idle = engine.parts().limits.session_idle_seconds;
        Self {
            registry: ToolRegistry::from_catalog(catalog),
            sessions: SessionManager::new(idle),
            engine,
            workspaces: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Server-initiated notification stream: run and step events, for
    /// callers that keep a streaming channel open.
    pub fn notifications(&self) -> BroadcastStream<Event<Message>> {
        BroadcastStream::new(self.engine.channel().subscribe_events())
    }

    /// Handle one inbound message. `session_id` is the transport-level
    /// session header; None is only valid for `initialize` and `ping`.
    /// Returns None for notifications.
    pub async fn handle_message(
        &self,
        session_id: Option<&str>,
        message: Value,
    ) -> Option<Value> {
        let msg_id = message.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return Some(Self::error_response(msg_id, CODE_INVALID_REQUEST, "missing method"));
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "initialize" => {
                let result = self.handle_initialize(&params);
                Some(Self::success_response(msg_id, result))
            }
            // notification, no response
            "initialized" => None,
            "ping" => Some(Self::success_response(msg_id, json!({}))),
            _ => {
                let session = match session_id {
                    Some(id) => match self.sessions.get(id) {
                        Ok(session) => session,
                        Err(e) => return Some(Self::error_response(msg_id, CODE_UNKNOWN_SESSION, &e.to_string())),
                    },
                    None => return Some(Self::error_response(msg_id, CODE_UNKNOWN_SESSION, "no session id supplied")),
                };

                let outcome = match method {
                    "tools/list" => Ok(self.handle_list_tools(&session)),
                    "tools/call" => self.handle_call_tool(&session, &params).await,
                    "session/close" => {
                        let closed = self.sessions.close(&session.id);
                        Ok(json!({ "closed": closed }))
                    }
                    _ => {
                        return Some(Self::error_response(msg_id, CODE_METHOD_NOT_FOUND, &format!("Method not found: {}", method)));
                    }
                };

                Some(match outcome {
                    Ok(result) => Self::success_response(msg_id, result),
                    Err(e) => Self::error_response(msg_id, Self::error_code(&e), &e.to_string()),
                })
            }
        }
    }

    fn handle_initialize(
        &self,
        params: &Value,
    ) -> Value {
        let mode: SessionMode = params
            .get("mode")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
            .unwrap_or_default();
        let workspace = params.get("workspace").and_then(Value::as_str).map(String::from);

        let session = self.sessions.open(mode, workspace);
        info!(session_id = %session.id, mode = mode.as_ref(), "session opened");

        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
            "session_id": session.id,
            "capabilities": {
                "tools": { "listChanged": false },
                "notifications": { "streaming": true }
            }
        })
    }

    fn handle_list_tools(
        &self,
        session: &Session,
    ) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list()
            .filter(|tool| session.mode.allows(tool.access))
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema
                })
            })
            .collect();

        json!({ "tools": tools })
    }

    async fn handle_call_tool(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<Value> {
        let tool_name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowgateError::Validation("tool name is required".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| FlowgateError::NotFound(format!("unknown tool '{}'", tool_name)))?
            .clone();

        if !session.mode.allows(tool.access) {
            warn!(session_id = %session.id, tool = %tool.name, "tool denied by session mode");
            return Err(FlowgateError::Permission(format!(
                "tool '{}' requires {} access; session mode is {}",
                tool.name,
                tool.access.as_ref(),
                session.mode.as_ref()
            )));
        }

        jsonschema::validate(&tool.input_schema, &arguments)
            .map_err(|e| FlowgateError::Validation(format!("tool '{}': {}", tool.name, e)))?;

        match &tool.binding {
            ToolBinding::Action {
                system,
                resource,
                action,
                paginated,
            } => self.dispatch_action(session, &tool, system, resource, action, *paginated, arguments).await,
            ToolBinding::Management(management) => self.dispatch_management(session, *management, &arguments),
        }
    }

    /// Single-call dispatch: no dependency graph, same gateway, paginator,
    /// and policy wrapper as the step executor.
    async fn dispatch_action(
        &self,
        session: &Session,
        tool: &ToolDescriptor,
        system: &str,
        resource: &str,
        action: &str,
        paginated: bool,
        arguments: Value,
    ) -> Result<Value> {
        let mut args = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let fetch_all = paginated && args.remove("fetch_all_pages").and_then(|v| v.as_bool()).unwrap_or(false);
        let page = args.remove("page").and_then(|v| v.as_u64());

        let mut call = ActionCall::new(system, resource, action, Vars::from(Value::Object(args)));
        call.page = page;

        let parts = self.engine.parts();
        let policy = ErrorPolicy::fail();

        let attempted = run_with_policy(&policy, &parts.limits, |_| {
            let call = call.clone();
            let gateway = parts.gateway.clone();
            let limits = parts.limits.clone();
            async move {
                if fetch_all {
                    let aggregate = fetch_all_pages(gateway.as_ref(), &call, &limits).await?;
                    let count = aggregate.items.len();
                    Ok(json!({
                        "data": aggregate.items,
                        "meta": {
                            "count": count,
                            "pages": aggregate.pages,
                            "truncated": aggregate.truncated,
                            "request_id": aggregate.last_request_id
                        }
                    }))
                } else {
                    let reply = gateway.invoke(&call).await?;
                    Ok(json!({
                        "data": reply.data,
                        "meta": {
                            "count": reply.meta.count,
                            "pages": 1,
                            "duration_ms": reply.meta.duration_ms,
                            "request_id": reply.meta.request_id
                        }
                    }))
                }
            }
        })
        .await;

        match attempted {
            Attempted::Done {
                value, ..
            } => {
                let request_id = value["meta"]["request_id"].as_str().unwrap_or_default().to_string();
                info!(session_id = %session.id, tool = %tool.name, request_id = %request_id, "tool call succeeded");
                Ok(value)
            }
            Attempted::Continued {
                error, ..
            }
            | Attempted::Failed {
                error, ..
            } => {
                warn!(session_id = %session.id, tool = %tool.name, "tool call failed: {}", error);
                Err(error)
            }
        }
    }

    fn dispatch_management(
        &self,
        session: &Session,
        tool: ManagementTool,
        arguments: &Value,
    ) -> Result<Value> {
        let result = match tool {
            ManagementTool::WorkspaceCreate => {
                let slug = required_str(arguments, "slug")?;
                let name = required_str(arguments, "name")?;
                let workspace = Workspace {
                    slug: slug.to_string(),
                    name: name.to_string(),
                    created_at: utils::time::time_millis(),
                };
                let mut workspaces = self.workspaces.write().unwrap();
                if workspaces.contains_key(slug) {
                    return Err(FlowgateError::Validation(format!("workspace '{}' already exists", slug)));
                }
                workspaces.insert(slug.to_string(), workspace.clone());
                serde_json::to_value(workspace)?
            }
            ManagementTool::WorkspaceList => {
                let workspaces = self.workspaces.read().unwrap();
                json!({ "workspaces": workspaces.values().collect::<Vec<_>>() })
            }
            ManagementTool::WorkspaceGet => {
                let slug = required_str(arguments, "slug")?;
                let workspaces = self.workspaces.read().unwrap();
                let workspace = workspaces
                    .get(slug)
                    .ok_or_else(|| FlowgateError::NotFound(format!("workspace '{}' not found", slug)))?;
                serde_json::to_value(workspace)?
            }
            ManagementTool::MappingUpsert => {
                let entity_type = required_str(arguments, "entity_type")?;
                let canonical_name = required_str(arguments, "canonical_name")?;
                let ids = arguments
                    .get("ids")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();

                let mapping = EntityMapping {
                    canonical_name: canonical_name.to_string(),
                    entity_type: entity_type.to_string(),
                    ids,
                };
                self.engine.mappings().upsert(mapping);
                let stored = self.engine.mappings().get(entity_type, canonical_name)?;
                serde_json::to_value(stored)?
            }
            ManagementTool::MappingGet => {
                let entity_type = required_str(arguments, "entity_type")?;
                let canonical_name = required_str(arguments, "canonical_name")?;
                serde_json::to_value(self.engine.mappings().get(entity_type, canonical_name)?)?
            }
            ManagementTool::MappingList => {
                let entity_type = arguments.get("entity_type").and_then(Value::as_str);
                json!({ "mappings": self.engine.mappings().list(entity_type) })
            }
            ManagementTool::PipelineRun => {
                let pipeline = required_str(arguments, "pipeline")?;
                let variables = arguments
                    .get("variables")
                    .and_then(Value::as_object)
                    .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();

                let run_id = self.engine.run_pipeline(pipeline, variables)?;
                info!(session_id = %session.id, pipeline, run_id = %run_id, "pipeline run triggered");
                json!({ "run_id": run_id })
            }
            ManagementTool::RunStatus => {
                let run_id = required_str(arguments, "run_id")?;
                self.run_status(run_id)?
            }
        };

        info!(session_id = %session.id, tool = tool.name(), "management tool call");
        Ok(result)
    }

    fn run_status(
        &self,
        run_id: &str,
    ) -> Result<Value> {
        if let Some(run) = self.engine.get_run(&run_id.to_string()) {
            let steps: Vec<Value> = run
                .step_states()
                .into_iter()
                .map(|(sid, state, continued)| json!({ "step_id": sid, "state": state.as_ref(), "continued": continued }))
                .collect();

            return Ok(json!({
                "run_id": run_id,
                "complete": run.is_complete(),
                "steps": steps,
                "outputs": Value::from(run.outputs()),
            }));
        }

        // evicted from the cache; serve from the store
        let store = self.engine.store();
        let record = store.runs().find(run_id)?;
        let steps = store.steps().query(&crate::store::Query::new().filter("run_id", run_id))?;
        let steps: Vec<Value> = steps
            .into_iter()
            .map(|s| {
                let output = s.output.as_deref().and_then(|o| serde_json::from_str::<Value>(o).ok());
                json!({ "step_id": s.step_id, "state": s.state, "error": s.error, "output": output })
            })
            .collect();

        Ok(json!({
            "run_id": run_id,
            "pipeline": record.pipeline,
            "state": record.state,
            "error": record.err,
            "steps": steps,
        }))
    }

    fn error_code(error: &FlowgateError) -> i64 {
        match error {
            FlowgateError::Permission(_) => CODE_PERMISSION,
            FlowgateError::NotFound(_) => CODE_NOT_FOUND,
            FlowgateError::Validation(_) => CODE_INVALID_PARAMS,
            FlowgateError::Engine(_) | FlowgateError::Store(_) => CODE_INTERNAL,
            _ => CODE_TOOL_FAILED,
        }
    }

    fn success_response(
        msg_id: Value,
        result: Value,
    ) -> Value {
        json!({ "jsonrpc": "2.0", "id": msg_id, "result": result })
    }

    fn error_response(
        msg_id: Value,
        code: i64,
        message: &str,
    ) -> Value {
        json!({ "jsonrpc": "2.0", "id": msg_id, "error": { "code": code, "message": message } })
    }
}

fn required_str<'a>(
    arguments: &'a Value,
    field: &str,
) -> Result<&'a str> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| FlowgateError::Validation(format!("'{}' is required", field)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::{EngineBuilder, model::PipelineModel, testkit::ScriptedGateway};

    fn catalog() -> Catalog {
        Catalog::from_json(
            &json!({
                "systems": [{
                    "alias": "tracker",
                    "base_url": "https://tracker.example",
                    "resources": [{
                        "alias": "issue",
                        "actions": [
                            {"alias": "list", "pagination": {}},
                            {"alias": "create", "access": "write"}
                        ]
                    }]
                }]
            })
            .to_string(),
        )
        .unwrap()
    }

    struct Fixture {
        server: ToolServer,
        engine: Arc<crate::Engine>,
        gateway: Arc<ScriptedGateway>,
        rt: tokio::runtime::Runtime,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = Arc::new(EngineBuilder::new().gateway(gateway.clone()).build().unwrap());
        engine.launch();
        let server = ToolServer::new(engine.clone(), &catalog());
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        Fixture {
            server,
            engine,
            gateway,
            rt,
        }
    }

    impl Fixture {
        fn send(
            &self,
            session_id: Option<&str>,
            method: &str,
            params: Value,
        ) -> Value {
            let message = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
            self.rt.block_on(self.server.handle_message(session_id, message)).unwrap()
        }

        fn open_session(
            &self,
            mode: &str,
        ) -> String {
            let response = self.send(None, "initialize", json!({"mode": mode}));
            response["result"]["session_id"].as_str().unwrap().to_string()
        }
    }

    #[test]
    fn test_initialize_returns_session_id() {
        let fx = fixture();
        let response = fx.send(None, "initialize", json!({"mode": "safe"}));

        assert_eq!(response["jsonrpc"], json!("2.0"));
        assert!(response["result"]["session_id"].is_string());
        assert_eq!(response["result"]["serverInfo"]["name"], json!("flowgate"));
        fx.engine.shutdown();
    }

    #[test]
    fn test_tools_list_filtered_by_mode() {
        let fx = fixture();

        let safe = fx.open_session("safe");
        let response = fx.send(Some(&safe), "tools/list", json!({}));
        let names: Vec<String> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"tracker_issue_list".to_string()));
        assert!(!names.contains(&"tracker_issue_create".to_string()));
        assert!(!names.contains(&"pipeline_run".to_string()));

        let power = fx.open_session("power");
        let response = fx.send(Some(&power), "tools/list", json!({}));
        let names: Vec<String> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"tracker_issue_create".to_string()));
        assert!(names.contains(&"pipeline_run".to_string()));
        fx.engine.shutdown();
    }

    #[test]
    fn test_safe_mode_rejects_write_tool() {
        let fx = fixture();

        let safe = fx.open_session("safe");
        let response = fx.send(
            Some(&safe),
            "tools/call",
            json!({"name": "tracker_issue_create", "arguments": {"title": "x"}}),
        );
        assert_eq!(response["error"]["code"], json!(CODE_PERMISSION));
        assert_eq!(fx.gateway.call_count(), 0);

        // the identical call in power mode succeeds
        let power = fx.open_session("power");
        let response = fx.send(
            Some(&power),
            "tools/call",
            json!({"name": "tracker_issue_create", "arguments": {"title": "x"}}),
        );
        assert_eq!(response["result"]["data"], json!({"ok": true}));
        assert!(response["result"]["meta"]["request_id"].is_string());
        assert_eq!(fx.gateway.call_count(), 1);
        fx.engine.shutdown();
    }

    #[test]
    fn test_fetch_all_pages_through_tool() {
        let fx = fixture();
        fx.gateway.push_page(json!([{"id": 1}, {"id": 2}]));
        fx.gateway.push_page(json!([{"id": 3}]));
        fx.gateway.push_page(json!([]));

        let session = fx.open_session("safe");
        let response = fx.send(
            Some(&session),
            "tools/call",
            json!({"name": "tracker_issue_list", "arguments": {"fetch_all_pages": true}}),
        );

        assert_eq!(response["result"]["data"].as_array().unwrap().len(), 3);
        assert_eq!(response["result"]["meta"]["truncated"], json!(false));
        assert_eq!(fx.gateway.pages_requested(), vec![0, 1, 2]);
        fx.engine.shutdown();
    }

    #[test]
    fn test_unknown_tool_and_method_and_session() {
        let fx = fixture();
        let session = fx.open_session("safe");

        let response = fx.send(Some(&session), "tools/call", json!({"name": "ghost_tool"}));
        assert_eq!(response["error"]["code"], json!(CODE_NOT_FOUND));

        let response = fx.send(Some(&session), "tools/purge", json!({}));
        assert_eq!(response["error"]["code"], json!(CODE_METHOD_NOT_FOUND));

        let response = fx.send(Some("nope"), "tools/list", json!({}));
        assert_eq!(response["error"]["code"], json!(CODE_UNKNOWN_SESSION));
        fx.engine.shutdown();
    }

    #[test]
    fn test_session_close_releases_context() {
        let fx = fixture();
        let session = fx.open_session("safe");

        let response = fx.send(Some(&session), "session/close", json!({}));
        assert_eq!(response["result"]["closed"], json!(true));

        let response = fx.send(Some(&session), "tools/list", json!({}));
        assert_eq!(response["error"]["code"], json!(CODE_UNKNOWN_SESSION));
        fx.engine.shutdown();
    }

    #[test]
    fn test_pipeline_trigger_and_status() {
        let fx = fixture();

        let pipeline = PipelineModel::from_json(
            &json!({
                "name": "sync",
                "steps": [
                    {"id": "fetch", "type": "read", "config": {"system": "tracker", "resource": "issue", "action": "list"}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        fx.engine.deploy(&pipeline).unwrap();

        let power = fx.open_session("power");
        let response = fx.send(Some(&power), "tools/call", json!({"name": "pipeline_run", "arguments": {"pipeline": "sync"}}));
        let run_id = response["result"]["run_id"].as_str().unwrap().to_string();

        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            let response = fx.send(
                Some(&power),
                "tools/call",
                json!({"name": "run_status", "arguments": {"run_id": run_id.as_str()}}),
            );
            if response["result"]["complete"] == json!(true) {
                break response["result"].clone();
            }
            assert!(Instant::now() < deadline, "run never completed");
            std::thread::sleep(Duration::from_millis(10));
        };

        assert_eq!(status["outputs"]["fetch"]["data"], json!({"ok": true}));

        // a safe session may not trigger pipelines
        let safe = fx.open_session("safe");
        let response = fx.send(Some(&safe), "tools/call", json!({"name": "pipeline_run", "arguments": {"pipeline": "sync"}}));
        assert_eq!(response["error"]["code"], json!(CODE_PERMISSION));
        fx.engine.shutdown();
    }

    #[test]
    fn test_mapping_tools_round_trip() {
        let fx = fixture();
        let power = fx.open_session("power");

        let response = fx.send(
            Some(&power),
            "tools/call",
            json!({"name": "mapping_upsert", "arguments": {
                "entity_type": "project",
                "canonical_name": "harbor-north",
                "ids": {"tracker": "PRJ-7"}
            }}),
        );
        assert_eq!(response["result"]["ids"]["tracker"], json!("PRJ-7"));

        let response = fx.send(
            Some(&power),
            "tools/call",
            json!({"name": "mapping_get", "arguments": {"entity_type": "project", "canonical_name": "harbor-north"}}),
        );
        assert_eq!(response["result"]["canonical_name"], json!("harbor-north"));
        fx.engine.shutdown();
    }
}
