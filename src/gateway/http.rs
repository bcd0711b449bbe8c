//! Catalog-driven HTTP gateway adapter.
//!
//! Resolves a call against the catalog, substitutes `{param}` placeholders
//! into the action's path template, applies the interface's auth scheme from
//! host-supplied credentials, and maps transport failures onto the typed
//! error variants. List actions with a pagination spec get their item array
//! extracted from the upstream envelope.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;

use crate::{
    FlowgateError, Result, ShareLock,
    catalog::{ActionBinding, AuthScheme, Catalog, PaginationSpec},
    gateway::{ActionCall, ActionGateway, ActionReply, CallMeta},
    utils,
};

/// Envelope fields commonly holding a list reply's items, tried in order
/// when the action's pagination spec names no data field.
const ITEM_FIELDS: [&str; 5] = ["content", "items", "data", "results", "records"];

pub struct HttpGateway {
    catalog: Arc<Catalog>,
    client: reqwest::Client,
    /// system alias -> resolved secret (token, key, or user:pass pair)
    credentials: ShareLock<HashMap<String, String>>,
    default_timeout: Duration,
}

impl HttpGateway {
    pub fn new(
        catalog: Arc<Catalog>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            client: reqwest::Client::new(),
            credentials: Arc::new(RwLock::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Register the resolved secret for a system. Credential acquisition
    /// itself (OAuth flows, vaults) is the host's concern.
    pub fn set_credential(
        &self,
        system: &str,
        secret: &str,
    ) {
        self.credentials.write().unwrap().insert(system.to_string(), secret.to_string());
    }

    fn auth_headers(
        &self,
        binding: &ActionBinding<'_>,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("accept"), HeaderValue::from_static("application/json"));

        let scheme = binding.system.auth.scheme;
        if scheme == AuthScheme::None {
            return Ok(headers);
        }

        let secret = self
            .credentials
            .read()
            .unwrap()
            .get(&binding.system.alias)
            .cloned()
            .ok_or_else(|| FlowgateError::Authentication(format!("no credential registered for system '{}'", binding.system.alias)))?;

        let (name, value) = match scheme {
            AuthScheme::Bearer => ("Authorization".to_string(), format!("Bearer {}", secret)),
            AuthScheme::Basic => {
                let encoded = if secret.contains(':') { STANDARD.encode(secret.as_bytes()) } else { secret };
                ("Authorization".to_string(), format!("Basic {}", encoded))
            }
            AuthScheme::ApiKeyHeader => (binding.system.auth.header.clone().unwrap_or_else(|| "Authorization".to_string()), secret),
            AuthScheme::None => unreachable!(),
        };

        headers.insert(
            name.parse::<HeaderName>().map_err(|e| FlowgateError::Runtime(e.to_string()))?,
            value.parse::<HeaderValue>().map_err(|e| FlowgateError::Runtime(e.to_string()))?,
        );
        Ok(headers)
    }

    /// Substitute `{key}` placeholders in the path template, consuming the
    /// used parameters.
    fn substitute_path(
        template: &str,
        params: &mut serde_json::Map<String, Value>,
    ) -> String {
        let mut path = template.to_string();
        let consumed: Vec<String> = params
            .iter()
            .filter(|(key, _)| path.contains(&format!("{{{}}}", key)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in consumed {
            if let Some(value) = params.remove(&key) {
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                path = path.replace(&format!("{{{}}}", key), &rendered);
            }
        }
        path
    }

    fn map_status(
        status: u16,
        body: &str,
        retry_after: Option<u64>,
    ) -> FlowgateError {
        let message = if body.is_empty() { format!("http status {}", status) } else { body.chars().take(500).collect() };
        match status {
            401 | 403 => FlowgateError::Authentication(message),
            404 => FlowgateError::NotFound(message),
            408 => FlowgateError::Timeout(message),
            429 => FlowgateError::RateLimited {
                message,
                retry_after,
            },
            _ => FlowgateError::Remote {
                status,
                message,
            },
        }
    }

    /// Pull the item array out of a list reply. Falls back to the first
    /// array-valued field when no conventional field matches.
    fn extract_items(
        data: &Value,
        spec: &PaginationSpec,
    ) -> Option<Vec<Value>> {
        if let Some(field) = &spec.data_field {
            if let Some(Value::Array(arr)) = data.get(field) {
                return Some(arr.clone());
            }
        }
        if let Value::Array(arr) = data {
            return Some(arr.clone());
        }
        if let Value::Object(map) = data {
            for field in ITEM_FIELDS {
                if let Some(Value::Array(arr)) = map.get(field) {
                    return Some(arr.clone());
                }
            }
            for value in map.values() {
                if let Value::Array(arr) = value {
                    return Some(arr.clone());
                }
            }
        }
        None
    }
}

#[async_trait]
impl ActionGateway for HttpGateway {
    async fn invoke(
        &self,
        call: &ActionCall,
    ) -> Result<ActionReply> {
        let request_id = utils::longid();
        let started = Instant::now();

        let binding = self.catalog.find_action(&call.system, &call.resource, &call.action)?;

        if let Some(schema) = &binding.action.params_schema {
            let params_value: Value = call.params.clone().into();
            jsonschema::validate(schema, &params_value).map_err(|e| FlowgateError::Validation(format!("{}: {}", call.target(), e)))?;
        }

        let mut params = match Value::from(call.params.clone()) {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let path = Self::substitute_path(&binding.action.path, &mut params);
        let url = format!("{}/{}", binding.system.base_url.trim_end_matches('/'), path.trim_start_matches('/'));

        let method: reqwest::Method = binding
            .action
            .method
            .parse()
            .map_err(|_| FlowgateError::Config(format!("invalid method '{}' for {}", binding.action.method, call.target())))?;

        let headers = self.auth_headers(&binding)?;
        let timeout = call.timeout().unwrap_or(self.default_timeout);

        let body = params.remove("data");

        let mut query: Vec<(String, String)> = Vec::new();
        for (key, value) in &params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            query.push((key.clone(), rendered));
        }
        if let (Some(page), Some(spec)) = (call.page, &binding.action.pagination) {
            query.push((spec.page_param.clone(), (spec.start_page + page).to_string()));
            query.push((spec.size_param.clone(), spec.page_size.to_string()));
        }

        let mut request = self.client.request(method.clone(), &url).headers(headers).query(&query).timeout(timeout);
        if method != reqwest::Method::GET {
            let payload = body.unwrap_or_else(|| Value::Object(params.clone()));
            request = request.json(&payload);
        }

        debug!(request_id = %request_id, target = %call.target(), %url, "gateway dispatch");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FlowgateError::Timeout(format!("{}: {}", call.target(), e))
            } else {
                FlowgateError::Remote {
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await.map_err(|e| FlowgateError::Remote {
            status,
            message: e.to_string(),
        })?;

        if status >= 400 {
            return Err(Self::map_status(status, &text, retry_after));
        }

        let data: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let mut meta = CallMeta::new(request_id);
        meta.duration_ms = started.elapsed().as_millis() as u64;

        let data = if let Some(spec) = &binding.action.pagination {
            let items = Self::extract_items(&data, spec).unwrap_or_default();
            meta.count = items.len();
            meta.has_more = match &data {
                Value::Object(map) => map.get(&spec.last_page_field).and_then(Value::as_bool).map(|last| !last),
                _ => None,
            };
            meta.total_pages = match &data {
                Value::Object(map) => map.get(&spec.total_pages_field).and_then(Value::as_u64),
                _ => None,
            };
            if meta.has_more.is_none() && (items.len() as u64) < spec.page_size {
                meta.has_more = Some(false);
            }
            Value::Array(items)
        } else {
            meta.count = 1;
            data
        };

        Ok(ActionReply {
            data,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_substitute_path_consumes_params() {
        let mut params = match json!({"issue_id": 42, "q": "open"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let path = HttpGateway::substitute_path("/issues/{issue_id}/comments", &mut params);
        assert_eq!(path, "/issues/42/comments");
        assert!(!params.contains_key("issue_id"));
        assert!(params.contains_key("q"));
    }

    #[test]
    fn test_extract_items_conventional_fields() {
        let spec = PaginationSpec::default();
        let data = json!({"content": [1, 2], "last": false});
        assert_eq!(HttpGateway::extract_items(&data, &spec).unwrap().len(), 2);

        let direct = json!([1, 2, 3]);
        assert_eq!(HttpGateway::extract_items(&direct, &spec).unwrap().len(), 3);
    }

    #[test]
    fn test_extract_items_explicit_and_fallback_field() {
        let mut spec = PaginationSpec::default();
        spec.data_field = Some("logpoints".to_string());
        let data = json!({"logpoints": [1], "total": 1});
        assert_eq!(HttpGateway::extract_items(&data, &spec).unwrap().len(), 1);

        // unnamed field still auto-detected as the first array
        let spec = PaginationSpec::default();
        let data = json!({"machines": [1, 2]});
        assert_eq!(HttpGateway::extract_items(&data, &spec).unwrap().len(), 2);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(HttpGateway::map_status(401, "", None), FlowgateError::Authentication(_)));
        assert!(matches!(HttpGateway::map_status(404, "", None), FlowgateError::NotFound(_)));
        assert!(matches!(
            HttpGateway::map_status(429, "", Some(30)),
            FlowgateError::RateLimited {
                retry_after: Some(30),
                ..
            }
        ));
        assert!(matches!(HttpGateway::map_status(500, "boom", None), FlowgateError::Remote { status: 500, .. }));
    }
}
