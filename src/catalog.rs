//! Catalog of external systems, their resources, and invocable actions.
//!
//! The catalog is read-only input to this crate: the operator's management
//! surface produces it, the action gateway uses it to address calls, and the
//! tool registry derives one callable tool per action from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FlowgateError, Result};

/// Whether an action observes or mutates the external system. Gates tool
/// dispatch under safe-mode sessions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Access {
    #[default]
    Read,
    Write,
}

/// Credential scheme an interface expects. The gateway is handed resolved
/// secrets by the host; the catalog only names the scheme.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    Bearer,
    Basic,
    ApiKeyHeader,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AuthSpec {
    #[serde(default)]
    pub scheme: AuthScheme,
    /// Header name for `api_key_header`; defaults to "Authorization".
    #[serde(default)]
    pub header: Option<String>,
}

/// How a list action pages its results. Field names follow the upstream
/// API's envelope; absent fields fall back to common conventions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PaginationSpec {
    pub page_param: String,
    pub size_param: String,
    pub page_size: u64,
    pub start_page: u64,
    /// Field holding the item array; None triggers envelope auto-detection.
    pub data_field: Option<String>,
    pub last_page_field: String,
    pub total_pages_field: String,
}

impl Default for PaginationSpec {
    fn default() -> Self {
        Self {
            page_param: "page".to_string(),
            size_param: "size".to_string(),
            page_size: 100,
            start_page: 0,
            data_field: None,
            last_page_field: "last".to_string(),
            total_pages_field: "totalPages".to_string(),
        }
    }
}

/// One invocable operation on a resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub access: Access,
    /// HTTP method for the default gateway adapter.
    #[serde(default = "default_method")]
    pub method: String,
    /// Path template with `{param}` placeholders, relative to the base URL.
    #[serde(default)]
    pub path: String,
    /// JSON Schema for the action's parameters.
    #[serde(default)]
    pub params_schema: Option<Value>,
    #[serde(default)]
    pub pagination: Option<PaginationSpec>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceDef {
    pub alias: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SystemDef {
    pub alias: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
}

/// A resolved (system, resource, action) triple.
#[derive(Debug, Clone, Copy)]
pub struct ActionBinding<'a> {
    pub system: &'a SystemDef,
    pub resource: &'a ResourceDef,
    pub action: &'a ActionSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub systems: Vec<SystemDef>,
}

impl Catalog {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str::<Catalog>(s).map_err(|e| FlowgateError::Config(format!("invalid catalog: {}", e)))
    }

    pub fn find_system(
        &self,
        system: &str,
    ) -> Option<&SystemDef> {
        self.systems.iter().find(|s| s.alias == system)
    }

    /// Resolve a (system, resource, action) triple.
    pub fn find_action(
        &self,
        system: &str,
        resource: &str,
        action: &str,
    ) -> Result<ActionBinding<'_>> {
        let system_def = self
            .find_system(system)
            .ok_or_else(|| FlowgateError::NotFound(format!("system '{}' is not in the catalog", system)))?;
        let resource_def = system_def
            .resources
            .iter()
            .find(|r| r.alias == resource)
            .ok_or_else(|| FlowgateError::NotFound(format!("resource '{}.{}' is not in the catalog", system, resource)))?;
        let action_def = resource_def
            .actions
            .iter()
            .find(|a| a.alias == action)
            .ok_or_else(|| FlowgateError::NotFound(format!("action '{}.{}.{}' is not in the catalog", system, resource, action)))?;

        Ok(ActionBinding {
            system: system_def,
            resource: resource_def,
            action: action_def,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_catalog() -> Catalog {
        let raw = json!({
            "systems": [{
                "alias": "tracker",
                "name": "Issue Tracker",
                "base_url": "https://tracker.example/api",
                "auth": {"scheme": "bearer"},
                "resources": [{
                    "alias": "issue",
                    "actions": [
                        {"alias": "list", "method": "GET", "path": "/issues", "pagination": {}},
                        {"alias": "create", "access": "write", "method": "POST", "path": "/issues"}
                    ]
                }]
            }]
        });
        Catalog::from_json(&raw.to_string()).unwrap()
    }

    #[test]
    fn test_find_action() {
        let catalog = sample_catalog();
        let binding = catalog.find_action("tracker", "issue", "list").unwrap();
        assert_eq!(binding.action.access, Access::Read);
        assert_eq!(binding.action.pagination.as_ref().unwrap().page_param, "page");

        let create = catalog.find_action("tracker", "issue", "create").unwrap();
        assert_eq!(create.action.access, Access::Write);
    }

    #[test]
    fn test_find_unknown_is_not_found() {
        let catalog = sample_catalog();
        assert!(matches!(catalog.find_action("tracker", "issue", "purge"), Err(FlowgateError::NotFound(_))));
        assert!(matches!(catalog.find_action("crm", "issue", "list"), Err(FlowgateError::NotFound(_))));
    }
}
