use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::catalog::{Access, Catalog};

/// Permission class a tool requires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolAccess {
    Read,
    Write,
    /// Workspace/mapping/pipeline management; power mode only.
    Manage,
}

/// The fixed management tools, independent of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementTool {
    WorkspaceCreate,
    WorkspaceList,
    WorkspaceGet,
    MappingUpsert,
    MappingGet,
    MappingList,
    PipelineRun,
    RunStatus,
}

impl ManagementTool {
    pub fn name(&self) -> &'static str {
        match self {
            ManagementTool::WorkspaceCreate => "workspace_create",
            ManagementTool::WorkspaceList => "workspace_list",
            ManagementTool::WorkspaceGet => "workspace_get",
            ManagementTool::MappingUpsert => "mapping_upsert",
            ManagementTool::MappingGet => "mapping_get",
            ManagementTool::MappingList => "mapping_list",
            ManagementTool::PipelineRun => "pipeline_run",
            ManagementTool::RunStatus => "run_status",
        }
    }

    fn all() -> [ManagementTool; 8] {
        [
            ManagementTool::WorkspaceCreate,
            ManagementTool::WorkspaceList,
            ManagementTool::WorkspaceGet,
            ManagementTool::MappingUpsert,
            ManagementTool::MappingGet,
            ManagementTool::MappingList,
            ManagementTool::PipelineRun,
            ManagementTool::RunStatus,
        ]
    }

    fn descriptor(&self) -> ToolDescriptor {
        let (description, schema) = match self {
            ManagementTool::WorkspaceCreate => (
                "Create a workspace",
                json!({
                    "type": "object",
                    "required": ["slug", "name"],
                    "properties": {
                        "slug": { "type": "string" },
                        "name": { "type": "string" }
                    }
                }),
            ),
            ManagementTool::WorkspaceList => ("List workspaces", json!({ "type": "object", "properties": {} })),
            ManagementTool::WorkspaceGet => (
                "Get one workspace",
                json!({
                    "type": "object",
                    "required": ["slug"],
                    "properties": { "slug": { "type": "string" } }
                }),
            ),
            ManagementTool::MappingUpsert => (
                "Create or update a cross-system entity mapping",
                json!({
                    "type": "object",
                    "required": ["entity_type", "canonical_name"],
                    "properties": {
                        "entity_type": { "type": "string" },
                        "canonical_name": { "type": "string" },
                        "ids": {
                            "type": "object",
                            "description": "system alias -> system-local identifier",
                            "additionalProperties": { "type": "string" }
                        }
                    }
                }),
            ),
            ManagementTool::MappingGet => (
                "Resolve a mapping by canonical name and entity type",
                json!({
                    "type": "object",
                    "required": ["entity_type", "canonical_name"],
                    "properties": {
                        "entity_type": { "type": "string" },
                        "canonical_name": { "type": "string" }
                    }
                }),
            ),
            ManagementTool::MappingList => (
                "List entity mappings",
                json!({
                    "type": "object",
                    "properties": { "entity_type": { "type": ["string", "null"] } }
                }),
            ),
            ManagementTool::PipelineRun => (
                "Trigger a run of a deployed pipeline; returns the run id",
                json!({
                    "type": "object",
                    "required": ["pipeline"],
                    "properties": {
                        "pipeline": { "type": "string" },
                        "variables": { "type": "object" }
                    }
                }),
            ),
            ManagementTool::RunStatus => (
                "Inspect a run's step states and outputs",
                json!({
                    "type": "object",
                    "required": ["run_id"],
                    "properties": { "run_id": { "type": "string" } }
                }),
            ),
        };

        ToolDescriptor {
            name: self.name().to_string(),
            description: description.to_string(),
            access: ToolAccess::Manage,
            input_schema: schema,
            binding: ToolBinding::Management(*self),
        }
    }
}

/// What a tool dispatches to.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolBinding {
    /// One catalog action, dispatched straight to the gateway.
    Action {
        system: String,
        resource: String,
        action: String,
        paginated: bool,
    },
    Management(ManagementTool),
}

/// A callable unit exposed to sessions. Derived from the catalog at
/// registration time; read-only to the dispatch layer.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub access: ToolAccess,
    pub input_schema: Value,
    pub binding: ToolBinding,
}

/// Lowercase, `[a-z0-9_]`, no repeated or trailing underscores.
fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}

/// Inject pagination controls into a read tool's schema.
fn with_pagination_controls(schema: &Value) -> Value {
    let mut schema = schema.clone();
    if schema.get("type").is_none() {
        schema["type"] = json!("object");
    }
    let props = schema
        .as_object_mut()
        .and_then(|map| map.entry("properties").or_insert_with(|| json!({})).as_object_mut());
    if let Some(props) = props {
        props.insert(
            "page".to_string(),
            json!({ "type": "integer", "minimum": 0, "description": "Page to fetch (0-indexed)" }),
        );
        props.insert(
            "fetch_all_pages".to_string(),
            json!({
                "type": "boolean",
                "default": false,
                "description": "Fetch all pages and return the combined result; may be truncated by safety limits"
            }),
        );
    }
    schema
}

/// Registry mapping tool names to descriptors.
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// One tool per catalog action plus the management tools.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut tools = BTreeMap::new();

        for system in &catalog.systems {
            for resource in &system.resources {
                for action in &resource.actions {
                    let name = sanitize_tool_name(&format!("{}_{}_{}", system.alias, resource.alias, action.alias));
                    let paginated = action.pagination.is_some();

                    let base_schema = action.params_schema.clone().unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
                    let input_schema = if paginated { with_pagination_controls(&base_schema) } else { base_schema };

                    let access = match action.access {
                        Access::Read => ToolAccess::Read,
                        Access::Write => ToolAccess::Write,
                    };

                    let description = if action.description.is_empty() {
                        format!("{} on {} {}", action.alias, system.alias, resource.alias)
                    } else {
                        action.description.clone()
                    };

                    tools.insert(
                        name.clone(),
                        ToolDescriptor {
                            name,
                            description,
                            access,
                            input_schema,
                            binding: ToolBinding::Action {
                                system: system.alias.clone(),
                                resource: resource.alias.clone(),
                                action: action.alias.clone(),
                                paginated,
                            },
                        },
                    );
                }
            }
        }

        for tool in ManagementTool::all() {
            let descriptor = tool.descriptor();
            tools.insert(descriptor.name.clone(), descriptor);
        }

        Self {
            tools,
        }
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use serde_json::json;

    fn catalog() -> Catalog {
        Catalog::from_json(
            &json!({
                "systems": [{
                    "alias": "Issue-Tracker",
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

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("Issue-Tracker_issue_list"), "issue_tracker_issue_list");
        assert_eq!(sanitize_tool_name("__a..b__"), "a_b");
    }

    #[test]
    fn test_registry_from_catalog() {
        let registry = ToolRegistry::from_catalog(&catalog());

        let list_tool = registry.get("issue_tracker_issue_list").unwrap();
        assert_eq!(list_tool.access, ToolAccess::Read);
        assert!(list_tool.input_schema["properties"]["fetch_all_pages"].is_object());

        let create_tool = registry.get("issue_tracker_issue_create").unwrap();
        assert_eq!(create_tool.access, ToolAccess::Write);

        assert!(registry.get("pipeline_run").is_some());
        assert_eq!(registry.get("pipeline_run").unwrap().access, ToolAccess::Manage);
        // catalog tools + 8 management tools
        assert_eq!(registry.len(), 10);
    }
}
