use std::collections::HashSet;

use anyhow::{bail, Result};
use serde_json::{json, Value};

/// One entry of the static tool catalog. `aliases` maps a canonical
/// parameter key to the alternate keys callers may use for it; `required`
/// lists canonical keys that must be present after alias resolution.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub required: &'static [&'static str],
    pub aliases: &'static [(&'static str, &'static [&'static str])],
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Builds the catalog once at startup. Duplicate names are a
    /// configuration defect and abort the process.
    pub fn new() -> Result<Self> {
        let tools = tool_definitions();

        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name) {
                bail!("Duplicate tool name in registry: {}", tool.name);
            }
        }

        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn list(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// The `tools/list` payload: name, description and inputSchema verbatim.
    pub fn list_json(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": tool.input_schema,
                    })
                })
                .collect(),
        )
    }
}

const COMMUNITY_ALIASES: &[(&str, &[&str])] =
    &[("community", &["name", "community_name"])];
const COMMUNITY_NAME_ALIASES: &[(&str, &[&str])] =
    &[("name", &["community_name", "community"])];
const POST_ALIASES: &[(&str, &[&str])] = &[("post_id", &["id"])];
const POST_BODY_ALIASES: &[(&str, &[&str])] =
    &[("post_id", &["id"]), ("body", &["content"])];
const CREATE_POST_ALIASES: &[(&str, &[&str])] = &[
    ("community", &["name", "community_name"]),
    ("body", &["content"]),
];
const ASSET_ALIASES: &[(&str, &[&str])] = &[("id", &["asset_id"])];
const DESCRIPTION_ALIASES: &[(&str, &[&str])] = &[("description", &["prompt"])];
const UPDATE_ASSET_ALIASES: &[(&str, &[&str])] =
    &[("id", &["asset_id"]), ("description", &["prompt"])];

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "goodfaith_get_community",
            description: "Get a community by name",
            input_schema: json!({"type":"object","required":["name"],"properties":{"name":{"type":"string","description":"Community name (also accepted as community_name or community)"}}}),
            required: &["name"],
            aliases: COMMUNITY_NAME_ALIASES,
        },
        ToolDefinition {
            name: "goodfaith_list_communities",
            description: "List all communities",
            input_schema: json!({"type":"object","properties":{}}),
            required: &[],
            aliases: &[],
        },
        ToolDefinition {
            name: "goodfaith_create_post",
            description: "Create a post in a community",
            input_schema: json!({"type":"object","required":["community","title","body"],"properties":{"community":{"type":"string"},"title":{"type":"string"},"body":{"type":"string","description":"Post body (also accepted as content)"}}}),
            required: &["community", "title", "body"],
            aliases: CREATE_POST_ALIASES,
        },
        ToolDefinition {
            name: "goodfaith_list_posts",
            description: "List posts in a community",
            input_schema: json!({"type":"object","required":["community"],"properties":{"community":{"type":"string"}}}),
            required: &["community"],
            aliases: COMMUNITY_ALIASES,
        },
        ToolDefinition {
            name: "goodfaith_get_post",
            description: "Get a post by id",
            input_schema: json!({"type":"object","required":["post_id"],"properties":{"post_id":{"type":"string"}}}),
            required: &["post_id"],
            aliases: POST_ALIASES,
        },
        ToolDefinition {
            name: "goodfaith_create_comment",
            description: "Comment on a post",
            input_schema: json!({"type":"object","required":["post_id","body"],"properties":{"post_id":{"type":"string"},"body":{"type":"string"}}}),
            required: &["post_id", "body"],
            aliases: POST_BODY_ALIASES,
        },
        ToolDefinition {
            name: "goodfaith_evaluate_post",
            description: "Request an AI evaluation of a post",
            input_schema: json!({"type":"object","required":["post_id"],"properties":{"post_id":{"type":"string"}}}),
            required: &["post_id"],
            aliases: POST_ALIASES,
        },
        ToolDefinition {
            name: "forge_create",
            description: "Generate a new asset from a description",
            input_schema: json!({"type":"object","required":["description"],"properties":{"description":{"type":"string","description":"What to generate (also accepted as prompt)"},"name":{"type":"string"}}}),
            required: &["description"],
            aliases: DESCRIPTION_ALIASES,
        },
        ToolDefinition {
            name: "forge_get",
            description: "Get a generated asset by id",
            input_schema: json!({"type":"object","required":["id"],"properties":{"id":{"type":"string"}}}),
            required: &["id"],
            aliases: ASSET_ALIASES,
        },
        ToolDefinition {
            name: "forge_list",
            description: "List generated assets",
            input_schema: json!({"type":"object","properties":{"limit":{"type":"integer"}}}),
            required: &[],
            aliases: &[],
        },
        ToolDefinition {
            name: "forge_update",
            description: "Update an asset from a new description",
            input_schema: json!({"type":"object","required":["id","description"],"properties":{"id":{"type":"string"},"description":{"type":"string"}}}),
            required: &["id", "description"],
            aliases: UPDATE_ASSET_ALIASES,
        },
        ToolDefinition {
            name: "forge_get_source",
            description: "Get the generated source code for an asset (raw text)",
            input_schema: json!({"type":"object","required":["id"],"properties":{"id":{"type":"string"}}}),
            required: &["id"],
            aliases: ASSET_ALIASES,
        },
        ToolDefinition {
            name: "forge_get_types",
            description: "Get the platform type definitions (raw text)",
            input_schema: json!({"type":"object","properties":{}}),
            required: &[],
            aliases: &[],
        },
        ToolDefinition {
            name: "forge_health",
            description: "Check generation service health; warmup=true polls until warm",
            input_schema: json!({"type":"object","properties":{"warmup":{"type":"boolean"}}}),
            required: &[],
            aliases: &[],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_with_unique_names() {
        let registry = ToolRegistry::new().expect("registry builds");
        let names: HashSet<_> = registry.list().iter().map(|t| t.name).collect();
        assert_eq!(names.len(), registry.list().len());
    }

    #[test]
    fn list_json_exposes_schema_per_tool() {
        let registry = ToolRegistry::new().expect("registry builds");
        let listed = registry.list_json();
        let tools = listed.as_array().expect("array");
        assert_eq!(tools.len(), registry.list().len());
        for tool in tools {
            assert!(tool.get("name").is_some());
            assert!(tool.get("description").is_some());
            assert!(tool.get("inputSchema").is_some());
        }
    }

    #[test]
    fn required_keys_are_canonical() {
        let registry = ToolRegistry::new().expect("registry builds");
        for tool in registry.list() {
            for required in tool.required {
                let is_alias = tool
                    .aliases
                    .iter()
                    .any(|(_, aliases)| aliases.contains(required));
                assert!(!is_alias, "{}: required key {required} is an alias", tool.name);
            }
        }
    }
}
