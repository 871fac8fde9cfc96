use std::{sync::Arc, time::Duration};

use reqwest::Method;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time;
use tracing::debug;

use crate::{
    downstream::{ApiClient, DownstreamError},
    registry::{ToolDefinition, ToolRegistry},
};

/// Fixed warm-up schedule: first probe is immediate, then one probe after
/// each delay. Worst case is six probes in ~28s of wall clock.
pub const WARMUP_DELAYS: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(10),
];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Downstream(#[from] DownstreamError),
}

/// A dispatched tool either yields structured JSON or opaque text (source
/// code, type definitions). Both are rendered into the protocol's text
/// content envelope by the message handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Json(Value),
    Text(String),
}

impl ToolOutput {
    pub fn into_text(self) -> String {
        match self {
            ToolOutput::Json(value) => value.to_string(),
            ToolOutput::Text(text) => text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Goodfaith,
    Forge,
}

/// The downstream request a tool call resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub backend: Backend,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub authenticated: bool,
    pub raw_text: bool,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: ApiClient,
    registry: Arc<ToolRegistry>,
    goodfaith_base_url: String,
    forge_base_url: String,
    warmup_delays: Vec<Duration>,
}

impl Dispatcher {
    pub fn new(
        client: ApiClient,
        registry: Arc<ToolRegistry>,
        goodfaith_base_url: String,
        forge_base_url: String,
    ) -> Self {
        Self {
            client,
            registry,
            goodfaith_base_url,
            forge_base_url,
            warmup_delays: WARMUP_DELAYS.to_vec(),
        }
    }

    #[cfg(test)]
    fn with_warmup_delays(mut self, delays: Vec<Duration>) -> Self {
        self.warmup_delays = delays;
        self
    }

    /// Validates and routes one tool call. Holds no state between calls;
    /// the token is whatever the session currently carries.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        token: &str,
    ) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        let normalized = normalize_arguments(args, tool.aliases);
        validate_required(tool, &normalized, args)?;

        if tool.name == "forge_health" {
            let warmup = normalized
                .get("warmup")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return self.forge_health(warmup).await;
        }

        // The tool is known and every required key is present, so a route
        // that fails to build means an argument carried the wrong type.
        let route = build_route(tool.name, &normalized)
            .ok_or_else(|| invalid_type_error(tool, &normalized, args))?;
        debug!(tool = %tool.name, path = %route.path, "Dispatching tool call");

        let base_url = match route.backend {
            Backend::Goodfaith => &self.goodfaith_base_url,
            Backend::Forge => &self.forge_base_url,
        };
        let auth = route.authenticated.then_some(token);

        if route.raw_text {
            let text = self
                .client
                .request_text(base_url, &route.path, auth, route.method)
                .await?;
            return Ok(ToolOutput::Text(text));
        }

        let value = self
            .client
            .request_json(base_url, &route.path, auth, route.method, route.body)
            .await?;
        Ok(ToolOutput::Json(value))
    }

    /// Health probe, optionally polling through the fixed delay schedule
    /// until the generation service reports warm. Always terminates within
    /// the attempt budget.
    async fn forge_health(&self, warmup: bool) -> Result<ToolOutput, ToolError> {
        let mut attempts = 1u32;
        if let Some(health) = self.probe_health().await {
            return Ok(ToolOutput::Json(json!({"status": "warm", "health": health})));
        }

        if !warmup {
            return Ok(ToolOutput::Json(json!({"status": "cold", "attempts": attempts})));
        }

        for delay in &self.warmup_delays {
            time::sleep(*delay).await;
            attempts += 1;
            if let Some(health) = self.probe_health().await {
                return Ok(ToolOutput::Json(json!({
                    "status": "warm",
                    "health": health,
                    "attempts": attempts,
                })));
            }
        }

        Ok(ToolOutput::Json(json!({"status": "cold", "attempts": attempts})))
    }

    async fn probe_health(&self) -> Option<Value> {
        self.client
            .request_json(&self.forge_base_url, "/api/health", None, Method::GET, None)
            .await
            .ok()
    }
}

/// Resolves the declarative alias table into a canonical-keyed argument
/// map. The first present alias wins; remaining aliases are dropped so a
/// tool never sees the same logical parameter twice.
pub fn normalize_arguments(
    args: &Value,
    aliases: &[(&str, &[&str])],
) -> Map<String, Value> {
    let mut normalized = args.as_object().cloned().unwrap_or_default();

    for (canonical, alternates) in aliases {
        for alias in *alternates {
            let value = normalized.remove(*alias);
            if !normalized.contains_key(*canonical) {
                if let Some(value) = value {
                    normalized.insert((*canonical).to_string(), value);
                }
            }
        }
    }

    normalized
}

fn validate_required(
    tool: &ToolDefinition,
    normalized: &Map<String, Value>,
    supplied: &Value,
) -> Result<(), ToolError> {
    let missing: Vec<&str> = tool
        .required
        .iter()
        .filter(|key| {
            !normalized
                .get(**key)
                .map(|v| !v.is_null())
                .unwrap_or(false)
        })
        .copied()
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    // The message echoes both the expected shape and what arrived, so a
    // tool-calling model can self-correct without another round trip.
    Err(ToolError::InvalidArguments(format!(
        "Missing required parameter. Tool {} requires: {:?}. Missing: {:?}. Expected call shape: {}. Got arguments: {}",
        tool.name,
        tool.required,
        missing,
        tool.input_schema,
        supplied,
    )))
}

fn invalid_type_error(
    tool: &ToolDefinition,
    normalized: &Map<String, Value>,
    supplied: &Value,
) -> ToolError {
    let wrong_type: Vec<&str> = tool
        .required
        .iter()
        .filter(|key| {
            normalized
                .get(**key)
                .map(|v| !v.is_string())
                .unwrap_or(false)
        })
        .copied()
        .collect();

    ToolError::InvalidArguments(format!(
        "Invalid argument type. Tool {} requires string values for: {:?}. Wrong type: {:?}. Expected call shape: {}. Got arguments: {}",
        tool.name,
        tool.required,
        wrong_type,
        tool.input_schema,
        supplied,
    ))
}

/// Maps a validated tool call onto its downstream request. Pure, so routing
/// is testable without a live backend.
pub fn build_route(name: &str, args: &Map<String, Value>) -> Option<RouteSpec> {
    let get_str = |key: &str| args.get(key).and_then(Value::as_str).map(ToString::to_string);

    let route = match name {
        "goodfaith_get_community" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::GET,
            path: format!("/api/communities/{}", get_str("name")?),
            body: None,
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_list_communities" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::GET,
            path: "/api/communities".to_string(),
            body: None,
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_create_post" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::POST,
            path: format!("/api/communities/{}/posts", get_str("community")?),
            body: Some(json!({
                "title": get_str("title")?,
                "body": get_str("body")?,
            })),
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_list_posts" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::GET,
            path: format!("/api/communities/{}/posts", get_str("community")?),
            body: None,
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_get_post" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::GET,
            path: format!("/api/posts/{}", get_str("post_id")?),
            body: None,
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_create_comment" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::POST,
            path: format!("/api/posts/{}/comments", get_str("post_id")?),
            body: Some(json!({"body": get_str("body")?})),
            authenticated: true,
            raw_text: false,
        },
        "goodfaith_evaluate_post" => RouteSpec {
            backend: Backend::Goodfaith,
            method: Method::POST,
            path: format!("/api/posts/{}/evaluate", get_str("post_id")?),
            body: None,
            authenticated: true,
            raw_text: false,
        },
        "forge_create" => {
            let mut body = json!({"description": get_str("description")?});
            if let Some(name) = get_str("name") {
                body["name"] = Value::String(name);
            }
            RouteSpec {
                backend: Backend::Forge,
                method: Method::POST,
                path: "/api/generate".to_string(),
                body: Some(body),
                authenticated: false,
                raw_text: false,
            }
        }
        "forge_get" => RouteSpec {
            backend: Backend::Forge,
            method: Method::GET,
            path: format!("/api/assets/{}", get_str("id")?),
            body: None,
            authenticated: false,
            raw_text: false,
        },
        "forge_list" => {
            // Tolerate a numeric string, the same leniency aliasing gives
            // misnamed keys.
            let limit = args.get("limit").and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
            });
            let path = match limit {
                Some(limit) => format!("/api/assets?limit={limit}"),
                None => "/api/assets".to_string(),
            };
            RouteSpec {
                backend: Backend::Forge,
                method: Method::GET,
                path,
                body: None,
                authenticated: false,
                raw_text: false,
            }
        }
        "forge_update" => RouteSpec {
            backend: Backend::Forge,
            method: Method::PUT,
            path: format!("/api/assets/{}", get_str("id")?),
            body: Some(json!({"description": get_str("description")?})),
            authenticated: true,
            raw_text: false,
        },
        "forge_get_source" => RouteSpec {
            backend: Backend::Forge,
            method: Method::GET,
            path: format!("/api/assets/{}/source", get_str("id")?),
            body: None,
            authenticated: false,
            raw_text: true,
        },
        "forge_get_types" => RouteSpec {
            backend: Backend::Forge,
            method: Method::GET,
            path: "/api/types".to_string(),
            body: None,
            authenticated: false,
            raw_text: true,
        },
        _ => return None,
    };

    Some(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn dispatcher_for(goodfaith: &MockServer, forge: &MockServer) -> Dispatcher {
        Dispatcher::new(
            ApiClient::new(reqwest::Client::new()),
            Arc::new(ToolRegistry::new().expect("registry builds")),
            goodfaith.base_url(),
            forge.base_url(),
        )
    }

    #[test]
    fn alias_resolution_prefers_first_present() {
        let args = json!({"community_name": "rustaceans"});
        let normalized = normalize_arguments(&args, &[("name", &["community_name", "community"])]);
        assert_eq!(normalized.get("name"), Some(&json!("rustaceans")));
        assert!(!normalized.contains_key("community_name"));
    }

    #[test]
    fn alias_resolution_keeps_canonical_when_both_present() {
        let args = json!({"name": "canonical", "community": "alias"});
        let normalized = normalize_arguments(&args, &[("name", &["community_name", "community"])]);
        assert_eq!(normalized.get("name"), Some(&json!("canonical")));
        assert!(!normalized.contains_key("community"));
    }

    #[test]
    fn aliased_arguments_build_identical_routes() {
        let registry = ToolRegistry::new().expect("registry builds");
        let tool = registry.get("goodfaith_get_community").expect("tool exists");

        let via_name = normalize_arguments(&json!({"name": "rustaceans"}), tool.aliases);
        let via_alias = normalize_arguments(&json!({"community": "rustaceans"}), tool.aliases);

        assert_eq!(
            build_route(tool.name, &via_name),
            build_route(tool.name, &via_alias)
        );
    }

    #[test]
    fn forge_create_routes_to_generate() {
        let args = normalize_arguments(
            &json!({"prompt": "a red button"}),
            &[("description", &["prompt"])],
        );
        let route = build_route("forge_create", &args).expect("route builds");
        assert_eq!(route.method, Method::POST);
        assert_eq!(route.path, "/api/generate");
        assert!(!route.authenticated);
        assert_eq!(route.body, Some(json!({"description": "a red button"})));
    }

    #[tokio::test]
    async fn missing_required_parameter_names_the_keys() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        let err = dispatcher_for(&goodfaith, &forge)
            .dispatch("goodfaith_get_community", &json!({}), "tok")
            .await
            .expect_err("missing required");

        let message = err.to_string();
        assert!(message.contains("Missing required parameter."));
        assert!(message.contains("\"name\""));
        assert!(message.contains("Got arguments: {}"));
    }

    #[tokio::test]
    async fn wrong_type_required_parameter_is_invalid_arguments() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        let err = dispatcher_for(&goodfaith, &forge)
            .dispatch("goodfaith_get_community", &json!({"name": 42}), "tok")
            .await
            .expect_err("wrong argument type");

        assert!(matches!(err, ToolError::InvalidArguments(_)));
        let message = err.to_string();
        assert!(message.contains("Invalid argument type"));
        assert!(message.contains("\"name\""));
        assert!(message.contains("Got arguments: {\"name\":42}"));
        assert!(!message.contains("Unknown tool"));
    }

    #[test]
    fn forge_list_accepts_numeric_string_limit() {
        let args = normalize_arguments(&json!({"limit": "5"}), &[]);
        let route = build_route("forge_list", &args).expect("route builds");
        assert_eq!(route.path, "/api/assets?limit=5");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        let err = dispatcher_for(&goodfaith, &forge)
            .dispatch("no_such_tool", &json!({}), "tok")
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn forge_create_returns_asset_id_from_healthy_backend() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        forge
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body(json!({"description": "a red button"}));
                then.status(200).json_body(json!({"id": "asset-1", "status": "queued"}));
            })
            .await;

        let output = dispatcher_for(&goodfaith, &forge)
            .dispatch("forge_create", &json!({"description": "a red button"}), "tok")
            .await
            .expect("dispatch succeeds");

        let value: Value = serde_json::from_str(&output.into_text()).expect("valid JSON");
        assert_eq!(value.get("id"), Some(&json!("asset-1")));
    }

    #[tokio::test]
    async fn aliased_call_hits_same_downstream_endpoint() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        let mock = goodfaith
            .mock_async(|when, then| {
                when.method(GET).path("/api/communities/rustaceans");
                then.status(200).json_body(json!({"name": "rustaceans"}));
            })
            .await;

        let dispatcher = dispatcher_for(&goodfaith, &forge);
        dispatcher
            .dispatch("goodfaith_get_community", &json!({"name": "rustaceans"}), "tok")
            .await
            .expect("canonical key works");
        dispatcher
            .dispatch(
                "goodfaith_get_community",
                &json!({"community": "rustaceans"}),
                "tok",
            )
            .await
            .expect("alias key works");

        mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn warmup_poll_terminates_cold_within_budget() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        let mock = forge
            .mock_async(|when, then| {
                when.method(GET).path("/api/health");
                then.status(503).json_body(json!({"error": "starting"}));
            })
            .await;

        let dispatcher = dispatcher_for(&goodfaith, &forge)
            .with_warmup_delays(vec![Duration::from_millis(1); 5]);
        let output = dispatcher
            .dispatch("forge_health", &json!({"warmup": true}), "tok")
            .await
            .expect("health never errors");

        let value: Value = serde_json::from_str(&output.into_text()).expect("valid JSON");
        assert_eq!(value.get("status"), Some(&json!("cold")));
        assert_eq!(value.get("attempts"), Some(&json!(6)));
        mock.assert_calls_async(6).await;
    }

    #[tokio::test]
    async fn warmup_poll_stops_at_first_warm_probe() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        forge
            .mock_async(|when, then| {
                when.method(GET).path("/api/health");
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let dispatcher = dispatcher_for(&goodfaith, &forge);
        let output = dispatcher
            .dispatch("forge_health", &json!({"warmup": true}), "tok")
            .await
            .expect("health never errors");

        let value: Value = serde_json::from_str(&output.into_text()).expect("valid JSON");
        assert_eq!(value.get("status"), Some(&json!("warm")));
    }

    #[tokio::test]
    async fn raw_text_tool_passes_body_through() {
        let goodfaith = MockServer::start_async().await;
        let forge = MockServer::start_async().await;
        forge
            .mock_async(|when, then| {
                when.method(GET).path("/api/assets/a1/source");
                then.status(200).body("fn main() {}");
            })
            .await;

        let output = dispatcher_for(&goodfaith, &forge)
            .dispatch("forge_get_source", &json!({"asset_id": "a1"}), "tok")
            .await
            .expect("dispatch succeeds");

        assert_eq!(output.into_text(), "fn main() {}");
    }
}
