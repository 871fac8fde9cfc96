use std::{collections::HashMap, env, net::SocketAddr};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Session state lives in an in-memory table keyed by session id;
    /// message POSTs reuse the token obtained at stream-open.
    Shared,
    /// No server-held session state; every message POST performs a fresh
    /// login for the identity named in the URL.
    Stateless,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub auth_base_url: String,
    pub goodfaith_base_url: String,
    pub forge_base_url: String,
    pub public_base_url: String,
    pub default_identity: String,
    pub heartbeat_seconds: u64,
    pub session_max_seconds: u64,
    pub session_mode: SessionMode,
    pub identities: HashMap<String, IdentityConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let auth_base_url = base_url_from_env("GATEWAY_AUTH_BASE_URL", "http://localhost:9000");
        let goodfaith_base_url =
            base_url_from_env("GATEWAY_GOODFAITH_BASE_URL", "http://localhost:9100");
        let forge_base_url = base_url_from_env("GATEWAY_FORGE_BASE_URL", "http://localhost:9200");
        let public_base_url = base_url_from_env("GATEWAY_PUBLIC_BASE_URL", "http://localhost:8080");

        let default_identity = env::var("GATEWAY_DEFAULT_IDENTITY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "claude_code".to_string());

        let heartbeat_seconds = env::var("GATEWAY_HEARTBEAT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(15);

        // Heartbeat ceiling: a stream older than this is torn down and the
        // client reconnects with a fresh stream-open.
        let session_max_seconds = env::var("GATEWAY_SESSION_MAX_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(6 * 60 * 60);

        let session_mode = match env::var("GATEWAY_SESSION_MODE") {
            Ok(v) if v.trim().eq_ignore_ascii_case("stateless") => SessionMode::Stateless,
            _ => SessionMode::Shared,
        };

        let identities = resolve_identities();

        Ok(Self {
            bind_addr,
            auth_base_url,
            goodfaith_base_url,
            forge_base_url,
            public_base_url,
            default_identity,
            heartbeat_seconds,
            session_max_seconds,
            session_mode,
            identities,
        })
    }
}

fn base_url_from_env(key: &str, default: &str) -> String {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim().trim_end_matches('/').to_string()
}

fn resolve_identities() -> HashMap<String, IdentityConfig> {
    let names = env::var("GATEWAY_IDENTITIES").unwrap_or_else(|_| "claude_code".to_string());

    let mut identities = HashMap::new();
    for name in names.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let env_key = name.to_ascii_uppercase().replace('-', "_");
        let email = env::var(format!("GATEWAY_IDENTITY_{env_key}_EMAIL")).ok();
        let password = env::var(format!("GATEWAY_IDENTITY_{env_key}_PASSWORD")).ok();

        match (email, password) {
            (Some(email), Some(password))
                if !email.trim().is_empty() && !password.trim().is_empty() =>
            {
                identities.insert(
                    name.to_string(),
                    IdentityConfig {
                        email: email.trim().to_string(),
                        password: password.trim().to_string(),
                    },
                );
            }
            _ => {
                eprintln!(
                    "[mcp-gateway-api] Identity {name} is missing GATEWAY_IDENTITY_{env_key}_EMAIL or _PASSWORD. Skipping."
                );
            }
        }
    }

    if identities.is_empty() {
        eprintln!(
            "[mcp-gateway-api] No identities provisioned. Stream-open will fail until configured."
        );
    }

    identities
}
