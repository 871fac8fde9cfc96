mod broker;
mod config;
mod dispatch;
mod downstream;
mod registry;
mod rpc;
mod session;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use broker::CredentialBroker;
use config::Config;
use dispatch::Dispatcher;
use downstream::ApiClient;
use registry::ToolRegistry;
use session::SessionStore;
use tokio::sync::RwLock;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub broker: CredentialBroker,
    pub dispatcher: Dispatcher,
    pub registry: Arc<ToolRegistry>,
    pub sessions: SessionStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_gateway_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let registry = Arc::new(ToolRegistry::new()?);
    let http = reqwest::Client::new();

    let state = AppState {
        broker: CredentialBroker::new(
            http.clone(),
            config.auth_base_url.clone(),
            config.identities.clone(),
        ),
        dispatcher: Dispatcher::new(
            ApiClient::new(http),
            registry.clone(),
            config.goodfaith_base_url.clone(),
            config.forge_base_url.clone(),
        ),
        registry,
        sessions: Arc::new(RwLock::new(HashMap::new())),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(session::healthz))
        .route("/sse", get(session::open_stream_default))
        .route("/sse/{identity}", get(session::open_stream_for_identity))
        .route("/message", post(session::post_message))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("mcp-gateway-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
