//! A2A Gateway HTTP server powered by axum.
//!
//! Serves:
//! - `GET  /.well-known/agent.json` - this gateway's own card
//! - `POST /a2a/v1`                 - JSON-RPC 2.0 orchestration endpoint
//! - `GET  /a2a/health`             - liveness
//! - `GET|POST /a2a/cards`          - list / register agent cards
//! - `GET|DELETE /a2a/cards/{name}` - fetch / deregister one card
//! - `POST /a2a/discover`           - ranked candidates for a query

use crate::a2a::client::HttpAgentClient;
use crate::a2a::matcher::MatchConstraints;
use crate::a2a::orchestrator::Orchestrator;
use crate::a2a::registry::{AgentRegistry, RegistryFilter};
use crate::a2a::{agent_card, handler, types::*};
use crate::config::Config;
use crate::error::{A2aError, RegistryError};
use anyhow::Context;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Shared state for the A2A gateway.
#[derive(Clone)]
pub struct A2aState {
    pub orchestrator: Arc<Orchestrator>,
    pub host: String,
    pub port: u16,
}

/// Build the axum router for the A2A gateway.
pub fn build_router(state: A2aState) -> Router {
    Router::new()
        .route("/.well-known/agent.json", get(get_agent_card))
        .route("/a2a/v1", post(handle_jsonrpc))
        .route("/a2a/health", get(health_check))
        .route("/a2a/cards", get(list_cards).post(register_card))
        .route("/a2a/cards/{name}", get(get_card).delete(deregister_card))
        .route("/a2a/discover", post(discover))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the A2A gateway: register seed agents, spawn the background
/// health monitor and purgers, then serve until the listener fails.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    if !config.gateway.enabled {
        tracing::info!("A2A gateway disabled in config");
        return Ok(());
    }

    let client = Arc::new(HttpAgentClient::new().context("building agent HTTP client")?);
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(AgentRegistry::new()),
        client,
    ));
    if !config.agents.is_empty() {
        let registered = orchestrator.register_seeds(&config.agents).await;
        tracing::info!(
            registered = registered.len(),
            seeds = config.agents.len(),
            "Seed agents processed"
        );
    }

    let background = CancellationToken::new();
    let _background_guard = background.clone().drop_guard();
    orchestrator.clone().spawn_background(background);

    let state = A2aState {
        orchestrator,
        host: config.gateway.bind.clone(),
        port: config.gateway.port,
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .with_context(|| format!("invalid gateway address {}:{}", config.gateway.bind, config.gateway.port))?;

    tracing::info!("A2A Gateway starting on http://{}", addr);
    tracing::info!("   Agent Card: http://{}/.well-known/agent.json", addr);
    tracing::info!("   JSON-RPC:   http://{}/a2a/v1", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /.well-known/agent.json - Agent Card discovery.
async fn get_agent_card(State(state): State<A2aState>) -> Json<AgentCard> {
    Json(agent_card::build_agent_card(&state.host, state.port))
}

/// POST /a2a/v1 - JSON-RPC 2.0 endpoint.
async fn handle_jsonrpc(
    State(state): State<A2aState>,
    Json(req): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    if req.jsonrpc != JSONRPC_VERSION {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::error(
                req.id,
                error_codes::INVALID_REQUEST,
                "Invalid JSON-RPC version, expected 2.0",
            )),
        );
    }

    let response = handler::dispatch(req, &state.orchestrator).await;
    (StatusCode::OK, Json(response))
}

/// GET /a2a/health - Health check.
async fn health_check(State(state): State<A2aState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "protocol": "A2A",
        "protocol_version": "1.0",
        "agents": state.orchestrator.registry().len(),
        "sessions": state.orchestrator.sessions().len(),
    }))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, err: &A2aError) -> ApiError {
    (
        status,
        Json(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
}

fn registry_error(err: RegistryError) -> ApiError {
    let status = match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    api_error(status, &A2aError::Registry(err))
}

#[derive(Debug, Default, Deserialize)]
struct CardQuery {
    /// Comma-separated.
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    capability: Option<String>,
}

/// GET /a2a/cards - registered cards, optionally filtered.
async fn list_cards(
    State(state): State<A2aState>,
    Query(query): Query<CardQuery>,
) -> Json<Vec<AgentCard>> {
    let capability = query
        .capability
        .as_deref()
        .and_then(|raw| raw.parse::<Capability>().ok());
    let filter = RegistryFilter {
        tags: query
            .tags
            .as_deref()
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        capability,
    };
    Json(state.orchestrator.registry().list(&filter))
}

/// POST /a2a/cards - register or replace a card.
async fn register_card(
    State(state): State<A2aState>,
    Json(card): Json<AgentCard>,
) -> Result<(StatusCode, Json<AgentCard>), ApiError> {
    let name = card.name.clone();
    state
        .orchestrator
        .registry()
        .register(card)
        .map_err(registry_error)?;
    tracing::info!(agent = %name, "A2A: Card registered over HTTP");
    let stored = state
        .orchestrator
        .registry()
        .get(&name)
        .map_err(registry_error)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /a2a/cards/{name}
async fn get_card(
    State(state): State<A2aState>,
    Path(name): Path<String>,
) -> Result<Json<AgentCard>, ApiError> {
    state
        .orchestrator
        .registry()
        .get(&name)
        .map(Json)
        .map_err(registry_error)
}

/// DELETE /a2a/cards/{name}
async fn deregister_card(
    State(state): State<A2aState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .registry()
        .deregister(&name)
        .map_err(registry_error)?;
    tracing::info!(agent = %name, "A2A: Card deregistered over HTTP");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DiscoverRequest {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    tags: Vec<String>,
}

/// POST /a2a/discover - ranked candidates.
async fn discover(
    State(state): State<A2aState>,
    Json(req): Json<DiscoverRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let constraints = MatchConstraints {
        tags: req.tags,
        max_results: req.max_results,
        ..MatchConstraints::default()
    };
    let candidates = state
        .orchestrator
        .discover(&req.query, &constraints)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, &e))?;
    Ok(Json(serde_json::json!({ "candidates": candidates })))
}
