//! HTTP front door: one websocket endpoint for the app side of a session,
//! one for clients, plus health, stats and Prometheus endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::protocol::SessionId;
use crate::rules::Rules;
use crate::session::Session;
use crate::transport::{Connection, WebSocketConnection};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub session: SessionConfig,
}

/// Live sessions keyed by id. A session leaves the registry once its app
/// connection closes.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.get(&session_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Opens a session for `app`, or returns `None` when the id is taken.
    pub fn open(
        &self,
        session_id: SessionId,
        app: Arc<dyn Connection>,
        rules: Arc<Rules>,
        config: SessionConfig,
    ) -> Option<Session> {
        let session = match self.sessions.entry(session_id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => slot
                .insert(Session::new(session_id, app, rules, config))
                .clone(),
        };
        gauge!("beach_mirror_active_sessions", self.sessions.len() as f64);

        let sessions = Arc::clone(&self.sessions);
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            sessions.remove(&session_id);
            gauge!("beach_mirror_active_sessions", sessions.len() as f64);
        });
        Some(session)
    }

    pub fn shutdown_all(&self) {
        let sessions: Vec<Session> = self.sessions.iter().map(|entry| entry.clone()).collect();
        for session in sessions {
            session.shutdown();
        }
    }
}

pub struct AppState {
    pub registry: SessionRegistry,
    pub rules: Arc<Rules>,
    pub session_config: SessionConfig,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(session_config: SessionConfig, rules: Rules, metrics: PrometheusHandle) -> Self {
        Self {
            registry: SessionRegistry::new(),
            rules: Arc::new(rules),
            session_config,
            metrics,
        }
    }

    fn stats(&self) -> StatsResponse {
        let mut sessions: Vec<SessionStatsEntry> = self
            .registry
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionStatsEntry {
                    session_id: session.id().to_string(),
                    clients: session.client_count(),
                    authoritative_client: session
                        .authoritative_client()
                        .map(|client| client.id().to_string()),
                    actors: session.with_state(|state| state.actors.len()),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        StatsResponse {
            active_sessions: sessions.len(),
            active_clients: sessions.iter().map(|entry| entry.clients).sum(),
            sessions,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    active_clients: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    session_id: String,
    clients: usize,
    authoritative_client: Option<String>,
    actors: usize,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: SessionId,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/app", get(app_handler))
        .route("/client", get(client_handler))
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = Arc::new(AppState::new(
        config.session.clone(),
        Rules::standard(),
        metrics,
    ));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!(listen_addr = %config.listen_addr, "beach-mirror listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        sessions = state.registry.len(),
        "shutdown signal received; closing sessions"
    );
    state.registry.shutdown_all();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn app_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.registry.contains(query.session) {
        counter!("beach_mirror_rejected_connections_total", 1, "reason" => "session_exists");
        return StatusCode::CONFLICT.into_response();
    }
    ws.on_upgrade(move |socket| attach_app(socket, state, query.session))
        .into_response()
}

async fn client_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.registry.contains(query.session) {
        counter!("beach_mirror_rejected_connections_total", 1, "reason" => "unknown_session");
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| attach_client(socket, state, query.session))
        .into_response()
}

async fn attach_app(socket: WebSocket, state: Arc<AppState>, session_id: SessionId) {
    let connection = WebSocketConnection::spawn(socket, format!("app:{session_id}"));
    let app: Arc<dyn Connection> = connection.clone();
    if state
        .registry
        .open(
            session_id,
            app,
            state.rules.clone(),
            state.session_config.clone(),
        )
        .is_none()
    {
        warn!(session_id = %session_id, "session opened concurrently; closing app connection");
        connection.close();
    }
}

async fn attach_client(socket: WebSocket, state: Arc<AppState>, session_id: SessionId) {
    let connection = WebSocketConnection::spawn(socket, format!("client:{session_id}"));
    match state.registry.get(session_id) {
        Some(session) => {
            let client = session.connect_client(connection);
            info!(session_id = %session_id, client_id = %client.id(), "client connected");
        }
        None => {
            warn!(session_id = %session_id, "session closed before client attached");
            connection.close();
        }
    }
}
