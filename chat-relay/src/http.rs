//! HTTP surface: the websocket endpoint plus read-only status reports.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use sysinfo::System;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::{
    broker::BrokerHealth,
    session::{self, Relay},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const ENDPOINTS: [&str; 5] = ["/", "/health", "/ws", "/status", "/debug"];

#[derive(Clone)]
pub struct AppState {
    relay: Relay,
    broker: Arc<BrokerHealth>,
    broker_url: Arc<str>,
    started: Instant,
}

impl AppState {
    /// `broker_url` is reported as given, so pass it already redacted.
    pub fn new(relay: Relay, broker: Arc<BrokerHealth>, broker_url: impl Into<String>) -> Self {
        Self {
            relay,
            broker,
            broker_url: broker_url.into().into(),
            started: Instant::now(),
        }
    }

    fn instance(&self) -> String {
        self.relay.instance().to_string()
    }

    fn client_count(&self) -> usize {
        self.relay.registry().reported_count()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/debug", get(debug_report))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    debug!(pod = %state.relay.instance(), "websocket upgrade requested");
    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            let (sink, frames) = socket.split();
            let relay = state.relay;
            relay.track(session::serve(relay.clone(), Box::pin(sink), frames))
        })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerStatus {
    status: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
    active_clients: usize,
    rabbitmq: BrokerStatus,
    server_time: DateTime<Utc>,
    pod_name: String,
}

#[derive(Debug, Serialize)]
struct BrokerStatus {
    connected: bool,
    url: String,
}

async fn root(State(state): State<AppState>) -> Json<ServerStatus> {
    let active_clients = state.client_count();
    debug!(active_clients, "reporting server status");

    Json(ServerStatus {
        status: "running",
        version: VERSION,
        endpoints: ENDPOINTS.to_vec(),
        active_clients,
        rabbitmq: BrokerStatus {
            connected: state.broker.is_connected(),
            url: state.broker_url.to_string(),
        },
        server_time: Utc::now(),
        pod_name: state.instance(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    pod_name: String,
    connected_clients: usize,
    timestamp: String,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = if state.broker.is_connected() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let body = Health {
        status,
        pod_name: state.instance(),
        connected_clients: state.client_count(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    (code, Json(body))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    status: &'static str,
    pod_name: String,
    uptime: String,
    client_count: usize,
    server_time: DateTime<Utc>,
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        status: "operational",
        pod_name: state.instance(),
        uptime: format_uptime(state.started.elapsed().as_secs()),
        client_count: state.client_count(),
        server_time: Utc::now(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DebugReport {
    pod_name: String,
    global_clients: usize,
    local_clients: usize,
    memory: Option<MemoryReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryReport {
    rss_bytes: u64,
    virtual_bytes: u64,
}

async fn debug_report(State(state): State<AppState>) -> Json<DebugReport> {
    Json(DebugReport {
        pod_name: state.instance(),
        global_clients: state.client_count(),
        local_clients: state.relay.registry().size().await,
        memory: process_memory(),
    })
}

fn process_memory() -> Option<MemoryReport> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_process(pid);
    let process = system.process(pid)?;
    Some(MemoryReport {
        rss_bytes: process.memory(),
        virtual_bytes: process.virtual_memory(),
    })
}

fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m{seconds}s"),
        _ => format!("{hours}h{minutes}m{seconds}s"),
    }
}
