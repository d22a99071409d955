//! ---
//! ms_section: "05-networking-external-interfaces"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "HTTP gateway for tables and process-variable channels."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ms_core::TableChannel;
use ms_metrics::{metrics_handler, SharedRegistry};
use ms_router::{ChannelError, ChannelRouter, ChannelValue, RouterError};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct GatewayState {
    tables: Arc<TableChannel>,
    router: Arc<ChannelRouter>,
    metrics: Option<SharedRegistry>,
}

/// Channel read or write result.
#[derive(Debug, Serialize)]
struct ChannelBody {
    name: String,
    kind: ms_router::ChannelKind,
    writable: bool,
    value: ChannelValue,
}

/// Builder for the process-variable HTTP gateway.
pub struct PvGatewayBuilder {
    listen: SocketAddr,
    tables: Arc<TableChannel>,
    router: Arc<ChannelRouter>,
    metrics: Option<SharedRegistry>,
}

impl PvGatewayBuilder {
    pub fn new(listen: SocketAddr, tables: Arc<TableChannel>, router: Arc<ChannelRouter>) -> Self {
        Self {
            listen,
            tables,
            router,
            metrics: None,
        }
    }

    /// Expose `registry` at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    pub async fn spawn(self) -> anyhow::Result<PvGatewayHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "pv gateway listening");

        let state = Arc::new(GatewayState {
            tables: self.tables,
            router: self.router,
            metrics: self.metrics,
        });
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/metrics", get(get_metrics))
            .route("/tables/:name", get(get_table))
            .route("/pv/:name", get(get_channel).put(put_channel))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "pv gateway exited with error");
            }
        });

        Ok(PvGatewayHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

pub struct PvGatewayHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PvGatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|err| anyhow::anyhow!(err))
    }
}

fn error_body(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn channel_error(err: ChannelError) -> Response {
    let status = match &err {
        ChannelError::ReadOnly(_) => StatusCode::CONFLICT,
        ChannelError::TypeMismatch { .. } | ChannelError::OutOfRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        ChannelError::Handler(_) => StatusCode::BAD_GATEWAY,
    };
    error_body(status, err)
}

async fn get_metrics(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(registry) => metrics_handler(Arc::clone(registry)).await.into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics registry unavailable").into_response(),
    }
}

async fn get_table(State(state): State<Arc<GatewayState>>, Path(name): Path<String>) -> Response {
    match state.tables.get(&name) {
        Some(table) => Json(table.to_document()).into_response(),
        None => error_body(StatusCode::NOT_FOUND, format!("no table named {name}")),
    }
}

async fn get_channel(State(state): State<Arc<GatewayState>>, Path(name): Path<String>) -> Response {
    let channel = match state.router.get(&name) {
        Ok(channel) => channel,
        Err(err @ RouterError::NotFound(_)) => return error_body(StatusCode::NOT_FOUND, err),
        Err(err) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, err),
    };
    match channel.read() {
        Ok(value) => Json(ChannelBody {
            name: channel.name().to_owned(),
            kind: channel.kind(),
            writable: channel.is_writable(),
            value,
        })
        .into_response(),
        Err(err) => channel_error(err),
    }
}

async fn put_channel(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    Json(value): Json<ChannelValue>,
) -> Response {
    let channel = match state.router.get(&name) {
        Ok(channel) => channel,
        Err(err @ RouterError::NotFound(_)) => return error_body(StatusCode::NOT_FOUND, err),
        Err(err) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, err),
    };
    debug!(channel = %name, value = ?value, "channel write requested");
    match channel.write(value) {
        Ok(()) => Json(ChannelBody {
            name: channel.name().to_owned(),
            kind: channel.kind(),
            writable: true,
            value: channel.value(),
        })
        .into_response(),
        Err(err) => channel_error(err),
    }
}
