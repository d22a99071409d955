//! ---
//! ms_section: "03-observability"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Metrics collection and export utilities."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
pub async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the model service core.
#[derive(Clone, Debug)]
pub struct ModelMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    table_builds: IntCounter,
    table_build_seconds: Histogram,
    broadcasts: IntCounterVec,
    broadcast_failures: IntCounterVec,
    rpc_requests: IntCounterVec,
    oracle_commands: IntCounterVec,
}

impl ModelMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "model_service_starts_total",
            "Total number of times the model service has started",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let table_builds = IntCounter::with_opts(Opts::new(
            "model_table_builds_total",
            "Completed Twiss table builds",
        ))?;
        registry.register(Box::new(table_builds.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let table_build_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "model_table_build_seconds",
                "Time spent querying the oracle to build a Twiss table",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(table_build_seconds.clone()))?;

        let broadcasts = IntCounterVec::new(
            Opts::new("model_broadcasts_total", "Diagnostic messages published by tag"),
            &["tag"],
        )?;
        registry.register(Box::new(broadcasts.clone()))?;

        let broadcast_failures = IntCounterVec::new(
            Opts::new(
                "model_broadcast_failures_total",
                "Diagnostic messages that failed to build or send, by tag",
            ),
            &["tag"],
        )?;
        registry.register(Box::new(broadcast_failures.clone()))?;

        let rpc_requests = IntCounterVec::new(
            Opts::new(
                "model_rpc_requests_total",
                "Requests handled by the command endpoint",
            ),
            &["cmd", "status"],
        )?;
        registry.register(Box::new(rpc_requests.clone()))?;

        let oracle_commands = IntCounterVec::new(
            Opts::new(
                "model_oracle_commands_total",
                "Commands forwarded to the physics oracle",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(oracle_commands.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            table_builds,
            table_build_seconds,
            broadcasts,
            broadcast_failures,
            rpc_requests,
            oracle_commands,
        })
    }

    /// Metrics bound to a private registry; handy for tests and tools.
    pub fn unregistered() -> Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_table_build(&self, seconds: f64) {
        self.table_builds.inc();
        self.table_build_seconds.observe(seconds);
    }

    pub fn table_builds(&self) -> u64 {
        self.table_builds.get()
    }

    pub fn record_broadcast(&self, tag: &str, ok: bool) {
        if ok {
            self.broadcasts.with_label_values(&[tag]).inc();
        } else {
            self.broadcast_failures.with_label_values(&[tag]).inc();
        }
    }

    pub fn broadcasts(&self, tag: &str) -> u64 {
        self.broadcasts.with_label_values(&[tag]).get()
    }

    pub fn broadcast_failures(&self, tag: &str) -> u64 {
        self.broadcast_failures.with_label_values(&[tag]).get()
    }

    pub fn record_rpc(&self, cmd: &str, status: &str) {
        self.rpc_requests.with_label_values(&[cmd, status]).inc();
    }

    pub fn rpc_requests(&self, cmd: &str, status: &str) -> u64 {
        self.rpc_requests.with_label_values(&[cmd, status]).get()
    }

    pub fn record_oracle_command(&self, kind: &str) {
        self.oracle_commands.with_label_values(&[kind]).inc();
    }

    pub fn oracle_commands(&self, kind: &str) -> u64 {
        self.oracle_commands.with_label_values(&[kind]).get()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = ModelMetrics::unregistered().expect("metrics");
        metrics.record_broadcast("orbit", true);
        metrics.record_broadcast("orbit", false);
        metrics.record_rpc("tao", "ok");
        metrics.observe_table_build(0.02);

        let text = render(&metrics.registry()).expect("render");
        assert!(text.contains("model_broadcasts_total{tag=\"orbit\"} 1"));
        assert!(text.contains("model_broadcast_failures_total{tag=\"orbit\"} 1"));
        assert!(text.contains("model_rpc_requests_total{cmd=\"tao\",status=\"ok\"} 1"));
        assert_eq!(metrics.table_builds(), 1);
    }

    #[test]
    fn registering_twice_is_rejected() {
        let registry = new_registry();
        ModelMetrics::new(registry.clone()).expect("first registration");
        assert!(ModelMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn http_exporter_serves_registry() {
        let metrics = ModelMetrics::unregistered().expect("metrics");
        metrics.inc_start();
        let server = spawn_http_server(metrics.registry(), "127.0.0.1:0".parse().expect("addr"))
            .expect("server");
        let body = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(body.contains("model_service_starts_total 1"));
        server.shutdown().await.expect("shutdown");
    }
}
