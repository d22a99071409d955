//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Service wiring and lifecycle management."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use ms_common::ServiceConfig;
use ms_metrics::ModelMetrics;
use ms_oracle::Oracle;
use ms_router::ChannelRouter;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::{ModelAdapter, SharedModel};
use crate::channels::register_lattice_routes;
use crate::devices::DeviceNames;
use crate::flags::ChangeTracker;
use crate::publisher::{BroadcastSink, DiagnosticBroadcaster, TableChannel, TableRefresher};
use crate::rpc::{run_endpoint, RpcClient, RpcDispatcher};
use crate::table::build_table;

const RPC_QUEUE_DEPTH: usize = 64;

/// Fully wired model service, not yet running.
pub struct ModelService {
    config: ServiceConfig,
    model: SharedModel,
    tracker: Arc<ChangeTracker>,
    devices: Arc<dyn DeviceNames>,
    tables: Arc<TableChannel>,
    router: Arc<ChannelRouter>,
    sink: Arc<dyn BroadcastSink>,
    metrics: ModelMetrics,
}

impl ModelService {
    /// Wrap `oracle`, build the initial table (published as both live and
    /// design) and register the element channel routes.
    pub fn new(
        config: ServiceConfig,
        oracle: Box<dyn Oracle>,
        devices: Arc<dyn DeviceNames>,
        sink: Arc<dyn BroadcastSink>,
        metrics: ModelMetrics,
    ) -> Result<Self> {
        let tracker = Arc::new(ChangeTracker::new());
        let mut adapter =
            ModelAdapter::new(oracle, Arc::clone(&tracker)).with_metrics(metrics.clone());
        let oracle_name = adapter.oracle_name();
        let initial = build_table(&mut adapter, devices.as_ref())
            .context("failed to build the initial twiss table")?;
        info!(oracle = oracle_name, rows = initial.len(), "initial twiss table built");

        let tables = Arc::new(TableChannel::new(Arc::new(initial), &config.publish));
        let model = adapter.into_shared();
        let router = Arc::new(ChannelRouter::new());
        register_lattice_routes(
            &router,
            &config.pv.channel_prefix,
            Arc::clone(&tables),
            Arc::clone(&model),
        )
        .context("failed to register element channel routes")?;

        Ok(Self {
            config,
            model,
            tracker,
            devices,
            tables,
            router,
            sink,
            metrics,
        })
    }

    pub fn model(&self) -> SharedModel {
        Arc::clone(&self.model)
    }

    pub fn tracker(&self) -> Arc<ChangeTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn tables(&self) -> Arc<TableChannel> {
        Arc::clone(&self.tables)
    }

    pub fn router(&self) -> Arc<ChannelRouter> {
        Arc::clone(&self.router)
    }

    /// Spawn the command endpoint and both publisher loops.
    pub fn start(self) -> ServiceHandle {
        self.metrics.inc_start();
        let (shutdown, _) = broadcast::channel(4);
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE_DEPTH);

        let dispatcher = RpcDispatcher::new(Arc::clone(&self.model), Arc::clone(&self.tracker))
            .reply_to_unknown(self.config.rpc.reply_to_unknown)
            .with_metrics(self.metrics.clone());
        let refresher = TableRefresher::new(
            Arc::clone(&self.model),
            Arc::clone(&self.tracker),
            Arc::clone(&self.devices),
            Arc::clone(&self.tables),
        );
        let broadcaster = DiagnosticBroadcaster::new(
            Arc::clone(&self.model),
            Arc::clone(&self.tracker),
            Arc::clone(&self.sink),
        )
        .with_metrics(self.metrics.clone());

        let publish = &self.config.publish;
        let tasks = vec![
            tokio::spawn(run_endpoint(dispatcher, rpc_rx, shutdown.subscribe())),
            tokio::spawn(refresher.run(publish.table_interval, shutdown.subscribe())),
            tokio::spawn(broadcaster.run(publish.broadcast_interval, shutdown.subscribe())),
        ];
        info!(
            table_interval_ms = publish.table_interval.as_millis() as u64,
            broadcast_interval_ms = publish.broadcast_interval.as_millis() as u64,
            "model service started"
        );

        ServiceHandle {
            rpc: RpcClient::new(rpc_tx),
            model: self.model,
            tracker: self.tracker,
            tables: self.tables,
            router: self.router,
            shutdown,
            tasks,
        }
    }
}

/// Handle to a running service.
pub struct ServiceHandle {
    rpc: RpcClient,
    model: SharedModel,
    tracker: Arc<ChangeTracker>,
    tables: Arc<TableChannel>,
    router: Arc<ChannelRouter>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn rpc(&self) -> RpcClient {
        self.rpc.clone()
    }

    pub fn model(&self) -> SharedModel {
        Arc::clone(&self.model)
    }

    pub fn tracker(&self) -> Arc<ChangeTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn tables(&self) -> Arc<TableChannel> {
        Arc::clone(&self.tables)
    }

    pub fn router(&self) -> Arc<ChannelRouter> {
        Arc::clone(&self.router)
    }

    /// Cancel the endpoint and both loops, then wait for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "service task ended abnormally");
                return Err(anyhow::anyhow!("service task join failure: {}", err));
            }
        }
        info!("model service stopped");
        Ok(())
    }
}
