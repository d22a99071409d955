//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Request/reply command dispatch."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::sync::Arc;

use ms_metrics::ModelMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapter::{CommandOutput, SharedModel};
use crate::flags::ChangeTracker;

/// Incoming command: `{cmd, val}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub cmd: String,
    #[serde(default)]
    pub val: Value,
}

impl RpcRequest {
    pub fn new(cmd: impl Into<String>, val: Value) -> Self {
        Self {
            cmd: cmd.into(),
            val,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    Ok,
    Fail,
}

/// Reply: `{status: "ok", result?}` or `{status: "fail", err}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: RpcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl RpcReply {
    pub fn ok() -> Self {
        Self {
            status: RpcStatus::Ok,
            result: None,
            err: None,
        }
    }

    pub fn ok_with(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::ok()
        }
    }

    pub fn fail(err: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Fail,
            result: None,
            err: Some(err.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RpcStatus::Ok
    }
}

/// A request paired with the slot its reply goes into. Dropping the sender
/// means no reply.
pub type RpcCall = (RpcRequest, oneshot::Sender<RpcReply>);

/// Maps commands onto the model adapter and change tracker.
#[derive(Clone)]
pub struct RpcDispatcher {
    model: SharedModel,
    tracker: Arc<ChangeTracker>,
    reply_to_unknown: bool,
    metrics: Option<ModelMetrics>,
}

impl RpcDispatcher {
    pub fn new(model: SharedModel, tracker: Arc<ChangeTracker>) -> Self {
        Self {
            model,
            tracker,
            reply_to_unknown: false,
            metrics: None,
        }
    }

    /// Answer unknown commands with a failure instead of staying silent.
    pub fn reply_to_unknown(mut self, enabled: bool) -> Self {
        self.reply_to_unknown = enabled;
        self
    }

    pub fn with_metrics(mut self, metrics: ModelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle one request. `None` means the request gets no reply.
    pub fn dispatch(&self, request: &RpcRequest) -> Option<RpcReply> {
        let (label, reply) = match request.cmd.as_str() {
            "tao" => ("tao", Some(self.tao(&request.val))),
            "send_orbit" | "send_profiles_twiss" | "send_und_twiss" => {
                self.tracker.mark_changed();
                (request.cmd.as_str(), Some(RpcReply::ok()))
            }
            "echo" => ("echo", Some(RpcReply::ok_with(request.val.clone()))),
            other => {
                warn!(cmd = other, "unknown command");
                let reply = self
                    .reply_to_unknown
                    .then(|| RpcReply::fail(format!("unknown command: {other}")));
                ("unknown", reply)
            }
        };
        if let Some(metrics) = &self.metrics {
            let status = match &reply {
                Some(reply) if reply.is_ok() => "ok",
                Some(_) => "fail",
                None => "ignored",
            };
            metrics.record_rpc(label, status);
        }
        reply
    }

    fn tao(&self, val: &Value) -> RpcReply {
        let Some(command) = val.as_str() else {
            return RpcReply::fail("tao expects a string command");
        };
        let outcome = self.model.lock().command(command);
        match outcome {
            Ok(CommandOutput::Lines(lines)) => RpcReply::ok_with(json!(lines)),
            Ok(CommandOutput::Refused(message)) => RpcReply::ok_with(json!(message)),
            Err(err) => {
                debug!(command, error = %err, "tao command failed");
                RpcReply::fail(err.to_string())
            }
        }
    }
}

/// Cloneable front door to the endpoint task.
#[derive(Debug, Clone)]
pub struct RpcClient {
    tx: mpsc::Sender<RpcCall>,
}

impl RpcClient {
    pub fn new(tx: mpsc::Sender<RpcCall>) -> Self {
        Self { tx }
    }

    /// Submit a request and wait for its reply. `None` when the endpoint
    /// chose not to reply or has stopped.
    pub async fn call(&self, request: RpcRequest) -> Option<RpcReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send((request, reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}

/// Serve requests strictly one at a time until shutdown or until every
/// client is gone.
pub async fn run_endpoint(
    dispatcher: RpcDispatcher,
    mut requests: mpsc::Receiver<RpcCall>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("command endpoint started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("command endpoint shutdown signal received");
                break;
            }
            call = requests.recv() => {
                let Some((request, reply_slot)) = call else {
                    debug!("all command clients dropped");
                    break;
                };
                if let Some(reply) = dispatcher.dispatch(&request) {
                    let _ = reply_slot.send(reply);
                }
            }
        }
    }
}
