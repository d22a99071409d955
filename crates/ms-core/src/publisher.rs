//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Periodic table refresh and diagnostic broadcast loops."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! The two publisher loops poll the change tracker on a fixed cadence. Each
//! cycle takes the oracle lock once, runs every query it needs to completion
//! and releases it before handing results to the outside world.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ms_common::PublishConfig;
use ms_metrics::ModelMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::{ModelAdapter, SharedModel};
use crate::devices::DeviceNames;
use crate::diagnostics::{self, DiagnosticsError};
use crate::flags::ChangeTracker;
use crate::table::{build_table, TableError, TwissTable};

pub const TAG_ORBIT: &str = "orbit";
pub const TAG_PROFILE_TWISS: &str = "prof_twiss";
pub const TAG_PROFILE_ORBIT: &str = "prof_orbit";
pub const TAG_UNDULATOR_TWISS: &str = "und_twiss";

/// First part of every broadcast; subscribers filter on `tag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
}

impl FrameMetadata {
    pub fn tagged(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            dtype: None,
            shape: None,
        }
    }
}

/// Second part of a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Numeric array; shape and element type travel in the metadata.
    Array(Vec<f64>),
    Structured(serde_json::Value),
}

impl Payload {
    /// Raw little-endian bytes of an array payload.
    pub fn array_bytes(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn decode_array(bytes: &[u8]) -> Option<Vec<f64>> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    f64::from_le_bytes(raw)
                })
                .collect(),
        )
    }
}

/// Two-part diagnostic message.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub metadata: FrameMetadata,
    pub payload: Payload,
}

impl BroadcastMessage {
    pub fn tag(&self) -> &str {
        &self.metadata.tag
    }

    fn array(tag: &str, shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self {
            metadata: FrameMetadata {
                tag: tag.to_owned(),
                dtype: Some("float64".to_owned()),
                shape: Some(shape),
            },
            payload: Payload::Array(values),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    #[error("broadcast sink closed")]
    Closed,
    #[error("broadcast transport error: {0}")]
    Transport(String),
}

/// Destination of diagnostic broadcasts.
pub trait BroadcastSink: Send + Sync {
    fn send(&self, message: BroadcastMessage) -> Result<(), SinkError>;
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<BroadcastMessage>>,
    failing: HashSet<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every message carrying `tag`.
    pub fn failing_on(mut self, tag: &str) -> Self {
        self.failing.insert(tag.to_owned());
        self
    }

    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.messages.lock().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|m| m.metadata.tag.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl BroadcastSink for RecordingSink {
    fn send(&self, message: BroadcastMessage) -> Result<(), SinkError> {
        if self.failing.contains(message.tag()) {
            return Err(SinkError::Transport(format!("rejected {}", message.tag())));
        }
        self.messages.lock().push(message);
        Ok(())
    }
}

/// Live and design Twiss tables published under their process-variable names.
#[derive(Debug)]
pub struct TableChannel {
    live_name: String,
    design_name: String,
    live: watch::Sender<Arc<TwissTable>>,
    design: watch::Sender<Arc<TwissTable>>,
}

impl TableChannel {
    /// Both tables start from `initial`; the design table never changes afterwards.
    pub fn new(initial: Arc<TwissTable>, config: &PublishConfig) -> Self {
        let (live, _) = watch::channel(Arc::clone(&initial));
        let (design, _) = watch::channel(initial);
        Self {
            live_name: config.live_table.clone(),
            design_name: config.design_table.clone(),
            live,
            design,
        }
    }

    pub fn live_name(&self) -> &str {
        &self.live_name
    }

    pub fn design_name(&self) -> &str {
        &self.design_name
    }

    pub fn live(&self) -> Arc<TwissTable> {
        Arc::clone(&self.live.borrow())
    }

    pub fn design(&self) -> Arc<TwissTable> {
        Arc::clone(&self.design.borrow())
    }

    /// Table published under `name`, if it is one of ours.
    pub fn get(&self, name: &str) -> Option<Arc<TwissTable>> {
        if name == self.live_name {
            Some(self.live())
        } else if name == self.design_name {
            Some(self.design())
        } else {
            None
        }
    }

    pub fn post_live(&self, table: Arc<TwissTable>) {
        self.live.send_replace(table);
    }

    pub fn subscribe_live(&self) -> watch::Receiver<Arc<TwissTable>> {
        self.live.subscribe()
    }
}

/// Build the diagnostic messages in publication order.
///
/// A failed query only affects its own message.
pub fn diagnostic_messages(
    adapter: &mut ModelAdapter,
) -> Vec<(&'static str, Result<BroadcastMessage, DiagnosticsError>)> {
    let orbit = diagnostics::orbit(adapter)
        .map(|pair| BroadcastMessage::array(TAG_ORBIT, pair.shape().to_vec(), pair.flatten()));
    let profile_twiss = diagnostics::profile_twiss(adapter).map(|lines| BroadcastMessage {
        metadata: FrameMetadata {
            tag: TAG_PROFILE_TWISS.to_owned(),
            dtype: Some("str".to_owned()),
            shape: Some(vec![lines.len()]),
        },
        payload: Payload::Structured(json!(lines)),
    });
    let profile_orbit = diagnostics::profile_orbit(adapter).map(|pair| {
        BroadcastMessage::array(TAG_PROFILE_ORBIT, pair.shape().to_vec(), pair.flatten())
    });
    let undulator_twiss = diagnostics::undulator_twiss(adapter).map(|fields| BroadcastMessage {
        metadata: FrameMetadata::tagged(TAG_UNDULATOR_TWISS),
        payload: Payload::Structured(json!(fields)),
    });
    vec![
        (TAG_ORBIT, orbit),
        (TAG_PROFILE_TWISS, profile_twiss),
        (TAG_PROFILE_ORBIT, profile_orbit),
        (TAG_UNDULATOR_TWISS, undulator_twiss),
    ]
}

/// Rebuilds the live table whenever the model changed.
#[derive(Clone)]
pub struct TableRefresher {
    model: SharedModel,
    tracker: Arc<ChangeTracker>,
    devices: Arc<dyn DeviceNames>,
    tables: Arc<TableChannel>,
}

impl TableRefresher {
    pub fn new(
        model: SharedModel,
        tracker: Arc<ChangeTracker>,
        devices: Arc<dyn DeviceNames>,
        tables: Arc<TableChannel>,
    ) -> Self {
        Self {
            model,
            tracker,
            devices,
            tables,
        }
    }

    /// One polling cycle. Returns whether a new table was posted.
    ///
    /// A failed build leaves the refresh flag raised so the next cycle retries.
    pub fn tick(&self) -> Result<bool, TableError> {
        if !self.tracker.take_table_refresh() {
            return Ok(false);
        }
        let built = {
            let mut model = self.model.lock();
            build_table(&mut model, self.devices.as_ref())
        };
        let table = built.inspect_err(|_| self.tracker.restore_table_refresh())?;
        debug!(rows = table.len(), pv = %self.tables.live_name(), "live table refreshed");
        self.tables.post_live(Arc::new(table));
        Ok(true)
    }

    pub async fn run(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "table refresh loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("table refresh shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick() {
                        error!(error = %err, "twiss table rebuild failed");
                    }
                }
            }
        }
    }
}

/// Sends diagnostic broadcasts whenever the model changed.
#[derive(Clone)]
pub struct DiagnosticBroadcaster {
    model: SharedModel,
    tracker: Arc<ChangeTracker>,
    sink: Arc<dyn BroadcastSink>,
    metrics: Option<ModelMetrics>,
}

impl DiagnosticBroadcaster {
    pub fn new(model: SharedModel, tracker: Arc<ChangeTracker>, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            model,
            tracker,
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ModelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One polling cycle. Returns how many messages were sent.
    ///
    /// A failed message is logged; it neither undoes earlier sends nor stops
    /// later ones.
    pub fn tick(&self) -> usize {
        if !self.tracker.take_broadcast() {
            return 0;
        }
        let messages = {
            let mut model = self.model.lock();
            diagnostic_messages(&mut model)
        };
        let mut sent = 0;
        for (tag, message) in messages {
            let outcome = match message {
                Ok(message) => self.sink.send(message).map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            let ok = match outcome {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(err) => {
                    warn!(tag, error = %err, "diagnostic broadcast failed");
                    false
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_broadcast(tag, ok);
            }
        }
        debug!(sent, "diagnostics broadcast");
        sent
    }

    pub async fn run(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "broadcast loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("broadcast shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}
