//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Guarded access to the physics oracle."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::sync::Arc;

use ms_metrics::ModelMetrics;
use ms_oracle::{Oracle, OracleError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::flags::ChangeTracker;

/// Reply given instead of forwarding an `exit` command.
pub const REFUSAL: &str = "Please stop trying to exit the model service's Tao, you jerk!";

/// Adapter shared by every task that talks to the oracle.
pub type SharedModel = Arc<Mutex<ModelAdapter>>;

/// Outcome of a forwarded text command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Lines(Vec<String>),
    Refused(String),
}

impl CommandOutput {
    pub fn into_lines(self) -> Vec<String> {
        match self {
            CommandOutput::Lines(lines) => lines,
            CommandOutput::Refused(reply) => vec![reply],
        }
    }
}

/// Wraps the oracle, refusing process exits and flagging lattice mutations.
pub struct ModelAdapter {
    oracle: Box<dyn Oracle>,
    tracker: Arc<ChangeTracker>,
    metrics: Option<ModelMetrics>,
}

impl ModelAdapter {
    pub fn new(oracle: Box<dyn Oracle>, tracker: Arc<ChangeTracker>) -> Self {
        Self {
            oracle,
            tracker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ModelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn into_shared(self) -> SharedModel {
        Arc::new(Mutex::new(self))
    }

    pub fn tracker(&self) -> Arc<ChangeTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn metrics(&self) -> Option<&ModelMetrics> {
        self.metrics.as_ref()
    }

    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }

    /// Forward a text command.
    ///
    /// `exit...` is never forwarded. `set...` marks the model changed whether
    /// or not the oracle accepted it.
    pub fn command(&mut self, text: &str) -> Result<CommandOutput, OracleError> {
        if text.starts_with("exit") {
            warn!(command = text, "refusing to forward exit command");
            self.count("refused");
            return Ok(CommandOutput::Refused(REFUSAL.to_owned()));
        }
        debug!(command = text, oracle = self.oracle.name(), "oracle command");
        self.count("text");
        let result = self.oracle.cmd(text);
        if text.starts_with("set") {
            self.tracker.mark_changed();
        }
        result.map(CommandOutput::Lines)
    }

    /// Forward a numeric query.
    pub fn command_real(&mut self, text: &str) -> Result<Vec<f64>, OracleError> {
        debug!(command = text, oracle = self.oracle.name(), "oracle numeric query");
        self.count("real");
        self.oracle.cmd_real(text)
    }

    fn count(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_oracle_command(kind);
        }
    }
}

impl std::fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("oracle", &self.oracle.name())
            .finish()
    }
}
