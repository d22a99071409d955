//! ---
//! ms_section: "11-simulation"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Physics oracle interface and bundled engines."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{parse_reals, Oracle, OracleError, Result};

/// Shared record of every command an oracle received, in order.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
enum Scripted {
    Lines(Vec<String>),
    Reals(Vec<f64>),
    Fail(OracleError),
}

/// Oracle replaying canned responses keyed by exact command text.
///
/// Unscripted commands fail with [`OracleError::UnknownCommand`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedOracle {
    responses: HashMap<String, Scripted>,
    log: CommandLog,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with the given text lines.
    pub fn respond<I, S>(mut self, command: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses.insert(
            command.into(),
            Scripted::Lines(lines.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Answer `command` with a numeric sequence.
    pub fn respond_real(mut self, command: impl Into<String>, values: Vec<f64>) -> Self {
        self.responses.insert(command.into(), Scripted::Reals(values));
        self
    }

    /// Fail `command` with an engine error carrying `message`.
    pub fn fail(self, command: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail_with(command, OracleError::Engine(message.into()))
    }

    pub fn fail_with(mut self, command: impl Into<String>, error: OracleError) -> Self {
        self.responses.insert(command.into(), Scripted::Fail(error));
        self
    }

    /// Handle onto the command history that survives boxing the oracle.
    pub fn log(&self) -> CommandLog {
        Arc::clone(&self.log)
    }

    pub fn history(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn lookup(&self, command: &str) -> Result<&Scripted> {
        self.log.lock().push(command.to_owned());
        trace!(command, "scripted oracle command");
        self.responses
            .get(command)
            .ok_or_else(|| OracleError::UnknownCommand(command.to_owned()))
    }
}

impl Oracle for ScriptedOracle {
    fn cmd(&mut self, command: &str) -> Result<Vec<String>> {
        match self.lookup(command)? {
            Scripted::Lines(lines) => Ok(lines.clone()),
            Scripted::Reals(values) => Ok(values.iter().map(|v| v.to_string()).collect()),
            Scripted::Fail(err) => Err(err.clone()),
        }
    }

    fn cmd_real(&mut self, command: &str) -> Result<Vec<f64>> {
        match self.lookup(command)? {
            Scripted::Lines(lines) => parse_reals(command, lines),
            Scripted::Reals(values) => Ok(values.clone()),
            Scripted::Fail(err) => Err(err.clone()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
