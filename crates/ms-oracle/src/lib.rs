//! ---
//! ms_section: "11-simulation"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Physics oracle interface and bundled engines."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Text-command interface to the beam-dynamics engine.
//!
//! The engine is treated as an opaque oracle: commands go in as text, results
//! come back as text lines or as a numeric sequence. Two engines ship with the
//! crate, an in-process FODO [`LatticeSimulator`] and a [`ScriptedOracle`] that
//! replays canned responses.

pub mod optics;
pub mod scripted;
pub mod sim;

/// Shared result type for oracle calls.
pub type Result<T> = std::result::Result<T, OracleError>;

/// Failures reported by an engine while executing a command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    /// The command verb or sub-command is not understood.
    #[error("unrecognised command: {0}")]
    UnknownCommand(String),
    /// The command was understood but one of its arguments is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No lattice element matched the selector.
    #[error("no element matches '{0}'")]
    UnknownElement(String),
    /// Engine-internal failure carrying the engine's diagnostic text.
    #[error("engine error: {0}")]
    Engine(String),
    /// A numeric query produced a line that is not a number.
    #[error("non-numeric output from '{command}': {line}")]
    NotNumeric {
        /// Command that was issued.
        command: String,
        /// Offending output line.
        line: String,
    },
}

/// Synchronous command interface to a simulation engine.
///
/// Calls run to completion; there is no timeout and no retry.
pub trait Oracle: Send {
    /// Issue a command and return its output lines.
    fn cmd(&mut self, command: &str) -> Result<Vec<String>>;

    /// Issue a command whose output is a numeric sequence.
    fn cmd_real(&mut self, command: &str) -> Result<Vec<f64>>;

    /// Engine name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Parse text output into numbers, accepting `;`, `,` or whitespace separators.
pub fn parse_reals(command: &str, lines: &[String]) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    for line in lines {
        for field in line
            .split(|c: char| c == ';' || c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
        {
            let value = field.parse::<f64>().map_err(|_| OracleError::NotNumeric {
                command: command.to_owned(),
                line: line.clone(),
            })?;
            values.push(value);
        }
    }
    Ok(values)
}

pub use scripted::{CommandLog, ScriptedOracle};
pub use sim::{ElementKind, LatticeSimulator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reals_accepts_mixed_separators() {
        let lines = vec!["1.5;2".to_string(), " 3e-3  4 ".to_string(), "".to_string()];
        let values = parse_reals("q", &lines).expect("numeric");
        assert_eq!(values, vec![1.5, 2.0, 3e-3, 4.0]);
    }

    #[test]
    fn parse_reals_reports_offending_line() {
        let lines = vec!["1.0".to_string(), "ERROR detected".to_string()];
        let err = parse_reals("python lat_list", &lines).expect_err("not numeric");
        assert_eq!(
            err,
            OracleError::NotNumeric {
                command: "python lat_list".into(),
                line: "ERROR detected".into(),
            }
        );
    }
}
