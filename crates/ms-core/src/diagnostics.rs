//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Oracle queries behind the diagnostic broadcasts."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use ms_oracle::OracleError;
use thiserror::Error;

use crate::adapter::ModelAdapter;

pub const PROFILE_TWISS_QUERY: &str =
    "show lat -at beta_a -at beta_b Instrument::OTR*,Instrument::YAG*";
pub const UNDULATOR_TWISS_QUERY: &str =
    "show lat -no_label_lines -at alpha_a -at beta_a -at alpha_b -at beta_b UNDSTART";

const DATA_HEADER_LINES: usize = 3;
const DATA_FOOTER_LINES: usize = 2;
/// Whitespace-separated field carrying the model value in a data listing.
const MODEL_FIELD: usize = 5;

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("unexpected line in output of '{command}': {line}")]
    Malformed { command: String, line: String },
}

/// Two stacked planes, x then y, each in millimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitPair {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl OrbitPair {
    pub fn shape(&self) -> [usize; 2] {
        [2, self.x.len()]
    }

    /// Row-major 2xN values.
    pub fn flatten(&self) -> Vec<f64> {
        self.x.iter().chain(self.y.iter()).copied().collect()
    }
}

/// Model orbit at the beam position monitors.
pub fn orbit(adapter: &mut ModelAdapter) -> Result<OrbitPair, DiagnosticsError> {
    Ok(OrbitPair {
        x: orbit_plane(adapter, "show data orbit.x")?,
        y: orbit_plane(adapter, "show data orbit.y")?,
    })
}

/// Model orbit at the profile monitors.
pub fn profile_orbit(adapter: &mut ModelAdapter) -> Result<OrbitPair, DiagnosticsError> {
    Ok(OrbitPair {
        x: orbit_plane(adapter, "show data orbit.profx")?,
        y: orbit_plane(adapter, "show data orbit.profy")?,
    })
}

/// Beta functions at the profile monitors as raw listing lines.
pub fn profile_twiss(adapter: &mut ModelAdapter) -> Result<Vec<String>, DiagnosticsError> {
    Ok(adapter.command(PROFILE_TWISS_QUERY)?.into_lines())
}

/// Twiss values at the undulator entrance, one token per field.
pub fn undulator_twiss(adapter: &mut ModelAdapter) -> Result<Vec<String>, DiagnosticsError> {
    let lines = adapter.command(UNDULATOR_TWISS_QUERY)?.into_lines();
    let first = lines.first().ok_or_else(|| DiagnosticsError::Malformed {
        command: UNDULATOR_TWISS_QUERY.to_owned(),
        line: String::new(),
    })?;
    Ok(first.split_whitespace().map(str::to_owned).collect())
}

fn orbit_plane(adapter: &mut ModelAdapter, command: &str) -> Result<Vec<f64>, DiagnosticsError> {
    let lines = adapter.command(command)?.into_lines();
    let body = lines
        .len()
        .checked_sub(DATA_FOOTER_LINES)
        .filter(|end| *end >= DATA_HEADER_LINES)
        .map(|end| &lines[DATA_HEADER_LINES..end])
        .unwrap_or(&[]);
    body.iter()
        .map(|line| {
            line.split_whitespace()
                .nth(MODEL_FIELD)
                .and_then(|field| field.parse::<f64>().ok())
                .map(|metres| metres * 1000.0)
                .ok_or_else(|| DiagnosticsError::Malformed {
                    command: command.to_owned(),
                    line: line.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ms_oracle::ScriptedOracle;

    use super::*;
    use crate::flags::ChangeTracker;

    fn data_listing(values: &[f64]) -> Vec<String> {
        let mut lines = vec!["h1".to_string(), "h2".into(), "h3".into()];
        for (i, v) in values.iter().enumerate() {
            lines.push(format!("{} BPM{} T 0 0 {:e} 0", i + 1, i + 1, v));
        }
        lines.push("f1".into());
        lines.push("f2".into());
        lines
    }

    fn adapter(oracle: ScriptedOracle) -> ModelAdapter {
        ModelAdapter::new(Box::new(oracle), Arc::new(ChangeTracker::new()))
    }

    #[test]
    fn orbit_strips_framing_and_converts_to_millimetres() {
        let oracle = ScriptedOracle::new()
            .respond("show data orbit.x", data_listing(&[1e-3, -2e-3]))
            .respond("show data orbit.y", data_listing(&[0.0, 5e-4]));
        let pair = orbit(&mut adapter(oracle)).expect("orbit");
        assert_eq!(pair.shape(), [2, 2]);
        assert!((pair.x[0] - 1.0).abs() < 1e-12);
        assert!((pair.x[1] + 2.0).abs() < 1e-12);
        assert!((pair.y[1] - 0.5).abs() < 1e-12);
        assert_eq!(pair.flatten().len(), 4);
    }

    #[test]
    fn short_listing_yields_no_monitors() {
        let oracle = ScriptedOracle::new()
            .respond("show data orbit.profx", ["only", "header"])
            .respond("show data orbit.profy", data_listing(&[]));
        let pair = profile_orbit(&mut adapter(oracle)).expect("orbit");
        assert!(pair.x.is_empty());
        assert!(pair.y.is_empty());
    }

    #[test]
    fn malformed_row_is_reported() {
        let mut listing = data_listing(&[1.0]);
        listing[3] = "1 BPM1 T".into();
        let oracle = ScriptedOracle::new().respond("show data orbit.x", listing);
        assert!(matches!(
            orbit(&mut adapter(oracle)),
            Err(DiagnosticsError::Malformed { .. })
        ));
    }

    #[test]
    fn undulator_twiss_splits_first_line() {
        let oracle = ScriptedOracle::new().respond(
            UNDULATOR_TWISS_QUERY,
            ["  12 UNDSTART 1.0e-1 5.0 -2.0e-1 6.0", "ignored"],
        );
        let fields = undulator_twiss(&mut adapter(oracle)).expect("twiss");
        assert_eq!(fields, ["12", "UNDSTART", "1.0e-1", "5.0", "-2.0e-1", "6.0"]);
    }
}
