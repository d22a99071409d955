//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Twiss table construction from oracle queries."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ms_oracle::optics::Mat6;
use ms_oracle::OracleError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::ModelAdapter;
use crate::devices::DeviceNames;

/// Column labels of the published table, in order.
#[rustfmt::skip]
pub const COLUMNS: [&str; 51] = [
    "element", "device_name", "s", "length", "p0c",
    "alpha_x", "beta_x", "eta_x", "etap_x", "psi_x",
    "alpha_y", "beta_y", "eta_y", "etap_y", "psi_y",
    "r11", "r12", "r13", "r14", "r15", "r16",
    "r21", "r22", "r23", "r24", "r25", "r26",
    "r31", "r32", "r33", "r34", "r35", "r36",
    "r41", "r42", "r43", "r44", "r45", "r46",
    "r51", "r52", "r53", "r54", "r55", "r56",
    "r61", "r62", "r63", "r64", "r65", "r66",
];

const ELEMENT_LIST: &str = "python lat_ele 1@0";

/// Attributes queried once per build, in record order after `element`/`device_name`.
#[rustfmt::skip]
const ATTRIBUTES: [&str; 13] = [
    "s", "l", "p0c",
    "a.alpha", "a.beta", "a.eta", "a.etap", "a.phi",
    "b.alpha", "b.beta", "b.eta", "b.etap", "b.phi",
];

fn attribute_query(attr: &str) -> String {
    format!("python lat_list 1@0>>*|model real:ele.{attr}")
}

fn mat6_query(id: &str) -> String {
    format!("python ele:mat6 1@0>>{id}|model mat6")
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("query '{query}' failed: {source}")]
    Query {
        query: String,
        #[source]
        source: OracleError,
    },
    #[error("malformed element list line '{0}'")]
    MalformedElement(String),
    #[error("'{query}' returned {got} values for {expected} elements")]
    Misaligned {
        query: String,
        expected: usize,
        got: usize,
    },
}

/// Twiss functions of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaneOptics {
    pub alpha: f64,
    pub beta: f64,
    pub eta: f64,
    pub etap: f64,
    pub psi: f64,
}

/// One table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatticeElementRecord {
    pub element: String,
    /// Empty when the element has no mapped device.
    pub device_name: String,
    pub s: f64,
    pub length: f64,
    pub p0c: f64,
    pub x: PlaneOptics,
    pub y: PlaneOptics,
    /// All NaN when the oracle did not return a usable 6x6 matrix.
    pub rmat: Mat6,
}

impl LatticeElementRecord {
    /// Numeric columns in [`COLUMNS`] order, starting at `s`.
    pub fn numeric_values(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(COLUMNS.len() - 2);
        values.extend([self.s, self.length, self.p0c]);
        for plane in [&self.x, &self.y] {
            values.extend([plane.alpha, plane.beta, plane.eta, plane.etap, plane.psi]);
        }
        values.extend(self.rmat.iter().flatten().copied());
        values
    }

    /// Scalar column by label, `None` for unknown labels and the text columns.
    pub fn value(&self, column: &str) -> Option<f64> {
        let position = COLUMNS.iter().position(|c| *c == column)?;
        position
            .checked_sub(2)
            .and_then(|i| self.numeric_values().get(i).copied())
    }

    pub fn has_transfer_matrix(&self) -> bool {
        self.rmat.iter().flatten().all(|v| !v.is_nan())
    }
}

/// Immutable snapshot of the lattice optics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TwissTable {
    pub rows: Vec<LatticeElementRecord>,
    pub built_at: DateTime<Utc>,
}

/// Column data of the table document.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ColumnData {
    Text(Vec<String>),
    Real(Vec<f64>),
}

/// Column-oriented table document, `{labels, value: {column: [..]}, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct TableDocument {
    pub labels: Vec<&'static str>,
    pub value: IndexMap<&'static str, ColumnData>,
    pub timestamp: DateTime<Utc>,
}

impl TwissTable {
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            built_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns() -> &'static [&'static str] {
        &COLUMNS
    }

    pub fn row(&self, element: &str) -> Option<&LatticeElementRecord> {
        self.rows
            .iter()
            .find(|row| row.element.eq_ignore_ascii_case(element))
    }

    pub fn to_document(&self) -> TableDocument {
        let mut value = IndexMap::with_capacity(COLUMNS.len());
        value.insert(
            COLUMNS[0],
            ColumnData::Text(self.rows.iter().map(|r| r.element.clone()).collect()),
        );
        value.insert(
            COLUMNS[1],
            ColumnData::Text(self.rows.iter().map(|r| r.device_name.clone()).collect()),
        );
        let numeric: Vec<Vec<f64>> = self.rows.iter().map(|r| r.numeric_values()).collect();
        for (offset, label) in COLUMNS.iter().skip(2).enumerate() {
            value.insert(
                *label,
                ColumnData::Real(numeric.iter().map(|values| values[offset]).collect()),
            );
        }
        TableDocument {
            labels: COLUMNS.to_vec(),
            value,
            timestamp: self.built_at,
        }
    }
}

/// Query the oracle and assemble a fresh table.
///
/// Rows cover element index 1 through the last `END` element inclusive. A
/// failed or malformed matrix for one element yields a NaN matrix for that
/// row; failures of the element list or the attribute arrays abort the build.
pub fn build_table(
    adapter: &mut ModelAdapter,
    devices: &dyn DeviceNames,
) -> Result<TwissTable, TableError> {
    let started = Instant::now();

    let listing = adapter
        .command(ELEMENT_LIST)
        .map_err(|source| TableError::Query {
            query: ELEMENT_LIST.to_owned(),
            source,
        })?
        .into_lines();
    let mut elements = Vec::with_capacity(listing.len());
    for line in &listing {
        let (id, name) = line
            .split_once(';')
            .ok_or_else(|| TableError::MalformedElement(line.clone()))?;
        elements.push((id.trim().to_owned(), name.trim().to_owned()));
    }

    let Some(end) = elements.iter().rposition(|(_, name)| name == "END") else {
        warn!(elements = elements.len(), "element list has no END marker; publishing an empty table");
        return Ok(TwissTable::empty());
    };
    let retained = &elements[1..=end];

    let mut columns = Vec::with_capacity(ATTRIBUTES.len());
    for attr in ATTRIBUTES {
        let query = attribute_query(attr);
        let values = adapter
            .command_real(&query)
            .map_err(|source| TableError::Query {
                query: query.clone(),
                source,
            })?;
        if values.len() < retained.len() {
            return Err(TableError::Misaligned {
                query,
                expected: retained.len(),
                got: values.len(),
            });
        }
        columns.push(values);
    }

    let mut rows = Vec::with_capacity(retained.len());
    for (i, (id, name)) in retained.iter().enumerate() {
        let at = |column: usize| columns[column][i];
        let plane = |first: usize| PlaneOptics {
            alpha: at(first),
            beta: at(first + 1),
            eta: at(first + 2),
            etap: at(first + 3),
            psi: at(first + 4),
        };
        rows.push(LatticeElementRecord {
            element: name.clone(),
            device_name: devices.device_for(name).unwrap_or_default(),
            s: at(0),
            length: at(1),
            p0c: at(2),
            x: plane(3),
            y: plane(8),
            rmat: transfer_matrix(adapter, id),
        });
    }

    let elapsed = started.elapsed().as_secs_f64();
    if let Some(metrics) = adapter.metrics() {
        metrics.observe_table_build(elapsed);
    }
    debug!(rows = rows.len(), seconds = elapsed, "twiss table built");
    Ok(TwissTable {
        rows,
        built_at: Utc::now(),
    })
}

fn transfer_matrix(adapter: &mut ModelAdapter, id: &str) -> Mat6 {
    let query = mat6_query(id);
    let parsed = match adapter.command(&query) {
        Ok(output) => parse_mat6(&output.into_lines()),
        Err(err) => {
            debug!(element = id, error = %err, "transfer matrix unavailable");
            None
        }
    };
    parsed.unwrap_or([[f64::NAN; 6]; 6])
}

/// Rows of `;`-separated fields; fields from index 3 on are the matrix columns.
pub fn parse_mat6(lines: &[String]) -> Option<Mat6> {
    if lines.len() != 6 {
        return None;
    }
    let mut matrix = [[0.0; 6]; 6];
    for (row, line) in lines.iter().enumerate() {
        let fields: Vec<&str> = line.split(';').skip(3).collect();
        if fields.len() != 6 {
            return None;
        }
        for (col, field) in fields.iter().enumerate() {
            matrix[row][col] = field.trim().parse().ok()?;
        }
    }
    Some(matrix)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ms_oracle::ScriptedOracle;

    use super::*;
    use crate::devices::DeviceNameMap;
    use crate::flags::ChangeTracker;

    fn mat6_lines(scale: f64) -> Vec<String> {
        (1..=6)
            .map(|row| {
                let values: Vec<String> = (1..=6).map(|c| format!("{}", scale * c as f64)).collect();
                format!("{row};REAL_ARR;F;{}", values.join(";"))
            })
            .collect()
    }

    fn scripted(elements: &[&str], len: usize) -> ScriptedOracle {
        let mut oracle = ScriptedOracle::new().respond(
            ELEMENT_LIST,
            elements
                .iter()
                .enumerate()
                .map(|(i, name)| format!("{i};{name}")),
        );
        for (n, attr) in ATTRIBUTES.iter().enumerate() {
            oracle = oracle.respond_real(
                attribute_query(attr),
                (0..len).map(|i| (n * 100 + i) as f64).collect(),
            );
        }
        oracle
    }

    fn adapter(oracle: ScriptedOracle) -> ModelAdapter {
        ModelAdapter::new(Box::new(oracle), Arc::new(ChangeTracker::new()))
    }

    #[test]
    fn rows_run_from_one_through_last_end() {
        let names = ["BEGINNING", "Q1", "END", "D2", "END", "LORD"];
        let oracle = scripted(&names, 4)
            .respond(mat6_query("1"), mat6_lines(1.0))
            .respond(mat6_query("2"), mat6_lines(2.0))
            .respond(mat6_query("3"), mat6_lines(3.0))
            .respond(mat6_query("4"), mat6_lines(4.0));
        let mut devices = DeviceNameMap::empty();
        devices.insert("Q1", "QUAD:IN20:1");

        let table = build_table(&mut adapter(oracle), &devices).expect("table");
        let elements: Vec<&str> = table.rows.iter().map(|r| r.element.as_str()).collect();
        assert_eq!(elements, ["Q1", "END", "D2", "END"]);
        assert_eq!(table.rows[0].device_name, "QUAD:IN20:1");
        assert_eq!(table.rows[1].device_name, "");
        assert_eq!(table.rows[2].s, 2.0);
        assert_eq!(table.rows[2].x.beta, 402.0);
        assert_eq!(table.rows[3].y.psi, 1203.0);
        assert_eq!(table.rows[3].rmat[5][5], 24.0);
    }

    #[test]
    fn bad_matrices_become_nan_without_failing_the_build() {
        let names = ["BEGINNING", "A", "B", "C", "END"];
        let mut short = mat6_lines(1.0);
        short.pop();
        let mut garbled = mat6_lines(1.0);
        garbled[2] = "3;REAL_ARR;F;1;2;x;4;5;6".into();
        let oracle = scripted(&names, 4)
            .respond(mat6_query("1"), short)
            .respond(mat6_query("2"), garbled)
            .fail(mat6_query("3"), "no matrix")
            .respond(mat6_query("4"), mat6_lines(1.0));

        let table = build_table(&mut adapter(oracle), &DeviceNameMap::empty()).expect("table");
        assert_eq!(table.len(), 4);
        assert!(!table.rows[0].has_transfer_matrix());
        assert!(table.rows[1].rmat.iter().flatten().all(|v| v.is_nan()));
        assert!(!table.rows[2].has_transfer_matrix());
        assert!(table.rows[3].has_transfer_matrix());
    }

    #[test]
    fn missing_end_gives_empty_table() {
        let oracle = ScriptedOracle::new().respond(ELEMENT_LIST, ["0;BEGINNING", "1;Q1"]);
        let table = build_table(&mut adapter(oracle), &DeviceNameMap::empty()).expect("table");
        assert!(table.is_empty());
    }

    #[test]
    fn short_attribute_array_is_misaligned() {
        let names = ["BEGINNING", "A", "B", "END"];
        let oracle = scripted(&names, 2);
        let err = build_table(&mut adapter(oracle), &DeviceNameMap::empty()).expect_err("misaligned");
        assert!(matches!(err, TableError::Misaligned { expected: 3, got: 2, .. }));
    }

    #[test]
    fn element_list_failure_propagates() {
        let oracle = ScriptedOracle::new().fail(ELEMENT_LIST, "engine down");
        let err = build_table(&mut adapter(oracle), &DeviceNameMap::empty()).expect_err("fails");
        assert!(matches!(err, TableError::Query { .. }));
    }

    #[test]
    fn parse_mat6_keeps_fields_after_the_third() {
        let matrix = parse_mat6(&mat6_lines(0.5)).expect("matrix");
        assert_eq!(matrix[0], [0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
        assert!(parse_mat6(&[]).is_none());
    }

    #[test]
    fn document_is_column_oriented() {
        let record = LatticeElementRecord {
            element: "Q1".into(),
            device_name: String::new(),
            s: 1.0,
            length: 0.1,
            p0c: 135e6,
            x: PlaneOptics { alpha: 0.1, beta: 2.0, eta: 0.0, etap: 0.0, psi: 0.3 },
            y: PlaneOptics { alpha: -0.1, beta: 3.0, eta: 0.0, etap: 0.0, psi: 0.2 },
            rmat: [[1.0; 6]; 6],
        };
        assert_eq!(record.value("beta_y"), Some(3.0));
        assert_eq!(record.value("r66"), Some(1.0));
        assert_eq!(record.value("element"), None);
        let table = TwissTable { rows: vec![record], built_at: Utc::now() };
        let doc = serde_json::to_value(table.to_document()).expect("json");
        assert_eq!(doc["labels"].as_array().map(Vec::len), Some(COLUMNS.len()));
        assert_eq!(doc["value"]["element"][0], "Q1");
        assert_eq!(doc["value"]["beta_x"][0], 2.0);
    }
}
