//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Element to control-system device name lookup."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::info;

/// Naming-convention lookup from lattice element to device name.
pub trait DeviceNames: Send + Sync {
    fn device_for(&self, element: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct DeviceRow {
    element: String,
    device: String,
}

/// Table-backed [`DeviceNames`], keyed by upper-cased element name.
#[derive(Debug, Default, Clone)]
pub struct DeviceNameMap {
    names: HashMap<String, String>,
}

impl DeviceNameMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load an `element,device` CSV with a header row.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open device name csv {}", path.display()))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut names = HashMap::new();
        for row in reader.deserialize::<DeviceRow>() {
            let row = row.with_context(|| format!("invalid device row in {}", path.display()))?;
            names.insert(row.element.to_ascii_uppercase(), row.device);
        }
        info!(path = %path.display(), devices = names.len(), "device names loaded");
        Ok(Self { names })
    }

    /// Load from `path` when configured, otherwise start empty.
    pub fn from_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_csv(path),
            None => Ok(Self::empty()),
        }
    }

    pub fn insert(&mut self, element: impl AsRef<str>, device: impl Into<String>) {
        self.names
            .insert(element.as_ref().to_ascii_uppercase(), device.into());
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl DeviceNames for DeviceNameMap {
    fn device_for(&self, element: &str) -> Option<String> {
        self.names.get(&element.to_ascii_uppercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn loads_csv_and_ignores_case() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "element,device")?;
        writeln!(file, "QF01, QUAD:LI21:201")?;
        writeln!(file, "bpm01,BPMS:LI21:233")?;
        file.flush()?;

        let map = DeviceNameMap::from_csv(file.path())?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.device_for("qf01").as_deref(), Some("QUAD:LI21:201"));
        assert_eq!(map.device_for("BPM01").as_deref(), Some("BPMS:LI21:233"));
        assert_eq!(map.device_for("D01A"), None);
        Ok(())
    }

    #[test]
    fn missing_path_means_empty_map() -> Result<()> {
        assert!(DeviceNameMap::from_optional(None)?.is_empty());
        assert!(DeviceNameMap::from_optional(Some(Path::new("/nonexistent/devices.csv"))).is_err());
        Ok(())
    }
}
