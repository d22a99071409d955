//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Shared primitives and utilities for the model service."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

/// Default port of the request/reply command endpoint.
pub const DEFAULT_RPC_PORT: u16 = 12312;
/// Default port of the diagnostic broadcast hub.
///
/// Historic deployments advertised 66666, which is not a valid TCP port.
pub const DEFAULT_BROADCAST_PORT: u16 = 56666;
/// Default port of the process-variable HTTP gateway.
pub const DEFAULT_PV_PORT: u16 = 5075;
/// Default port of the prometheus exporter.
pub const DEFAULT_METRICS_PORT: u16 = 9898;

/// Process-variable name of the live Twiss table.
pub const LIVE_TWISS_PV: &str = "BMAD:SYS0:1:FULL_MACHINE:LIVE:TWISS";
/// Process-variable name of the design Twiss table.
pub const DESIGN_TWISS_PV: &str = "BMAD:SYS0:1:FULL_MACHINE:DESIGN:TWISS";

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

fn default_rpc_listen() -> SocketAddr {
    any_addr(DEFAULT_RPC_PORT)
}

fn default_broadcast_listen() -> SocketAddr {
    any_addr(DEFAULT_BROADCAST_PORT)
}

fn default_pv_listen() -> SocketAddr {
    any_addr(DEFAULT_PV_PORT)
}

fn default_metrics_listen() -> SocketAddr {
    any_addr(DEFAULT_METRICS_PORT)
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_table_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_broadcast_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_live_table() -> String {
    LIVE_TWISS_PV.to_owned()
}

fn default_design_table() -> String {
    DESIGN_TWISS_PV.to_owned()
}

fn default_channel_prefix() -> String {
    "BMAD:SYS0:1".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the model service daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub pv: PvConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`ServiceConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedServiceConfig {
    pub config: ServiceConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl ServiceConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MODEL_SERVICE_CONFIG";
    pub const ENV_ENGINE_LIBRARY: &'static str = "TAO_LIB";
    pub const ENV_RPC_PORT: &'static str = "MODEL_PORT";
    pub const ENV_BROADCAST_PORT: &'static str = "MODEL_BROADCAST_PORT";

    /// Load configuration from the first existing candidate, respecting the
    /// `MODEL_SERVICE_CONFIG` override, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedServiceConfig> {
        let mut loaded = Self::load_file(candidates)?;
        loaded
            .config
            .apply_overrides(|key| std::env::var(key).ok())?;
        loaded.config.validate()?;
        Ok(loaded)
    }

    fn load_file<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedServiceConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedServiceConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedServiceConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using built-in defaults");
        Ok(LoadedServiceConfig {
            config: ServiceConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<ServiceConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply the environment variables understood by the legacy deployment
    /// (`TAO_LIB`, `MODEL_PORT`, `MODEL_BROADCAST_PORT`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(Self::ENV_ENGINE_LIBRARY) {
            if !path.trim().is_empty() {
                self.oracle.library_path = Some(PathBuf::from(path));
            }
        }
        if let Some(raw) = lookup(Self::ENV_RPC_PORT) {
            let port = parse_port(Self::ENV_RPC_PORT, &raw)?;
            self.rpc.listen.set_port(port);
        }
        if let Some(raw) = lookup(Self::ENV_BROADCAST_PORT) {
            let port = parse_port(Self::ENV_BROADCAST_PORT, &raw)?;
            self.broadcast.listen.set_port(port);
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.publish.validate()?;
        self.oracle.simulator.validate()?;
        if self.broadcast.capacity == 0 {
            return Err(anyhow!("broadcast.capacity must be greater than zero"));
        }

        let mut bound = vec![("rpc", self.rpc.listen), ("broadcast", self.broadcast.listen)];
        if self.pv.enabled {
            bound.push(("pv", self.pv.listen));
        }
        if self.metrics.enabled {
            bound.push(("metrics", self.metrics.listen));
        }
        for (i, (name, addr)) in bound.iter().enumerate() {
            if addr.port() == 0 {
                continue;
            }
            if let Some((other, _)) = bound[i + 1..].iter().find(|(_, a)| a == addr) {
                return Err(anyhow!(
                    "{} and {} listeners share the address {}",
                    name,
                    other,
                    addr
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ServiceConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ServiceConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_port(variable: &str, raw: &str) -> Result<u16> {
    let value: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a port number, got '{}'", variable, raw))?;
    u16::try_from(value).map_err(|_| anyhow!("{} value {} is outside 0..=65535", variable, value))
}

/// Simulation engine selection and settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Shared library of the external engine (`TAO_LIB`). Recorded for the
    /// engine bridge; the in-process simulator ignores it.
    #[serde(default)]
    pub library_path: Option<PathBuf>,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Parameters of the in-process FODO lattice simulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorConfig {
    #[serde(default = "SimulatorConfig::default_cells")]
    pub cells: usize,
    #[serde(default = "SimulatorConfig::default_drift_length")]
    pub drift_length: f64,
    #[serde(default = "SimulatorConfig::default_quad_length")]
    pub quad_length: f64,
    #[serde(default = "SimulatorConfig::default_quad_k1")]
    pub quad_k1: f64,
    /// Reference momentum in eV.
    #[serde(default = "SimulatorConfig::default_p0c")]
    pub p0c: f64,
    #[serde(default = "SimulatorConfig::default_beta")]
    pub beta_a: f64,
    #[serde(default)]
    pub alpha_a: f64,
    #[serde(default = "SimulatorConfig::default_beta")]
    pub beta_b: f64,
    #[serde(default)]
    pub alpha_b: f64,
}

impl SimulatorConfig {
    fn default_cells() -> usize {
        6
    }

    fn default_drift_length() -> f64 {
        2.0
    }

    fn default_quad_length() -> f64 {
        0.1
    }

    fn default_quad_k1() -> f64 {
        1.5
    }

    fn default_p0c() -> f64 {
        135.0e6
    }

    fn default_beta() -> f64 {
        5.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.cells == 0 {
            return Err(anyhow!("oracle.simulator.cells must be at least 1"));
        }
        if self.drift_length <= 0.0 || self.quad_length <= 0.0 {
            return Err(anyhow!("oracle.simulator element lengths must be positive"));
        }
        if self.beta_a <= 0.0 || self.beta_b <= 0.0 {
            return Err(anyhow!("oracle.simulator initial beta must be positive"));
        }
        Ok(())
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            cells: Self::default_cells(),
            drift_length: Self::default_drift_length(),
            quad_length: Self::default_quad_length(),
            quad_k1: Self::default_quad_k1(),
            p0c: Self::default_p0c(),
            beta_a: Self::default_beta(),
            alpha_a: 0.0,
            beta_b: Self::default_beta(),
            alpha_b: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_listen")]
    pub listen: SocketAddr,
    /// Reply `fail` to unrecognised commands instead of staying silent.
    #[serde(default)]
    pub reply_to_unknown: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: default_rpc_listen(),
            reply_to_unknown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_listen")]
    pub listen: SocketAddr,
    /// Messages buffered per subscriber before it starts lagging.
    #[serde(default = "default_broadcast_capacity")]
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            listen: default_broadcast_listen(),
            capacity: default_broadcast_capacity(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_table_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub table_interval: Duration,
    #[serde(default = "default_broadcast_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub broadcast_interval: Duration,
    #[serde(default = "default_live_table")]
    pub live_table: String,
    #[serde(default = "default_design_table")]
    pub design_table: String,
}

impl PublishConfig {
    pub fn validate(&self) -> Result<()> {
        if self.table_interval.is_zero() || self.broadcast_interval.is_zero() {
            return Err(anyhow!("publish intervals must be greater than zero"));
        }
        if self.live_table == self.design_table {
            return Err(anyhow!(
                "live and design tables must use distinct names (both '{}')",
                self.live_table
            ));
        }
        Ok(())
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            table_interval: default_table_interval(),
            broadcast_interval: default_broadcast_interval(),
            live_table: default_live_table(),
            design_table: default_design_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pv_listen")]
    pub listen: SocketAddr,
    /// Prefix of the per-element channels, e.g. `BMAD:SYS0:1:QF1:BETA_X`.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_pv_listen(),
            channel_prefix: default_channel_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// CSV file with `element,device` rows. Without it every device name is empty.
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;

    use super::*;

    #[test]
    fn defaults_match_legacy_deployment() {
        let config = ServiceConfig::default();
        assert_eq!(config.rpc.listen.port(), 12312);
        assert_eq!(config.publish.table_interval, Duration::from_secs(1));
        assert_eq!(config.publish.broadcast_interval, Duration::from_millis(100));
        assert_eq!(config.publish.live_table, LIVE_TWISS_PV);
        assert_eq!(config.publish.design_table, DESIGN_TWISS_PV);
        assert!(!config.rpc.reply_to_unknown);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn fractional_intervals_parse() {
        let config = ServiceConfig::from_str(
            r#"
            [publish]
            table_interval = 2.5
            broadcast_interval = 0.25

            [rpc]
            reply_to_unknown = true
            "#,
        )
        .expect("config parses");
        assert_eq!(config.publish.table_interval, Duration::from_millis(2500));
        assert_eq!(config.publish.broadcast_interval, Duration::from_millis(250));
        assert!(config.rpc.reply_to_unknown);
    }

    #[test]
    fn environment_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TAO_LIB", "/opt/bmad/libtao.so"),
            ("MODEL_PORT", "15000"),
            ("MODEL_BROADCAST_PORT", "15001"),
        ]
        .into_iter()
        .collect();
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides apply");
        assert_eq!(
            config.oracle.library_path.as_deref(),
            Some(Path::new("/opt/bmad/libtao.so"))
        );
        assert_eq!(config.rpc.listen.port(), 15000);
        assert_eq!(config.broadcast.listen.port(), 15001);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides(|key| (key == "MODEL_BROADCAST_PORT").then(|| "66666".to_string()))
            .expect_err("port rejected");
        assert!(err.to_string().contains("MODEL_BROADCAST_PORT"));
    }

    #[test]
    fn clashing_listeners_fail_validation() {
        let err = ServiceConfig::from_str(
            r#"
            [rpc]
            listen = "127.0.0.1:7000"

            [broadcast]
            listen = "127.0.0.1:7000"
            "#,
        )
        .expect_err("clash detected");
        assert!(err.to_string().contains("share the address"));
    }

    #[test]
    fn zero_interval_fails_validation() {
        let err = ServiceConfig::from_str(
            r#"
            [publish]
            broadcast_interval = 0.0
            "#,
        )
        .expect_err("zero interval rejected");
        assert!(err.to_string().contains("intervals"));
    }

    #[test]
    fn shipped_example_config_parses() {
        let config = ServiceConfig::from_str(include_str!("../../../configs/model-service.toml"))
            .expect("example config parses");
        assert_eq!(config.broadcast.listen.port(), 56666);
        assert_eq!(config.pv.channel_prefix, "BMAD:SYS0:1");
        assert!(config.devices.csv_path.is_some());
    }

    #[test]
    fn load_reads_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.toml");
        std::fs::write(
            &path,
            "[oracle.simulator]\ncells = 3\nquad_k1 = 0.8\n",
        )
        .expect("write config");
        let missing = dir.path().join("missing.toml");

        let loaded = ServiceConfig::load_file(&[missing, path.clone()]).expect("config loads");
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.oracle.simulator.cells, 3);
        assert_eq!(loaded.config.oracle.simulator.quad_k1, 0.8);
    }
}
