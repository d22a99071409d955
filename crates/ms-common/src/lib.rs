//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Shared primitives and utilities for the model service."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Shared primitives for the lattice model service workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the daemon and the service crates.

pub mod config;
pub mod logging;

pub use config::{
    BroadcastConfig, DevicesConfig, LoadedServiceConfig, LoggingConfig, MetricsConfig,
    OracleConfig, PublishConfig, PvConfig, RpcConfig, ServiceConfig, SimulatorConfig,
};
pub use logging::{init_tracing, LogFormat};
