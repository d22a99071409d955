//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Service wiring and lifecycle management."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Core of the lattice model service: change tracking, table building,
//! diagnostic publishers and command dispatch around a physics oracle.

pub mod adapter;
pub mod channels;
pub mod devices;
pub mod diagnostics;
pub mod flags;
pub mod publisher;
pub mod rpc;
pub mod service;
pub mod table;

pub use adapter::{CommandOutput, ModelAdapter, SharedModel, REFUSAL};
pub use devices::{DeviceNameMap, DeviceNames};
pub use flags::ChangeTracker;
pub use publisher::{
    BroadcastMessage, BroadcastSink, DiagnosticBroadcaster, FrameMetadata, Payload,
    RecordingSink, SinkError, TableChannel, TableRefresher,
};
pub use rpc::{RpcCall, RpcClient, RpcDispatcher, RpcReply, RpcRequest, RpcStatus};
pub use service::{ModelService, ServiceHandle};
pub use table::{build_table, LatticeElementRecord, TableError, TwissTable};
