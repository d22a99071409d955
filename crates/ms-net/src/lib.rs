//! ---
//! ms_section: "05-networking-external-interfaces"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Network surfaces of the model service."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Network surfaces of the model service: the line-delimited JSON command
//! endpoint, the WebSocket diagnostic broadcast hub and the HTTP gateway for
//! tables and per-element channels.

pub mod broadcast;
pub mod pv;
pub mod rpc_tcp;

pub use broadcast::{BroadcastHub, BroadcastServerBuilder, BroadcastServerHandle};
pub use pv::{PvGatewayBuilder, PvGatewayHandle};
pub use rpc_tcp::{RpcServerBuilder, RpcServerHandle};
