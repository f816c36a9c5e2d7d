//! Data Relay Module
//!
//! Moves bytes between intercepted clients and egress dialers.

pub mod engine;
pub mod session;
pub mod udp;

pub use engine::RelayEngine;
pub use session::{ConnectionStats, RelaySession};
pub use udp::{UdpFlow, UdpFlowKey, UdpSessionTable};
