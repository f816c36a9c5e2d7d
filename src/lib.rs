//! tproute
//!
//! Control plane of a transparent proxy. Intercepted connections and packets
//! arrive on a local listener prefixed with their original destination; a
//! compiled routing policy decides which outbound group carries them and the
//! group picks one of its dialers.

pub mod config;
pub mod control;
pub mod dns;
pub mod epoch;
pub mod interception;
pub mod outbound;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod shutdown;

pub use config::Config;
pub use control::ControlPlane;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the control plane
pub type Result<T> = anyhow::Result<T>;
