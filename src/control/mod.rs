//! Control Plane Module
//!
//! Lifecycle owner of the proxy: construction, link binding, the dispatch
//! pipeline and LIFO teardown.

pub mod dispatch;
pub mod plane;
pub mod teardown;

pub use dispatch::{is_closed_listener_error, DispatchTimeouts, Dispatcher, Route};
pub use plane::{ControlPlane, Listeners, MAX_LOAD_RETRIES};
pub use teardown::{TeardownError, TeardownStack};
