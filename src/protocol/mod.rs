//! Wire Protocols
//!
//! Original-destination header written by the interception layer, and the
//! client handshakes egress dialers speak to upstream proxies.

pub mod constants;
pub mod header;
pub mod socks5;

pub use constants::*;
pub use header::{HeaderError, OriginalDestinationHeader};
pub use socks5::{ProxyAuth, Socks5Client};
