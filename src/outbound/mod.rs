//! Outbound Module
//!
//! Dialers, the links that describe them and the groups that choose between
//! them.

pub mod dialer;
pub mod group;
pub mod link;

pub use dialer::{Connector, DialError, Dialer, LATENCY_HISTORY};
pub use group::{OutboundGroup, ProbeConfig, SelectionPolicy};
pub use link::{parse_link, BlockConnector, DirectConnector, HttpConnector, Socks5Connector};
