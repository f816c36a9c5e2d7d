//! DNS Module
//!
//! Epoch-stamped cache of DNS-derived facts and the observer that fills it
//! from relayed DNS replies.

pub mod cache;
pub mod observe;

pub use cache::{normalize_domain, DnsCache, DnsCacheEntry, DnsCacheStats};
pub use observe::{observe_response, DNS_PORT};
