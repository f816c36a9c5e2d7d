//! Interception Layer
//!
//! The kernel side of the proxy (redirect rules, checksum handling, per-link
//! address tables) lives outside this crate. The control plane talks to it
//! only through [`InterceptionLayer`]: point updates and lookups of parameter
//! slots, per-link address records and reversible hook installation.

pub mod memory;

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

pub use memory::MemoryInterception;

use crate::routing::trie::normalize_addr;

/// Failures reported by an interception layer
#[derive(Debug, Error)]
pub enum InterceptionError {
    /// A pinned object left behind by an older build has an incompatible layout
    #[error("pinned object '{object}' is incompatible")]
    Incompatible { object: String },

    #[error("{hook} hook already exists on link {ifindex}")]
    AlreadyExists { ifindex: u32, hook: HookPoint },

    #[error("link '{0}' not found")]
    LinkNotFound(String),

    #[error("interception objects are not loaded")]
    NotLoaded,

    #[error("{0}")]
    Other(String),
}

/// Parameter slots shared with the interception layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    /// Listening port, stored in network byte order
    TproxyPort,
    DisableL4TxChecksum,
    DisableL4RxChecksum,
    /// Generation of the installed kernel state
    Epoch,
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TproxyPort => "tproxy_port",
            Self::DisableL4TxChecksum => "disable_l4_tx_checksum",
            Self::DisableL4RxChecksum => "disable_l4_rx_checksum",
            Self::Epoch => "epoch",
        };
        f.write_str(name)
    }
}

/// What the interception layer does with L4 checksums of rewritten packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChecksumPolicy {
    Enable = 0,
    Keep = 1,
    SetZero = 2,
}

impl From<ChecksumPolicy> for u32 {
    fn from(policy: ChecksumPolicy) -> Self {
        policy as u32
    }
}

/// Attachment points on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Queueing discipline the filters hang off
    Clsact,
    Ingress,
    Egress,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clsact => f.write_str("clsact"),
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

/// A network interface as seen by the interception layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<IpAddr>,
}

/// Per-link address record: at most one IPv4 and one IPv6 address, each
/// normalized to 128 bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfIpRecord {
    pub ip4: [u32; 4],
    pub ip6: [u32; 4],
    pub has_ip4: bool,
    pub has_ip6: bool,
}

impl IfIpRecord {
    /// Take the first non-link-local address of each family
    pub fn from_addrs(addrs: &[IpAddr]) -> Self {
        let mut record = Self::default();
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) if !record.has_ip4 && !v4.is_link_local() => {
                    record.ip4 = to_words(*addr);
                    record.has_ip4 = true;
                }
                IpAddr::V6(v6) if !record.has_ip6 && !is_unicast_link_local(v6) => {
                    record.ip6 = to_words(*addr);
                    record.has_ip6 = true;
                }
                _ => {}
            }
        }
        record
    }
}

fn is_unicast_link_local(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Split a normalized address into four words, keeping wire byte order
pub fn to_words(addr: IpAddr) -> [u32; 4] {
    let bytes = normalize_addr(addr).to_be_bytes();
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Narrow interface onto the kernel interception mechanism
pub trait InterceptionLayer: Send + Sync {
    /// Load and pin the interception objects
    fn load_objects(&self) -> Result<(), InterceptionError>;

    /// Remove a stale pinned object so loading can be retried
    fn remove_pinned(&self, object: &str) -> Result<(), InterceptionError>;

    /// Release the loaded objects; pinned parameters survive
    fn unload(&self) -> Result<(), InterceptionError>;

    fn update_param(&self, key: ParamKey, value: u32) -> Result<(), InterceptionError>;

    fn lookup_param(&self, key: ParamKey) -> Result<Option<u32>, InterceptionError>;

    /// Resolve a link by name
    fn link(&self, ifname: &str) -> Result<LinkInfo, InterceptionError>;

    fn update_link_ip(&self, ifindex: u32, record: IfIpRecord) -> Result<(), InterceptionError>;

    fn install_hook(&self, ifindex: u32, hook: HookPoint) -> Result<(), InterceptionError>;

    fn uninstall_hook(&self, ifindex: u32, hook: HookPoint) -> Result<(), InterceptionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_skips_link_local() {
        let addrs: Vec<IpAddr> = [
            "169.254.1.1",
            "fe80::1",
            "192.168.1.10",
            "2001:db8::10",
            "10.0.0.1",
        ]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let record = IfIpRecord::from_addrs(&addrs);

        assert!(record.has_ip4 && record.has_ip6);
        assert_eq!(record.ip4, to_words("192.168.1.10".parse().unwrap()));
        assert_eq!(record.ip6, to_words("2001:db8::10".parse().unwrap()));
    }

    #[test]
    fn test_record_without_addresses() {
        let record = IfIpRecord::from_addrs(&["fe80::2".parse().unwrap()]);
        assert!(!record.has_ip4);
        assert!(!record.has_ip6);
    }

    #[test]
    fn test_v4_words_are_mapped() {
        let words = to_words("1.2.3.4".parse().unwrap());
        assert_eq!(words[0], 0);
        assert_eq!(words[1], 0);
        assert_eq!(words[2].to_ne_bytes(), [0, 0, 0xff, 0xff]);
        assert_eq!(words[3].to_ne_bytes(), [1, 2, 3, 4]);
    }
}
