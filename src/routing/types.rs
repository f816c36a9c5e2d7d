//! Routing Types

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Name of the reserved outbound that drops traffic
pub const BLOCK_OUTBOUND: &str = "block";

/// Name of the built-in direct outbound
pub const DIRECT_OUTBOUND: &str = "direct";

// Canonical parameter keys, produced by key refinement
pub const KEY_SUFFIX: &str = "suffix";
pub const KEY_FULL: &str = "full";
pub const KEY_KEYWORD: &str = "keyword";
pub const KEY_GEOSITE: &str = "geosite";
pub const KEY_CIDR: &str = "cidr";
pub const KEY_GEOIP: &str = "geoip";
pub const KEY_PORT: &str = "port";
pub const KEY_PROTO: &str = "proto";
pub const KEY_VERSION: &str = "version";

/// Predicate kind of a clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Function {
    Domain,
    Ip,
    SourceIp,
    Port,
    SourcePort,
    L4Proto,
    IpVersion,
}

impl Function {
    /// Resolve a function name as written in policy text
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "domain" => Some(Self::Domain),
            "ip" | "dip" => Some(Self::Ip),
            "sip" => Some(Self::SourceIp),
            "port" | "dport" => Some(Self::Port),
            "sport" => Some(Self::SourcePort),
            "l4proto" => Some(Self::L4Proto),
            "ipversion" => Some(Self::IpVersion),
            _ => None,
        }
    }

    /// Canonical name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Ip => "ip",
            Self::SourceIp => "sip",
            Self::Port => "port",
            Self::SourcePort => "sport",
            Self::L4Proto => "l4proto",
            Self::IpVersion => "ipversion",
        }
    }

    /// Relative evaluation cost; cheaper predicates are tested first
    pub const fn cost(&self) -> u8 {
        match self {
            Self::L4Proto | Self::IpVersion => 0,
            Self::Port | Self::SourcePort => 1,
            Self::Ip | Self::SourceIp => 2,
            Self::Domain => 3,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `key: value` (or bare `value`) parameter of a clause
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A parameter with no key
    pub fn bare(value: impl Into<String>) -> Self {
        Self::new("", value)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            f.write_str(&self.value)
        } else {
            write!(f, "{}: {}", self.key, self.value)
        }
    }
}

/// A single predicate; matches when any of its params matches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clause {
    pub function: Function,
    pub negated: bool,
    pub params: Vec<Param>,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        write!(f, "{}(", self.function)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")
    }
}

/// Conjunction of clauses routed to a named outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub clauses: Vec<Clause>,
    pub outbound: String,
    /// Source line in the policy text (1-based)
    pub line: usize,
}

impl Rule {
    /// Evaluation cost used by merge & sort: (most expensive clause, clause count)
    pub fn cost(&self) -> (u8, usize) {
        let max = self
            .clauses
            .iter()
            .map(|c| c.function.cost())
            .max()
            .unwrap_or(0);
        (max, self.clauses.len())
    }

    /// Structural equality ignoring the source line
    pub fn same_as(&self, other: &Rule) -> bool {
        self.outbound == other.outbound && self.clauses == other.clauses
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{}", clause)?;
        }
        write!(f, " -> {}", self.outbound)
    }
}

/// Ordered rules plus the default outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub rules: Vec<Rule>,
    pub final_outbound: String,
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{}", rule)?;
        }
        write!(f, "final: {}", self.final_outbound)
    }
}

/// Transport protocol of an intercepted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the matcher may look at for one connection or packet
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub domain: Option<String>,
    pub l4proto: L4Proto,
}

impl ConnectionMeta {
    pub fn new(source: SocketAddr, destination: SocketAddr, l4proto: L4Proto) -> Self {
        Self {
            source,
            destination,
            domain: None,
            l4proto,
        }
    }

    /// Attach a domain name
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Compact outbound identifier; fits the interception layer's one-byte field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutboundId(pub u8);

impl OutboundId {
    /// Reserved id of the `block` sentinel
    pub const BLOCK: OutboundId = OutboundId(u8::MAX);

    /// Largest number of outbounds that can be declared
    pub const MAX_DECLARED: usize = u8::MAX as usize;

    pub fn is_block(&self) -> bool {
        *self == Self::BLOCK
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OutboundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
