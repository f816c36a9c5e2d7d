//! Compiled Matcher
//!
//! Built once from an optimized [`RoutingPolicy`] and an [`OutboundTable`].
//! Every clause owns a type-specific index; querying is a read-only walk over
//! the rule list, so a matcher can be shared across tasks without locking.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

use super::error::RoutingError;
use super::optimizer::{canonical_key, canonical_value};
use super::trie::{DomainSet, PrefixTrie};
use super::types::*;

/// Outbound name <-> id binding
#[derive(Debug, Clone)]
pub struct OutboundTable {
    names: Vec<String>,
    ids: HashMap<String, OutboundId>,
}

impl OutboundTable {
    /// Assign ids in declaration order. `block` is reserved and implicit.
    pub fn new<I, S>(names: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self {
            names: Vec::new(),
            ids: HashMap::new(),
        };

        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(RoutingError::build("outbound name must not be empty"));
            }
            if name == BLOCK_OUTBOUND {
                return Err(RoutingError::build(format!(
                    "outbound name '{}' is reserved",
                    BLOCK_OUTBOUND
                )));
            }
            if table.ids.contains_key(&name) {
                return Err(RoutingError::build(format!(
                    "outbound '{}' declared twice",
                    name
                )));
            }
            if table.names.len() >= OutboundId::MAX_DECLARED {
                return Err(RoutingError::build(format!(
                    "too many outbounds: at most {} can be declared",
                    OutboundId::MAX_DECLARED
                )));
            }

            let id = OutboundId(table.names.len() as u8);
            table.ids.insert(name.clone(), id);
            table.names.push(name);
        }

        Ok(table)
    }

    /// Id bound to `name`; `block` always resolves
    pub fn id(&self, name: &str) -> Option<OutboundId> {
        if name == BLOCK_OUTBOUND {
            return Some(OutboundId::BLOCK);
        }
        self.ids.get(name).copied()
    }

    pub fn resolve(&self, name: &str) -> Result<OutboundId, RoutingError> {
        self.id(name)
            .ok_or_else(|| RoutingError::build(format!("undeclared outbound '{}'", name)))
    }

    pub fn name(&self, id: OutboundId) -> &str {
        if id.is_block() {
            return BLOCK_OUTBOUND;
        }
        self.names.get(id.index()).map(String::as_str).unwrap_or("")
    }

    /// Declared names in id order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
enum ClauseIndex {
    Domain(DomainSet),
    DestIp(PrefixTrie),
    SourceIp(PrefixTrie),
    DestPort(Vec<(u16, u16)>),
    SourcePort(Vec<(u16, u16)>),
    L4Proto(Vec<L4Proto>),
    IpVersion { v4: bool, v6: bool },
}

impl ClauseIndex {
    fn matches(&self, meta: &ConnectionMeta) -> bool {
        match self {
            Self::Domain(set) => meta
                .domain
                .as_deref()
                .map(|d| set.matches(d.trim_end_matches('.').to_ascii_lowercase().as_str()))
                .unwrap_or(false),
            Self::DestIp(trie) => trie.contains(meta.destination.ip()),
            Self::SourceIp(trie) => trie.contains(meta.source.ip()),
            Self::DestPort(ranges) => port_in(ranges, meta.destination.port()),
            Self::SourcePort(ranges) => port_in(ranges, meta.source.port()),
            Self::L4Proto(protos) => protos.contains(&meta.l4proto),
            Self::IpVersion { v4, v6 } => match meta.destination.ip() {
                IpAddr::V4(_) => *v4,
                IpAddr::V6(v6addr) if v6addr.to_ipv4_mapped().is_some() => *v4,
                IpAddr::V6(_) => *v6,
            },
        }
    }
}

fn port_in(ranges: &[(u16, u16)], port: u16) -> bool {
    ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&port))
}

#[derive(Debug, Clone)]
struct CompiledClause {
    negated: bool,
    index: ClauseIndex,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    clauses: Vec<CompiledClause>,
    outbound: OutboundId,
    line: usize,
}

/// Immutable routing decision structure
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    rules: Vec<CompiledRule>,
    final_outbound: OutboundId,
}

impl CompiledMatcher {
    /// Bind names to ids and compile every clause
    pub fn build(policy: &RoutingPolicy, table: &OutboundTable) -> Result<Self, RoutingError> {
        let final_outbound = table.resolve(&policy.final_outbound)?;
        let mut rules = Vec::with_capacity(policy.rules.len());

        for rule in &policy.rules {
            let outbound = table.resolve(&rule.outbound).map_err(|e| {
                RoutingError::build(format!("rule at line {}: {}", rule.line, e))
            })?;
            let clauses = rule
                .clauses
                .iter()
                .map(|clause| compile_clause(clause, rule.line))
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(CompiledRule {
                clauses,
                outbound,
                line: rule.line,
            });
        }

        Ok(Self {
            rules,
            final_outbound,
        })
    }

    /// Outbound for `meta`: the first rule whose clauses all hold, else final
    pub fn decide(&self, meta: &ConnectionMeta) -> OutboundId {
        self.matching_rule(meta)
            .map(|rule| rule.outbound)
            .unwrap_or(self.final_outbound)
    }

    /// Source line of the rule that decides `meta`, if any
    pub fn matched_line(&self, meta: &ConnectionMeta) -> Option<usize> {
        self.matching_rule(meta).map(|rule| rule.line)
    }

    fn matching_rule(&self, meta: &ConnectionMeta) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| {
            rule.clauses
                .iter()
                .all(|clause| clause.index.matches(meta) != clause.negated)
        })
    }

    pub fn final_outbound(&self) -> OutboundId {
        self.final_outbound
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn compile_clause(clause: &Clause, line: usize) -> Result<CompiledClause, RoutingError> {
    let bad = |param: &Param, why: &str| {
        RoutingError::build(format!(
            "rule at line {}: {} '{}' in {}(): {}",
            line, param.key, param.value, clause.function, why
        ))
    };

    let mut canonical = Vec::with_capacity(clause.params.len());
    for param in &clause.params {
        let key = canonical_key(clause.function, &param.key)
            .ok_or_else(|| bad(param, "unknown key"))?;
        if key == KEY_GEOSITE || key == KEY_GEOIP {
            return Err(bad(param, "external list was not resolved"));
        }
        canonical.push((key, canonical_value(key, &param.value), param));
    }

    let index = match clause.function {
        Function::Domain => {
            let mut set = DomainSet::new();
            for (key, value, _) in &canonical {
                match *key {
                    KEY_FULL => set.insert_full(value),
                    KEY_KEYWORD => set.insert_keyword(value),
                    _ => set.insert_suffix(value),
                }
            }
            ClauseIndex::Domain(set)
        }
        Function::Ip | Function::SourceIp => {
            let mut trie = PrefixTrie::new();
            for (_, value, param) in &canonical {
                let net = parse_net(value).ok_or_else(|| bad(param, "invalid CIDR"))?;
                trie.insert(&net);
            }
            if clause.function == Function::Ip {
                ClauseIndex::DestIp(trie)
            } else {
                ClauseIndex::SourceIp(trie)
            }
        }
        Function::Port | Function::SourcePort => {
            let ranges = canonical
                .iter()
                .map(|(_, value, param)| {
                    parse_port_range(value).ok_or_else(|| bad(param, "invalid port"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if clause.function == Function::Port {
                ClauseIndex::DestPort(ranges)
            } else {
                ClauseIndex::SourcePort(ranges)
            }
        }
        Function::L4Proto => {
            let protos = canonical
                .iter()
                .map(|(_, value, param)| {
                    L4Proto::from_name(value).ok_or_else(|| bad(param, "expected tcp or udp"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            ClauseIndex::L4Proto(protos)
        }
        Function::IpVersion => {
            let (mut v4, mut v6) = (false, false);
            for (_, value, param) in &canonical {
                match value.as_str() {
                    "4" => v4 = true,
                    "6" => v6 = true,
                    _ => return Err(bad(param, "expected 4 or 6")),
                }
            }
            ClauseIndex::IpVersion { v4, v6 }
        }
    };

    Ok(CompiledClause {
        negated: clause.negated,
        index,
    })
}

fn parse_net(value: &str) -> Option<IpNet> {
    value
        .parse::<IpNet>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(IpNet::from))
}

/// `80`, `80-90` or `80:90`
fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    match value.split_once(['-', ':']) {
        Some((lo, hi)) => {
            let lo = lo.trim().parse::<u16>().ok()?;
            let hi = hi.trim().parse::<u16>().ok()?;
            (lo <= hi).then_some((lo, hi))
        }
        None => {
            let port = value.parse::<u16>().ok()?;
            Some((port, port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::parser::parse_policy;
    use std::net::SocketAddr;

    fn table() -> OutboundTable {
        OutboundTable::new(["direct", "proxy", "alt"]).unwrap()
    }

    fn meta(src: &str, dst: &str, proto: L4Proto) -> ConnectionMeta {
        ConnectionMeta::new(
            src.parse::<SocketAddr>().unwrap(),
            dst.parse::<SocketAddr>().unwrap(),
            proto,
        )
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = parse_policy(
            "ip(10.0.0.0/8) && port(22) -> alt\n\
             ip(10.0.0.0/8) -> direct\n\
             domain(example.com) -> proxy\n\
             final: proxy",
        )
        .unwrap();
        let m = CompiledMatcher::build(&policy, &table()).unwrap();

        let ssh = meta("192.168.1.2:5000", "10.1.1.1:22", L4Proto::Tcp);
        assert_eq!(m.decide(&ssh), OutboundId(2));
        assert_eq!(m.matched_line(&ssh), Some(1));

        let web = meta("192.168.1.2:5000", "10.1.1.1:443", L4Proto::Tcp);
        assert_eq!(m.decide(&web), OutboundId(0));

        let other = meta("192.168.1.2:5000", "8.8.8.8:53", L4Proto::Udp);
        assert_eq!(m.decide(&other), OutboundId(1));
        assert_eq!(m.matched_line(&other), None);
    }

    #[test]
    fn test_negation_and_missing_domain() {
        let policy = parse_policy(
            "domain(example.com) -> alt\n\
             !l4proto(tcp) -> direct\n\
             final: block",
        )
        .unwrap();
        let m = CompiledMatcher::build(&policy, &table()).unwrap();

        let tcp = meta("1.1.1.1:1", "2.2.2.2:80", L4Proto::Tcp);
        assert_eq!(m.decide(&tcp), OutboundId::BLOCK);
        assert_eq!(m.decide(&tcp.clone().with_domain("www.Example.com.")), OutboundId(2));

        let udp = meta("1.1.1.1:1", "2.2.2.2:80", L4Proto::Udp);
        assert_eq!(m.decide(&udp), OutboundId(0));
    }

    #[test]
    fn test_ports_and_versions() {
        let policy = parse_policy(
            "sport(1000-2000) -> alt\n\
             ipversion(6) && port(443, 8443) -> proxy\n\
             final: direct",
        )
        .unwrap();
        let m = CompiledMatcher::build(&policy, &table()).unwrap();

        assert_eq!(m.decide(&meta("1.1.1.1:1500", "2.2.2.2:80", L4Proto::Tcp)), OutboundId(2));
        assert_eq!(m.decide(&meta("[::1]:1", "[2001:db8::1]:8443", L4Proto::Tcp)), OutboundId(1));
        assert_eq!(m.decide(&meta("1.1.1.1:1", "2.2.2.2:443", L4Proto::Tcp)), OutboundId(0));
    }

    #[test]
    fn test_build_errors() {
        let undeclared = parse_policy("port(1) -> nowhere\nfinal: direct").unwrap();
        assert!(matches!(
            CompiledMatcher::build(&undeclared, &table()),
            Err(RoutingError::Build(_))
        ));

        for text in [
            "ip(10.0.0.300/8) -> direct\nfinal: direct",
            "port(70000) -> direct\nfinal: direct",
            "port(90-80) -> direct\nfinal: direct",
            "l4proto(icmp) -> direct\nfinal: direct",
            "domain(geosite: cn) -> direct\nfinal: direct",
        ] {
            let policy = parse_policy(text).unwrap();
            assert!(
                matches!(CompiledMatcher::build(&policy, &table()), Err(RoutingError::Build(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_outbound_table_limits() {
        let names: Vec<String> = (0..255).map(|i| format!("out{}", i)).collect();
        let table = OutboundTable::new(names.clone()).unwrap();
        assert_eq!(table.id("out254"), Some(OutboundId(254)));
        assert_eq!(table.id("block"), Some(OutboundId::BLOCK));

        let mut too_many = names;
        too_many.push("out255".to_string());
        assert!(matches!(OutboundTable::new(too_many), Err(RoutingError::Build(_))));

        assert!(OutboundTable::new(["a", "a"]).is_err());
        assert!(OutboundTable::new(["block"]).is_err());
    }
}
