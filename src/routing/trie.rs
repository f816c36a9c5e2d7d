//! Lookup Structures
//!
//! Binary longest-prefix trie over 128-bit normalized addresses and the
//! domain set used by `domain(...)` clauses.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

/// Map an address to 128 bits; IPv4 lands in `::ffff:0:0/96`
pub fn normalize_addr(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Normalized (bits, prefix length) for a network
pub fn normalize_net(net: &IpNet) -> (u128, u8) {
    match net {
        IpNet::V4(v4) => (
            normalize_addr(IpAddr::V4(v4.network())),
            v4.prefix_len() + 96,
        ),
        IpNet::V6(v6) => (normalize_addr(IpAddr::V6(v6.network())), v6.prefix_len()),
    }
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: [Option<u32>; 2],
    terminal: bool,
}

/// Longest-prefix-match trie. Immutable once built.
#[derive(Debug, Clone)]
pub struct PrefixTrie {
    nodes: Vec<Node>,
    prefixes: usize,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            prefixes: 0,
        }
    }

    /// Insert a network
    pub fn insert(&mut self, net: &IpNet) {
        let (bits, len) = normalize_net(net);
        let mut current = 0usize;
        for depth in 0..len {
            let bit = bit_at(bits, depth);
            current = match self.nodes[current].children[bit] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[current].children[bit] = Some(next as u32);
                    next
                }
            };
        }
        if !self.nodes[current].terminal {
            self.nodes[current].terminal = true;
            self.prefixes += 1;
        }
    }

    /// Length (in normalized bits) of the longest stored prefix covering `addr`
    pub fn longest_match(&self, addr: IpAddr) -> Option<u8> {
        let bits = normalize_addr(addr);
        let mut current = 0usize;
        let mut best = self.nodes[0].terminal.then_some(0);
        for depth in 0..128u8 {
            match self.nodes[current].children[bit_at(bits, depth)] {
                Some(next) => current = next as usize,
                None => break,
            }
            if self.nodes[current].terminal {
                best = Some(depth + 1);
            }
        }
        best
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.longest_match(addr).is_some()
    }

    /// Number of distinct prefixes stored
    pub fn len(&self) -> usize {
        self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes == 0
    }
}

fn bit_at(bits: u128, depth: u8) -> usize {
    ((bits >> (127 - depth)) & 1) as usize
}

/// Domain membership by exact name, suffix or keyword
#[derive(Debug, Default, Clone)]
pub struct DomainSet {
    full: HashSet<String>,
    suffix: HashSet<String>,
    keyword: Vec<String>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_full(&mut self, domain: &str) {
        self.full.insert(domain.to_ascii_lowercase());
    }

    pub fn insert_suffix(&mut self, suffix: &str) {
        self.suffix
            .insert(suffix.trim_matches('.').to_ascii_lowercase());
    }

    pub fn insert_keyword(&mut self, keyword: &str) {
        let keyword = keyword.to_ascii_lowercase();
        if !self.keyword.contains(&keyword) {
            self.keyword.push(keyword);
        }
    }

    /// `domain` is expected lowercase without a trailing dot
    pub fn matches(&self, domain: &str) -> bool {
        if self.full.contains(domain) {
            return true;
        }
        if !self.suffix.is_empty() {
            // example.com, then com
            let mut rest = domain;
            loop {
                if self.suffix.contains(rest) {
                    return true;
                }
                match rest.find('.') {
                    Some(pos) => rest = &rest[pos + 1..],
                    None => break,
                }
            }
        }
        self.keyword.iter().any(|k| domain.contains(k.as_str()))
    }

    pub fn len(&self) -> usize {
        self.full.len() + self.suffix.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(nets: &[&str]) -> PrefixTrie {
        let mut trie = PrefixTrie::new();
        for net in nets {
            trie.insert(&net.parse().unwrap());
        }
        trie
    }

    #[test]
    fn test_longest_prefix_wins() {
        let trie = trie(&["10.0.0.0/8", "10.1.0.0/16", "2001:db8::/32"]);

        assert_eq!(trie.longest_match("10.1.2.3".parse().unwrap()), Some(96 + 16));
        assert_eq!(trie.longest_match("10.2.0.1".parse().unwrap()), Some(96 + 8));
        assert_eq!(trie.longest_match("2001:db8::1".parse().unwrap()), Some(32));
        assert!(!trie.contains("11.0.0.1".parse().unwrap()));
        assert!(!trie.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_v4_does_not_leak_into_v6() {
        let trie = trie(&["0.0.0.0/0"]);
        assert!(trie.contains("8.8.8.8".parse().unwrap()));
        assert!(!trie.contains("2001:4860::8888".parse().unwrap()));

        let all_v6 = self::trie(&["::/0"]);
        assert!(all_v6.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_duplicate_prefixes_count_once() {
        let trie = trie(&["192.168.1.7/32", "192.168.1.7/32"]);
        assert_eq!(trie.len(), 1);
        assert!(trie.contains("192.168.1.7".parse().unwrap()));
    }

    #[test]
    fn test_domain_set_kinds() {
        let mut set = DomainSet::new();
        set.insert_suffix("example.com");
        set.insert_full("exact.org");
        set.insert_keyword("tracker");

        assert!(set.matches("example.com"));
        assert!(set.matches("a.b.example.com"));
        assert!(!set.matches("badexample.com"));
        assert!(set.matches("exact.org"));
        assert!(!set.matches("www.exact.org"));
        assert!(set.matches("cdn-tracker.net"));
        assert!(!set.matches("example.org"));
    }
}
