//! DNS Response Observation
//!
//! Feeds A/AAAA answers seen on relayed DNS replies into the [`DnsCache`] so
//! that later connections to those addresses can be routed by domain.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use tracing::debug;

use super::DnsCache;
use crate::Result;

/// Well-known DNS port; replies from it are parsed
pub const DNS_PORT: u16 = 53;

/// Parse a DNS reply and store its address answers.
///
/// Answers are attributed to the first question's name so that CNAME chains
/// resolve to the name the client asked for. The shortest answer TTL wins.
/// Returns the number of addresses stored.
pub fn observe_response(cache: &DnsCache, payload: &[u8]) -> Result<usize> {
    let message = Message::from_vec(payload)?;
    if message.message_type() != MessageType::Response {
        return Ok(0);
    }
    let Some(query) = message.queries().first() else {
        return Ok(0);
    };

    let mut addrs: Vec<IpAddr> = Vec::new();
    let mut ttl = u32::MAX;
    for record in message.answers() {
        let addr = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        ttl = ttl.min(record.ttl());
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    if addrs.is_empty() {
        return Ok(0);
    }

    let domain = query.name().to_string();
    let count = addrs.len();
    debug!("Observed DNS answer {} -> {:?} (ttl {}s)", domain, addrs, ttl);
    cache.store(&domain, addrs, Duration::from_secs(u64::from(ttl)));
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::str::FromStr;
    use std::sync::Arc;

    fn response(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn test_a_and_aaaa_answers_are_cached() {
        let cache = DnsCache::new(Arc::new(Epoch::new(1)));
        let name = Name::from_str("example.com.").unwrap();
        let mut msg = response("example.com.");
        let v4 = RData::A(A("93.184.216.34".parse().unwrap()));
        let v6 = RData::AAAA(AAAA("2606:2800::1".parse().unwrap()));
        msg.add_answer(Record::from_rdata(name.clone(), 300, v4));
        msg.add_answer(Record::from_rdata(name, 120, v6));

        let stored = observe_response(&cache, &msg.to_vec().unwrap()).unwrap();
        assert_eq!(stored, 2);
        assert_eq!(cache.lookup("example.com").map(|a| a.len()), Some(2));
        assert_eq!(
            cache.reverse_lookup("93.184.216.34".parse().unwrap()).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn test_cname_chain_is_attributed_to_question() {
        let cache = DnsCache::new(Arc::new(Epoch::new(1)));
        let asked = Name::from_str("www.example.com.").unwrap();
        let target = Name::from_str("edge.cdn.example.").unwrap();
        let mut msg = response("www.example.com.");
        msg.add_answer(Record::from_rdata(asked, 60, RData::CNAME(CNAME(target.clone()))));
        msg.add_answer(Record::from_rdata(target, 60, RData::A(A("10.1.2.3".parse().unwrap()))));

        observe_response(&cache, &msg.to_vec().unwrap()).unwrap();
        assert_eq!(
            cache.reverse_lookup("10.1.2.3".parse().unwrap()).as_deref(),
            Some("www.example.com")
        );
    }

    #[test]
    fn test_queries_and_garbage_store_nothing() {
        let cache = DnsCache::new(Arc::new(Epoch::new(1)));
        let mut query = response("example.com.");
        query.set_message_type(MessageType::Query);

        assert_eq!(observe_response(&cache, &query.to_vec().unwrap()).unwrap(), 0);
        assert!(observe_response(&cache, &[0xde, 0xad]).is_err());
        assert!(cache.is_empty());
    }
}
