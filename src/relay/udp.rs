//! UDP Session Table
//!
//! Datagram relay keeps no connection state beyond a short-lived mapping from
//! (client, original destination) to the egress socket a dialer opened. A
//! mapping lives while datagrams keep flowing and is dropped after the idle
//! timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::debug;

use super::session::RelaySession;

/// (client, original destination)
pub type UdpFlowKey = (SocketAddr, SocketAddr);

/// Egress side of one datagram flow
#[derive(Debug)]
pub struct UdpFlow {
    pub socket: Arc<UdpSocket>,
    pub session: Arc<RelaySession>,
    last_active: Mutex<Instant>,
}

impl UdpFlow {
    pub fn new(socket: UdpSocket, session: RelaySession) -> Self {
        Self {
            socket: Arc::new(socket),
            session: Arc::new(session),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Live datagram flows
#[derive(Debug)]
pub struct UdpSessionTable {
    idle_timeout: Duration,
    flows: Mutex<HashMap<UdpFlowKey, Arc<UdpFlow>>>,
}

impl UdpSessionTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            flows: Mutex::new(HashMap::new()),
        }
    }

    fn flows(&self) -> MutexGuard<'_, HashMap<UdpFlowKey, Arc<UdpFlow>>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn get(&self, key: &UdpFlowKey) -> Option<Arc<UdpFlow>> {
        self.flows().get(key).cloned()
    }

    /// Insert unless another task won the race; returns the flow in the table
    /// and whether it is the one passed in
    pub fn insert(&self, key: UdpFlowKey, flow: UdpFlow) -> (Arc<UdpFlow>, bool) {
        let mut flows = self.flows();
        if let Some(existing) = flows.get(&key) {
            return (Arc::clone(existing), false);
        }
        let flow = Arc::new(flow);
        flows.insert(key, Arc::clone(&flow));
        (flow, true)
    }

    pub fn remove(&self, key: &UdpFlowKey) -> Option<Arc<UdpFlow>> {
        let removed = self.flows().remove(key);
        if removed.is_some() {
            debug!("UDP flow {} -> {} closed", key.0, key.1);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.flows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.flows().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::L4Proto;

    async fn flow(client: SocketAddr, target: SocketAddr) -> UdpFlow {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        UdpFlow::new(
            socket,
            RelaySession::new(L4Proto::Udp, client, target, "direct", "direct"),
        )
    }

    #[tokio::test]
    async fn test_insert_keeps_first_flow() {
        let table = UdpSessionTable::new(Duration::from_secs(30));
        let key: UdpFlowKey = ("10.0.0.2:5353".parse().unwrap(), "1.1.1.1:53".parse().unwrap());

        let (first, inserted) = table.insert(key, flow(key.0, key.1).await);
        assert!(inserted);
        let (second, inserted) = table.insert(key, flow(key.0, key.1).await);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
    }
}
