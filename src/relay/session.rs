//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info};
use uuid::Uuid;

use crate::routing::L4Proto;

/// One relayed connection or datagram exchange
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub l4proto: L4Proto,
    pub client_addr: SocketAddr,
    /// Original destination recovered from the header
    pub target_addr: SocketAddr,
    pub outbound: String,
    pub dialer: String,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub session_id: String,
    pub l4proto: L4Proto,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub outbound: String,
    pub dialer: String,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    pub fn new(
        l4proto: L4Proto,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
        outbound: impl Into<String>,
        dialer: impl Into<String>,
    ) -> Self {
        let session_id = format!("{}-{}", l4proto, Uuid::new_v4().simple());
        debug!(
            "Creating relay session {} ({} -> {})",
            session_id, client_addr, target_addr
        );

        Self {
            session_id,
            l4proto,
            client_addr,
            target_addr,
            outbound: outbound.into(),
            dialer: dialer.into(),
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes sent client -> target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes sent target -> client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn to_stats(&self) -> ConnectionStats {
        let duration = self.duration();
        ConnectionStats {
            session_id: self.session_id.clone(),
            l4proto: self.l4proto,
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            outbound: self.outbound.clone(),
            dialer: self.dialer.clone(),
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            l4proto = %self.l4proto,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            outbound = %self.outbound,
            dialer = %self.dialer,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            "Relay session completed"
        );
    }
}
