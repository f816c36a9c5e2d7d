//! Dialers
//!
//! A [`Dialer`] wraps an opaque [`Connector`] (the concrete egress transport)
//! with a label and a rolling window of probe latencies.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Number of probe samples a dialer retains
pub const LATENCY_HISTORY: usize = 64;

/// Per-connection egress failure. Never retried automatically.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {target} timed out after {timeout:?}")]
    Timeout {
        target: SocketAddr,
        timeout: Duration,
    },

    #[error("connect to {target} failed: {source}")]
    Io {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("proxy handshake failed: {0}")]
    Handshake(String),

    #[error("{0} is not supported by this dialer")]
    Unsupported(&'static str),

    #[error("connection blocked")]
    Blocked,
}

impl DialError {
    pub(crate) fn io(target: SocketAddr, source: io::Error) -> Self {
        Self::Io { target, source }
    }
}

/// Concrete egress transport
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a stream to `target`
    async fn connect(&self, target: SocketAddr) -> Result<TcpStream, DialError>;

    /// Open a datagram socket able to reach `target`
    async fn bind_datagram(&self, _target: SocketAddr) -> Result<UdpSocket, DialError> {
        Err(DialError::Unsupported("datagram relay"))
    }

    /// Whether latency probing makes sense for this transport
    fn supports_probe(&self) -> bool {
        true
    }
}

/// Last-N latency samples, oldest first
#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the newest `n` samples (or all of them if fewer)
    fn mean_of_last(&self, n: usize) -> Option<Duration> {
        let take = n.min(self.samples.len());
        if take == 0 {
            return None;
        }
        let total: Duration = self.samples.iter().rev().take(take).sum();
        Some(total / take as u32)
    }
}

/// Labelled egress capability
#[derive(Debug)]
pub struct Dialer {
    label: String,
    connector: Box<dyn Connector>,
    latencies: Mutex<LatencyWindow>,
}

impl Dialer {
    pub fn new(label: impl Into<String>, connector: Box<dyn Connector>) -> Self {
        Self {
            label: label.into(),
            connector,
            latencies: Mutex::new(LatencyWindow::new(LATENCY_HISTORY)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Open a stream to `target`, bounded by `limit`
    pub async fn connect(
        &self,
        target: SocketAddr,
        limit: Duration,
    ) -> Result<TcpStream, DialError> {
        match timeout(limit, self.connector.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                target,
                timeout: limit,
            }),
        }
    }

    pub async fn bind_datagram(&self, target: SocketAddr) -> Result<UdpSocket, DialError> {
        self.connector.bind_datagram(target).await
    }

    pub fn supports_probe(&self) -> bool {
        self.connector.supports_probe()
    }

    /// Measure one connect to `target`. A failed or timed out probe counts
    /// as `limit`.
    pub async fn probe(&self, target: SocketAddr, limit: Duration) -> Duration {
        let started = Instant::now();
        let sample = match self.connect(target, limit).await {
            Ok(_stream) => started.elapsed().min(limit),
            Err(e) => {
                debug!("Probe of dialer '{}' failed: {}", self.label, e);
                limit
            }
        };
        trace!("Dialer '{}' probe: {:?}", self.label, sample);
        self.record_latency(sample);
        sample
    }

    pub fn record_latency(&self, sample: Duration) {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    /// Mean of the last `window` samples; `None` before the first probe
    pub fn mean_latency(&self, window: usize) -> Option<Duration> {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mean_of_last(window)
    }

    pub fn sample_count(&self) -> usize {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .len()
    }
}
