//! Outbound Groups
//!
//! A named, ordered set of dialers plus the policy that picks one of them for
//! each new connection. Latency-driven policies are fed by background probe
//! tasks owned by the group.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::dialer::{Dialer, LATENCY_HISTORY};
use crate::Result;

/// How a group picks a dialer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Always the dialer at `index`
    Fixed { index: usize },
    /// Lowest mean over the last `window` probe latencies
    MinAverage { window: usize },
}

impl SelectionPolicy {
    fn needs_probing(&self) -> bool {
        matches!(self, Self::MinAverage { .. })
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::Fixed { index: 0 }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { index } => write!(f, "fixed({})", index),
            Self::MinAverage { window } => write!(f, "min_average({})", window),
        }
    }
}

/// Latency probe schedule
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub target: SocketAddr,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Named dialer set with a selection policy
pub struct OutboundGroup {
    name: String,
    dialers: Vec<Arc<Dialer>>,
    policy: SelectionPolicy,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboundGroup {
    /// Fails on an empty dialer list, a fixed index out of range or a latency
    /// window outside `1..=LATENCY_HISTORY`
    pub fn new(
        name: impl Into<String>,
        dialers: Vec<Arc<Dialer>>,
        policy: SelectionPolicy,
    ) -> Result<Self> {
        let name = name.into();
        if dialers.is_empty() {
            bail!("outbound '{}' has no dialers", name);
        }
        match policy {
            SelectionPolicy::Fixed { index } if index >= dialers.len() => bail!(
                "outbound '{}': fixed index {} out of range ({} dialers)",
                name,
                index,
                dialers.len()
            ),
            SelectionPolicy::MinAverage { window: 0 } => {
                bail!("outbound '{}': latency window must be at least 1", name)
            }
            SelectionPolicy::MinAverage { window } if window > LATENCY_HISTORY => bail!(
                "outbound '{}': latency window {} exceeds the {} retained samples",
                name,
                window,
                LATENCY_HISTORY
            ),
            _ => {}
        }

        Ok(Self {
            name,
            dialers,
            policy,
            probes: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn dialers(&self) -> &[Arc<Dialer>] {
        &self.dialers
    }

    /// Dialer to use now. Reads the latest latency snapshot, never waits.
    pub fn select(&self) -> Arc<Dialer> {
        self.dialers[self.select_index()].clone()
    }

    /// Index of the dialer [`select`](Self::select) returns
    pub fn select_index(&self) -> usize {
        match self.policy {
            SelectionPolicy::Fixed { index } => index,
            SelectionPolicy::MinAverage { window } => {
                // unmeasured dialers never beat a measured one
                let mut best: Option<(usize, Duration)> = None;
                for (index, dialer) in self.dialers.iter().enumerate() {
                    if let Some(mean) = dialer.mean_latency(window) {
                        if best.map_or(true, |(_, current)| mean < current) {
                            best = Some((index, mean));
                        }
                    }
                }
                best.map_or(0, |(index, _)| index)
            }
        }
    }

    /// Spawn one probe loop per dialer on the current runtime. No-op for
    /// policies that ignore latency; fails outside a tokio runtime.
    pub fn start_probing(&self, config: &ProbeConfig) -> Result<()> {
        if !self.policy.needs_probing() {
            return Ok(());
        }

        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        if !probes.is_empty() {
            return Ok(());
        }

        let runtime = Handle::try_current().with_context(|| {
            format!("outbound '{}': latency probing needs a tokio runtime", self.name)
        })?;

        for dialer in self.dialers.iter().filter(|d| d.supports_probe()) {
            let dialer = Arc::clone(dialer);
            let config = config.clone();
            probes.push(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(config.interval);
                // a probe slower than the interval must not trigger a burst
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    dialer.probe(config.target, config.timeout).await;
                }
            }));
        }

        info!(
            "Started latency probing for outbound '{}' ({} dialers, every {:?})",
            self.name,
            probes.len(),
            config.interval
        );
        Ok(())
    }

    /// Stop every probe loop started by [`start_probing`](Self::start_probing)
    pub fn stop_probing(&self) {
        let probes: Vec<_> = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !probes.is_empty() {
            debug!("Stopping {} probes of outbound '{}'", probes.len(), self.name);
        }
        for probe in probes {
            probe.abort();
        }
    }

    pub fn is_probing(&self) -> bool {
        !self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl Drop for OutboundGroup {
    fn drop(&mut self) {
        self.stop_probing();
    }
}

impl fmt::Debug for OutboundGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroup")
            .field("name", &self.name)
            .field("dialers", &self.dialers.iter().map(|d| d.label()).collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}
