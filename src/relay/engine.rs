//! Relay Engine
//!
//! Copies bytes between an intercepted client stream and the egress stream a
//! dialer opened, and keeps track of the sessions currently running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::session::{ConnectionStats, RelaySession};
use crate::Result;

/// Bidirectional stream relay with a per-session time limit
#[derive(Debug)]
pub struct RelayEngine {
    relay_timeout: Duration,
    active_sessions: Mutex<HashMap<String, Arc<RelaySession>>>,
}

impl RelayEngine {
    pub fn new(relay_timeout: Duration) -> Self {
        Self {
            relay_timeout,
            active_sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<RelaySession>>> {
        self.active_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `session`
    pub fn register(&self, session: RelaySession) -> Arc<RelaySession> {
        let session = Arc::new(session);
        self.sessions()
            .insert(session.session_id.clone(), Arc::clone(&session));
        session
    }

    pub fn remove_session(&self, session_id: &str) {
        if self.sessions().remove(session_id).is_some() {
            debug!("Removed session {} from active tracking", session_id);
        }
    }

    /// Relay until either side closes, an error occurs or the time limit
    /// passes. The session is untracked afterwards in every case.
    pub async fn relay<C, T>(
        &self,
        session: &Arc<RelaySession>,
        client: &mut C,
        target: &mut T,
    ) -> Result<ConnectionStats>
    where
        C: AsyncRead + AsyncWrite + Unpin + ?Sized,
        T: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        debug!("Starting bidirectional relay for session {}", session.session_id);

        let result = timeout(
            self.relay_timeout,
            tokio::io::copy_bidirectional(client, target),
        )
        .await;

        self.remove_session(&session.session_id);

        match result {
            Ok(Ok((up, down))) => {
                session.add_bytes_up(up);
                session.add_bytes_down(down);
                session.log_stats();
                Ok(session.to_stats())
            }
            Ok(Err(e)) => {
                session.log_stats();
                Err(anyhow!("relay failed after {:?}: {}", session.duration(), e))
            }
            Err(_) => {
                warn!(
                    "Relay session {} timed out after {:?}",
                    session.session_id, self.relay_timeout
                );
                session.log_stats();
                Err(anyhow!("relay timed out after {:?}", self.relay_timeout))
            }
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::L4Proto;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn session() -> RelaySession {
        RelaySession::new(
            L4Proto::Tcp,
            "10.0.0.2:40000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            "direct",
            "direct",
        )
    }

    #[tokio::test]
    async fn test_relay_counts_bytes_and_untracks() {
        let engine = RelayEngine::new(Duration::from_secs(5));
        let session = engine.register(session());
        assert_eq!(engine.active_session_count(), 1);

        let (mut client, mut client_peer) = duplex(1024);
        let (mut target, mut target_peer) = duplex(1024);

        tokio::spawn(async move {
            client_peer.write_all(b"ping").await.unwrap();
            client_peer.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client_peer.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, b"pong!");
        });
        tokio::spawn(async move {
            let mut request = [0u8; 4];
            target_peer.read_exact(&mut request).await.unwrap();
            target_peer.write_all(b"pong!").await.unwrap();
            target_peer.shutdown().await.unwrap();
        });

        let stats = engine.relay(&session, &mut client, &mut target).await.unwrap();
        assert_eq!(stats.bytes_up, 4);
        assert_eq!(stats.bytes_down, 5);
        assert_eq!(engine.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_times_out() {
        let engine = RelayEngine::new(Duration::from_millis(50));
        let session = engine.register(session());

        let (mut client, _client_peer) = duplex(64);
        let (mut target, _target_peer) = duplex(64);

        let err = engine
            .relay(&session, &mut client, &mut target)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(engine.active_session_count(), 0);
    }
}
