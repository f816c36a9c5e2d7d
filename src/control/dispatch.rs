//! Dispatch Pipeline
//!
//! Two accept loops, one per transport. Every accepted stream or datagram is
//! handled on its own task: recover the original destination, decide the
//! outbound, select a dialer, relay. Per-item failures are logged and dropped;
//! only a listener failure ends a loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::dns::{observe_response, DnsCache, DNS_PORT};
use crate::outbound::OutboundGroup;
use crate::protocol::constants::MAX_DATAGRAM_SIZE;
use crate::protocol::OriginalDestinationHeader;
use crate::relay::{RelayEngine, RelaySession, UdpFlow, UdpFlowKey, UdpSessionTable};
use crate::routing::{CompiledMatcher, ConnectionMeta, L4Proto, OutboundId, OutboundTable};
use crate::shutdown::{InFlight, ShutdownCoordinator, ShutdownSignal};
use crate::Result;

/// Timeouts applied per item
#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
    pub header: Duration,
    pub dial: Duration,
}

/// Outcome of routing one item
#[derive(Debug, Clone)]
pub struct Route {
    pub meta: ConnectionMeta,
    pub outbound: OutboundId,
}

/// Shared state of both accept loops
pub struct Dispatcher {
    matcher: Arc<CompiledMatcher>,
    table: Arc<OutboundTable>,
    groups: Arc<Vec<Arc<OutboundGroup>>>,
    dns: Arc<DnsCache>,
    relay: RelayEngine,
    udp: Arc<UdpSessionTable>,
    timeouts: DispatchTimeouts,
    in_flight: Arc<InFlight>,
    shutdown: ShutdownCoordinator,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: Arc<CompiledMatcher>,
        table: Arc<OutboundTable>,
        groups: Arc<Vec<Arc<OutboundGroup>>>,
        dns: Arc<DnsCache>,
        relay_timeout: Duration,
        udp_idle_timeout: Duration,
        timeouts: DispatchTimeouts,
        in_flight: Arc<InFlight>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            matcher,
            table,
            groups,
            dns,
            relay: RelayEngine::new(relay_timeout),
            udp: Arc::new(UdpSessionTable::new(udp_idle_timeout)),
            timeouts,
            in_flight,
            shutdown,
        }
    }

    /// Build metadata for an item, attach a cached domain and decide
    pub fn route(&self, source: SocketAddr, destination: SocketAddr, l4proto: L4Proto) -> Route {
        let mut meta = ConnectionMeta::new(source, destination, l4proto);
        meta.domain = self.dns.reverse_lookup(destination.ip());
        let outbound = self.matcher.decide(&meta);
        trace!(
            "{} {} -> {} ({:?}) routed to {}",
            l4proto,
            source,
            destination,
            meta.domain,
            self.table.name(outbound)
        );
        Route { meta, outbound }
    }

    fn group(&self, id: OutboundId) -> Option<&Arc<OutboundGroup>> {
        self.groups.get(id.index())
    }

    pub fn active_udp_flows(&self) -> usize {
        self.udp.len()
    }

    pub fn clear_udp_flows(&self) {
        self.udp.clear();
    }

    /// Stream accept loop
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        info!("TCP dispatch listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(
                        "TCP accept loop stopping, {} sessions still relaying",
                        self.relay.active_session_count()
                    );
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = self.in_flight.enter();
                        let dispatcher = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _guard = guard;
                            dispatcher.handle_conn(stream, peer).await;
                        });
                    }
                    Err(e) if is_closed_listener_error(&e) || shutdown.is_triggered() => {
                        debug!("TCP listener closed: {}", e);
                        return Ok(());
                    }
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Datagram receive loop
    pub async fn serve_udp(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        info!("UDP dispatch listening on {}", socket.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("UDP receive loop stopping");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, client)) => {
                        let packet = buf[..n].to_vec();
                        let guard = self.in_flight.enter();
                        let dispatcher = Arc::clone(&self);
                        let listener = Arc::clone(&socket);
                        tokio::spawn(async move {
                            let _guard = guard;
                            dispatcher.handle_pkt(listener, packet, client).await;
                        });
                    }
                    Err(e) if is_closed_listener_error(&e) || shutdown.is_triggered() => {
                        debug!("UDP listener closed: {}", e);
                        return Ok(());
                    }
                    // ICMP unreachable from an earlier send surfaces here on some platforms
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        debug!("Ignoring UDP reset: {}", e);
                    }
                    Err(e) => {
                        error!("UDP receive failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Handle one intercepted stream. Never fails the loop.
    pub async fn handle_conn(&self, mut stream: TcpStream, peer: SocketAddr) {
        let header = match timeout(
            self.timeouts.header,
            OriginalDestinationHeader::read_from(&mut stream),
        )
        .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Dropping connection from {}: no header within {:?}",
                    peer, self.timeouts.header
                );
                return;
            }
        };

        let route = self.route(peer, header.destination, L4Proto::Tcp);
        if route.outbound.is_block() {
            debug!("Blocked TCP {} -> {}", peer, header.destination);
            return;
        }
        let Some(group) = self.group(route.outbound) else {
            error!("No outbound group for id {}", route.outbound);
            return;
        };

        let dialer = group.select();
        let mut egress = match dialer.connect(header.destination, self.timeouts.dial).await {
            Ok(egress) => egress,
            Err(e) => {
                warn!(
                    "Dial {} via {}/{} failed: {}",
                    header.destination,
                    group.name(),
                    dialer.label(),
                    e
                );
                return;
            }
        };

        let session = self.relay.register(RelaySession::new(
            L4Proto::Tcp,
            peer,
            header.destination,
            group.name(),
            dialer.label(),
        ));
        if let Err(e) = self.relay.relay(&session, &mut stream, &mut egress).await {
            debug!("Relay {} ended: {}", session.session_id, e);
        }
    }

    /// Handle one intercepted datagram. Never fails the loop.
    pub async fn handle_pkt(
        &self,
        listener: Arc<UdpSocket>,
        packet: Vec<u8>,
        client: SocketAddr,
    ) {
        let (header, offset) = match OriginalDestinationHeader::parse(&packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", client, e);
                return;
            }
        };
        let payload = &packet[offset..];
        let key: UdpFlowKey = (client, header.destination);

        let flow = match self.udp.get(&key) {
            Some(flow) => flow,
            None => match self.open_flow(key).await {
                Some((flow, true)) => {
                    self.spawn_reply_pump(Arc::clone(&flow), key, listener);
                    flow
                }
                Some((flow, false)) => flow,
                None => return,
            },
        };

        flow.touch();
        match flow.socket.send_to(payload, header.destination).await {
            Ok(n) => flow.session.add_bytes_up(n as u64),
            Err(e) => warn!("UDP send to {} failed: {}", header.destination, e),
        }
    }

    /// Route a new flow and bind its egress socket. The flag reports whether
    /// this call created the table entry.
    async fn open_flow(&self, key: UdpFlowKey) -> Option<(Arc<UdpFlow>, bool)> {
        let (client, destination) = key;
        let route = self.route(client, destination, L4Proto::Udp);
        if route.outbound.is_block() {
            debug!("Blocked UDP {} -> {}", client, destination);
            return None;
        }
        let Some(group) = self.group(route.outbound) else {
            error!("No outbound group for id {}", route.outbound);
            return None;
        };
        let dialer = group.select();

        let socket = match dialer.bind_datagram(destination).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    "UDP via {}/{} to {} failed: {}",
                    group.name(),
                    dialer.label(),
                    destination,
                    e
                );
                return None;
            }
        };

        let session = RelaySession::new(
            L4Proto::Udp,
            client,
            destination,
            group.name(),
            dialer.label(),
        );
        Some(self.udp.insert(key, UdpFlow::new(socket, session)))
    }

    /// Forward replies of one flow back to its client until the flow idles out
    fn spawn_reply_pump(&self, flow: Arc<UdpFlow>, key: UdpFlowKey, listener: Arc<UdpSocket>) {
        let dns = Arc::clone(&self.dns);
        let table = Arc::clone(&self.udp);
        let idle = table.idle_timeout();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let received = tokio::select! {
                    _ = shutdown.recv() => break,
                    received = timeout(idle, flow.socket.recv_from(&mut buf)) => received,
                };

                let (n, from) = match received {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => {
                        debug!("UDP flow {} -> {} failed: {}", key.0, key.1, e);
                        break;
                    }
                    Err(_) if flow.idle_for() >= idle => break,
                    Err(_) => continue,
                };

                let reply = frame_reply(&dns, from, &buf[..n]);
                if let Err(e) = listener.send_to(&reply, key.0).await {
                    debug!("UDP reply to {} failed: {}", key.0, e);
                    break;
                }
                flow.touch();
                flow.session.add_bytes_down(n as u64);
            }

            if let Some(current) = table.get(&key) {
                if Arc::ptr_eq(&current, &flow) {
                    table.remove(&key);
                }
            }
            flow.session.log_stats();
        });
    }
}

/// Prefix a reply from `from` with its original-destination header. DNS
/// replies are fed to the cache on the way.
fn frame_reply(dns: &DnsCache, from: SocketAddr, payload: &[u8]) -> BytesMut {
    if from.port() == DNS_PORT {
        match observe_response(dns, payload) {
            Ok(stored) if stored > 0 => trace!("Cached {} DNS answers from {}", stored, from),
            Ok(_) => {}
            Err(e) => debug!("Unparsable DNS reply from {}: {}", from, e),
        }
    }

    let header = OriginalDestinationHeader::new(from);
    let mut reply = BytesMut::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut reply);
    reply.put_slice(payload);
    reply
}

/// Whether an accept/receive error only reports that the listener was closed
pub fn is_closed_listener_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    ) || e.to_string().contains("use of closed")
}
