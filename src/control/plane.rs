//! Control Plane
//!
//! Owns the compiled matcher, the outbound groups, the DNS cache, the epoch
//! and the teardown stack. Everything acquired during construction, link
//! binding and listening registers its release on the stack, so `close`
//! unwinds the process state in reverse order.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

use super::dispatch::{DispatchTimeouts, Dispatcher};
use super::teardown::{TeardownError, TeardownStack};
use crate::config::Config;
use crate::dns::DnsCache;
use crate::epoch::Epoch;
use crate::interception::{
    ChecksumPolicy, HookPoint, IfIpRecord, InterceptionError, InterceptionLayer, ParamKey,
};
use crate::outbound::{
    parse_link, Dialer, DirectConnector, OutboundGroup, ProbeConfig, SelectionPolicy,
};
use crate::routing::{
    CompiledMatcher, ConnectionMeta, OutboundId, OutboundTable, RoutingCompiler, DIRECT_OUTBOUND,
};
use crate::shutdown::{InFlight, ShutdownCoordinator};
use crate::Result;

/// Attempts to clear an incompatible pinned object before loading gives up
pub const MAX_LOAD_RETRIES: usize = 3;

/// Hooks installed on every bound link, in installation order
const LINK_HOOKS: [HookPoint; 3] = [HookPoint::Clsact, HookPoint::Ingress, HookPoint::Egress];

/// Bound TCP and UDP listeners sharing one port
#[derive(Debug)]
pub struct Listeners {
    pub tcp: TcpListener,
    pub udp: Arc<UdpSocket>,
}

impl Listeners {
    pub fn port(&self) -> u16 {
        self.tcp.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }
}

/// State acquired during construction
struct Parts {
    epoch: Arc<Epoch>,
    dns: Arc<DnsCache>,
    matcher: Arc<CompiledMatcher>,
    table: Arc<OutboundTable>,
    groups: Arc<Vec<Arc<OutboundGroup>>>,
}

pub struct ControlPlane {
    config: Config,
    interception: Arc<dyn InterceptionLayer>,
    epoch: Arc<Epoch>,
    dns: Arc<DnsCache>,
    matcher: Arc<CompiledMatcher>,
    table: Arc<OutboundTable>,
    groups: Arc<Vec<Arc<OutboundGroup>>>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownCoordinator,
    in_flight: Arc<InFlight>,
    teardown: TeardownStack,
}

impl ControlPlane {
    /// Load the interception objects, bump the epoch, compile the routing
    /// policy and build the outbound groups. Anything already acquired is
    /// released again when a later step fails.
    ///
    /// Must be called within a Tokio runtime: latency probes start here.
    pub fn new(config: Config, interception: Arc<dyn InterceptionLayer>) -> Result<Self> {
        config.validate()?;
        let teardown = TeardownStack::new();

        let parts = match Self::acquire(&config, &interception, &teardown) {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(cleanup) = teardown.close() {
                    warn!("Cleanup after failed startup: {}", cleanup);
                }
                return Err(e);
            }
        };

        let shutdown = ShutdownCoordinator::new();
        let in_flight = InFlight::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&parts.matcher),
            Arc::clone(&parts.table),
            Arc::clone(&parts.groups),
            Arc::clone(&parts.dns),
            config.server.relay_timeout,
            config.server.udp_session_timeout,
            DispatchTimeouts {
                header: config.server.header_timeout,
                dial: config.server.dial_timeout,
            },
            Arc::clone(&in_flight),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            interception,
            epoch: parts.epoch,
            dns: parts.dns,
            matcher: parts.matcher,
            table: parts.table,
            groups: parts.groups,
            dispatcher,
            shutdown,
            in_flight,
            teardown,
        })
    }

    fn acquire(
        config: &Config,
        interception: &Arc<dyn InterceptionLayer>,
        teardown: &TeardownStack,
    ) -> Result<Parts> {
        load_objects(interception.as_ref())?;
        let layer = Arc::clone(interception);
        teardown.push("unload interception objects", move || {
            layer.unload().context("failed to unload interception objects")
        });

        for key in [ParamKey::DisableL4TxChecksum, ParamKey::DisableL4RxChecksum] {
            interception
                .update_param(key, ChecksumPolicy::SetZero.into())
                .with_context(|| format!("failed to set {}", key))?;
        }

        let previous = interception
            .lookup_param(ParamKey::Epoch)
            .context("failed to read epoch")?;
        let epoch = previous.unwrap_or(0).wrapping_add(1);
        interception
            .update_param(ParamKey::Epoch, epoch)
            .context("failed to write epoch")?;
        info!("Control plane epoch {}", epoch);

        let groups = build_groups(config)?;
        let table = OutboundTable::new(groups.iter().map(|g| g.name().to_string()))?;

        let policy_text = config.policy_text()?;
        let matcher = RoutingCompiler::new(config.routing.data_dir.clone())
            .build(&policy_text, &table)
            .context("failed to compile routing policy")?;
        info!(
            "Routing policy compiled: {} rules, {} outbounds, final '{}'",
            matcher.rule_count(),
            table.len(),
            table.name(matcher.final_outbound())
        );

        let probe = ProbeConfig {
            target: config.probe.target,
            interval: config.probe.interval,
            timeout: config.probe.timeout,
        };
        for group in &groups {
            group.start_probing(&probe)?;
            let group = Arc::clone(group);
            teardown.push(format!("stop probes of '{}'", group.name()), move || {
                group.stop_probing();
                Ok(())
            });
        }

        let epoch = Arc::new(Epoch::new(epoch));
        Ok(Parts {
            dns: Arc::new(DnsCache::new(Arc::clone(&epoch))),
            epoch,
            matcher: Arc::new(matcher),
            table: Arc::new(table),
            groups: Arc::new(groups),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Epoch written to the interception layer by this instance
    pub fn epoch(&self) -> u32 {
        self.epoch.current()
    }

    pub fn dns_cache(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    pub fn matcher(&self) -> &CompiledMatcher {
        &self.matcher
    }

    pub fn outbound_table(&self) -> &OutboundTable {
        &self.table
    }

    pub fn groups(&self) -> &[Arc<OutboundGroup>] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Arc<OutboundGroup>> {
        self.table.id(name).and_then(|id| self.groups.get(id.index()))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn decide(&self, meta: &ConnectionMeta) -> OutboundId {
        self.matcher.decide(meta)
    }

    /// Record the link's addresses and install its hooks
    pub fn bind_link(&self, ifname: &str) -> Result<()> {
        let link = self
            .interception
            .link(ifname)
            .with_context(|| format!("cannot bind link '{}'", ifname))?;

        let record = IfIpRecord::from_addrs(&link.addrs);
        if !record.has_ip4 && !record.has_ip6 {
            warn!("Link '{}' has no routable address", ifname);
        }
        self.interception
            .update_link_ip(link.index, record)
            .with_context(|| format!("failed to record addresses of '{}'", ifname))?;

        for hook in LINK_HOOKS {
            self.install_hook(link.index, hook)
                .with_context(|| format!("failed to install {} hook on '{}'", hook, ifname))?;

            let layer = Arc::clone(&self.interception);
            let index = link.index;
            self.teardown
                .push(format!("uninstall {} hook on '{}'", hook, ifname), move || {
                    layer
                        .uninstall_hook(index, hook)
                        .with_context(|| format!("failed to uninstall {} hook", hook))
                });
        }

        info!("Bound link '{}' (index {})", ifname, link.index);
        Ok(())
    }

    /// Install a hook, replacing one left behind by an earlier run
    fn install_hook(
        &self,
        ifindex: u32,
        hook: HookPoint,
    ) -> std::result::Result<(), InterceptionError> {
        match self.interception.install_hook(ifindex, hook) {
            Err(InterceptionError::AlreadyExists { .. }) => {
                debug!("Replacing stale {} hook on link {}", hook, ifindex);
                self.interception.uninstall_hook(ifindex, hook)?;
                self.interception.install_hook(ifindex, hook)
            }
            other => other,
        }
    }

    /// Bind TCP and UDP on `0.0.0.0:<port>` and publish the port. Port 0
    /// picks a free TCP port and reuses it for UDP.
    pub async fn listen(&self, port: u16) -> Result<Listeners> {
        let tcp = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
            .with_context(|| format!("failed to bind TCP port {}", port))?;
        let port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
            .with_context(|| format!("failed to bind UDP port {}", port))?;

        self.interception
            .update_param(ParamKey::TproxyPort, u32::from(port.to_be()))
            .context("failed to publish listening port")?;

        let shutdown = self.shutdown.clone();
        self.teardown.push("stop listeners", move || {
            shutdown.trigger();
            Ok(())
        });

        info!("Listening on 0.0.0.0:{} (TCP and UDP)", port);
        Ok(Listeners {
            tcp,
            udp: Arc::new(udp),
        })
    }

    /// Run both accept loops until shutdown. A listener failure stops the
    /// other loop too and is returned.
    pub async fn serve(&self, listeners: Listeners) -> Result<()> {
        let Listeners { tcp, udp } = listeners;
        let tcp = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let signal = self.shutdown.subscribe();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let result = dispatcher.serve_tcp(tcp, signal).await;
                if result.is_err() {
                    shutdown.trigger();
                }
                result
            })
        };
        let udp = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let signal = self.shutdown.subscribe();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let result = dispatcher.serve_udp(udp, signal).await;
                if result.is_err() {
                    shutdown.trigger();
                }
                result
            })
        };

        let (tcp, udp) = tokio::join!(tcp, udp);
        self.in_flight
            .wait_idle(self.config.server.shutdown_timeout)
            .await;

        tcp.context("TCP accept loop panicked")??;
        udp.context("UDP receive loop panicked")??;
        Ok(())
    }

    pub async fn listen_and_serve(&self, port: u16) -> Result<()> {
        let listeners = self.listen(port).await?;
        self.serve(listeners).await
    }

    /// Stop dispatch, wait for in-flight work within the shutdown timeout and
    /// release everything in reverse acquisition order. A second call is a
    /// no-op.
    pub async fn close(&self) -> std::result::Result<(), TeardownError> {
        info!("Closing control plane");
        self.shutdown.trigger();
        if !self.in_flight.wait_idle(self.shutdown_timeout()).await {
            warn!("Closing with {} tasks still in flight", self.in_flight.count());
        }

        let result = self.teardown.close();
        self.dispatcher.clear_udp_flows();
        match &result {
            Ok(()) => info!("Control plane closed"),
            Err(e) => error!("Control plane closed with errors: {}", e),
        }
        result
    }

    fn shutdown_timeout(&self) -> Duration {
        self.config.server.shutdown_timeout
    }
}

/// Load the interception objects, clearing incompatible pinned objects left
/// behind by older builds
fn load_objects(layer: &dyn InterceptionLayer) -> Result<()> {
    let mut retries = 0;
    loop {
        match layer.load_objects() {
            Ok(()) => return Ok(()),
            Err(InterceptionError::Incompatible { object }) if retries < MAX_LOAD_RETRIES => {
                retries += 1;
                warn!(
                    "Pinned object '{}' is incompatible, removing it (retry {}/{})",
                    object, retries, MAX_LOAD_RETRIES
                );
                layer
                    .remove_pinned(&object)
                    .with_context(|| format!("failed to remove pinned object '{}'", object))?;
            }
            Err(e) => return Err(e).context("failed to load interception objects"),
        }
    }
}

/// Configured groups plus a built-in `direct` group at id 0 when the
/// configuration does not declare one
fn build_groups(config: &Config) -> Result<Vec<Arc<OutboundGroup>>> {
    let mut groups = Vec::with_capacity(config.outbounds.len() + 1);

    if !config.outbounds.iter().any(|o| o.name == DIRECT_OUTBOUND) {
        let direct = Arc::new(Dialer::new(DIRECT_OUTBOUND, Box::new(DirectConnector)));
        groups.push(Arc::new(OutboundGroup::new(
            DIRECT_OUTBOUND,
            vec![direct],
            SelectionPolicy::default(),
        )?));
    }

    for outbound in &config.outbounds {
        let dialers = outbound
            .dialers
            .iter()
            .map(|link| -> Result<Arc<Dialer>> {
                let connector = parse_link(link)
                    .with_context(|| format!("outbound '{}'", outbound.name))?;
                Ok(Arc::new(Dialer::new(dialer_label(link), connector)))
            })
            .collect::<Result<Vec<_>>>()?;

        groups.push(Arc::new(OutboundGroup::new(
            outbound.name.clone(),
            dialers,
            outbound.policy,
        )?));
        debug!(
            "Outbound '{}': {} dialers, {}",
            outbound.name,
            outbound.dialers.len(),
            outbound.policy
        );
    }

    Ok(groups)
}

/// Link text without credentials
fn dialer_label(link: &str) -> String {
    match (link.split_once("://"), link.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, server))) => format!("{}://{}", scheme, server),
        _ => link.to_string(),
    }
}
