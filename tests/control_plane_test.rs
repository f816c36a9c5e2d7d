//! End-to-end tests for the control plane against the in-memory
//! interception layer

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tproute::config::Config;
use tproute::control::MAX_LOAD_RETRIES;
use tproute::interception::{
    to_words, ChecksumPolicy, HookPoint, InterceptionLayer, MemoryInterception, ParamKey,
};
use tproute::protocol::OriginalDestinationHeader;
use tproute::routing::{ConnectionMeta, L4Proto, OutboundId};
use tproute::ControlPlane;

const WAIT: Duration = Duration::from_secs(5);

fn config(policy: &str) -> Config {
    let mut config = Config::default();
    config.routing.policy = Some(policy.to_string());
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.server.header_timeout = Duration::from_secs(2);
    config.server.udp_session_timeout = Duration::from_secs(2);
    config
}

fn layer() -> Arc<MemoryInterception> {
    let addrs: Vec<IpAddr> = ["fe80::1", "192.168.1.2", "2001:db8::2"]
        .iter()
        .map(|a| a.parse().unwrap())
        .collect();
    Arc::new(MemoryInterception::new().with_link("eth0", 2, addrs))
}

async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

async fn start(plane: &Arc<ControlPlane>) -> (u16, JoinHandle<anyhow::Result<()>>) {
    let listeners = plane.listen(0).await.unwrap();
    let port = listeners.port();
    let serving = Arc::clone(plane);
    let handle = tokio::spawn(async move { serving.serve(listeners).await });
    (port, handle)
}

#[tokio::test]
async fn test_epoch_increments_per_construction() {
    let layer = layer();

    let first = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();
    assert_eq!(first.epoch(), 1);
    assert_eq!(layer.param(ParamKey::Epoch), Some(1));
    first.close().await.unwrap();
    assert!(!layer.is_loaded());

    let second = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();
    assert_eq!(second.epoch(), 2);
    assert_eq!(layer.param(ParamKey::Epoch), Some(2));
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_checksum_slots_are_set_to_zero() {
    let layer = layer();
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();

    let set_zero = u32::from(ChecksumPolicy::SetZero);
    assert_eq!(layer.param(ParamKey::DisableL4TxChecksum), Some(set_zero));
    assert_eq!(layer.param(ParamKey::DisableL4RxChecksum), Some(set_zero));
    plane.close().await.unwrap();
}

#[tokio::test]
async fn test_incompatible_object_is_cleared_and_retried() {
    let layer = Arc::new(MemoryInterception::new().with_incompatible("routing_map"));
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();

    assert_eq!(layer.load_attempts(), 2);
    assert_eq!(layer.removed_objects(), vec!["routing_map".to_string()]);
    assert!(layer.is_loaded());
    plane.close().await.unwrap();
}

#[tokio::test]
async fn test_persistent_incompatibility_is_fatal() {
    let layer = Arc::new(MemoryInterception::new().with_persistent_incompatibility("routing_map"));
    let result = ControlPlane::new(config("final: direct"), layer.clone());

    assert!(result.is_err());
    assert_eq!(layer.load_attempts(), MAX_LOAD_RETRIES + 1);
    assert!(!layer.is_loaded());
}

#[tokio::test]
async fn test_failed_construction_releases_interception_objects() {
    let layer = layer();
    let result = ControlPlane::new(config("port(22) -> nowhere\nfinal: direct"), layer.clone());

    assert!(result.is_err());
    assert!(!layer.is_loaded());
}

#[tokio::test]
async fn test_builtin_direct_and_decisions() {
    let mut config = config("port(22) -> proxy\nport(23) -> block\nfinal: direct");
    config.outbounds.push(tproute::config::OutboundConfig {
        name: "proxy".to_string(),
        dialers: vec!["socks5://127.0.0.1:1080".to_string()],
        policy: Default::default(),
    });
    let plane = ControlPlane::new(config, layer()).unwrap();

    let table = plane.outbound_table();
    assert_eq!(table.names(), &["direct".to_string(), "proxy".to_string()]);

    let meta = |port: u16| {
        ConnectionMeta::new(
            "192.168.1.5:40000".parse().unwrap(),
            SocketAddr::new("93.184.216.34".parse().unwrap(), port),
            L4Proto::Tcp,
        )
    };
    assert_eq!(plane.decide(&meta(22)), OutboundId(1));
    assert_eq!(plane.decide(&meta(23)), OutboundId::BLOCK);
    assert_eq!(plane.decide(&meta(443)), OutboundId(0));
    assert_eq!(plane.group("proxy").map(|g| g.dialers().len()), Some(1));
    plane.close().await.unwrap();
}

#[tokio::test]
async fn test_bind_link_records_addresses_and_hooks() {
    let layer = Arc::new(
        MemoryInterception::new()
            .with_link("eth0", 2, vec!["10.0.0.2".parse().unwrap()])
            .with_hook(2, HookPoint::Ingress),
    );
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();

    plane.bind_link("eth0").unwrap();
    let record = layer.link_ip(2).unwrap();
    assert!(record.has_ip4);
    assert!(!record.has_ip6);
    assert_eq!(record.ip4, to_words("10.0.0.2".parse().unwrap()));
    assert_eq!(layer.hook_count(), 3);

    assert!(plane.bind_link("wlan9").is_err());

    plane.close().await.unwrap();
    assert_eq!(layer.hook_count(), 0);
    assert!(!layer.is_loaded());
}

#[tokio::test]
async fn test_close_collects_failures_and_keeps_going() {
    let layer = Arc::new(
        MemoryInterception::new()
            .with_link("eth0", 2, vec!["10.0.0.2".parse().unwrap()])
            .with_failing_uninstall(HookPoint::Ingress),
    );
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();
    plane.bind_link("eth0").unwrap();

    let err = plane.close().await.unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert!(err.to_string().contains("ingress"));

    // the steps registered before the failing one still ran
    assert!(!layer.has_hook(2, HookPoint::Egress));
    assert!(!layer.has_hook(2, HookPoint::Clsact));
    assert!(!layer.is_loaded());

    // nothing left to release
    assert!(plane.close().await.is_ok());
}

#[tokio::test]
async fn test_listen_publishes_port() {
    let layer = layer();
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();

    let listeners = plane.listen(0).await.unwrap();
    let port = listeners.port();
    assert_ne!(port, 0);
    assert_eq!(listeners.udp.local_addr().unwrap().port(), port);
    assert_eq!(layer.param(ParamKey::TproxyPort), Some(u32::from(port.to_be())));

    drop(listeners);
    plane.close().await.unwrap();
}

#[tokio::test]
async fn test_tcp_dispatch_through_direct() {
    let echo = tcp_echo_server().await;
    let plane = Arc::new(ControlPlane::new(config("final: direct"), layer()).unwrap());
    let (port, server) = start(&plane).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(&OriginalDestinationHeader::new(echo).to_bytes())
        .await
        .unwrap();
    client.write_all(b"hello through tproute").await.unwrap();

    let mut buf = [0u8; 21];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello through tproute");
    drop(client);

    plane.close().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_blocked_and_malformed_connections_are_dropped() {
    let echo = tcp_echo_server().await;
    let policy = format!("port({}) -> block\nfinal: direct", echo.port());
    let plane = Arc::new(ControlPlane::new(config(&policy), layer()).unwrap());
    let (port, server) = start(&plane).await;

    let mut blocked = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    blocked
        .write_all(&OriginalDestinationHeader::new(echo).to_bytes())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(WAIT, blocked.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let mut malformed = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    malformed.write_all(&[9, 1, 2, 3, 4, 0, 80]).await.unwrap();
    let read = timeout(WAIT, malformed.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // the accept loop survived both
    assert!(!server.is_finished());

    plane.close().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_udp_dispatch_returns_prefixed_replies() {
    let echo = udp_echo_server().await;
    let plane = Arc::new(ControlPlane::new(config("final: direct"), layer()).unwrap());
    let (port, server) = start(&plane).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = OriginalDestinationHeader::new(echo).to_bytes().to_vec();
    packet.extend_from_slice(b"ping");
    client.send_to(&packet, ("127.0.0.1", port)).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    let (header, offset) = OriginalDestinationHeader::parse(&buf[..n]).unwrap();
    assert_eq!(header.destination, echo);
    assert_eq!(&buf[offset..n], b"ping");

    // the second datagram reuses the flow
    client.send_to(&packet, ("127.0.0.1", port)).await.unwrap();
    timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(plane.dispatcher().active_udp_flows(), 1);

    plane.close().await.unwrap();
    assert_eq!(plane.dispatcher().active_udp_flows(), 0);
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_interception_layer_is_object_safe() {
    let layer: Arc<dyn InterceptionLayer> = layer();
    let plane = ControlPlane::new(config("final: direct"), layer.clone()).unwrap();
    assert_eq!(layer.lookup_param(ParamKey::Epoch).unwrap(), Some(1));
    plane.close().await.unwrap();
}

#[tokio::test]
async fn test_cached_domain_drives_tcp_decision() {
    let echo = tcp_echo_server().await;
    let plane = Arc::new(
        ControlPlane::new(config("domain(example.com) -> block\nfinal: direct"), layer()).unwrap(),
    );
    let (port, server) = start(&plane).await;

    // without a cached domain the connection goes direct
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(&OriginalDestinationHeader::new(echo).to_bytes())
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);

    plane
        .dns_cache()
        .store("example.com", vec![echo.ip()], Duration::from_secs(60));

    let mut blocked = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    blocked
        .write_all(&OriginalDestinationHeader::new(echo).to_bytes())
        .await
        .unwrap();
    let _ = blocked.write_all(b"ping").await;
    let read = timeout(WAIT, blocked.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    plane.close().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_cached_domain_drives_udp_decision() {
    let echo = udp_echo_server().await;
    let plane = Arc::new(
        ControlPlane::new(config("domain(suffix: example.com) -> block\nfinal: direct"), layer())
            .unwrap(),
    );
    plane
        .dns_cache()
        .store("www.example.com", vec![echo.ip()], Duration::from_secs(60));
    let (port, server) = start(&plane).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = OriginalDestinationHeader::new(echo).to_bytes().to_vec();
    packet.extend_from_slice(b"ping");
    client.send_to(&packet, ("127.0.0.1", port)).await.unwrap();

    let mut buf = [0u8; 1500];
    let reply = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "blocked datagram was answered");
    assert_eq!(plane.dispatcher().active_udp_flows(), 0);

    plane.close().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}
