//! Tests for the routing compiler pipeline

use std::fs;
use std::net::SocketAddr;

use tempfile::TempDir;
use tproute::routing::{
    CompiledMatcher, ConnectionMeta, DataFileOptimizer, DeduplicateOptimizer, L4Proto,
    MergeAndSortOptimizer, OutboundId, OutboundTable, RefineParamKeyOptimizer, RoutingCompiler,
    RoutingError, RulesOptimizer,
};

const POLICY: &str = "
# local networks first
ip(geoip: private) -> direct
sip(192.168.100.0/24) && !port(53) -> block

domain(geosite: streaming) -> proxy
domain(keyword: tracker) -> block
domain(example.org) -> proxy
domain(full: api.example.org) -> alt
port(22) -> alt
l4proto(udp) && port(443) -> block
domain(example.org) -> proxy
ipversion(6) && port(80-90) -> proxy
sport(5000:5100) -> alt
final: direct
";

fn data_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("geosite")).unwrap();
    fs::create_dir_all(dir.path().join("geoip")).unwrap();
    fs::write(
        dir.path().join("geosite/streaming.list"),
        "netflix.com\nfull:www.youtube.com\nkeyword:hulu\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("geoip/private.json"),
        r#"["10.0.0.0/8", "172.16.0.0/12", "fc00::/7"]"#,
    )
    .unwrap();
    dir
}

fn table() -> OutboundTable {
    OutboundTable::new(["direct", "proxy", "alt"]).unwrap()
}

fn grid() -> Vec<ConnectionMeta> {
    let sources = ["192.168.1.10:40000", "192.168.100.7:5050", "[fd00::2]:5001"];
    let destinations = [
        "10.1.2.3:443",
        "8.8.8.8:53",
        "93.184.216.34:22",
        "93.184.216.34:443",
        "[2001:db8::1]:85",
        "[fc00::1]:443",
    ];
    let domains = [
        None,
        Some("www.netflix.com"),
        Some("www.youtube.com"),
        Some("youtube.com"),
        Some("cdn.hulu.net"),
        Some("my-tracker.io"),
        Some("api.example.org"),
        Some("example.org"),
    ];

    let mut grid = Vec::new();
    for src in sources {
        for dst in destinations {
            for domain in domains {
                for proto in [L4Proto::Tcp, L4Proto::Udp] {
                    let src: SocketAddr = src.parse().unwrap();
                    let dst: SocketAddr = dst.parse().unwrap();
                    let mut meta = ConnectionMeta::new(src, dst, proto);
                    if let Some(domain) = domain {
                        meta = meta.with_domain(domain);
                    }
                    grid.push(meta);
                }
            }
        }
    }
    grid
}

fn unoptimized(dir: &TempDir) -> RoutingCompiler {
    RoutingCompiler::with_optimizers(vec![
        Box::new(RefineParamKeyOptimizer),
        Box::new(DataFileOptimizer::new(dir.path())),
    ])
}

#[test]
fn test_optimization_preserves_decisions() {
    let dir = data_dir();
    let table = table();

    let baseline = unoptimized(&dir).build(POLICY, &table).unwrap();
    let optimized = RoutingCompiler::new(dir.path()).build(POLICY, &table).unwrap();

    assert!(optimized.rule_count() < baseline.rule_count());
    for meta in grid() {
        assert_eq!(
            baseline.decide(&meta),
            optimized.decide(&meta),
            "decision changed for {:?}",
            meta
        );
    }
}

#[test]
fn test_merge_and_sort_keeps_winning_outbound() {
    let dir = data_dir();
    let table = table();
    let base = unoptimized(&dir);
    let policy = base.compile(POLICY).unwrap();

    let merged = MergeAndSortOptimizer.optimize(policy.clone()).unwrap();
    let before = CompiledMatcher::build(&policy, &table).unwrap();
    let after = CompiledMatcher::build(&merged, &table).unwrap();

    for meta in grid() {
        assert_eq!(before.decide(&meta), after.decide(&meta), "{:?}", meta);
    }
}

#[test]
fn test_deduplication_is_idempotent() {
    let dir = data_dir();
    let policy = RoutingCompiler::new(dir.path()).compile(POLICY).unwrap();

    let once = DeduplicateOptimizer.optimize(policy.clone()).unwrap();
    let twice = DeduplicateOptimizer.optimize(once.clone()).unwrap();
    assert_eq!(policy, once);
    assert_eq!(once, twice);
}

#[test]
fn test_spot_decisions() {
    let dir = data_dir();
    let table = table();
    let matcher = RoutingCompiler::new(dir.path()).build(POLICY, &table).unwrap();

    let tcp = |src: &str, dst: &str| {
        ConnectionMeta::new(src.parse().unwrap(), dst.parse().unwrap(), L4Proto::Tcp)
    };

    assert_eq!(
        matcher.decide(&tcp("192.168.1.10:40000", "10.9.9.9:443")),
        table.id("direct").unwrap()
    );
    assert_eq!(
        matcher.decide(&tcp("192.168.100.7:40000", "8.8.4.4:443")),
        OutboundId::BLOCK
    );
    assert_eq!(
        matcher.decide(
            &tcp("192.168.1.10:40000", "93.184.216.34:443").with_domain("www.youtube.com")
        ),
        table.id("proxy").unwrap()
    );
    assert_eq!(
        matcher.decide(
            &tcp("192.168.1.10:40000", "93.184.216.34:443").with_domain("api.example.org")
        ),
        table.id("proxy").unwrap()
    );
    assert_eq!(
        matcher.decide(&tcp("192.168.1.10:40000", "93.184.216.34:22")),
        table.id("alt").unwrap()
    );
    // sport(5000:5100)
    assert_eq!(
        matcher.decide(&tcp("192.168.1.10:5050", "93.184.216.34:443")),
        table.id("alt").unwrap()
    );
    assert_eq!(
        matcher.decide(&tcp("192.168.1.10:5101", "93.184.216.34:443")),
        table.id("direct").unwrap()
    );
}

#[test]
fn test_colon_and_dash_port_ranges_agree() {
    let table = table();
    let compiler = RoutingCompiler::new("/nonexistent");
    let colon = compiler.build("sport(5000:5100) -> alt\nfinal: direct", &table).unwrap();
    let dash = compiler.build("sport(5000-5100) -> alt\nfinal: direct", &table).unwrap();
    let keyed = compiler.build("sport(port: 5000:5100) -> alt\nfinal: direct", &table).unwrap();

    for sport in [4999u16, 5000, 5050, 5100, 5101] {
        let meta = ConnectionMeta::new(
            SocketAddr::new("192.168.1.10".parse().unwrap(), sport),
            "93.184.216.34:443".parse().unwrap(),
            L4Proto::Tcp,
        );
        assert_eq!(colon.decide(&meta), dash.decide(&meta), "sport {}", sport);
        assert_eq!(colon.decide(&meta), keyed.decide(&meta), "sport {}", sport);
    }
}

#[test]
fn test_outbound_limit() {
    let names: Vec<String> = (0..255).map(|i| format!("o{}", i)).collect();
    let table = OutboundTable::new(names.clone()).unwrap();
    let matcher = RoutingCompiler::new("/nonexistent")
        .build("port(1) -> o254\nfinal: o0", &table)
        .unwrap();
    assert_eq!(matcher.final_outbound(), OutboundId(0));

    let mut names = names;
    names.push("o255".to_string());
    assert!(matches!(OutboundTable::new(names), Err(RoutingError::Build(_))));
}

#[test]
fn test_error_kinds() {
    let dir = data_dir();
    fs::write(dir.path().join("geoip/broken.list"), "not-a-cidr\n").unwrap();
    let compiler = RoutingCompiler::new(dir.path());
    let table = table();

    assert!(matches!(
        compiler.compile("port(22) -> alt\n"),
        Err(RoutingError::Syntax { line: 1, .. })
    ));
    assert!(matches!(
        compiler.compile("final: direct\ndomain(weird: x) -> proxy\n"),
        Err(RoutingError::Syntax { line: 2, .. })
    ));
    assert!(matches!(
        compiler.compile("domain(geosite: missing) -> proxy\nfinal: direct"),
        Err(RoutingError::NotFound { .. })
    ));
    assert!(matches!(
        compiler.compile("ip(geoip: broken) -> proxy\nfinal: direct"),
        Err(RoutingError::Format { .. })
    ));
    assert!(matches!(
        compiler.build("port(22) -> nowhere\nfinal: direct", &table),
        Err(RoutingError::Build(_))
    ));
}
