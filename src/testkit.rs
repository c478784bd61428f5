//! Shared test doubles and fixtures

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collab::{
    IcmpListener, PolicyDecider, PreAuthPorts, ProcessResolver, StaticHostAddrs, StreamInspector,
    TunnelClient,
};
use crate::config::FirewallConfig;
use crate::conn::{ConnectionState, ProcessInfo, RemoteEntity};
use crate::core::{CoreBuilder, FirewallCore};
use crate::driver::{QueueDriver, RecordingSlot, VerdictRecord, VerdictSlot};
use crate::error::{FirewallError, FirewallResult};
use crate::ipscope;
use crate::packet::{ConnectionId, Direction, Packet, PacketInfo, Protocol};
use crate::verdict::{Reason, Verdict};

// ---------------------------------------------------------------------------
// packet fixtures
// ---------------------------------------------------------------------------

fn parse_endpoint(ep: &str) -> (IpAddr, u16) {
    let addr: SocketAddr = ep.parse().expect("bad endpoint in test");
    (addr.ip(), addr.port())
}

pub(crate) fn tcp_info(src: &str, dst: &str, direction: Direction) -> PacketInfo {
    let (src, src_port) = parse_endpoint(src);
    let (dst, dst_port) = parse_endpoint(dst);
    PacketInfo {
        src,
        dst,
        src_port,
        dst_port,
        protocol: Protocol::Tcp,
        direction,
    }
}

pub(crate) fn udp_info(src: &str, dst: &str, direction: Direction) -> PacketInfo {
    PacketInfo {
        protocol: Protocol::Udp,
        ..tcp_info(src, dst, direction)
    }
}

pub(crate) fn icmp4_info(src: &str, dst: &str, direction: Direction) -> PacketInfo {
    PacketInfo {
        src: src.parse().unwrap(),
        dst: dst.parse().unwrap(),
        src_port: 0,
        dst_port: 0,
        protocol: Protocol::Icmp4,
        direction,
    }
}

pub(crate) fn icmp6_info(src: &str, dst: &str, direction: Direction) -> PacketInfo {
    PacketInfo {
        protocol: Protocol::Icmp6,
        ..icmp4_info(src, dst, direction)
    }
}

/// Minimal IPv4 packet carrying an ICMP header.
pub(crate) fn icmp4_packet_bytes(icmp_type: u8, code: u8) -> Vec<u8> {
    let mut raw = vec![0u8; 28];
    raw[0] = 0x45;
    raw[9] = 1;
    raw[20] = icmp_type;
    raw[21] = code;
    raw
}

/// Minimal IPv6 packet carrying an ICMPv6 header.
pub(crate) fn icmp6_packet_bytes(icmp_type: u8, code: u8) -> Vec<u8> {
    let mut raw = vec![0u8; 48];
    raw[0] = 0x60;
    raw[6] = 58;
    raw[40] = icmp_type;
    raw[41] = code;
    raw
}

/// Standalone verdict slot writing into a fresh log.
pub(crate) fn recording_slot(conn: ConnectionId) -> (Box<dyn VerdictSlot>, VerdictRecord) {
    let log: VerdictRecord = Arc::new(Mutex::new(Vec::new()));
    (Box::new(RecordingSlot::new(conn, log.clone())), log)
}

/// Install a test subscriber so traced lines show up in test output.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll until the driver saw `n` verdicts.
pub(crate) async fn wait_for_applied(driver: &QueueDriver, n: usize) {
    for _ in 0..400 {
        if driver.applied_count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {} verdicts, saw {}",
        n,
        driver.applied_count()
    );
}

// ---------------------------------------------------------------------------
// collaborator doubles
// ---------------------------------------------------------------------------

/// Policy double answering every decision the same way.
pub(crate) struct ScriptedPolicy {
    verdict: Verdict,
    reason: &'static str,
    inspecting: bool,
    calls: AtomicUsize,
}

impl ScriptedPolicy {
    pub(crate) fn accepting() -> Self {
        Self {
            verdict: Verdict::Accept,
            reason: "allowed by rulebook",
            inspecting: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn blocking() -> Self {
        Self {
            verdict: Verdict::Block,
            reason: "blocked by rulebook",
            inspecting: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn accepting_with_inspection() -> Self {
        Self {
            inspecting: true,
            ..Self::accepting()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyDecider for ScriptedPolicy {
    async fn decide(&self, _conn: &ConnectionId, state: &mut ConnectionState, pkt: &Packet) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let dst = pkt.info().dst;
        state.entity = Some(RemoteEntity {
            ip: dst,
            domain: None,
            country: None,
            scope: ipscope::classify(dst),
        });
        state.set_verdict(self.verdict, Reason::new(self.reason));
        state.inspecting = self.inspecting;
    }
}

/// Policy double that never answers.
pub(crate) struct StallingPolicy;

#[async_trait]
impl PolicyDecider for StallingPolicy {
    async fn decide(&self, _conn: &ConnectionId, _state: &mut ConnectionState, _pkt: &Packet) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// Inspector that blocks the flow on its nth packet.
pub(crate) struct BlockOnNth {
    n: usize,
    reason: &'static str,
    seen: AtomicUsize,
}

impl BlockOnNth {
    pub(crate) fn new(n: usize, reason: &'static str) -> Self {
        Self {
            n,
            reason,
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StreamInspector for BlockOnNth {
    fn initialize(&self, _conn: &ConnectionId, _state: &mut ConnectionState, _pkt: &Packet) {}

    async fn handle_packet(
        &self,
        _conn: &ConnectionId,
        state: &mut ConnectionState,
        _pkt: &Packet,
    ) -> FirewallResult<(Verdict, Option<Reason>)> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= self.n {
            state.inspecting = false;
            Ok((Verdict::Block, Some(Reason::new(self.reason))))
        } else {
            Ok((Verdict::Undecided, None))
        }
    }
}

/// Inspector whose parser always fails.
pub(crate) struct FailingInspector;

#[async_trait]
impl StreamInspector for FailingInspector {
    fn initialize(&self, _conn: &ConnectionId, _state: &mut ConnectionState, _pkt: &Packet) {}

    async fn handle_packet(
        &self,
        _conn: &ConnectionId,
        _state: &mut ConnectionState,
        _pkt: &Packet,
    ) -> FirewallResult<(Verdict, Option<Reason>)> {
        Err(FirewallError::Inspection("stream desynchronized".into()))
    }
}

/// Tunnel double with a fixed sluice answer.
pub(crate) struct SluiceTunnel {
    accept: bool,
    requests: AtomicUsize,
}

impl SluiceTunnel {
    pub(crate) fn with_pending_request() -> Self {
        Self {
            accept: true,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn without_pending_request() -> Self {
        Self {
            accept: false,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelClient for SluiceTunnel {
    fn client_ready(&self) -> bool {
        true
    }

    async fn await_request(
        &self,
        _info: &PacketInfo,
        _domain: Option<&str>,
    ) -> FirewallResult<()> {
        if self.accept {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(FirewallError::Driver("no pending tunnel request".into()))
        }
    }
}

/// ICMP listener counting submissions.
pub(crate) struct CountingIcmp {
    keep: bool,
    submitted: AtomicUsize,
}

impl CountingIcmp {
    pub(crate) fn new(keep: bool) -> Self {
        Self {
            keep,
            submitted: AtomicUsize::new(0),
        }
    }

    pub(crate) fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl IcmpListener for CountingIcmp {
    fn submit(&self, _pkt: &Packet) -> bool {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.keep
    }
}

struct FixedPreAuth {
    ports: Vec<(Protocol, u16)>,
}

impl PreAuthPorts for FixedPreAuth {
    fn is_pre_authenticated(&self, protocol: Protocol, local_port: u16) -> bool {
        self.ports.contains(&(protocol, local_port))
    }
}

struct FixedProcess {
    pid: u32,
}

impl ProcessResolver for FixedProcess {
    fn lookup(&self, _info: &PacketInfo) -> Option<ProcessInfo> {
        Some(ProcessInfo {
            pid: self.pid,
            name: Some("guardian".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// core fixture
// ---------------------------------------------------------------------------

/// Builder for a core wired to a fresh [`QueueDriver`].
pub(crate) struct TestCore {
    policy: Arc<dyn PolicyDecider>,
    inspector: Option<Arc<dyn StreamInspector>>,
    tunnel: Option<Arc<dyn TunnelClient>>,
    icmp: Option<Arc<dyn IcmpListener>>,
    my_ips: Vec<IpAddr>,
    preauth: Vec<(Protocol, u16)>,
    procs: Option<u32>,
    config: FirewallConfig,
}

pub(crate) fn core() -> TestCore {
    TestCore {
        policy: Arc::new(ScriptedPolicy::accepting()),
        inspector: None,
        tunnel: None,
        icmp: None,
        my_ips: Vec::new(),
        preauth: Vec::new(),
        procs: None,
        config: FirewallConfig::default(),
    }
}

impl TestCore {
    pub(crate) fn policy(mut self, policy: Arc<dyn PolicyDecider>) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) fn inspector(mut self, inspector: Arc<dyn StreamInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub(crate) fn tunnel(mut self, tunnel: Arc<dyn TunnelClient>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub(crate) fn icmp(mut self, icmp: Arc<dyn IcmpListener>) -> Self {
        self.icmp = Some(icmp);
        self
    }

    pub(crate) fn my_ips(mut self, ips: &[&str]) -> Self {
        self.my_ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self
    }

    pub(crate) fn api_endpoint(mut self, endpoint: &str) -> Self {
        self.config.api_endpoint = Some(endpoint.parse().unwrap());
        self
    }

    pub(crate) fn preauth(mut self, protocol: Protocol, port: u16) -> Self {
        self.preauth.push((protocol, port));
        self
    }

    pub(crate) fn procs(mut self, pid: u32) -> Self {
        self.procs = Some(pid);
        self
    }

    pub(crate) fn filter_enabled(mut self, enabled: bool) -> Self {
        self.config.filter_enabled = enabled;
        self
    }

    pub(crate) fn deadline_ms(mut self, ms: u64) -> Self {
        self.config.collaborator_deadline_ms = ms;
        self
    }

    pub(crate) fn build_for_test(self) -> (Arc<FirewallCore>, Arc<QueueDriver>) {
        let driver = Arc::new(QueueDriver::new());
        let mut builder: CoreBuilder = FirewallCore::builder(driver.clone(), self.policy);
        if let Some(inspector) = self.inspector {
            builder = builder.inspector(inspector);
        }
        if let Some(tunnel) = self.tunnel {
            builder = builder.tunnel(tunnel);
        }
        if let Some(icmp) = self.icmp {
            builder = builder.icmp_listener(icmp);
        }
        if !self.my_ips.is_empty() {
            builder = builder.host_addrs(Arc::new(StaticHostAddrs::with_addrs(self.my_ips)));
        }
        if !self.preauth.is_empty() {
            builder = builder.pre_auth_ports(Arc::new(FixedPreAuth {
                ports: self.preauth,
            }));
        }
        if let Some(pid) = self.procs {
            builder = builder.process_resolver(Arc::new(FixedProcess { pid }));
        }
        let core = builder.config(self.config).build();
        (core, driver)
    }
}
