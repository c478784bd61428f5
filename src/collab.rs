//! Collaborator contracts
//!
//! The core orchestrates these external components; only their contracts
//! live here. All async calls are suspension points and must honor the
//! configured deadline.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::conn::{ConnectionState, ProcessInfo};
use crate::error::FirewallResult;
use crate::packet::{ConnectionId, Packet, PacketInfo, Protocol};
use crate::verdict::{Reason, Verdict};

/// Policy engine deciding on new connections.
#[async_trait]
pub trait PolicyDecider: Send + Sync {
    /// Decide on a connection: sets verdict, reason and the inspecting
    /// flag on `state`; may populate entity and process.
    async fn decide(&self, conn: &ConnectionId, state: &mut ConnectionState, pkt: &Packet);
}

/// Protocol-aware deep inspection of an ongoing flow.
#[async_trait]
pub trait StreamInspector: Send + Sync {
    /// Set up per-protocol inspectors for a flow entering inspection.
    fn initialize(&self, conn: &ConnectionId, state: &mut ConnectionState, pkt: &Packet);

    /// Inspect one packet. May clear `state.inspecting` when done with
    /// the flow.
    async fn handle_packet(
        &self,
        conn: &ConnectionId,
        state: &mut ConnectionState,
        pkt: &Packet,
    ) -> FirewallResult<(Verdict, Option<Reason>)>;
}

/// Client side of the encrypted overlay tunnel.
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Whether the tunnel is connected and accepting flows.
    fn client_ready(&self) -> bool;

    /// Rendezvous with a pending tunnel request for this flow. An error
    /// means the flow is not tunneled.
    async fn await_request(&self, info: &PacketInfo, domain: Option<&str>) -> FirewallResult<()>;
}

/// Observer of non-echo ICMP traffic.
pub trait IcmpListener: Send + Sync {
    /// Offer a packet for observation. Returning true means the listener
    /// wants to keep seeing packets of this flow.
    fn submit(&self, pkt: &Packet) -> bool;
}

/// Ports registered by the daemon for its own outgoing sockets.
pub trait PreAuthPorts: Send + Sync {
    /// Whether a local port was pre-authenticated for this protocol.
    fn is_pre_authenticated(&self, protocol: Protocol, local_port: u16) -> bool;
}

/// Addresses assigned to this host.
pub trait HostAddrs: Send + Sync {
    /// Whether `ip` is one of this host's own addresses.
    fn is_my_ip(&self, ip: IpAddr) -> FirewallResult<bool>;
}

/// Process attribution for new connections.
pub trait ProcessResolver: Send + Sync {
    /// Resolve the process owning the socket behind `info`, if possible.
    fn lookup(&self, info: &PacketInfo) -> Option<ProcessInfo>;
}

/// [`HostAddrs`] backed by a fixed, updatable address set.
#[derive(Debug, Default)]
pub struct StaticHostAddrs {
    addrs: RwLock<HashSet<IpAddr>>,
}

impl StaticHostAddrs {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set backed by the given addresses.
    pub fn with_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: RwLock::new(addrs.into_iter().collect()),
        }
    }

    /// Add an address.
    pub fn add(&self, ip: IpAddr) {
        self.addrs.write().insert(ip);
    }

    /// Remove an address.
    pub fn remove(&self, ip: IpAddr) {
        self.addrs.write().remove(&ip);
    }
}

impl HostAddrs for StaticHostAddrs {
    fn is_my_ip(&self, ip: IpAddr) -> FirewallResult<bool> {
        if ip.is_loopback() {
            return Ok(true);
        }
        Ok(self.addrs.read().contains(&ip))
    }
}

/// [`PreAuthPorts`] for hosts without a port registry.
#[derive(Debug, Default)]
pub struct NoPreAuth;

impl PreAuthPorts for NoPreAuth {
    fn is_pre_authenticated(&self, _protocol: Protocol, _local_port: u16) -> bool {
        false
    }
}

/// [`IcmpListener`] that never keeps flows.
#[derive(Debug, Default)]
pub struct NoIcmpListener;

impl IcmpListener for NoIcmpListener {
    fn submit(&self, _pkt: &Packet) -> bool {
        false
    }
}
