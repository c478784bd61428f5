//! Packet abstraction
//!
//! Uniform view of an intercepted IP packet: immutable header metadata,
//! lazy layer parsing, and a write-once verdict slot backed by the
//! driver that produced the packet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::driver::VerdictSlot;
use crate::error::{FirewallError, FirewallResult};
use crate::verdict::Verdict;

/// Layer-4 protocol of a packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMPv4
    Icmp4,
    /// ICMPv6
    Icmp6,
    /// Any other IP protocol, by number
    Other(u8),
}

impl Protocol {
    /// IP protocol number
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp4 => 1,
            Protocol::Icmp6 => 58,
            Protocol::Other(n) => n,
        }
    }

    /// Map an IP protocol number
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp4,
            58 => Protocol::Icmp6,
            other => Protocol::Other(other),
        }
    }

    /// Whether this is ICMPv4 or ICMPv6
    #[inline]
    pub fn is_icmp(self) -> bool {
        matches!(self, Protocol::Icmp4 | Protocol::Icmp6)
    }
}

/// Direction of a flow relative to this host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Not yet set by the driver
    #[default]
    Unknown,
    /// Flow initiated by a remote peer
    Inbound,
    /// Flow initiated by this host
    Outbound,
}

/// Immutable 5-tuple view of a packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketInfo {
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Source port, 0 for portless protocols
    pub src_port: u16,
    /// Destination port, 0 for portless protocols
    pub dst_port: u16,
    /// Layer-4 protocol
    pub protocol: Protocol,
    /// Flow direction, set by the driver before enqueueing
    pub direction: Direction,
}

impl PacketInfo {
    /// Local endpoint of the flow this packet belongs to.
    pub fn local(&self) -> (IpAddr, u16) {
        match self.direction {
            Direction::Inbound => (self.dst, self.dst_port),
            _ => (self.src, self.src_port),
        }
    }

    /// Remote endpoint of the flow this packet belongs to.
    pub fn remote(&self) -> (IpAddr, u16) {
        match self.direction {
            Direction::Inbound => (self.src, self.src_port),
            _ => (self.dst, self.dst_port),
        }
    }

    /// Canonical connection id of the flow this packet belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        let (local_ip, local_port) = self.local();
        let (remote_ip, remote_port) = self.remote();
        ConnectionId {
            protocol: self.protocol,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            inbound: self.direction == Direction::Inbound,
        }
    }
}

impl fmt::Display for PacketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol.number(),
            self.src,
            self.src_port,
            self.dst,
            self.dst_port
        )
    }
}

/// Canonical identifier of an IP flow.
///
/// Derived from the 5-tuple plus direction family; every packet of the
/// same flow, in either direction, maps to the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Layer-4 protocol
    pub protocol: Protocol,
    /// Local address
    pub local_ip: IpAddr,
    /// Local port
    pub local_port: u16,
    /// Remote address
    pub remote_ip: IpAddr,
    /// Remote port
    pub remote_port: u16,
    /// Whether the flow was initiated by the remote peer
    pub inbound: bool,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}-{}:{}{}",
            self.protocol.number(),
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            if self.inbound { "-in" } else { "" }
        )
    }
}

/// ICMP control header extracted from the packet payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcmpInfo {
    /// ICMP type field
    pub icmp_type: u8,
    /// ICMP code field
    pub code: u8,
    /// Whether this is ICMPv6
    pub v6: bool,
}

impl IcmpInfo {
    /// Whether this is an echo request or echo reply.
    pub fn is_echo(&self) -> bool {
        if self.v6 {
            matches!(self.icmp_type, 128 | 129)
        } else {
            matches!(self.icmp_type, 0 | 8)
        }
    }
}

/// Parsed layer structure of a packet
#[derive(Clone, Debug)]
pub struct Layers {
    /// Offset of the transport header within the raw packet
    pub transport_offset: usize,
    /// ICMP control header, if the packet carries one
    pub icmp: Option<IcmpInfo>,
}

fn parse_layers(raw: &[u8]) -> FirewallResult<Layers> {
    if raw.is_empty() {
        return Err(FirewallError::TruncatedPacket("empty packet"));
    }
    let (transport_offset, ip_protocol) = match raw[0] >> 4 {
        4 => {
            let ihl = ((raw[0] & 0x0f) as usize) * 4;
            if ihl < 20 || raw.len() < ihl {
                return Err(FirewallError::TruncatedPacket("short IPv4 header"));
            }
            (ihl, raw[9])
        }
        6 => {
            if raw.len() < 40 {
                return Err(FirewallError::TruncatedPacket("short IPv6 header"));
            }
            // extension headers are not walked; anything chained counts
            // as the transport protocol itself
            (40, raw[6])
        }
        _ => return Err(FirewallError::TruncatedPacket("unknown IP version")),
    };

    let icmp = match ip_protocol {
        1 | 58 => {
            if raw.len() < transport_offset + 2 {
                return Err(FirewallError::TruncatedPacket("short ICMP header"));
            }
            Some(IcmpInfo {
                icmp_type: raw[transport_offset],
                code: raw[transport_offset + 1],
                v6: ip_protocol == 58,
            })
        }
        _ => None,
    };

    Ok(Layers {
        transport_offset,
        icmp,
    })
}

/// An intercepted packet awaiting a verdict.
///
/// Owns exactly one verdict slot; the slot can be written at most once
/// and writing it releases the driver handle.
pub struct Packet {
    info: PacketInfo,
    raw: Vec<u8>,
    layers: Option<Layers>,
    slot: Option<Box<dyn VerdictSlot>>,
    fast_tracked: bool,
}

impl Packet {
    /// Wrap a raw packet delivered by a driver.
    pub fn new(info: PacketInfo, raw: Vec<u8>, slot: Box<dyn VerdictSlot>) -> Self {
        Self {
            info,
            raw,
            layers: None,
            slot: Some(slot),
            fast_tracked: false,
        }
    }

    /// Mark the packet as already fast-tracked by the OS integration.
    pub fn with_fast_track_hint(mut self, hint: bool) -> Self {
        self.fast_tracked = hint;
        self
    }

    /// 5-tuple metadata, O(1).
    #[inline]
    pub fn info(&self) -> &PacketInfo {
        &self.info
    }

    /// Driver-assigned fast-track hint.
    #[inline]
    pub fn fast_tracked_by_integration(&self) -> bool {
        self.fast_tracked
    }

    /// Set the flow direction. Drivers call this before enqueueing.
    pub fn set_direction(&mut self, direction: Direction) {
        self.info.direction = direction;
    }

    /// Parse link/network/transport layers on demand.
    pub fn load_payload(&mut self) -> FirewallResult<()> {
        if self.layers.is_none() {
            self.layers = Some(parse_layers(&self.raw)?);
        }
        Ok(())
    }

    /// Structured access to parsed headers, valid after `load_payload`.
    pub fn layers(&self) -> FirewallResult<&Layers> {
        self.layers.as_ref().ok_or(FirewallError::PayloadNotLoaded)
    }

    /// Raw packet bytes as delivered by the driver.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Whether a verdict was already applied to this packet.
    pub fn verdict_applied(&self) -> bool {
        self.slot.is_none()
    }

    /// Write the verdict slot. Fails on the second call.
    pub fn apply_verdict(&mut self, verdict: Verdict, permanent: bool) -> FirewallResult<()> {
        let slot = self
            .slot
            .take()
            .ok_or(FirewallError::VerdictAlreadyApplied)?;
        slot.apply(verdict, permanent)
    }

    /// Accept this packet.
    pub fn accept(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Accept, false)
    }

    /// Reject this packet.
    pub fn block(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Block, false)
    }

    /// Discard this packet silently.
    pub fn drop_packet(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Drop, false)
    }

    /// Redirect this packet to the local nameserver.
    pub fn reroute_to_nameserver(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::RerouteToNameserver, false)
    }

    /// Redirect this packet into the overlay tunnel.
    pub fn reroute_to_tunnel(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::RerouteToTunnel, false)
    }

    /// Accept this and all future packets of the flow.
    pub fn permanent_accept(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Accept, true)
    }

    /// Reject this and all future packets of the flow.
    pub fn permanent_block(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Block, true)
    }

    /// Discard this and all future packets of the flow.
    pub fn permanent_drop(&mut self) -> FirewallResult<()> {
        self.apply_verdict(Verdict::Drop, true)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("info", &self.info)
            .field("len", &self.raw.len())
            .field("fast_tracked", &self.fast_tracked)
            .field("verdict_applied", &self.verdict_applied())
            .finish()
    }
}
