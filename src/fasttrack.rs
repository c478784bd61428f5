//! Fast-track classifier
//!
//! Stateless per-packet rules that short-circuit network-critical and
//! daemon-internal traffic before the connection table is consulted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::FirewallCore;
use crate::ipscope;
use crate::packet::{Packet, PacketInfo, Protocol};
use crate::verdict::Verdict;

/// Well-known sentinel addresses flows are pointed at to block them.
const SENTINEL_V4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 17);
const SENTINEL_V6: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0x17);

/// DHCP and DHCPv6 ports
const DHCP_PORTS: [u16; 4] = [67, 68, 546, 547];

/// Quickly permit or block certain network-critical flows.
///
/// Returns true when a verdict was applied (or the OS integration
/// already handled the packet) and no further processing is needed.
pub(crate) fn fast_tracked_permit(core: &FirewallCore, pkt: &mut Packet) -> bool {
    let info = *pkt.info();

    // already handled in the kernel integration
    if pkt.fast_tracked_by_integration() {
        tracing::debug!("filter: fast-tracked by OS integration: {}", info);
        return true;
    }

    if is_sentinel(info.dst) {
        return apply(core, pkt, Verdict::Block, true);
    }

    // some programs connect to their own IP/port pair to test network
    // capabilities
    if info.src_port == info.dst_port && info.src == info.dst {
        tracing::debug!("filter: fast-track network self-check: {}", info);
        return apply(core, pkt, Verdict::Accept, true);
    }

    match info.protocol {
        Protocol::Icmp4 | Protocol::Icmp6 => fast_track_icmp(core, pkt),
        Protocol::Udp | Protocol::Tcp => fast_track_port_specials(core, pkt, &info),
        Protocol::Other(_) => false,
    }
}

fn is_sentinel(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == SENTINEL_V4,
        IpAddr::V6(v6) => v6 == SENTINEL_V6,
    }
}

fn fast_track_icmp(core: &FirewallCore, pkt: &mut Packet) -> bool {
    // malformed ICMP arises from the local stack and cannot carry
    // application traffic: fail open
    if let Err(err) = pkt.load_payload() {
        tracing::debug!("filter: failed to load ICMP packet data: {}", err);
        return apply(core, pkt, Verdict::Accept, true);
    }

    // echo requests and replies take the normal path so the user can
    // see pings; everything else is system business
    if let Ok(layers) = pkt.layers() {
        if let Some(icmp) = layers.icmp {
            if icmp.is_echo() {
                return false;
            }
        }
    }

    tracing::debug!("filter: fast-track accepting ICMP: {}", pkt.info());
    let submitted = core.icmp.submit(pkt);

    // a submitted flow must keep being delivered to userspace, so the
    // accept must not be permanent
    apply(core, pkt, Verdict::Accept, !submitted)
}

fn fast_track_port_specials(core: &FirewallCore, pkt: &mut Packet, info: &PacketInfo) -> bool {
    if DHCP_PORTS.contains(&info.dst_port) {
        return fast_track_dhcp(core, pkt, info);
    }

    let cfg = core.config.load();
    if let Some(api) = cfg.api_endpoint {
        if info.dst_port == api.port() {
            return fast_track_api(core, pkt, info, api.ip());
        }
    }

    if info.dst_port == 53 {
        return fast_track_dns(core, pkt, info);
    }

    false
}

fn fast_track_dhcp(core: &FirewallCore, pkt: &mut Packet, info: &PacketInfo) -> bool {
    // DHCP and DHCPv6 are UDP only
    if info.protocol != Protocol::Udp {
        return false;
    }

    // DHCP is only valid in local network scopes
    if !ipscope::classify(info.dst).is_local_network() {
        return false;
    }

    tracing::debug!("filter: fast-track accepting DHCP: {}", info);
    apply(core, pkt, Verdict::Accept, true)
}

fn fast_track_api(core: &FirewallCore, pkt: &mut Packet, info: &PacketInfo, api_ip: IpAddr) -> bool {
    // the management API is TCP only
    if info.protocol != Protocol::Tcp {
        return false;
    }

    if info.dst != api_ip {
        return false;
    }

    if !is_my_ip(core, info.src) {
        return false;
    }

    tracing::debug!("filter: fast-track accepting api connection: {}", info);
    apply(core, pkt, Verdict::Accept, true)
}

fn fast_track_dns(core: &FirewallCore, pkt: &mut Packet, info: &PacketInfo) -> bool {
    // DNS is both UDP and TCP
    if !core.nameserver_matcher_ready() {
        return false;
    }

    if !core.nameserver_matches(info.dst) {
        return false;
    }

    if !is_my_ip(core, info.src) {
        return false;
    }

    tracing::debug!("filter: fast-track accepting local dns: {}", info);
    apply(core, pkt, Verdict::Accept, true)
}

fn is_my_ip(core: &FirewallCore, ip: IpAddr) -> bool {
    match core.host.is_my_ip(ip) {
        Ok(is_me) => is_me,
        Err(err) => {
            tracing::debug!(
                "filter: failed to check if {} is own IP for fast-track: {}",
                ip,
                err
            );
            false
        }
    }
}

fn apply(core: &FirewallCore, pkt: &mut Packet, verdict: Verdict, permanent: bool) -> bool {
    let result = match (verdict, permanent) {
        (Verdict::Block, true) => pkt.permanent_block(),
        (Verdict::Block, false) => pkt.block(),
        (_, true) => pkt.permanent_accept(),
        (_, false) => pkt.accept(),
    };
    match result {
        Ok(()) => core.stats.counters.record(verdict),
        Err(err) => {
            tracing::warn!(
                "filter: failed to apply fast-track verdict to {}: {}",
                pkt.info(),
                err
            );
            core.stats.counters.record_failed();
        }
    }
    true
}
