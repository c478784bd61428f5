//! IP address scope classification
//!
//! Scope decides whether a destination counts as part of the local
//! network (DHCP fast-track) or as global (tunnel eligibility).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Network scope of a single IP address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpScope {
    /// Unspecified or otherwise unusable address
    Invalid,
    /// Loopback
    HostLocal,
    /// Link-local unicast
    LinkLocal,
    /// Private / unique-local unicast
    SiteLocal,
    /// Multicast that stays within the local site
    LocalMulticast,
    /// Multicast with global reach
    GlobalMulticast,
    /// Publicly routable unicast
    Global,
}

impl IpScope {
    /// Whether an address of this scope belongs to the local network.
    #[inline]
    pub fn is_local_network(self) -> bool {
        matches!(
            self,
            IpScope::HostLocal | IpScope::LinkLocal | IpScope::SiteLocal | IpScope::LocalMulticast
        )
    }

    /// Whether an address of this scope is globally routable unicast.
    #[inline]
    pub fn is_global(self) -> bool {
        self == IpScope::Global
    }
}

/// Classify an IP address into its network scope.
pub fn classify(ip: IpAddr) -> IpScope {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> IpScope {
    let o = ip.octets();
    match o {
        [0, 0, 0, 0] => IpScope::Invalid,
        // limited broadcast stays on the local link
        [255, 255, 255, 255] => IpScope::LocalMulticast,
        _ if o[0] == 127 => IpScope::HostLocal,
        _ if o[0] == 169 && o[1] == 254 => IpScope::LinkLocal,
        _ if o[0] == 10 => IpScope::SiteLocal,
        _ if o[0] == 172 && o[1] & 0xf0 == 16 => IpScope::SiteLocal,
        _ if o[0] == 192 && o[1] == 168 => IpScope::SiteLocal,
        // 224.0.0.0/24 link-local and 239.0.0.0/8 admin-scoped multicast
        _ if o[0] == 224 && o[1] == 0 && o[2] == 0 => IpScope::LocalMulticast,
        _ if o[0] == 239 => IpScope::LocalMulticast,
        _ if (224..=238).contains(&o[0]) => IpScope::GlobalMulticast,
        _ => IpScope::Global,
    }
}

fn classify_v6(ip: Ipv6Addr) -> IpScope {
    if ip.is_unspecified() {
        return IpScope::Invalid;
    }
    if ip.is_loopback() {
        return IpScope::HostLocal;
    }
    let seg = ip.segments();
    // fe80::/10
    if seg[0] & 0xffc0 == 0xfe80 {
        return IpScope::LinkLocal;
    }
    // fc00::/7 unique-local
    if seg[0] & 0xfe00 == 0xfc00 {
        return IpScope::SiteLocal;
    }
    // ff00::/8 multicast, scope nibble decides the reach
    if seg[0] & 0xff00 == 0xff00 {
        return match seg[0] & 0x000f {
            // interface-, link-, admin- and site-local scopes
            0x1 | 0x2 | 0x4 | 0x5 => IpScope::LocalMulticast,
            _ => IpScope::GlobalMulticast,
        };
    }
    IpScope::Global
}
