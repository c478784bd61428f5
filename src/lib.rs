//! Guardian Firewall - packet-interception firewall core
//!
//! The core sits on the kernel-userspace boundary: the host networking
//! stack hands it every outbound and inbound IP packet for a policy
//! decision (accept, block, drop, or redirect), and the core answers
//! quickly enough to sustain the host's throughput.
//!
//! # Architecture
//!
//! - **Driver** ([`driver`]): OS-specific interception backend feeding a
//!   bounded packet channel and taking per-packet verdicts back.
//! - **Dispatcher** ([`dispatch`]): one lightweight task per packet;
//!   back-pressure comes from the channel, serialization from the
//!   connection record.
//! - **Fast track** ([`fasttrack`]): stateless rules permitting or
//!   blocking network-critical flows (DHCP, loopback self-test, local
//!   DNS, management API, non-echo ICMP) before any table lookup.
//! - **Connection table** ([`table`]): per-5-tuple records with
//!   single-flight creation, caching decisions so repeated packets of a
//!   flow short-circuit policy evaluation.
//! - **State machine** ([`handler`]): initial classification, optional
//!   deep inspection, tunnel hand-off, verdict finalization; idempotent
//!   under re-queued retries.
//!
//! Policy engine, DNS resolver, overlay tunnel, deep-inspection parsers
//! and process attribution are external collaborators behind the traits
//! in [`collab`].

#![warn(missing_docs)]

pub mod collab;
pub mod config;
pub mod conn;
pub mod core;
pub mod driver;
pub mod error;
pub mod ipscope;
pub mod packet;
pub mod stats;
pub mod table;
pub mod verdict;

mod dispatch;
mod fasttrack;
mod handler;

#[cfg(test)]
pub(crate) mod testkit;

pub use crate::config::FirewallConfig;
pub use crate::conn::{Connection, ConnectionState, ProcessInfo, RemoteEntity};
pub use crate::core::{CoreBuilder, FirewallCore, NameserverIpMatcher};
pub use crate::driver::{AppliedVerdict, InterceptionDriver, QueueDriver, VerdictSlot};
pub use crate::error::{FirewallError, FirewallResult};
pub use crate::ipscope::IpScope;
pub use crate::packet::{ConnectionId, Direction, Packet, PacketInfo, Protocol};
pub use crate::verdict::{Reason, Verdict};
