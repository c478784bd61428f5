//! Per-connection record and state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::ipscope::IpScope;
use crate::packet::{ConnectionId, Packet, PacketInfo};
use crate::verdict::{Reason, Verdict};

/// Enriched metadata of the remote peer, filled by the policy collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// Remote address
    pub ip: IpAddr,
    /// Domain the address was resolved from, if known
    pub domain: Option<String>,
    /// Geo attribution, if known
    pub country: Option<String>,
    /// Network scope of the remote address
    pub scope: IpScope,
}

/// Descriptor of the process owning a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process id
    pub pid: u32,
    /// Binary name, if resolved
    pub name: Option<String>,
}

/// Which stage of the state machine handles the next packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    /// First packet: classify and decide
    Initial,
    /// Deep inspection is interested in further packets
    Inspect,
    /// Decided: re-issue the cached verdict
    Terminal,
}

/// Mutable state of a connection, guarded by the record mutex.
#[derive(Debug)]
pub struct ConnectionState {
    /// Cached verdict of the flow
    pub verdict: Verdict,
    /// Explanation of the current verdict
    pub reason: Reason,
    /// Driver auto-applies the verdict to future packets of the flow
    pub permanent: bool,
    /// Deep inspection wants to see further packets
    pub inspecting: bool,
    /// Connection originated by the daemon itself
    pub internal: bool,
    /// Durable persistence requested on termination
    pub save_pending: bool,
    /// Next stage of the state machine
    pub handler: HandlerState,
    /// Remote peer metadata
    pub entity: Option<RemoteEntity>,
    /// Owning process
    pub process: Option<ProcessInfo>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            verdict: Verdict::Undecided,
            reason: Reason::default(),
            permanent: false,
            inspecting: false,
            internal: false,
            save_pending: false,
            handler: HandlerState::Initial,
            entity: None,
            process: None,
        }
    }

    /// Set verdict and reason, honoring the monotonic order.
    ///
    /// Returns false when `verdict` would downgrade the current one, in
    /// which case nothing changes.
    pub fn set_verdict(&mut self, verdict: Verdict, reason: Reason) -> bool {
        if verdict < self.verdict {
            return false;
        }
        self.verdict = verdict;
        self.reason = reason;
        true
    }

    /// Raise the verdict, keeping the current reason.
    pub fn raise_verdict(&mut self, verdict: Verdict) -> bool {
        if verdict < self.verdict {
            return false;
        }
        self.verdict = verdict;
        true
    }

    /// Accept with a reason message.
    pub fn accept(&mut self, msg: impl Into<String>) {
        self.set_verdict(Verdict::Accept, Reason::new(msg));
    }

    /// Detach the state machine; further packets get the default handler.
    pub fn stop_handler(&mut self) {
        self.handler = HandlerState::Terminal;
    }
}

/// A tracked connection.
///
/// Created by the single-flight branch of the connection table on the
/// first packet of a flow; evicted by the owning collaborator when the
/// kernel-side flow terminates.
#[derive(Debug)]
pub struct Connection {
    /// Canonical flow id
    pub id: ConnectionId,
    /// 5-tuple of the first packet
    pub info: PacketInfo,
    /// Creation time
    pub started: DateTime<Utc>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a record from the first packet of a flow.
    pub fn from_first_packet(pkt: &Packet, process: Option<ProcessInfo>) -> Arc<Self> {
        let mut state = ConnectionState::new();
        state.process = process;
        Arc::new(Self {
            id: pkt.info().connection_id(),
            info: *pkt.info(),
            started: Utc::now(),
            state: Mutex::new(state),
        })
    }

    /// Lock the record state. Handlers hold this across their bounded
    /// suspension points, which serializes packets of the same flow.
    pub async fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().await
    }

    /// Non-blocking peek at the record state.
    pub fn try_state(&self) -> Option<MutexGuard<'_, ConnectionState>> {
        self.state.try_lock().ok()
    }
}
