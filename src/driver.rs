//! Interception driver interface
//!
//! A driver feeds intercepted packets into a bounded channel and
//! receives per-packet verdicts through the write-once slot each packet
//! carries. Backends (netfilter queue, WFP callout, BPF) are
//! interchangeable behind this contract.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{FirewallError, FirewallResult};
use crate::packet::{ConnectionId, Packet, PacketInfo};
use crate::verdict::Verdict;

/// Driver-side verdict sink of a single packet.
///
/// Consumed on the first write; the type system rules out a second one.
pub trait VerdictSlot: Send + Sync {
    /// Apply a verdict and release the driver handle.
    fn apply(self: Box<Self>, verdict: Verdict, permanent: bool) -> FirewallResult<()>;
}

/// A packet interception backend.
#[async_trait]
pub trait InterceptionDriver: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Start delivering packets into `packets`. The driver must set the
    /// flow direction on every packet before enqueueing it.
    async fn start(&self, packets: mpsc::Sender<Packet>) -> FirewallResult<()>;

    /// Stop the backend. Still-queued packets are released with a drop
    /// verdict.
    async fn stop(&self) -> FirewallResult<()>;
}

/// A verdict as observed by the driver.
#[derive(Clone, Debug)]
pub struct AppliedVerdict {
    /// Flow the packet belonged to
    pub conn: ConnectionId,
    /// Verdict written into the slot
    pub verdict: Verdict,
    /// Whether the permanent variant was requested
    pub permanent: bool,
}

pub(crate) type VerdictRecord = Arc<Mutex<Vec<AppliedVerdict>>>;

pub(crate) struct RecordingSlot {
    conn: ConnectionId,
    log: VerdictRecord,
    applied: bool,
}

impl RecordingSlot {
    pub(crate) fn new(conn: ConnectionId, log: VerdictRecord) -> Self {
        Self {
            conn,
            log,
            applied: false,
        }
    }
}

impl VerdictSlot for RecordingSlot {
    fn apply(mut self: Box<Self>, verdict: Verdict, permanent: bool) -> FirewallResult<()> {
        self.applied = true;
        self.log.lock().push(AppliedVerdict {
            conn: self.conn,
            verdict,
            permanent,
        });
        Ok(())
    }
}

impl Drop for RecordingSlot {
    fn drop(&mut self) {
        // an unwritten slot going away is the driver releasing the
        // packet at teardown
        if !self.applied {
            self.log.lock().push(AppliedVerdict {
                conn: self.conn,
                verdict: Verdict::Drop,
                permanent: false,
            });
        }
    }
}

/// In-memory driver backend.
///
/// Host integrations that run their own capture loop hand packets in
/// through [`QueueDriver::inject`]; applied verdicts are retained and can
/// be drained by the integration. Also the backend used by the test
/// suite.
pub struct QueueDriver {
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
    log: VerdictRecord,
}

impl QueueDriver {
    /// New, unstarted driver.
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build a packet whose verdict slot reports back to this driver.
    pub fn packet(&self, info: PacketInfo, raw: Vec<u8>) -> Packet {
        let slot = RecordingSlot::new(info.connection_id(), self.log.clone());
        Packet::new(info, raw, Box::new(slot))
    }

    /// Deliver a packet to the dispatcher.
    pub async fn inject(&self, pkt: Packet) -> FirewallResult<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(pkt).await.map_err(|_| FirewallError::ChannelClosed),
            None => Err(FirewallError::ChannelClosed),
        }
    }

    /// Snapshot of all verdicts applied so far.
    pub fn applied(&self) -> Vec<AppliedVerdict> {
        self.log.lock().clone()
    }

    /// Number of verdicts applied so far.
    pub fn applied_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl Default for QueueDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterceptionDriver for QueueDriver {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn start(&self, packets: mpsc::Sender<Packet>) -> FirewallResult<()> {
        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Err(FirewallError::AlreadyStarted);
        }
        *tx = Some(packets);
        Ok(())
    }

    async fn stop(&self) -> FirewallResult<()> {
        self.tx.lock().take();
        Ok(())
    }
}
