//! Concurrent connection table
//!
//! Map from connection id to connection record with single-flight
//! creation: concurrent first packets of the same flow coalesce onto one
//! constructor run. The OS regularly delivers a SYN and its retransmit
//! in parallel; without deduplication two records would race to set a
//! verdict.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::conn::Connection;
use crate::packet::ConnectionId;

type Flight = Arc<OnceCell<Arc<Connection>>>;

/// Result of a table lookup or creation.
#[derive(Clone)]
pub struct TableEntry {
    /// The connection record
    pub conn: Arc<Connection>,
    /// True only for the caller whose constructor ran
    pub created: bool,
    /// True for callers that coalesced onto another caller's flight
    pub shared: bool,
}

/// Concurrent map of tracked connections.
pub struct ConnectionTable {
    conns: DashMap<ConnectionId, Arc<Connection>>,
    in_flight: Mutex<HashMap<ConnectionId, Flight>>,
}

impl ConnectionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a record. Lock-free on the read path.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|c| c.clone())
    }

    /// Get the record for `id`, creating it with `ctor` if absent.
    ///
    /// Concurrent callers with the same id coalesce: exactly one
    /// constructor runs, the rest wait for its result and observe
    /// `shared = true`.
    pub async fn get_or_create<F>(&self, id: ConnectionId, ctor: F) -> TableEntry
    where
        F: FnOnce() -> Arc<Connection>,
    {
        if let Some(conn) = self.get(&id) {
            return TableEntry {
                conn,
                created: false,
                shared: false,
            };
        }

        let (flight, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&id) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight: Flight = Arc::new(OnceCell::new());
                    in_flight.insert(id, flight.clone());
                    (flight, true)
                }
            }
        };

        let mut created = false;
        let created_ref = &mut created;
        let conn = flight
            .get_or_init(|| async move {
                // a completed flight may have landed between the fast
                // path and joining this one
                if let Some(existing) = self.get(&id) {
                    return existing;
                }
                let conn = ctor();
                self.conns.insert(id, conn.clone());
                *created_ref = true;
                conn
            })
            .await
            .clone();

        // whoever finishes clears the flight; stale cells must never
        // outlive the record they produced
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(current) = in_flight.get(&id) {
                if Arc::ptr_eq(current, &flight) {
                    in_flight.remove(&id);
                }
            }
        }

        TableEntry {
            conn,
            created,
            shared: !leader,
        }
    }

    /// Evict a record. Called by the owning collaborator when the
    /// kernel-side flow terminates.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(id).map(|(_, c)| c)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
