//! Packet dispatcher
//!
//! Dedicated reader over the driver's packet channel; one lightweight
//! task per packet. Back-pressure comes from the bounded channel,
//! serialization from the connection record, so worker count needs no
//! tuning here.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::conn::Connection;
use crate::core::FirewallCore;
use crate::fasttrack;
use crate::handler;
use crate::packet::Packet;

pub(crate) async fn run_dispatcher(
    core: Arc<FirewallCore>,
    mut packets: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            pkt = packets.recv() => {
                let Some(pkt) = pkt else { break };
                let core = core.clone();
                let span = tracing::debug_span!("packet", conn = %pkt.info().connection_id());
                handlers.spawn(handle_packet(core, pkt).instrument(span));
            }
            // reap finished handlers so the set stays small
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drain_handlers(&core, handlers).await;
}

async fn drain_handlers(core: &FirewallCore, mut handlers: JoinSet<()>) {
    let deadline = core.config.load().shutdown_drain();
    let drained = tokio::time::timeout(deadline, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            "filter: abandoning {} in-flight packet handlers at shutdown",
            handlers.len()
        );
        handlers.abort_all();
    }
}

/// Handle one intercepted packet: fast-track check, then the connection
/// record's current state-machine handler.
pub(crate) async fn handle_packet(core: Arc<FirewallCore>, mut pkt: Packet) {
    let start = Instant::now();

    if fasttrack::fast_tracked_permit(&core, &mut pkt) {
        core.stats.latency.record(start.elapsed().as_micros() as u64);
        return;
    }

    tracing::trace!("filter: handling packet: {}", pkt.info());

    let id = pkt.info().connection_id();
    let entry = core
        .table
        .get_or_create(id, || {
            let process = core.procs.as_ref().and_then(|p| p.lookup(pkt.info()));
            Connection::from_first_packet(&pkt, process)
        })
        .await;

    let shared = if entry.shared { " (shared)" } else { "" };
    if entry.created {
        tracing::trace!("filter: created new connection {}{}", entry.conn.id, shared);
    } else {
        tracing::trace!("filter: assigned connection {}{}", entry.conn.id, shared);
    }

    handler::handle(&core, &entry.conn, &mut pkt).await;

    core.stats.latency.record(start.elapsed().as_micros() as u64);
}

pub(crate) async fn run_stat_logger(core: Arc<FirewallCore>, mut shutdown: watch::Receiver<bool>) {
    let interval = core.config.load().stat_interval();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => core.stats.log_stat_line(),
        }
    }
}
