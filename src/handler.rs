//! Per-connection state machine and verdict issuer
//!
//! Every packet of a tracked flow runs through the handler matching the
//! record's current state, while holding the record mutex. Handlers are
//! idempotent modulo monotonic verdict progression, so re-queued
//! packets cannot regress a decision.

use std::sync::Arc;
use tokio::time::timeout;

use crate::conn::{Connection, ConnectionState, HandlerState};
use crate::core::FirewallCore;
use crate::error::FirewallError;
use crate::ipscope;
use crate::packet::{Direction, Packet};
use crate::verdict::{Reason, Verdict};

/// Dispatch a packet to the record's current handler.
pub(crate) async fn handle(core: &Arc<FirewallCore>, conn: &Arc<Connection>, pkt: &mut Packet) {
    let mut state = conn.state().await;
    match state.handler {
        HandlerState::Initial => initial_handler(core, conn, &mut state, pkt).await,
        HandlerState::Inspect => inspect_then_verdict(core, conn, &mut state, pkt).await,
        HandlerState::Terminal => default_handler(core, &mut state, pkt),
    }
}

async fn initial_handler(
    core: &Arc<FirewallCore>,
    conn: &Arc<Connection>,
    state: &mut ConnectionState,
    pkt: &mut Packet,
) {
    tracing::trace!("filter: handing over to connection-based handler");
    let info = *pkt.info();
    let outbound = info.direction == Direction::Outbound;

    // connections from the daemon's own pre-authenticated sockets
    if outbound
        && core
            .preauth
            .is_pre_authenticated(info.protocol, conn.id.local_port)
    {
        state.accept("daemon-internal connection");
        state.internal = true;
        state.stop_handler();
        issue_verdict(core, state, pkt, Verdict::Undecided, true);
        return;
    }

    // redirect rogue dns queries to the local resolver
    if outbound
        && info.dst_port == 53
        && state
            .process
            .as_ref()
            .map_or(true, |p| p.pid != std::process::id())
        && core.nameserver_matcher_ready()
        && !core.nameserver_matches(info.dst)
    {
        state.set_verdict(
            Verdict::RerouteToNameserver,
            Reason::new("redirecting rogue dns query"),
        );
        state.internal = true;
        state.stop_handler();
        issue_verdict(core, state, pkt, Verdict::Undecided, true);
        return;
    }

    let cfg = core.config.load_full();
    if !cfg.filter_enabled {
        state.inspecting = false;
        state.set_verdict(
            Verdict::Accept,
            Reason::from_option("privacy filter disabled", "filter_enabled"),
        );
        state.stop_handler();
        issue_verdict(core, state, pkt, Verdict::Undecided, true);
        return;
    }

    tracing::trace!("filter: starting decision process");
    let deadline = cfg.collaborator_deadline();
    if timeout(deadline, core.policy.decide(&conn.id, state, pkt))
        .await
        .is_err()
    {
        let err = FirewallError::DeadlineExceeded("policy decision");
        tracing::warn!("filter: failing {}: {}", conn.id, err);
        state.set_verdict(Verdict::Failed, Reason::new("policy decision timed out"));
        state.stop_handler();
        issue_verdict(core, state, pkt, Verdict::Undecided, true);
        return;
    }

    // accepted global-scope outbound flows may be picked up by the tunnel
    if outbound && state.verdict == Verdict::Accept {
        if let Some(tunnel) = core.tunnel.as_ref().filter(|t| t.client_ready()) {
            let scope = state
                .entity
                .as_ref()
                .map(|e| e.scope)
                .unwrap_or_else(|| ipscope::classify(info.dst));
            if scope.is_global() {
                let domain = state.entity.as_ref().and_then(|e| e.domain.clone());
                match timeout(deadline, tunnel.await_request(&info, domain.as_deref())).await {
                    Ok(Ok(())) => {
                        tracing::trace!("filter: tunneling request");
                        state.raise_verdict(Verdict::RerouteToTunnel);
                    }
                    Ok(Err(err)) => {
                        tracing::trace!("filter: not tunneling: {}", err);
                    }
                    Err(_) => {
                        tracing::trace!("filter: not tunneling: sluice wait timed out");
                    }
                }
            }
        }
    }

    if state.inspecting {
        tracing::trace!("filter: starting inspection");
        if let Some(inspector) = core.inspector.as_ref() {
            inspector.initialize(&conn.id, state, pkt);
            state.handler = HandlerState::Inspect;
            inspect_then_verdict(core, conn, state, pkt).await;
            return;
        }
        // no inspection stack wired in
        state.inspecting = false;
    }

    state.stop_handler();
    issue_verdict(core, state, pkt, Verdict::Undecided, true);
}

async fn inspect_then_verdict(
    core: &Arc<FirewallCore>,
    conn: &Arc<Connection>,
    state: &mut ConnectionState,
    pkt: &mut Packet,
) {
    let Some(inspector) = core.inspector.clone() else {
        state.inspecting = false;
        state.stop_handler();
        issue_verdict(core, state, pkt, Verdict::Undecided, true);
        return;
    };

    let deadline = core.config.load().collaborator_deadline();
    let (verdict, reason) = match timeout(deadline, inspector.handle_packet(&conn.id, state, pkt))
        .await
    {
        Ok(Ok((verdict, reason))) => (verdict, reason),
        Ok(Err(err)) => {
            // accept this packet only; the next packet of the flow is
            // inspected again
            tracing::debug!("filter: inspection of {} failed: {}", conn.id, err);
            (Verdict::Accept, None)
        }
        Err(_) => {
            let err = FirewallError::DeadlineExceeded("stream inspector");
            tracing::warn!("filter: failing {}: {}", conn.id, err);
            (
                Verdict::Failed,
                Some(Reason::new("inspection deadline exceeded")),
            )
        }
    };

    if verdict > Verdict::Undecided {
        state.set_verdict(verdict, reason.unwrap_or_default());
    }

    if !state.inspecting {
        tracing::debug!("filter: stopping inspection of {}", conn.id);
        state.stop_handler();
        state.save_pending = true;
    }

    // the inspecting flag settled above, inside the record mutex; only
    // then may the verdict become permanent
    let allow_permanent = !state.inspecting;
    issue_verdict(core, state, pkt, Verdict::Undecided, allow_permanent);
}

/// Fallback for packets of decided flows that still reach userspace
/// because the driver has not installed the permanent verdict yet.
fn default_handler(core: &FirewallCore, state: &mut ConnectionState, pkt: &mut Packet) {
    issue_verdict(core, state, pkt, Verdict::Undecided, true);
}

/// Apply a verdict to a packet, enforcing monotonicity.
pub(crate) fn issue_verdict(
    core: &FirewallCore,
    state: &mut ConnectionState,
    pkt: &mut Packet,
    proposed: Verdict,
    allow_permanent: bool,
) {
    if allow_permanent && !state.permanent && core.config.load().permanent_verdicts {
        state.permanent = true;
        state.save_pending = true;
    }

    // do not allow circumventing the decision, e.g. accepting a packet
    // of a dropped connection
    let effective = proposed.max(state.verdict);
    let permanent = state.permanent && effective.supports_permanent();

    let result = match effective {
        Verdict::Accept if permanent => pkt.permanent_accept(),
        Verdict::Accept => pkt.accept(),
        Verdict::Block if permanent => pkt.permanent_block(),
        Verdict::Block => pkt.block(),
        Verdict::Drop if permanent => pkt.permanent_drop(),
        Verdict::RerouteToNameserver => pkt.reroute_to_nameserver(),
        Verdict::RerouteToTunnel => pkt.reroute_to_tunnel(),
        Verdict::Drop | Verdict::Failed | Verdict::Undecided => pkt.drop_packet(),
    };

    match result {
        Ok(()) => core.stats.counters.record(effective),
        Err(err) => {
            tracing::warn!(
                "filter: failed to apply verdict to packet {}: {}",
                pkt.info(),
                err
            );
            core.stats.counters.record_failed();
        }
    }
}
