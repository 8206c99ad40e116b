//! Background tasks owned by the engine.

use crate::engine::EngineInner;
use std::sync::Arc;
use sync_core::Operation;
use sync_outbox::FailureClass;
use sync_transport::DispatchOutcome;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drain the queue whenever the session is ready and the platform is
/// online, then sleep until woken, the next backoff deadline or the idle
/// tick, whichever is first.
pub(crate) async fn run_dispatch_loop(
    inner: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session_changes = inner.session.subscribe();
    let mut in_flight = JoinSet::new();
    let idle_tick = inner.config.idle_tick();

    info!("Dispatch loop started");

    loop {
        if inner.can_dispatch() {
            let token = inner.session.token();
            while let Some(op) = inner
                .queue
                .dequeue_next(Instant::now(), |op| inner.dispatcher.can_send(op))
                .await
            {
                debug!(operation_id = %op.id, kind = ?op.kind, "Dispatching");
                let task_inner = inner.clone();
                let token = token.clone();
                in_flight.spawn(async move {
                    let outcome = task_inner.dispatcher.dispatch(&op, token.as_deref()).await;
                    complete(&task_inner, &op, token.as_deref(), outcome).await;
                });
            }
        }

        let idle_deadline = Instant::now() + idle_tick;
        let wake_at = inner
            .queue
            .next_deadline()
            .map_or(idle_deadline, |deadline| deadline.min(idle_deadline));

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => {}
            Ok(()) = session_changes.changed() => {}
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "Dispatch task panicked");
                    }
                }
            }
            _ = sleep_until(wake_at) => {}
        }
    }

    in_flight.abort_all();
    info!("Dispatch loop stopped");
}

async fn complete(
    inner: &EngineInner,
    op: &Operation,
    sent_with: Option<&str>,
    outcome: DispatchOutcome,
) {
    match outcome {
        DispatchOutcome::Success(result) => {
            inner.queue.on_resolved(&op.id, result).await;
        }
        DispatchOutcome::Transient(cause) => {
            inner
                .queue
                .on_failed(&op.id, FailureClass::Transient, &cause)
                .await;
        }
        DispatchOutcome::Deferred(cause) => {
            inner
                .queue
                .on_failed(&op.id, FailureClass::Deferred, &cause)
                .await;
        }
        DispatchOutcome::AuthExpired => {
            // Only a rejection of the current token invalidates the session.
            let current = inner.session.token().as_deref() == sent_with;
            // Stale before requeue, so the loop does not resend with the
            // rejected token.
            let first = current
                && inner
                    .session
                    .mark_stale(&format!("token rejected for {}", op.endpoint))
                    .await;
            if !current {
                debug!(operation_id = %op.id, "Rejected token already replaced");
            }
            inner
                .queue
                .on_failed(&op.id, FailureClass::AuthExpired, "token rejected")
                .await;
            if first {
                match inner.session.reauthenticate().await {
                    Ok(_) => info!("Session restored, replaying queue"),
                    Err(e) => warn!(error = %e, "Reauthentication failed; waiting for login"),
                }
            }
        }
        DispatchOutcome::Permanent(cause) => {
            inner
                .queue
                .on_failed(&op.id, FailureClass::Permanent, &cause.to_string())
                .await;
        }
    }
    inner.wake.notify_one();
}

/// Refresh this instance's liveness record.
pub(crate) async fn run_heartbeat(
    inner: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => inner.store.heartbeat().await,
        }
    }
}

/// Periodically adopt work from instances whose heartbeat went stale.
pub(crate) async fn run_orphan_sweep(
    inner: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.config.orphan_sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Startup recovery already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if inner.queue.adopt_orphans().await > 0 {
                    inner.wake.notify_one();
                }
            }
        }
    }
}

pub(crate) async fn watch_connectivity(
    inner: Arc<EngineInner>,
    mut connectivity: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    debug!("Connectivity source dropped");
                    break;
                }
                let online = *connectivity.borrow_and_update();
                inner.set_online(online);
            }
        }
    }
}
