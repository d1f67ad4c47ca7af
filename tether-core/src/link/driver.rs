//! The connection driver: runs sessions back to back and applies the
//! reconnection policy between them.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::{error, info, warn};

use super::session::{self, SessionEnd};
use super::{CloseReason, LinkShared};
use crate::error::TetherError;
use crate::policy::{ReconnectAttempt, ReconnectDecision, ReconnectPolicy};
use crate::state::ConnectionState;

pub(crate) async fn run(shared: Arc<LinkShared>) {
    let policy = ReconnectPolicy::from(&shared.config.reconnect);
    let cancel = shared.cancel.clone();
    let max_rejections = shared.config.auth.max_auth_rejections;

    let mut failures: u32 = 0;
    let mut auth_rejections: u32 = 0;
    let mut streak_started: Option<Instant> = None;

    if !shared.transition(ConnectionState::Connecting, "start requested") {
        return;
    }

    loop {
        let outcome = session::run(&shared).await;
        if cancel.is_cancelled() {
            return;
        }

        let err = match outcome.end {
            SessionEnd::Stopped => return,
            SessionEnd::Failed(err) => err,
        };

        if outcome.authenticated {
            failures = 0;
            auth_rejections = 0;
            streak_started = None;
        }

        if err.is_fatal() {
            shared.close(CloseReason::Fatal(err));
            return;
        }

        if matches!(err, TetherError::AuthRejected(_)) {
            auth_rejections += 1;
            if max_rejections > 0 && auth_rejections >= max_rejections {
                error!(auth_rejections, "host keeps rejecting our credentials");
                shared.close(CloseReason::Fatal(TetherError::Security(format!(
                    "authentication rejected {auth_rejections} times in a row: {err}"
                ))));
                return;
            }
        } else {
            auth_rejections = 0;
        }

        failures += 1;
        shared.reconnect_failures.store(failures, Ordering::Relaxed);
        let elapsed = streak_started.get_or_insert_with(Instant::now).elapsed();

        if !shared.transition(ConnectionState::Reconnecting, &err.to_string()) {
            return;
        }

        let decision = policy.decide(failures, elapsed);
        let Some(attempt) = ReconnectAttempt::schedule(failures, decision, Instant::now().into_std())
        else {
            shared.close(CloseReason::Abandoned {
                attempts: failures,
                last_error: err,
            });
            return;
        };
        if decision == ReconnectDecision::RetryNow {
            info!(attempt = attempt.attempt + 1, "reconnecting");
        } else {
            info!(attempt = attempt.attempt + 1, ?decision, error = %err, "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(Instant::from_std(attempt.next_allowed)) => {}
            }
        }

        if !shared.transition(ConnectionState::Connecting, "backoff elapsed") {
            warn!("could not re-enter Connecting; driver exiting");
            return;
        }
    }
}
