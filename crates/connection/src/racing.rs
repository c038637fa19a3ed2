//! Candidate racing engine
//!
//! Happy-Eyeballs-style establishment: the top-ranked candidate launches
//! immediately, the next after a configurable stagger (a failure frees its
//! slot early), until one attempt succeeds or all have failed. The first
//! successful channel wins; the remaining attempts are cancelled and any
//! channel completing after the winner is closed. When everything fails, the
//! reported error is the most specific per-attempt failure
//! (authentication > refused > timeout > unreachable > other).

use crate::gather::Candidate;
use tapestry_core::config::RacingConfig;
use tapestry_core::error::{Result, TransportError};
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_transport::{Channel, CloseMode, StackError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The winning attempt
pub struct RaceOutcome {
    pub channel: Box<dyn Channel>,
    pub candidate: Candidate,
}

type AttemptResult = (usize, std::result::Result<Box<dyn Channel>, StackError>);

/// Race the candidate list to a single established channel
///
/// Bounded by the properties' connection timeout (or the configured
/// default). Cancelling `cancel` cancels every in-flight attempt.
pub async fn race(
    candidates: Vec<Candidate>,
    properties: &TransportProperties,
    security: &SecurityParameters,
    config: &RacingConfig,
    cancel: &CancellationToken,
) -> Result<RaceOutcome> {
    if candidates.is_empty() {
        return Err(TransportError::EstablishmentFailure(
            "no viable candidates".to_string(),
        ));
    }

    let total = properties.conn_timeout.unwrap_or_else(|| config.conn_timeout());
    let deadline = Instant::now() + total;
    let stagger = config.stagger();

    let attempt_cancel = cancel.child_token();
    let _cancel_guard = attempt_cancel.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel::<AttemptResult>(candidates.len());

    let n = candidates.len();
    let mut launched = 1usize;
    let mut failed = 0usize;
    let mut best_error: Option<StackError> = None;

    launch_attempt(&candidates[0], 0, properties, security, &tx, &attempt_cancel);
    let mut next_launch = Instant::now() + stagger;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("race cancelled by caller");
                return Err(TransportError::Aborted);
            }
            () = tokio::time::sleep_until(deadline) => {
                debug!(?total, "race timed out");
                return Err(TransportError::Timeout(total));
            }
            () = tokio::time::sleep_until(next_launch), if launched < n => {
                launch_attempt(&candidates[launched], launched, properties, security, &tx, &attempt_cancel);
                launched += 1;
                next_launch = Instant::now() + stagger;
            }
            received = rx.recv() => {
                let (index, result) = received.expect("race keeps a sender alive");
                match result {
                    Ok(channel) => {
                        attempt_cancel.cancel();
                        let candidate = candidates[index].clone();
                        debug!(
                            stack = candidate.stack.name(),
                            remote = %candidate.remote.addr,
                            "candidate won the race"
                        );
                        return Ok(RaceOutcome { channel, candidate });
                    }
                    Err(e) => {
                        debug!(
                            stack = candidates[index].stack.name(),
                            remote = %candidates[index].remote.addr,
                            error = %e,
                            "candidate attempt failed"
                        );
                        failed += 1;
                        best_error = Some(match best_error.take() {
                            Some(best) if best.specificity() >= e.specificity() => best,
                            _ => e,
                        });
                        if failed == n {
                            return Err(exhausted(n, best_error));
                        }
                        // A failed attempt frees its slot immediately.
                        if launched < n {
                            next_launch = Instant::now();
                        }
                    }
                }
            }
        }
    }
}

fn launch_attempt(
    candidate: &Candidate,
    index: usize,
    properties: &TransportProperties,
    security: &SecurityParameters,
    tx: &mpsc::Sender<AttemptResult>,
    cancel: &CancellationToken,
) {
    let stack = candidate.stack.clone();
    let remote = candidate.remote.addr;
    let server_name = candidate.server_name().map(str::to_string);
    let local = candidate.local.as_ref().map(|l| l.addr);
    let properties = properties.clone();
    let security = security.clone();
    let tx = tx.clone();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = stack.connect(remote, server_name.as_deref(), local, &properties, &security) => result,
        };
        match result {
            Ok(channel) => {
                if let Err(rejected) = tx.try_send((index, Ok(channel))) {
                    // A winner was already chosen; close the latecomer.
                    let (_, late) = rejected.into_inner();
                    if let Ok(channel) = late {
                        let _ = channel.close(CloseMode::Abortive).await;
                    }
                }
            }
            Err(e) => {
                let _ = tx.try_send((index, Err(e)));
            }
        }
    });
}

fn exhausted(attempts: usize, best_error: Option<StackError>) -> TransportError {
    let reason = best_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "all candidates exhausted".to_string());
    TransportError::EstablishmentFailure(format!("all {} attempts failed: {}", attempts, reason))
}
