//! Rendezvous engine
//!
//! Simultaneous listen + connect for peer-to-peer establishment: listeners
//! start on every local endpoint, then (after a brief readiness grace)
//! outbound attempts race over (locals U {ephemeral}) x remotes. The first
//! channel to establish — inbound or outbound — wins; the winner is selected
//! under a single critical section so the completion fires at most once, all
//! other attempts are cancelled, and the listeners are stopped.

use crate::connection::{Connection, EstablishmentOrigin};
use crate::gather::gather_candidates;
use crate::racing;
use crate::resolve;
use std::sync::{Arc, Mutex as StdMutex};
use tapestry_core::config::TapestryConfig;
use tapestry_core::endpoint::{LocalEndpoint, RemoteEndpoint};
use tapestry_core::error::{Result, TransportError};
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_framing::Framer;
use tapestry_transport::StackRegistry;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WinnerSlot = Arc<StdMutex<Option<oneshot::Sender<Connection>>>>;

/// Claim the single winner; a loser is aborted on the spot
async fn claim(slot: &WinnerSlot, connection: Connection) -> bool {
    let sender = slot.lock().expect("winner slot poisoned").take();
    match sender {
        Some(tx) => match tx.send(connection) {
            Ok(()) => true,
            Err(connection) => {
                let _ = connection.abort().await;
                false
            }
        },
        None => {
            let _ = connection.abort().await;
            false
        }
    }
}

pub(crate) async fn rendezvous(
    registry: Arc<StackRegistry>,
    locals: &[LocalEndpoint],
    remotes: &[RemoteEndpoint],
    properties: TransportProperties,
    security: SecurityParameters,
    framers: Vec<Arc<dyn Framer>>,
    config: TapestryConfig,
) -> Result<Connection> {
    if locals.is_empty() || remotes.is_empty() {
        return Err(TransportError::InvalidConfiguration(
            "rendezvous requires local and remote endpoints".to_string(),
        ));
    }

    // Inbound side first, with a grace period to reach readiness before the
    // peer's outbound attempts can land.
    let listener = crate::listener::start(
        registry.clone(),
        locals,
        properties.clone(),
        security.clone(),
        framers.clone(),
        &config,
    )
    .await?;
    tokio::time::sleep(config.rendezvous.listener_grace()).await;

    let resolved_remotes = resolve::resolve_remotes(remotes).await?;
    let resolved_locals = resolve::resolve_locals(locals).await?;
    let candidates = gather_candidates(
        &registry,
        &resolved_locals,
        &resolved_remotes,
        &properties,
        &security,
        true,
    );
    debug!(candidates = candidates.len(), "rendezvous racing started");

    let (winner_tx, mut winner_rx) = oneshot::channel();
    let slot: WinnerSlot = Arc::new(StdMutex::new(Some(winner_tx)));
    let outbound_cancel = CancellationToken::new();

    let inbound_task = {
        let listener = listener.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            while let Some(connection) = listener.accept().await {
                debug!(id = %connection.id(), "rendezvous inbound established");
                if claim(&slot, connection).await {
                    return;
                }
            }
        })
    };

    let outbound_task = {
        let slot = slot.clone();
        let cancel = outbound_cancel.clone();
        let registry = registry.clone();
        let properties = properties.clone();
        let security = security.clone();
        let framers = framers.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let outcome =
                racing::race(candidates, &properties, &security, &config.racing, &cancel).await?;
            let origin = EstablishmentOrigin {
                registry,
                remote: outcome.candidate.remote.endpoint.clone(),
                security,
                framers: framers.clone(),
                config,
            };
            let connection =
                Connection::establish(outcome.channel, properties, framers, Some(origin));
            debug!(id = %connection.id(), "rendezvous outbound established");
            claim(&slot, connection).await;
            Ok::<(), TransportError>(())
        })
    };

    let result = tokio::select! {
        winner = &mut winner_rx => winner.map_err(|_| {
            TransportError::EstablishmentFailure("all candidates exhausted".to_string())
        }),
        outbound = outbound_task => match outbound {
            // The outbound side claimed, or lost to an inbound claim; either
            // way the slot has fired.
            Ok(Ok(())) => winner_rx.await.map_err(|_| {
                TransportError::EstablishmentFailure("all candidates exhausted".to_string())
            }),
            // Outbound exhausted: the rendezvous fails unless an inbound
            // already arrived.
            Ok(Err(race_error)) => match winner_rx.try_recv() {
                Ok(connection) => Ok(connection),
                Err(_) => Err(TransportError::EstablishmentFailure(format!(
                    "all candidates exhausted: {}",
                    race_error
                ))),
            },
            Err(join_error) => Err(TransportError::EstablishmentFailure(format!(
                "outbound racing task failed: {}",
                join_error
            ))),
        },
    };

    // Winner or not: cancel the losing side and stop the listeners.
    outbound_cancel.cancel();
    inbound_task.abort();
    let _ = listener.stop().await;

    result
}
