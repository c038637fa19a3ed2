//! Preconnection
//!
//! The descriptor an application assembles before any network activity:
//! endpoints, transport properties, security parameters, and framers. Every
//! establishment entry point — `initiate`, `initiate_with_send`, `listen`,
//! `rendezvous` — starts here.

use crate::connection::{Connection, EstablishmentOrigin};
use crate::gather::gather_candidates;
use crate::listener::Listener;
use crate::racing;
use crate::resolve;
use std::sync::Arc;
use tapestry_core::config::TapestryConfig;
use tapestry_core::endpoint::{LocalEndpoint, RemoteEndpoint};
use tapestry_core::error::{Result, TransportError};
use tapestry_core::message::Message;
use tapestry_core::properties::{Preference, TransportProperties};
use tapestry_core::security::SecurityParameters;
use tapestry_framing::Framer;
use tapestry_transport::StackRegistry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Endpoints + properties + security + framers, from which connections and
/// listeners are produced
#[derive(Clone)]
pub struct Preconnection {
    locals: Vec<LocalEndpoint>,
    remotes: Vec<RemoteEndpoint>,
    properties: TransportProperties,
    security: SecurityParameters,
    framers: Vec<Arc<dyn Framer>>,
    registry: Arc<StackRegistry>,
    config: TapestryConfig,
}

impl Preconnection {
    /// Preconnection with the given properties, the built-in stacks, and no
    /// security
    pub fn new(properties: TransportProperties) -> Self {
        Self {
            locals: Vec::new(),
            remotes: Vec::new(),
            properties,
            security: SecurityParameters::disabled(),
            framers: Vec::new(),
            registry: Arc::new(StackRegistry::with_defaults()),
            config: TapestryConfig::default(),
        }
    }

    pub fn add_local(mut self, endpoint: LocalEndpoint) -> Self {
        self.locals.push(endpoint);
        self
    }

    pub fn add_remote(mut self, endpoint: RemoteEndpoint) -> Self {
        self.remotes.push(endpoint);
        self
    }

    pub fn with_security(mut self, security: SecurityParameters) -> Self {
        self.security = security;
        self
    }

    /// Append a framer; the chain runs in insertion order
    pub fn add_framer(mut self, framer: Arc<dyn Framer>) -> Self {
        self.framers.push(framer);
        self
    }

    /// Replace the stack registry (platform adapters, tests)
    pub fn with_registry(mut self, registry: Arc<StackRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: TapestryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn properties(&self) -> &TransportProperties {
        &self.properties
    }

    pub fn security(&self) -> &SecurityParameters {
        &self.security
    }

    /// Establish an outbound connection via candidate gathering and racing
    pub async fn initiate(&self) -> Result<Connection> {
        establish(
            &self.registry,
            &self.locals,
            &self.remotes,
            &self.properties,
            &self.security,
            self.framers.clone(),
            &self.config,
        )
        .await
    }

    /// Establish and immediately send the first message
    ///
    /// With `zero_rtt = Require` the message must be safely replayable; it
    /// may be transmitted in a replayable first flight by a zero-RTT-capable
    /// stack.
    pub async fn initiate_with_send(&self, message: Message) -> Result<Connection> {
        if self.properties.zero_rtt == Preference::Require && !message.context.safely_replayable {
            return Err(TransportError::InvalidConfiguration(
                "zero-RTT send requires a safely replayable message".to_string(),
            ));
        }

        let connection = self.initiate().await?;
        if let Err(e) = connection.send(message).await {
            let _ = connection.abort().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Bind listeners on every local endpoint
    pub async fn listen(&self) -> Result<Listener> {
        crate::listener::start(
            self.registry.clone(),
            &self.locals,
            self.properties.clone(),
            self.security.clone(),
            self.framers.clone(),
            &self.config,
        )
        .await
    }

    /// Simultaneous listen + connect for peer-to-peer establishment
    ///
    /// Returns the first channel to establish in either direction; at most
    /// one connection is ever produced per invocation.
    pub async fn rendezvous(&self) -> Result<Connection> {
        crate::rendezvous::rendezvous(
            self.registry.clone(),
            &self.locals,
            &self.remotes,
            self.properties.clone(),
            self.security.clone(),
            self.framers.clone(),
            self.config.clone(),
        )
        .await
    }
}

impl std::fmt::Debug for Preconnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preconnection")
            .field("locals", &self.locals)
            .field("remotes", &self.remotes)
            .field("properties", &self.properties)
            .field("security", &self.security)
            .field("framers", &self.framers.len())
            .finish()
    }
}

/// Shared establishment path for `initiate` and connection cloning
pub(crate) async fn establish(
    registry: &Arc<StackRegistry>,
    locals: &[LocalEndpoint],
    remotes: &[RemoteEndpoint],
    properties: &TransportProperties,
    security: &SecurityParameters,
    framers: Vec<Arc<dyn Framer>>,
    config: &TapestryConfig,
) -> Result<Connection> {
    if remotes.is_empty() {
        return Err(TransportError::InvalidConfiguration(
            "initiate requires at least one remote endpoint".to_string(),
        ));
    }

    let resolved_remotes = resolve::resolve_remotes(remotes).await?;
    let resolved_locals = if locals.is_empty() {
        Vec::new()
    } else {
        resolve::resolve_locals(locals).await?
    };

    let candidates = gather_candidates(
        registry,
        &resolved_locals,
        &resolved_remotes,
        properties,
        security,
        false,
    );
    debug!(candidates = candidates.len(), "initiating");

    let cancel = CancellationToken::new();
    let outcome = racing::race(candidates, properties, security, &config.racing, &cancel).await?;

    let origin = EstablishmentOrigin {
        registry: registry.clone(),
        remote: outcome.candidate.remote.endpoint.clone(),
        security: security.clone(),
        framers: framers.clone(),
        config: config.clone(),
    };
    Ok(Connection::establish(
        outcome.channel,
        properties.clone(),
        framers,
        Some(origin),
    ))
}
