//! TLS-over-TCP stack
//!
//! Layers TLS 1.2/1.3 (rustls via tokio-rustls) on the TCP stack. The
//! application's trust-verification callback is applied immediately after the
//! handshake with the negotiated parameters; without a callback the client
//! accepts any certificate, the development posture. Listeners use the
//! supplied server identity or fall back to a generated self-signed
//! certificate. Client identities come from the identity-challenge callback
//! when the server requests one.

use crate::channel::{Channel, ChannelOption, CloseMode, ServerChannel};
use crate::error::{Result, StackError};
use crate::stack::{ProtocolStack, StackCapabilities};
use crate::tcp::{apply_stream_properties, connect_stream};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tapestry_core::endpoint::Endpoint;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::{
    IdentityChallenge, SecurityParameters, SecurityProtocol, TrustContext, TrustVerdict,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

const READ_BUF_LEN: usize = 64 * 1024;

fn protocol_versions(security: &SecurityParameters) -> Vec<&'static SupportedProtocolVersion> {
    security
        .allowed_protocols
        .iter()
        .map(|p| match p {
            SecurityProtocol::Tls12 => &rustls::version::TLS12,
            SecurityProtocol::Tls13 => &rustls::version::TLS13,
        })
        .collect()
}

fn version_name(version: Option<ProtocolVersion>) -> String {
    match version {
        Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
        Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
        Some(other) => format!("{:?}", other),
        None => "unknown".to_string(),
    }
}

/// TLS-over-TCP transport stack
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsTcpStack;

impl TlsTcpStack {
    pub fn new() -> Self {
        Self
    }

    fn build_client_config(security: &SecurityParameters) -> Result<ClientConfig> {
        let builder = ClientConfig::builder_with_protocol_versions(&protocol_versions(security))
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredVerification));

        let mut config = match &security.identity_challenge {
            Some(callback) => builder.with_client_cert_resolver(Arc::new(ChallengeCertResolver {
                callback: callback.clone(),
            })),
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = security.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }

    fn build_server_config(security: &SecurityParameters) -> Result<ServerConfig> {
        if security.private_key_password.is_some() {
            warn!("private key passwords are not supported; key must be unencrypted DER");
        }

        let (certs, key) = if security.server_certificates.is_empty() {
            Self::generate_self_signed()?
        } else {
            let certs: Vec<CertificateDer<'static>> = security
                .server_certificates
                .iter()
                .map(|der| CertificateDer::from(der.clone()))
                .collect();
            let key_der = security.server_private_keys.first().ok_or_else(|| {
                StackError::Unsupported("server certificate without a private key".to_string())
            })?;
            let key = PrivateKeyDer::try_from(key_der.clone())
                .map_err(|e| StackError::AuthenticationFailed(format!("invalid private key: {}", e)))?;
            (certs, key)
        };

        let mut config = ServerConfig::builder_with_protocol_versions(&protocol_versions(security))
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| StackError::AuthenticationFailed(format!("TLS config failed: {}", e)))?;

        config.alpn_protocols = security.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }

    /// Generate a self-signed server identity
    ///
    /// Development fallback for listeners started without a configured
    /// certificate; peers verify through the trust callback or pinning.
    fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| StackError::AuthenticationFailed(format!("failed to generate cert: {}", e)))?;
        let cert_der = CertificateDer::from(cert.cert);
        let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| StackError::AuthenticationFailed(format!("failed to serialize key: {}", e)))?;
        Ok((vec![cert_der], key_der))
    }

    /// Apply the application's trust verdict to a finished handshake
    fn verify_trust(
        security: &SecurityParameters,
        session: &rustls::CommonState,
        server_name: &str,
    ) -> Result<()> {
        let Some(callback) = &security.trust_verification else {
            return Ok(());
        };

        let chain = session
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();
        let context = TrustContext {
            chain,
            server_name: server_name.to_string(),
            protocol_version: version_name(session.protocol_version()),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_else(|| "unknown".to_string()),
            ocsp: None,
            sct: None,
        };

        match callback(&context) {
            TrustVerdict::Accept => Ok(()),
            TrustVerdict::AcceptWithConditions(reasons) => {
                warn!(?reasons, "trust verification accepted with conditions");
                Ok(())
            }
            TrustVerdict::Reject => Err(StackError::AuthenticationFailed(
                "trust verification rejected the peer".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ProtocolStack for TlsTcpStack {
    fn name(&self) -> &'static str {
        "tls-tcp"
    }

    fn capabilities(&self) -> StackCapabilities {
        StackCapabilities {
            reliability: true,
            ordering: true,
            congestion_control: true,
            keep_alive: true,
            security: true,
            ..Default::default()
        }
    }

    fn can_handle(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_ip_family()
    }

    async fn connect(
        &self,
        remote: SocketAddr,
        server_name: Option<&str>,
        local: Option<SocketAddr>,
        properties: &TransportProperties,
        security: &SecurityParameters,
    ) -> Result<Box<dyn Channel>> {
        if !security.is_enabled() {
            return Err(StackError::Unsupported(
                "TLS stack selected without security parameters".to_string(),
            ));
        }

        let stream = connect_stream(remote, local).await?;
        apply_stream_properties(&stream, properties)?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();

        let connector = TlsConnector::from(Arc::new(Self::build_client_config(security)?));
        let sni = match server_name {
            Some(name) => ServerName::try_from(name.to_string())
                .map_err(|e| StackError::AuthenticationFailed(format!("invalid server name: {}", e)))?,
            None => ServerName::IpAddress(remote.ip().into()),
        };

        let tls = connector.connect(sni, stream).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                StackError::AuthenticationFailed(e.to_string())
            } else {
                StackError::from_io(&e)
            }
        })?;

        let name_for_verdict = server_name
            .map(str::to_string)
            .unwrap_or_else(|| remote.ip().to_string());
        let verdict = {
            let (_, session) = tls.get_ref();
            Self::verify_trust(security, session, &name_for_verdict)
        };
        if let Err(e) = verdict {
            // Reject means tear the session down before anyone uses it.
            let (mut stream, _) = tls.into_inner();
            let _ = stream.shutdown().await;
            return Err(e);
        }

        debug!(%remote, "tls connection established");
        Ok(Box::new(TlsChannel::new(
            TlsStream::from(tls),
            local_addr,
            remote_addr,
        )))
    }

    async fn listen(
        &self,
        local: SocketAddr,
        properties: &TransportProperties,
        security: &SecurityParameters,
    ) -> Result<Box<dyn ServerChannel>> {
        if !security.is_enabled() {
            return Err(StackError::Unsupported(
                "TLS stack selected without security parameters".to_string(),
            ));
        }

        let listener = TcpListener::bind(local).await?;
        let acceptor = TlsAcceptor::from(Arc::new(Self::build_server_config(security)?));
        debug!(addr = %listener.local_addr()?, "tls listener bound");
        Ok(Box::new(TlsServerChannel::new(
            listener,
            acceptor,
            properties.clone(),
        )))
    }
}

/// One established TLS conversation
pub struct TlsChannel {
    read_half: Mutex<ReadHalf<TlsStream<TcpStream>>>,
    write_half: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TlsChannel {
    fn new(
        stream: TlsStream<TcpStream>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            local_addr,
            remote_addr,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for TlsChannel {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        let mut half = self.write_half.lock().await;
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut buf = vec![0u8; READ_BUF_LEN];
        let mut half = self.read_half.lock().await;
        match half.read(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            // Peer dropped without close_notify; treat as end of stream.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StackError::from_io(&e)),
        }
    }

    async fn close_send(&self) -> Result<()> {
        let mut half = self.write_half.lock().await;
        half.shutdown().await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotConnected {
                Ok(())
            } else {
                Err(StackError::from_io(&e))
            }
        })?;
        Ok(())
    }

    async fn close(&self, _mode: CloseMode) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Both modes send close_notify; abortive teardown of the underlying
        // socket happens when the halves drop.
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn set_option(&self, option: ChannelOption) -> Result<()> {
        match option {
            ChannelOption::NoDelay(_) | ChannelOption::KeepAlive(_) => {
                Err(StackError::Unsupported(
                    "socket options are fixed after the TLS handshake".to_string(),
                ))
            }
        }
    }
}

/// Listening TLS socket; the handshake completes inside `accept`
pub struct TlsServerChannel {
    listener: std::sync::Mutex<Option<Arc<TcpListener>>>,
    local_addr: Option<SocketAddr>,
    acceptor: TlsAcceptor,
    properties: TransportProperties,
    closed: tokio::sync::Notify,
}

impl TlsServerChannel {
    fn new(listener: TcpListener, acceptor: TlsAcceptor, properties: TransportProperties) -> Self {
        let local_addr = listener.local_addr().ok();
        Self {
            listener: std::sync::Mutex::new(Some(Arc::new(listener))),
            local_addr,
            acceptor,
            properties,
            closed: tokio::sync::Notify::new(),
        }
    }

    fn listener(&self) -> Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .expect("listener lock poisoned")
            .clone()
            .ok_or(StackError::Closed)
    }
}

#[async_trait]
impl ServerChannel for TlsServerChannel {
    async fn accept(&self) -> Result<Box<dyn Channel>> {
        let listener = self.listener()?;
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => accepted.map_err(|e| StackError::from_io(&e))?,
            _ = self.closed.notified() => return Err(StackError::Closed),
        };
        apply_stream_properties(&stream, &self.properties)?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let tls = self.acceptor.accept(stream).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                StackError::AuthenticationFailed(e.to_string())
            } else {
                StackError::from_io(&e)
            }
        })?;
        debug!(%remote, "tls connection accepted");
        Ok(Box::new(TlsChannel::new(
            TlsStream::from(tls),
            local_addr,
            remote_addr,
        )))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        self.listener.lock().expect("listener lock poisoned").take();
        self.closed.notify_waiters();
        Ok(())
    }
}

/// Accepts any certificate during the handshake; the application verdict is
/// applied right after it with the negotiated parameters
#[derive(Debug)]
struct DeferredVerification;

impl ServerCertVerifier for DeferredVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Answers server certificate requests through the identity-challenge callback
struct ChallengeCertResolver {
    callback: tapestry_core::security::IdentityChallengeCallback,
}

impl std::fmt::Debug for ChallengeCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCertResolver").finish()
    }
}

impl ResolvesClientCert for ChallengeCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let challenge = IdentityChallenge {
            auth_type: "certificate".to_string(),
            acceptable_issuers: root_hint_subjects.iter().map(|s| s.to_vec()).collect(),
            server_name: String::new(),
            available_identities: Vec::new(),
        };
        let response = (self.callback)(&challenge)?;

        let key = PrivateKeyDer::try_from(response.private_key).ok()?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).ok()?;
        Some(Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(response.certificate)],
            signing_key,
        )))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> TransportProperties {
        TransportProperties::default()
    }

    #[tokio::test]
    async fn test_handshake_and_round_trip() {
        let stack = TlsTcpStack::new();
        let security = SecurityParameters::new().with_alpn("tapestry/1");

        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &security)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let __props = props();
        let (client, accepted) = tokio::join!(
            stack.connect(addr, Some("localhost"), None, &__props, &security),
            server.accept(),
        );
        let client = client.unwrap();
        let accepted = accepted.unwrap();

        client.write(b"over tls").await.unwrap();
        assert_eq!(accepted.read().await.unwrap().unwrap(), b"over tls");

        accepted.write(b"answer").await.unwrap();
        assert_eq!(client.read().await.unwrap().unwrap(), b"answer");
    }

    #[tokio::test]
    async fn test_trust_callback_sees_negotiated_params() {
        let stack = TlsTcpStack::new();
        let server_security = SecurityParameters::new();
        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &server_security)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let client_security = SecurityParameters::new().with_trust_verification(move |ctx| {
            seen_tx.send((ctx.server_name.clone(), ctx.chain.len())).unwrap();
            TrustVerdict::Accept
        });

        let __props = props();
        let (client, _accepted) = tokio::join!(
            stack.connect(addr, Some("localhost"), None, &__props, &client_security),
            server.accept(),
        );
        assert!(client.is_ok());

        let (name, chain_len) = seen_rx.recv().unwrap();
        assert_eq!(name, "localhost");
        assert!(chain_len >= 1);
    }

    #[tokio::test]
    async fn test_trust_rejection_fails_connect() {
        let stack = TlsTcpStack::new();
        let server_security = SecurityParameters::new();
        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &server_security)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client_security =
            SecurityParameters::new().with_trust_verification(|_| TrustVerdict::Reject);

        let __props = props();
        let (client, _accepted) = tokio::join!(
            stack.connect(addr, Some("localhost"), None, &__props, &client_security),
            server.accept(),
        );
        assert!(matches!(client, Err(StackError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_disabled_security_is_rejected() {
        let stack = TlsTcpStack::new();
        let result = stack
            .connect(
                "127.0.0.1:1".parse().unwrap(),
                None,
                None,
                &props(),
                &SecurityParameters::disabled(),
            )
            .await;
        assert!(matches!(result, Err(StackError::Unsupported(_))));
    }
}
