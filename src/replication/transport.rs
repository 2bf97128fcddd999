//! QUIC Transport
//!
//! Point-to-point links between master and satellites over QUIC (via
//! Quinn). Each link is one bidirectional stream carrying length-prefixed
//! `SyncEnvelope` frames.
//!
//! TLS uses a throwaway self-signed certificate per endpoint and clients
//! skip certificate verification: the channel is encrypted, and trust is
//! established by the HMAC handshake on top of it.

use crate::replication::codec::{
    decode_envelope, decode_length, encode_frame, InboundSequence, OutboundSequence, SyncMessage,
    MAX_FRAME_SIZE,
};
use crate::replication::error::{SyncError, TransportError};
use crate::replication::stats::StatsTracker;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// TLS server name used by all nodes.
pub const SERVER_NAME: &str = "multipc-sync";

/// Application close code for an orderly close.
const CLOSE_OK: u32 = 0;

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(idle_timeout: Duration) -> anyhow::Result<Arc<quinn::TransportConfig>> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::IdleTimeout::try_from(idle_timeout)?));
    Ok(Arc::new(transport))
}

/// Build the server half: a fresh self-signed certificate.
fn server_config(idle_timeout: Duration) -> anyhow::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec())];
    let private_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("failed to parse private key: {}", e))?;

    let server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;

    let mut config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    config.transport_config(transport_config(idle_timeout)?);
    Ok(config)
}

fn client_config(idle_timeout: Duration) -> anyhow::Result<ClientConfig> {
    let provider = crypto_provider();
    let client_crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();

    let mut config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));
    config.transport_config(transport_config(idle_timeout)?);
    Ok(config)
}

/// Bind a listening endpoint for the master.
#[cfg_attr(coverage_nightly, coverage(off))]
pub fn listen(addr: SocketAddr, idle_timeout: Duration) -> anyhow::Result<Endpoint> {
    let mut endpoint = Endpoint::server(server_config(idle_timeout)?, addr)?;
    endpoint.set_default_client_config(client_config(idle_timeout)?);
    Ok(endpoint)
}

/// Create a client-only endpoint for satellites and probes.
#[cfg_attr(coverage_nightly, coverage(off))]
pub fn client_endpoint(idle_timeout: Duration) -> anyhow::Result<Endpoint> {
    let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    endpoint.set_default_client_config(client_config(idle_timeout)?);
    Ok(endpoint)
}

fn read_error(e: quinn::ReadExactError) -> TransportError {
    match e {
        quinn::ReadExactError::FinishedEarly(_) => TransportError::Closed,
        quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(
            quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed,
        )) => TransportError::Closed,
        quinn::ReadExactError::ReadError(e) => TransportError::Io(e.to_string()),
    }
}

/// Writing half of a link. Owns the outgoing sequence counter.
pub struct LinkSender {
    send: SendStream,
    sequence: OutboundSequence,
    stats: Arc<StatsTracker>,
}

impl LinkSender {
    /// Encode and write one message.
    pub async fn send(&mut self, msg: SyncMessage) -> Result<(), SyncError> {
        let kind = msg.kind();
        let envelope = msg.into_envelope(self.sequence.next())?;
        let frame = encode_frame(&envelope)?;

        self.send
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.stats.record_sent(frame.len());
        tracing::trace!("sent {} seq={}", kind.as_str(), envelope.sequence);
        Ok(())
    }

    /// Finish the stream and give the peer a moment to read what was sent.
    pub async fn finish(&mut self, linger: Duration) {
        if self.send.finish().is_ok() {
            let _ = tokio::time::timeout(linger, self.send.stopped()).await;
        }
    }
}

/// Reading half of a link.
///
/// A dedicated task reads frames so a partially read frame is never lost
/// when the session loop's `select!` picks another branch.
pub struct LinkReceiver {
    rx: mpsc::Receiver<Result<SyncMessage, SyncError>>,
    task: JoinHandle<()>,
}

impl LinkReceiver {
    fn spawn(recv: RecvStream, stats: Arc<StatsTracker>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(Self::read_loop(recv, tx, stats));
        Self { rx, task }
    }

    /// Next message, `None` once the reader has stopped.
    pub async fn recv(&mut self) -> Option<Result<SyncMessage, SyncError>> {
        self.rx.recv().await
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn read_loop(
        mut recv: RecvStream,
        tx: mpsc::Sender<Result<SyncMessage, SyncError>>,
        stats: Arc<StatsTracker>,
    ) {
        let mut sequence = InboundSequence::default();
        loop {
            let result = Self::read_one(&mut recv, &mut sequence, &stats).await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                break;
            }
        }
    }

    async fn read_one(
        recv: &mut RecvStream,
        sequence: &mut InboundSequence,
        stats: &StatsTracker,
    ) -> Result<SyncMessage, SyncError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await.map_err(read_error)?;
        let len = decode_length(&len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len).into());
        }

        let mut data = vec![0u8; len];
        recv.read_exact(&mut data).await.map_err(read_error)?;
        stats.record_received(4 + len);

        let envelope = decode_envelope(&data)?;
        sequence.check(envelope.sequence)?;
        Ok(SyncMessage::from_envelope(&envelope)?)
    }
}

impl Drop for LinkReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An established link to one peer.
pub struct SyncLink {
    pub sender: LinkSender,
    pub receiver: LinkReceiver,
    connection: Connection,
}

impl SyncLink {
    fn new(connection: Connection, send: SendStream, recv: RecvStream, stats: Arc<StatsTracker>) -> Self {
        Self {
            sender: LinkSender {
                send,
                sequence: OutboundSequence::default(),
                stats: stats.clone(),
            },
            receiver: LinkReceiver::spawn(recv, stats),
            connection,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub async fn send(&mut self, msg: SyncMessage) -> Result<(), SyncError> {
        self.sender.send(msg).await
    }

    /// Wait for the next message, failing after `timeout`.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
        what: &'static str,
    ) -> Result<SyncMessage, SyncError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(TransportError::Closed.into()),
            Err(_) => Err(TransportError::Timeout(what).into()),
        }
    }

    /// Send a final message, then close the connection.
    pub async fn close_with(mut self, msg: SyncMessage, reason: &str) {
        if self.sender.send(msg).await.is_ok() {
            self.sender.finish(Duration::from_millis(250)).await;
        }
        self.close(reason);
    }

    /// Close the connection immediately.
    pub fn close(&self, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(CLOSE_OK), reason.as_bytes());
    }
}

/// Open a link to `addr`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    stats: Arc<StatsTracker>,
) -> Result<SyncLink, TransportError> {
    let connect_err = |e: &dyn std::fmt::Display| TransportError::Connect {
        addr,
        reason: e.to_string(),
    };

    let connection = endpoint
        .connect(addr, SERVER_NAME)
        .map_err(|e| connect_err(&e))?
        .await
        .map_err(|e| connect_err(&e))?;
    let (send, recv) = connection.open_bi().await.map_err(|e| connect_err(&e))?;

    Ok(SyncLink::new(connection, send, recv, stats))
}

/// Complete an incoming connection and accept its stream.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn accept(
    incoming: quinn::Incoming,
    stats: Arc<StatsTracker>,
) -> Result<SyncLink, TransportError> {
    let connection = incoming
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;

    Ok(SyncLink::new(connection, send, recv, stats))
}

/// Accept any server certificate; peers authenticate in the handshake.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

#[cfg_attr(coverage_nightly, coverage(off))]
impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
