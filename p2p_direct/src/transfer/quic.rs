//! QUIC message transport.
//!
//! Frames on the stream are `[kind u8][len u32 BE][bytes]`, kind 0 for text and
//! 1 for binary. Outbound frames go through a writer task so that
//! `buffered_amount` reports bytes queued but not yet written to the stream.

use crate::error::TransportError;
use anyhow::Result;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::constants::{ALPN, MAX_FRAME_SIZE};
use super::protocol::WireMessage;
use super::transport::{InboundMessages, MessageTransport};

const FRAME_TEXT: u8 = 0;
const FRAME_BINARY: u8 = 1;

/// Generate a self-signed certificate for QUIC
pub fn generate_self_signed_cert()
-> Result<(Vec<CertificateDer<'static>>, PrivatePkcs8KeyDer<'static>)> {
    let certified_key = generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    Ok((vec![cert_der], key))
}

fn transport_config() -> Result<TransportConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    transport_config.keep_alive_interval(Some(Duration::from_secs(2)));
    transport_config.stream_receive_window((10 * 1024 * 1024u32).into()); // 10 MiB
    transport_config.receive_window((20 * 1024 * 1024u32).into()); // 20 MiB
    transport_config.send_window(20 * 1024 * 1024);
    Ok(transport_config)
}

/// Create a QUIC server endpoint
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let (certs, key) = generate_self_signed_cert()?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Ok(Endpoint::server(server_config, bind_addr)?)
}

/// Create a QUIC client endpoint (skip certificate verification for P2P)
pub fn make_client_endpoint() -> Result<Endpoint> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Open the message stream on an established connection (initiating side)
pub async fn open_channel(connection: &Connection) -> Result<(QuicTransport, QuicInbound)> {
    let (send, recv) = connection.open_bi().await?;
    Ok((QuicTransport::new(send), QuicInbound::new(recv)))
}

/// Accept the message stream opened by the peer
pub async fn accept_channel(connection: &Connection) -> Result<(QuicTransport, QuicInbound)> {
    let (send, recv) = connection.accept_bi().await?;
    Ok((QuicTransport::new(send), QuicInbound::new(recv)))
}

/// Outbound half of a QUIC message stream.
#[derive(Debug)]
pub struct QuicTransport {
    queue: mpsc::UnboundedSender<WireMessage>,
    buffered: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

impl QuicTransport {
    /// Spawns the writer task; must be called inside a tokio runtime.
    pub fn new(send: SendStream) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicU64::new(0));
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_writer(send, rx, buffered.clone(), open.clone()));
        Self {
            queue,
            buffered,
            open,
        }
    }
}

async fn run_writer(
    mut send: SendStream,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    buffered: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
) {
    while let Some(message) = rx.recv().await {
        let len = message.len() as u64;
        let result = write_frame(&mut send, &message).await;
        buffered.fetch_sub(len, Ordering::SeqCst);
        if let Err(e) = result {
            warn!("QUIC message stream write failed: {}", e);
            open.store(false, Ordering::SeqCst);
            return;
        }
    }
    // Every sender handle is gone: flush and close our side
    let _ = send.finish();
    let _ = tokio::time::timeout(Duration::from_secs(2), send.stopped()).await;
    debug!("QUIC message stream finished");
}

impl MessageTransport for QuicTransport {
    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if message.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Failed(format!(
                "frame too large ({} bytes, max {})",
                message.len(),
                MAX_FRAME_SIZE
            )));
        }
        let len = message.len() as u64;
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.queue.send(message).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Inbound half of a QUIC message stream.
#[derive(Debug)]
pub struct QuicInbound {
    recv: RecvStream,
}

impl QuicInbound {
    pub fn new(recv: RecvStream) -> Self {
        Self { recv }
    }
}

impl InboundMessages for QuicInbound {
    async fn recv(&mut self) -> Option<WireMessage> {
        match read_frame(&mut self.recv).await {
            Ok(message) => message,
            Err(e) => {
                warn!("QUIC message stream read failed: {}", e);
                None
            }
        }
    }
}

/// Write one frame to the stream
pub async fn write_frame(send: &mut SendStream, message: &WireMessage) -> Result<()> {
    let kind = match message {
        WireMessage::Text(_) => FRAME_TEXT,
        WireMessage::Binary(_) => FRAME_BINARY,
    };
    let len = (message.len() as u32).to_be_bytes();
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&len);
    send.write_all(&header).await?;
    send.write_all(message.as_bytes()).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the peer finished the stream cleanly.
pub async fn read_frame(recv: &mut RecvStream) -> Result<Option<WireMessage>> {
    let mut header = [0u8; 5];
    match recv.read_exact(&mut header).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow::anyhow!(
            "Message too large: {} bytes (max {})",
            len,
            MAX_FRAME_SIZE
        ));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    match header[0] {
        FRAME_TEXT => Ok(Some(WireMessage::Text(String::from_utf8(buf)?))),
        FRAME_BINARY => Ok(Some(WireMessage::Binary(Bytes::from(buf)))),
        other => Err(anyhow::anyhow!("Unknown frame kind {}", other)),
    }
}

/// Custom certificate verifier that skips verification (for self-signed certs in P2P)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
