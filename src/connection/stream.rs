//! Plain TCP and TLS client sockets behind one type.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::ConnectionOptions;
use crate::error::{Error, Result};

/// Wrapper enum for TCP and TLS streams to avoid dynamic dispatch
#[allow(clippy::large_enum_variant)]
pub enum ClientStream {
  Tcp(TcpStream),
  Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for ClientStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// Open a socket to the configured host, with TLS unless disabled.
pub async fn open_stream(options: &ConnectionOptions) -> Result<ClientStream> {
  let addr = format!("{}:{}", options.host, options.port);
  let tcp = TcpStream::connect(&addr)
    .await
    .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
  tcp.set_nodelay(true)?;

  if !options.tls {
    debug!(%addr, "TCP connection established");
    return Ok(ClientStream::Tcp(tcp));
  }

  let connector = TlsConnector::from(Arc::new(tls_config(options.verify_cert)?));
  let server_name = ServerName::try_from(options.host.clone())
    .map_err(|e| Error::Tls(format!("Invalid server name {}: {}", options.host, e)))?;
  let tls = connector
    .connect(server_name, tcp)
    .await
    .map_err(|e| Error::Tls(e.to_string()))?;

  debug!(%addr, "TLS connection established");
  Ok(ClientStream::Tls(tls))
}

fn tls_config(verify_cert: bool) -> Result<rustls::ClientConfig> {
  let provider = Arc::new(rustls::crypto::ring::default_provider());
  let builder =
    rustls::ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions()?;

  let config = if verify_cert {
    let roots = RootCertStore {
      roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
      .with_no_client_auth()
  };
  Ok(config)
}

// Accepts any certificate; only used when verification is turned off.
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
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
