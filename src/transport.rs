//! Byte stream beneath an IMAP session
//!
//! A session runs over either a plaintext TCP socket or a rustls TLS stream,
//! depending on the account's `secure` flag.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::errors::{AppError, AppResult};

/// Plaintext or TLS-wrapped TCP stream
#[derive(Debug)]
pub enum MailStream {
    Plain(TcpStream),
    /// Boxed to keep the enum small
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Build a TLS connector trusting the bundled webpki roots
pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Validate a hostname for TLS SNI
///
/// # Errors
///
/// Returns `InvalidInput` if the host is neither a DNS name nor an IP address.
pub fn server_name(host: &str) -> AppResult<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| AppError::InvalidInput(format!("invalid IMAP host for TLS SNI: '{host}'")))
}

#[cfg(test)]
mod tests {
    use super::server_name;

    #[test]
    fn accepts_dns_names_and_ip_addresses() {
        server_name("imap.example.com").expect("dns name is valid");
        server_name("127.0.0.1").expect("ip address is valid");
    }

    #[test]
    fn rejects_malformed_host() {
        let err = server_name("bad host name").expect_err("must fail");
        assert!(err.to_string().contains("TLS SNI"));
    }
}
