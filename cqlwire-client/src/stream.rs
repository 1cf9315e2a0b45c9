//! Transport: plain TCP or TLS, behind one `AsyncRead + AsyncWrite` type.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::tls::build_connector;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// Socket to one node, plain or TLS-wrapped.
    #[project = Transport]
    pub enum ClientStream {
        Tcp { #[pin] io: TcpStream },
        Tls { #[pin] io: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

/// Opens a TCP connection to `addr` and upgrades it to TLS when configured.
///
/// Both steps share `config.connect_timeout`.
pub async fn connect(addr: SocketAddr, config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
    tokio::time::timeout(config.connect_timeout, open(addr, config))
        .await
        .map_err(|_| {
            tracing::debug!(%addr, "connect timed out");
            ClientError::Timeout
        })?
}

async fn open(addr: SocketAddr, config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
    let tcp = TcpStream::connect(addr).await.map_err(|e| {
        tracing::debug!(%addr, error = %e, "TCP connect failed");
        ClientError::from(e)
    })?;
    if let Err(e) = tcp.set_nodelay(true) {
        tracing::debug!(%addr, error = %e, "could not set TCP_NODELAY");
    }

    let Some(tls_config) = config.tls.as_ref().filter(|t| t.enabled) else {
        return Ok(ClientStream::Tcp { io: tcp });
    };

    let host = addr.ip().to_string();
    let (connector, server_name) = build_connector(tls_config, &host)?;

    tracing::debug!(%addr, "performing TLS handshake");
    let io = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
    Ok(ClientStream::Tls { io })
}

/// Forwards a poll method to whichever transport is active.
macro_rules! dispatch {
    ($this:expr, $method:ident($($arg:expr),*)) => {
        match $this.project() {
            Transport::Tcp { io } => io.$method($($arg),*),
            Transport::Tls { io } => io.$method($($arg),*),
        }
    };
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self, poll_read(cx, buf))
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self, poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self, poll_write_vectored(cx, bufs))
    }

    // Frames are written as header + body slices.
    fn is_write_vectored(&self) -> bool {
        match self {
            ClientStream::Tcp { io } => io.is_write_vectored(),
            ClientStream::Tls { io } => io.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self, poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self, poll_shutdown(cx))
    }
}
