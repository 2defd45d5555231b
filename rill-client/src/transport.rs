//! Socket ownership: TCP/TLS connect, frame-size enforcement, close.
//!
//! This is the only module that touches the OS socket. Everything above it
//! sees `send(bytes)` plus the read half handed out at connect time.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// A broker stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Write side of the connection plus the negotiated frame-size limit.
pub(crate) struct Transport {
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    frame_max: AtomicU32,
}

impl Transport {
    /// Opens the socket, applying connect timeout, no-delay, and the TLS
    /// upgrade when configured. Returns the transport and the read half
    /// for the read loop.
    pub(crate) async fn connect(
        config: &ClientConfig,
    ) -> Result<(Transport, ReadHalf<ClientStream>), ClientError> {
        tracing::debug!("connecting to {}:{}", config.host, config.port);

        let tcp_stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)?
        .map_err(ClientError::Io)?;

        if config.no_delay {
            tcp_stream.set_nodelay(true).ok();
        }

        let stream = match &config.tls {
            Some(tls_config) if tls_config.enabled => {
                let (connector, server_name) = if tls_config.insecure {
                    tracing::warn!("using insecure TLS (certificate verification disabled)");
                    create_insecure_tls_connector(tls_config, &config.host)?
                } else {
                    create_tls_connector(tls_config, &config.host)?
                };

                tracing::debug!("performing TLS handshake");
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                ClientStream::Tls { stream: tls_stream }
            }
            _ => ClientStream::Plain { stream: tcp_stream },
        };

        let (read_half, write_half) = tokio::io::split(stream);
        Ok((
            Transport {
                writer: Mutex::new(Some(write_half)),
                frame_max: AtomicU32::new(config.frame_max),
            },
            read_half,
        ))
    }

    /// Applies the tuned frame-size limit (0 = unlimited).
    pub(crate) fn set_frame_max(&self, max: u32) {
        self.frame_max.store(max, Ordering::SeqCst);
    }

    /// Writes one encoded frame, enforcing the negotiated frame size.
    pub(crate) async fn send(&self, frame: &[u8]) -> Result<(), ClientError> {
        let max = self.frame_max.load(Ordering::SeqCst);
        if max > 0 && frame.len() > max as usize {
            return Err(ClientError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(frame).await.map_err(ClientError::Io)?;
        writer.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Shuts the write half down; the read loop sees EOF shortly after.
    pub(crate) async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_frame_is_refused_before_the_socket() {
        let addr = bind_echo().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_read, write) = tokio::io::split(ClientStream::Plain { stream });

        let transport = Transport {
            writer: Mutex::new(Some(write)),
            frame_max: AtomicU32::new(8),
        };
        let err = transport.send(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::FrameTooLarge { size: 16, max: 8 }
        ));

        // Within the limit the write goes through.
        transport.send(&[0u8; 8]).await.unwrap();

        // After close every send fails.
        transport.close().await;
        assert!(matches!(
            transport.send(&[0u8; 2]).await,
            Err(ClientError::NotConnected)
        ));
    }

    async fn bind_echo() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _sock = listener.accept().await;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });
        addr
    }

    #[tokio::test]
    async fn refused_connection_surfaces_the_io_error() {
        // Bind then drop to find a port nobody is listening on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig::new("127.0.0.1").with_port(port);
        let result = Transport::connect(&config).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
