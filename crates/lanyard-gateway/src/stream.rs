//! Non-blocking buffered TLS stream client (L0).
//!
//! One `SecureStream` backs one gateway or voice signalling connection.
//! Writes land in an internal output buffer and are flushed opportunistically
//! by [`SecureStream::drive`], which also surfaces inbound data, a one-hertz
//! tick for the layers above, and an external wake hook.

use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Notify;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::ConnectError;

pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

const READ_CHUNK: usize = 16 * 1024;

/// What woke the stream loop up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamActivity {
    /// New bytes are available in the read buffer.
    Data,
    /// A wall-clock second boundary passed.
    Tick,
    /// An external component fired the wake hook.
    Wake,
    /// The peer closed the connection.
    Eof,
}

/// Build the rustls client config, honoring a configured CA bundle.
pub fn tls_client_config(ca_bundle: Option<&Path>) -> Result<Arc<ClientConfig>, ConnectError> {
    let mut roots = RootCertStore::empty();
    match ca_bundle {
        Some(path) => {
            let file = File::open(path).map_err(|e| ConnectError::CaBundle {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let mut reader = BufReader::new(file);
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| ConnectError::CaBundle {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                roots.add(cert).map_err(|e| ConnectError::CaBundle {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                added += 1;
            }
            if added == 0 {
                return Err(ConnectError::CaBundle {
                    path: path.display().to_string(),
                    reason: "no certificates found".into(),
                });
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

pub struct SecureStream {
    reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    bytes_in: u64,
    bytes_out: u64,
    tick: Interval,
    wake: Arc<Notify>,
}

impl SecureStream {
    /// Resolve, connect and complete the TLS handshake. `wake` is the
    /// externally shared hook that makes [`Self::drive`] return early; it
    /// outlives any single connection so queued work survives reconnects.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: Arc<ClientConfig>,
        wake: Arc<Notify>,
    ) -> Result<Self, ConnectError> {
        let mut addrs = lookup_host((host, port))
            .await
            .map_err(|_| ConnectError::Dns(host.to_string()))?;
        let addr = addrs.next().ok_or_else(|| ConnectError::Dns(host.to_string()))?;

        let tcp = TcpStream::connect(addr).await.map_err(ConnectError::Tcp)?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ConnectError::Dns(host.to_string()))?;
        let connector = TlsConnector::from(tls);
        let tls_stream = tokio::time::timeout(
            Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| ConnectError::HandshakeTimeout(TLS_HANDSHAKE_TIMEOUT_SECS))?
        .map_err(ConnectError::Tls)?;

        tracing::debug!(host, port, "tls connection established");

        let (reader, writer) = tokio::io::split(tls_stream);
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            bytes_in: 0,
            bytes_out: 0,
            tick,
            wake,
        })
    }

    /// Append to the output buffer. Never blocks; transmission happens
    /// inside [`drive`].
    pub fn write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Handle other components can use to make the loop re-inspect its
    /// buffers without waiting for socket readiness or the next tick.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Wait for the next piece of work. Pending output is flushed as the
    /// socket accepts it; flush progress does not return to the caller.
    pub async fn drive(&mut self) -> std::io::Result<StreamActivity> {
        loop {
            tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(StreamActivity::Eof);
                    }
                    self.bytes_in += n as u64;
                    return Ok(StreamActivity::Data);
                }
                written = self.writer.write(self.write_buf.as_ref()), if !self.write_buf.is_empty() => {
                    let n = written?;
                    self.bytes_out += n as u64;
                    self.write_buf.advance(n);
                    if self.write_buf.is_empty() {
                        self.writer.flush().await?;
                    }
                }
                _ = self.tick.tick() => {
                    return Ok(StreamActivity::Tick);
                }
                _ = self.wake.notified() => {
                    return Ok(StreamActivity::Wake);
                }
            }
        }
    }

    /// Inbound bytes not yet consumed by the layer above. The caller
    /// removes processed prefixes in place.
    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub fn pending_write_len(&self) -> usize {
        self.write_buf.len()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Flush what remains and send the TLS close-notify.
    pub async fn close(&mut self) {
        if !self.write_buf.is_empty() {
            if let Ok(n) = self.writer.write(self.write_buf.as_ref()).await {
                self.bytes_out += n as u64;
                self.write_buf.advance(n);
            }
        }
        let _ = self.writer.shutdown().await;
    }
}
