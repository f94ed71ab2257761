//! Byte relay between a local connection and a remote channel
//!
//! Two pumps run per relay, one per direction. A pump reads one chunk, writes
//! all of it to the other side and flushes before it reads again, so at most
//! one chunk per direction is ever in flight. When either pump stops (EOF or
//! error) the other stops reading, finishes writing the chunk it already
//! holds (bounded by [`DRAIN_TIMEOUT`]), and then both sides are shut down.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::config::RelayConfig;

/// Any bidirectional byte stream a relay can pump
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted local connection
    Local,
    /// The channel opened on the device
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Relay errors. Each one only ever affects the relay it came from.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{side} side I/O error: {source}")]
    Io {
        side: Side,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open remote service {service}: {reason}")]
    Open { service: String, reason: String },
}

/// Byte counts for one finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub local_to_remote: u64,
    pub remote_to_local: u64,
    /// Side whose end-of-stream ended the relay
    pub closed_by: Side,
}

/// How long the surviving pump may spend finishing its in-flight chunk once
/// the other side has closed.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay bytes between `local` and `remote` until either side closes.
pub async fn relay<L, R>(local: L, remote: R, chunk_size: usize) -> Result<RelayStats, RelayError>
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let mut local_to_remote = 0u64;
    let mut remote_to_local = 0u64;
    let (stop_tx, stop_rx) = watch::channel(false);

    let (closed_by, result) = {
        let upstream = pump(
            &mut local_rd,
            &mut remote_wr,
            chunk_size,
            &mut local_to_remote,
            Side::Local,
            Side::Remote,
            stop_rx.clone(),
        );
        let downstream = pump(
            &mut remote_rd,
            &mut local_wr,
            chunk_size,
            &mut remote_to_local,
            Side::Remote,
            Side::Local,
            stop_rx,
        );
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        // The first pump to stop decides the outcome. The other one stops
        // reading but finishes the chunk it already accepted.
        tokio::select! {
            first = &mut upstream => {
                let _ = stop_tx.send(true);
                (Side::Local, first.and(drain(downstream, Side::Remote).await))
            }
            first = &mut downstream => {
                let _ = stop_tx.send(true);
                (Side::Remote, first.and(drain(upstream, Side::Local).await))
            }
        }
    };

    let _ = local_wr.shutdown().await;
    let _ = remote_wr.shutdown().await;

    debug!(
        %closed_by,
        local_to_remote,
        remote_to_local,
        "Relay closed"
    );
    result.map(|()| RelayStats {
        local_to_remote,
        remote_to_local,
        closed_by,
    })
}

async fn drain<F>(pump: F, from: Side) -> Result<(), RelayError>
where
    F: Future<Output = Result<(), RelayError>>,
{
    match tokio::time::timeout(DRAIN_TIMEOUT, pump).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%from, "Gave up draining in-flight chunk");
            Ok(())
        }
    }
}

async fn pump<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    chunk_size: usize,
    transferred: &mut u64,
    from: Side,
    to: Side,
    mut stop: watch::Receiver<bool>,
) -> Result<(), RelayError>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        if *stop.borrow_and_update() {
            return Ok(());
        }
        let n = tokio::select! {
            biased;
            _ = stop.changed() => return Ok(()),
            read = reader.read(&mut buf) => read.map_err(|source| RelayError::Io { side: from, source })?,
        };
        if n == 0 {
            return Ok(());
        }

        let mut written = 0;
        while written < n {
            let count = writer
                .write(&buf[written..n])
                .await
                .map_err(|source| RelayError::Io { side: to, source })?;
            if count == 0 {
                return Err(RelayError::Io {
                    side: to,
                    source: io::ErrorKind::WriteZero.into(),
                });
            }
            written += count;
            *transferred += count as u64;
        }
        writer
            .flush()
            .await
            .map_err(|source| RelayError::Io { side: to, source })?;
    }
}

/// Called by the session layer once a remote channel is open for a freshly
/// accepted local connection.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_channel_open(
        &self,
        connection: BoxStream,
        channel: BoxStream,
    ) -> Result<RelayStats, RelayError>;
}

/// [`ChannelHandler`] that relays the pair byte-for-byte.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    chunk_size: usize,
}

impl RelayEndpoint {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
        }
    }
}

#[async_trait]
impl ChannelHandler for RelayEndpoint {
    async fn on_channel_open(
        &self,
        connection: BoxStream,
        channel: BoxStream,
    ) -> Result<RelayStats, RelayError> {
        relay(connection, channel, self.chunk_size).await
    }
}
