//! Byte Relay
//!
//! One direction of a session: read a chunk, write the whole chunk, repeat.
//! Only one chunk is ever in flight, so a slow writer throttles the reader.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::TunnelError;

/// Which way bytes are moving through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// How a relay direction terminated
#[derive(Debug)]
pub enum RelayEnd {
    /// Source reached a clean end of stream
    Eof { bytes: u64 },
    /// A read or write failed
    Failed { bytes: u64, error: TunnelError },
    /// The session was closed while this direction was still pending
    Cancelled,
}

/// Copy `reader` into `writer` one chunk at a time until EOF or error.
///
/// Each read fills at most `buf.len()` bytes and is forwarded as-is. The
/// next read is not issued until the previous chunk has been written in
/// full and flushed. `counter` is bumped after every completed chunk.
pub async fn relay_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    counter: &AtomicU64,
) -> RelayEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut bytes = 0u64;

    loop {
        let n = match reader.read(buf).await {
            Ok(0) => return RelayEnd::Eof { bytes },
            Ok(n) => n,
            Err(error) => {
                return RelayEnd::Failed {
                    bytes,
                    error: TunnelError::Io(error),
                }
            }
        };
        trace!("read {} bytes", n);

        let written = match writer.write_all(&buf[..n]).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(error) = written {
            return RelayEnd::Failed {
                bytes,
                error: TunnelError::Io(error),
            };
        }

        bytes += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
