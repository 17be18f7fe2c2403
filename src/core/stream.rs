//! Streaming plumbing for episode transfers
//!
//! Wraps an HTTP response body as an `AsyncRead` and reads it in fixed-size
//! chunks, which are the granularity of pause, cancel and checkpoints.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// A unified stream for HTTP sources
pub enum DownloadStream {
    /// HTTP stream using reqwest
    Http(Box<dyn AsyncRead + Send + Unpin>),
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            DownloadStream::Http(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

/// Progress callback: `(downloaded_bytes, total_bytes, bytes_per_second)`.
///
/// `total_bytes` is 0 when the server did not report a size. The speed is
/// measured since the previous invocation, not averaged over the transfer.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, f64) + Send + Sync>;

/// Tuning for a single episode transfer
#[derive(Clone)]
pub struct TransferOptions {
    /// Optional progress callback
    pub progress: Option<ProgressCallback>,

    /// Bytes read from the network per chunk
    pub chunk_size: usize,

    /// Chunks' worth of bytes between persisted checkpoints
    pub checkpoint_chunks: usize,

    /// Poll interval while paused
    pub pause_poll_interval: Duration,
}

impl TransferOptions {
    /// Bytes transferred between two checkpoints
    pub fn checkpoint_interval(&self) -> u64 {
        (self.chunk_size.max(1) * self.checkpoint_chunks.max(1)) as u64
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            progress: None,
            chunk_size: 1024 * 1024, // 1MB
            checkpoint_chunks: 5,
            pause_poll_interval: Duration::from_millis(100),
        }
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress", &self.progress.is_some())
            .field("chunk_size", &self.chunk_size)
            .field("checkpoint_chunks", &self.checkpoint_chunks)
            .field("pause_poll_interval", &self.pause_poll_interval)
            .finish()
    }
}

/// Creates a DownloadStream from an HTTP response
pub fn create_http_stream(response: reqwest::Response) -> DownloadStream {
    let stream = Box::new(tokio_util::io::StreamReader::new(
        response.bytes_stream().map_err(std::io::Error::other),
    ));
    DownloadStream::Http(stream)
}

/// Fill `buffer` from `stream`, stopping early only at end of stream.
///
/// Returns the number of bytes read; 0 means the stream is exhausted.
pub async fn read_chunk<R>(stream: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = stream.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
