//! Object readers and writers.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::{BucketError, Result};
use crate::session::SessionLease;

/// Size of the buffer used when moving bytes between streams.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Readable stream over one stored object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stream for one object.
///
/// Bytes become visible under the key once [`ObjectWriter::close`] succeeds.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Commit the object. Writing after close is an error.
    async fn close(&mut self) -> Result<()>;
}

/// Writer that accepts and drops everything. Used in dry-run mode.
#[derive(Debug, Default)]
pub struct DiscardWriter {
    written: u64,
}

impl DiscardWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl ObjectWriter for DiscardWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reader that owns the session it streams from.
pub(crate) struct LeasedReader<H> {
    inner: ObjectReader,
    lease: SessionLease<H>,
    eof: bool,
}

impl<H> LeasedReader<H> {
    pub(crate) fn new(inner: ObjectReader, lease: SessionLease<H>) -> Self {
        Self {
            inner,
            lease,
            eof: false,
        }
    }
}

impl<H> AsyncRead for LeasedReader<H> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.eof {
            return Poll::Ready(Ok(()));
        }
        if this.lease.token().is_cancelled() {
            return Poll::Ready(Err(io::Error::other("object stream closed: operation canceled")));
        }

        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        // End of stream: hand the session back without waiting for drop.
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.eof = true;
                this.lease.finish();
            }
        }
        poll
    }
}

/// Writer that owns the session it streams to.
pub(crate) struct LeasedWriter<H> {
    inner: Box<dyn ObjectWriter>,
    lease: SessionLease<H>,
}

impl<H> LeasedWriter<H> {
    pub(crate) fn new(inner: Box<dyn ObjectWriter>, lease: SessionLease<H>) -> Self {
        Self { inner, lease }
    }
}

#[async_trait]
impl<H> ObjectWriter for LeasedWriter<H>
where
    H: Send + Sync + 'static,
{
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let Self { inner, lease } = self;
        if lease.token().is_cancelled() {
            return Err(BucketError::Canceled);
        }
        tokio::select! {
            biased;
            _ = lease.token().cancelled() => Err(BucketError::Canceled),
            res = inner.write_all(buf) => res,
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Self { inner, lease } = self;
        let result = if lease.token().is_cancelled() {
            Err(BucketError::Canceled)
        } else {
            tokio::select! {
                biased;
                _ = lease.token().cancelled() => Err(BucketError::Canceled),
                res = inner.close() => res,
            }
        };
        lease.finish();
        result
    }
}

/// Move every byte of `reader` into `writer`, stopping early if `ctx` is cancelled.
///
/// Does not close the writer.
pub async fn copy_to_writer(
    ctx: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    writer: &mut dyn ObjectWriter,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_chunk(ctx, reader, &mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Move every byte of `reader` into a local file and flush it.
pub async fn copy_to_file(
    ctx: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    file: &mut File,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_chunk(ctx, reader, &mut buf).await?;
        if n == 0 {
            file.flush().await?;
            return Ok(total);
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

async fn read_chunk(
    ctx: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> Result<usize> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(BucketError::Canceled),
        read = reader.read(buf) => read.map_err(|err| {
            if ctx.is_cancelled() {
                BucketError::Canceled
            } else {
                BucketError::Io(err)
            }
        }),
    }
}
