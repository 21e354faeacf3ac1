//! Fragmenting adapters for size-constrained streams.
//!
//! A relay session only accepts reads with a large-enough buffer and
//! writes no bigger than one DATA frame. The adapters in this module
//! bridge that to ordinary callers: [`FragmentingReader`] serves reads of
//! any size out of an internal buffer, and [`FragmentingWriter`] splits
//! arbitrarily large writes into frame-sized windows.

use async_trait::async_trait;
use bytes::BytesMut;

use crate::error::Result;
use crate::session::{RelayReadHalf, RelayStream, RelayWriteHalf, MAX_WRITE_SIZE, MIN_READ_SIZE};

/// A stream that requires a minimum read buffer size.
#[async_trait]
pub trait SessionRead: Send {
    /// Smallest buffer [`SessionRead::read`] accepts.
    fn min_read_size(&self) -> usize;

    /// Reads the next chunk; `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// A stream that caps the size of a single write.
#[async_trait]
pub trait SessionWrite: Send {
    /// Largest write [`SessionWrite::write`] accepts.
    fn max_write_size(&self) -> usize;

    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl SessionRead for RelayReadHalf {
    fn min_read_size(&self) -> usize {
        MIN_READ_SIZE
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        RelayReadHalf::read(self, buf).await
    }
}

#[async_trait]
impl SessionWrite for RelayWriteHalf {
    fn max_write_size(&self) -> usize {
        MAX_WRITE_SIZE
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        RelayWriteHalf::write(self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        RelayWriteHalf::close(self).await
    }
}

#[async_trait]
impl SessionRead for RelayStream {
    fn min_read_size(&self) -> usize {
        MIN_READ_SIZE
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        RelayStream::read(self, buf).await
    }
}

#[async_trait]
impl SessionWrite for RelayStream {
    fn max_write_size(&self) -> usize {
        MAX_WRITE_SIZE
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        RelayStream::write(self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        RelayStream::close(self).await
    }
}

/// Reader adapter that accepts buffers of any size.
///
/// Reads with a large-enough caller buffer pass straight through; smaller
/// reads go through an internal buffer whose remainder is served on
/// subsequent calls. The wrapped stream never sees an undersized buffer.
pub struct FragmentingReader<R: SessionRead> {
    inner: R,
    leftover: BytesMut,
}

impl<R: SessionRead> FragmentingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            leftover: BytesMut::new(),
        }
    }

    /// Reads into `buf`; `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            let chunk = self.leftover.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(n);
        }

        let min = self.inner.min_read_size();
        if buf.len() >= min {
            return self.inner.read(buf).await;
        }

        let mut scratch = vec![0u8; min];
        let n = self.inner.read(&mut scratch).await?;
        if n == 0 {
            return Ok(0);
        }

        let take = buf.len().min(n);
        buf[..take].copy_from_slice(&scratch[..take]);
        self.leftover.extend_from_slice(&scratch[take..n]);
        Ok(take)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writer adapter that accepts writes of any size.
pub struct FragmentingWriter<W: SessionWrite> {
    inner: W,
    closed: bool,
}

impl<W: SessionWrite> FragmentingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Writes all of `buf`, split into max-write-sized windows in order.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let max = self.inner.max_write_size();
        for window in buf.chunks(max) {
            let mut written = 0;
            while written < window.len() {
                written += self.inner.write(&window[written..]).await?;
            }
        }
        Ok(())
    }

    /// Closes the wrapped stream. Later calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}

/// Both adapters over one stream, for single-task callers.
pub struct FragmentingStream<S: SessionRead + SessionWrite> {
    inner: S,
    leftover: BytesMut,
    closed: bool,
}

impl<S: SessionRead + SessionWrite> FragmentingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            leftover: BytesMut::new(),
            closed: false,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            let chunk = self.leftover.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(n);
        }

        let min = self.inner.min_read_size();
        if buf.len() >= min {
            return self.inner.read(buf).await;
        }

        let mut scratch = vec![0u8; min];
        let n = self.inner.read(&mut scratch).await?;
        if n == 0 {
            return Ok(0);
        }

        let take = buf.len().min(n);
        buf[..take].copy_from_slice(&scratch[..take]);
        self.leftover.extend_from_slice(&scratch[take..n]);
        Ok(take)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let max = self.inner.max_write_size();
        for window in buf.chunks(max) {
            let mut written = 0;
            while written < window.len() {
                written += self.inner.write(&window[written..]).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}
