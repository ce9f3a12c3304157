// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The common byte-stream capability every layer in the adapter stack
//! builds on. A FakeTLS record reader wraps a raw socket; an obfuscation
//! reader wraps the FakeTLS reader; a framing reader wraps the obfuscation
//! reader — each layer only needs to know it is talking to "something that
//! yields bytes", not what is underneath it.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{FrameError, FrameResult};

bitflags::bitflags! {
    /// Per-write options recognized by some adapters. Most layers ignore
    /// flags they don't understand rather than erroring on them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WriteExtra: u8 {
        const QUICKACK = 0b01;
        const SIMPLE_ACK = 0b10;
    }
}

/// Readable half of a layered stream.
pub trait ByteSource {
    /// Reads up to `max` bytes. May return fewer, including zero only at
    /// EOF (an empty non-EOF read is not a valid outcome).
    async fn read(&mut self, max: usize) -> FrameResult<Bytes>;

    /// Reads exactly `n` bytes, failing with [`FrameError::UnexpectedEof`]
    /// if the peer closes first.
    async fn read_exactly(&mut self, n: usize) -> FrameResult<Bytes>;
}

/// Writable half of a layered stream.
pub trait ByteSink {
    /// Writes `data`, returning the number of bytes accepted. `extra`
    /// flags are interpreted per adapter; adapters that don't recognize a
    /// flag silently ignore it.
    async fn write(&mut self, data: &[u8], extra: WriteExtra) -> FrameResult<usize>;

    /// Signals that no more data will be written and half-closes if the
    /// underlying transport supports it.
    async fn write_eof(&mut self) -> FrameResult<()>;

    /// Flushes any buffered output.
    async fn drain(&mut self) -> FrameResult<()>;

    /// Closes the stream gracefully.
    async fn close(&mut self) -> FrameResult<()>;

    /// Tears the stream down immediately, bypassing graceful shutdown.
    /// Used when a sibling splice direction has already failed.
    fn abort(&mut self);
}

/// The bottom of every stack: a raw, unframed, unencrypted TCP half.
pub struct TcpSource<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> TcpSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: AsyncRead + Unpin> ByteSource for TcpSource<R> {
    async fn read(&mut self, max: usize) -> FrameResult<Bytes> {
        let mut buf = BytesMut::zeroed(max);
        let n = self.inner.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    async fn read_exactly(&mut self, n: usize) -> FrameResult<Bytes> {
        let mut buf = BytesMut::zeroed(n);
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(FrameError::from)?;
        Ok(buf.freeze())
    }
}

pub struct TcpSink<W> {
    inner: W,
    aborted: bool,
}

impl<W: AsyncWrite + Unpin> TcpSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            aborted: false,
        }
    }
}

impl<W: AsyncWrite + Unpin> ByteSink for TcpSink<W> {
    async fn write(&mut self, data: &[u8], _extra: WriteExtra) -> FrameResult<usize> {
        self.inner.write_all(data).await?;
        Ok(data.len())
    }

    async fn write_eof(&mut self) -> FrameResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn drain(&mut self) -> FrameResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> FrameResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}
