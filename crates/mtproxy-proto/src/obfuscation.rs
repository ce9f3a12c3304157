// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-direction AES-CTR layer that sits directly below the MTProto
//! framing. Block size is effectively 1 (a pure keystream) except when
//! this layer is wrapping a CBC stream, in which case callers must keep
//! reads aligned to 16 bytes themselves.

use bytes::{Bytes, BytesMut};
use mtproxy_crypto::AesCtr;

use crate::errors::FrameResult;
use crate::io::{ByteSink, ByteSource, WriteExtra};

pub struct ObfuscatedSource<S> {
    inner: S,
    cipher: AesCtr,
}

impl<S: ByteSource> ObfuscatedSource<S> {
    pub fn new(inner: S, cipher: AesCtr) -> Self {
        Self { inner, cipher }
    }
}

impl<S: ByteSource> ByteSource for ObfuscatedSource<S> {
    async fn read(&mut self, max: usize) -> FrameResult<Bytes> {
        let data = self.inner.read(max).await?;
        let mut buf = BytesMut::from(data.as_ref());
        self.cipher.apply(&mut buf);
        Ok(buf.freeze())
    }

    async fn read_exactly(&mut self, n: usize) -> FrameResult<Bytes> {
        let data = self.inner.read_exactly(n).await?;
        let mut buf = BytesMut::from(data.as_ref());
        self.cipher.apply(&mut buf);
        Ok(buf.freeze())
    }
}

pub struct ObfuscatedSink<K> {
    inner: K,
    cipher: AesCtr,
}

impl<K: ByteSink> ObfuscatedSink<K> {
    pub fn new(inner: K, cipher: AesCtr) -> Self {
        Self { inner, cipher }
    }
}

impl<K: ByteSink> ByteSink for ObfuscatedSink<K> {
    async fn write(&mut self, data: &[u8], extra: WriteExtra) -> FrameResult<usize> {
        let mut buf = BytesMut::from(data);
        self.cipher.apply(&mut buf);
        self.inner.write(&buf, extra).await
    }

    async fn write_eof(&mut self) -> FrameResult<()> {
        self.inner.write_eof().await
    }

    async fn drain(&mut self) -> FrameResult<()> {
        self.inner.drain().await
    }

    async fn close(&mut self) -> FrameResult<()> {
        self.inner.close().await
    }

    fn abort(&mut self) {
        self.inner.abort()
    }
}
