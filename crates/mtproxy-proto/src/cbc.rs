// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! AES-CBC wrapping for the middle-proxy FULL transport. Unlike
//! [`crate::obfuscation`], reads and writes here MUST be 16-byte aligned —
//! FULL framing already pads every frame to a block boundary, so this is
//! never a practical constraint on that caller.

use bytes::{Bytes, BytesMut};
use mtproxy_crypto::AesCbcCodec;

use crate::errors::{FrameError, FrameResult};
use crate::io::{ByteSink, ByteSource, WriteExtra};

pub struct CbcSource<S> {
    inner: S,
    codec: AesCbcCodec,
}

impl<S: ByteSource> CbcSource<S> {
    pub fn new(inner: S, codec: AesCbcCodec) -> Self {
        Self { inner, codec }
    }
}

impl<S: ByteSource> ByteSource for CbcSource<S> {
    async fn read(&mut self, max: usize) -> FrameResult<Bytes> {
        let aligned = (max / 16).max(1) * 16;
        self.read_exactly(aligned).await
    }

    async fn read_exactly(&mut self, n: usize) -> FrameResult<Bytes> {
        if n % 16 != 0 {
            return Err(FrameError::Corruption("cbc read not block-aligned"));
        }
        let data = self.inner.read_exactly(n).await?;
        let mut buf = BytesMut::from(data.as_ref());
        self.codec.decrypt(&mut buf);
        Ok(buf.freeze())
    }
}

pub struct CbcSink<K> {
    inner: K,
    codec: AesCbcCodec,
}

impl<K: ByteSink> CbcSink<K> {
    pub fn new(inner: K, codec: AesCbcCodec) -> Self {
        Self { inner, codec }
    }
}

impl<K: ByteSink> ByteSink for CbcSink<K> {
    async fn write(&mut self, data: &[u8], extra: WriteExtra) -> FrameResult<usize> {
        if data.len() % 16 != 0 {
            return Err(FrameError::Corruption("cbc write not block-aligned"));
        }
        let mut buf = BytesMut::from(data);
        self.codec.encrypt(&mut buf);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{TcpSink, TcpSource};
    use tokio::io::duplex;

    #[tokio::test]
    async fn roundtrips_block_aligned_payloads() {
        let (client, server) = duplex(4096);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut sink = CbcSink::new(TcpSink::new(client_tx), AesCbcCodec::new(key, iv));
        let mut source = CbcSource::new(TcpSource::new(server_rx), AesCbcCodec::new(key, iv));

        let payload = vec![0x42u8; 32];
        sink.write(&payload, WriteExtra::empty()).await.unwrap();
        sink.drain().await.unwrap();
        let got = source.read_exactly(32).await.unwrap();
        assert_eq!(got.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn unaligned_write_is_rejected() {
        let (client, _server) = duplex(4096);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let mut sink = CbcSink::new(TcpSink::new(client_tx), AesCbcCodec::new([0u8; 32], [0u8; 16]));
        assert!(sink.write(&[0u8; 5], WriteExtra::empty()).await.is_err());
    }
}
