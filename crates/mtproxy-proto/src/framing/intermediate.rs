// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use bytes::Bytes;
use mtproxy_crypto::SecureRandom;

use crate::errors::{FrameError, FrameResult};
use crate::io::{ByteSink, ByteSource, WriteExtra};

const QUICKACK_BIT: u32 = 1 << 31;

pub struct IntermediateReader<S> {
    inner: S,
    /// SECURE-INTERMEDIATE pads each frame with 0-3 random bytes; the
    /// reader must truncate what it read back down to a 4-byte multiple.
    secure: bool,
}

impl<S: ByteSource> IntermediateReader<S> {
    pub fn new(inner: S, secure: bool) -> Self {
        Self { inner, secure }
    }

    pub async fn read_frame(&mut self) -> FrameResult<(Bytes, WriteExtra)> {
        let head = self.inner.read_exactly(4).await?;
        let raw = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let quickack = raw & QUICKACK_BIT != 0;
        let len = (raw & !QUICKACK_BIT) as usize;
        let mut payload = self.inner.read_exactly(len).await?;
        if self.secure {
            let aligned = payload.len() - (payload.len() % 4);
            payload.truncate(aligned);
        }
        let extra = if quickack {
            WriteExtra::QUICKACK
        } else {
            WriteExtra::empty()
        };
        Ok((payload, extra))
    }
}

pub struct IntermediateWriter<K> {
    inner: K,
    secure: bool,
    rng: Option<SecureRandom>,
}

impl<K: ByteSink> IntermediateWriter<K> {
    pub fn new(inner: K, secure: bool) -> Self {
        Self {
            inner,
            secure,
            rng: secure.then(SecureRandom::new),
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8], extra: WriteExtra) -> FrameResult<()> {
        if extra.contains(WriteExtra::SIMPLE_ACK) {
            if payload.len() != 4 {
                return Err(FrameError::Corruption("simple ack payload must be 4 bytes"));
            }
            self.inner.write(payload, WriteExtra::empty()).await?;
            self.inner.drain().await?;
            return Ok(());
        }

        let padding_len = match &mut self.rng {
            Some(rng) => (rng.next_u32() % 4) as usize,
            None => 0,
        };
        let total_len = payload.len() + padding_len;
        let mut len_word = total_len as u32;
        if extra.contains(WriteExtra::QUICKACK) {
            len_word |= QUICKACK_BIT;
        }
        self.inner
            .write(&len_word.to_le_bytes(), WriteExtra::empty())
            .await?;
        self.inner.write(payload, WriteExtra::empty()).await?;
        if padding_len > 0 {
            let padding = self
                .rng
                .as_mut()
                .expect("padding_len > 0 implies secure mode")
                .bytes(padding_len);
            self.inner.write(&padding, WriteExtra::empty()).await?;
        }
        self.inner.drain().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{TcpSink, TcpSource};
    use tokio::io::duplex;

    #[tokio::test]
    async fn plain_intermediate_roundtrips() {
        let (client, server) = duplex(8192);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut writer = IntermediateWriter::new(TcpSink::new(client_tx), false);
        let mut reader = IntermediateReader::new(TcpSource::new(server_rx), false);

        let payload = vec![0x11u8; 37];
        writer
            .write_frame(&payload, WriteExtra::empty())
            .await
            .unwrap();
        let (got, extra) = reader.read_frame().await.unwrap();
        assert_eq!(got.as_ref(), payload.as_slice());
        assert!(extra.is_empty());
    }

    #[tokio::test]
    async fn quickack_bit_survives_roundtrip() {
        let (client, server) = duplex(8192);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut writer = IntermediateWriter::new(TcpSink::new(client_tx), false);
        let mut reader = IntermediateReader::new(TcpSource::new(server_rx), false);

        let payload = vec![0x22u8; 8];
        writer
            .write_frame(&payload, WriteExtra::QUICKACK)
            .await
            .unwrap();
        let (got, extra) = reader.read_frame().await.unwrap();
        assert_eq!(got.as_ref(), payload.as_slice());
        assert!(extra.contains(WriteExtra::QUICKACK));
    }

    #[tokio::test]
    async fn secure_variant_truncates_to_four_byte_multiple() {
        let (client, server) = duplex(8192);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut writer = IntermediateWriter::new(TcpSink::new(client_tx), true);
        let mut reader = IntermediateReader::new(TcpSource::new(server_rx), true);

        let payload = vec![0x33u8; 8];
        writer
            .write_frame(&payload, WriteExtra::empty())
            .await
            .unwrap();
        let (got, _) = reader.read_frame().await.unwrap();
        assert_eq!(got.len() % 4, 0);
        assert_eq!(got.as_ref(), payload.as_slice());
    }
}
