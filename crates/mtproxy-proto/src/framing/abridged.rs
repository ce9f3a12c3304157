// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use bytes::{Bytes, BytesMut};

use crate::errors::{FrameError, FrameResult};
use crate::io::{ByteSink, ByteSource, WriteExtra};

const ESCAPE: u8 = 0x7F;
const QUICKACK_BIT: u8 = 0x80;

pub struct AbridgedReader<S> {
    inner: S,
}

impl<S: ByteSource> AbridgedReader<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Reads one frame, returning the payload and whether the length byte
    /// carried the QUICKACK bit.
    pub async fn read_frame(&mut self) -> FrameResult<(Bytes, WriteExtra)> {
        let head = self.inner.read_exactly(1).await?;
        let raw = head[0];
        let quickack = raw & QUICKACK_BIT != 0;
        let low = raw & !QUICKACK_BIT;
        let words = if low == ESCAPE {
            let lenb = self.inner.read_exactly(3).await?;
            u32::from_le_bytes([lenb[0], lenb[1], lenb[2], 0])
        } else {
            low as u32
        };
        let len = words as usize * 4;
        let payload = self.inner.read_exactly(len).await?;
        let extra = if quickack {
            WriteExtra::QUICKACK
        } else {
            WriteExtra::empty()
        };
        Ok((payload, extra))
    }
}

pub struct AbridgedWriter<K> {
    inner: K,
}

impl<K: ByteSink> AbridgedWriter<K> {
    pub fn new(inner: K) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, payload: &[u8], extra: WriteExtra) -> FrameResult<()> {
        if extra.contains(WriteExtra::SIMPLE_ACK) {
            if payload.len() != 4 {
                return Err(FrameError::Corruption("simple ack payload must be 4 bytes"));
            }
            let mut reversed = payload.to_vec();
            reversed.reverse();
            self.inner.write(&reversed, WriteExtra::empty()).await?;
            self.inner.drain().await?;
            return Ok(());
        }

        if payload.len() % 4 != 0 {
            return Err(FrameError::Corruption("abridged payload must be 4-byte aligned"));
        }
        let quickack_bit = if extra.contains(WriteExtra::QUICKACK) {
            QUICKACK_BIT
        } else {
            0
        };
        let words = payload.len() / 4;
        let mut head = BytesMut::new();
        if words < ESCAPE as usize {
            head.extend_from_slice(&[words as u8 | quickack_bit]);
        } else {
            head.extend_from_slice(&[ESCAPE | quickack_bit]);
            head.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
        }
        self.inner.write(&head, WriteExtra::empty()).await?;
        self.inner.write(payload, WriteExtra::empty()).await?;
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
    async fn roundtrips_small_and_large_frames() {
        let (client, server) = duplex(8192);
        let (client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        let mut writer = AbridgedWriter::new(TcpSink::new(client_tx));
        let mut reader = AbridgedReader::new(TcpSource::new(server_rx));

        let small = vec![0xAB; 8];
        writer
            .write_frame(&small, WriteExtra::empty())
            .await
            .unwrap();
        let (got, extra) = reader.read_frame().await.unwrap();
        assert_eq!(got.as_ref(), small.as_slice());
        assert!(extra.is_empty());

        let large = vec![0xCD; 1000];
        writer
            .write_frame(&large, WriteExtra::empty())
            .await
            .unwrap();
        let (got, _) = reader.read_frame().await.unwrap();
        assert_eq!(got.as_ref(), large.as_slice());

        drop(writer);
        drop(client_rx);
        drop(server_tx);
    }
}
