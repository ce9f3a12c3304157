// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! FULL framing, used only for middle-proxy control messages (the
//! RPC_NONCE/RPC_HANDSHAKE exchange and, wrapped in AES-CBC, the ongoing
//! RPC envelope stream). Unlike the client-facing framings this one has a
//! sequence number and a CRC, and is never optional-padding.

use bytes::Bytes;

use crate::errors::{FrameError, FrameResult};
use crate::io::{ByteSink, ByteSource, WriteExtra};

const MIN_LEN: usize = 12;
const MAX_LEN: usize = 1 << 24;
const FILLER: [u8; 4] = [0x04, 0x00, 0x00, 0x00];
const INITIAL_SEQ: i32 = -2;

fn padded_len(len: usize) -> usize {
    len.div_ceil(16) * 16
}

pub struct FullReader<S> {
    inner: S,
    expected_seq: i32,
}

impl<S: ByteSource> FullReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            expected_seq: INITIAL_SEQ,
        }
    }

    /// Rebuilds a reader over a different inner transport carrying the
    /// same logical sequence forward, for the middle-proxy handshake's
    /// switch from a plaintext to an AES-CBC-wrapped transport mid-stream.
    pub fn resume(inner: S, expected_seq: i32) -> Self {
        Self { inner, expected_seq }
    }

    pub fn into_inner_and_seq(self) -> (S, i32) {
        (self.inner, self.expected_seq)
    }

    pub async fn read_frame(&mut self) -> FrameResult<Bytes> {
        let len_bytes = self.inner.read_exactly(4).await?;
        let len = u32::from_le_bytes(len_bytes.as_ref().try_into().unwrap()) as usize;
        if len < MIN_LEN || len > MAX_LEN || len % 4 != 0 {
            return Err(FrameError::Corruption("full frame length out of range"));
        }

        let rest = self.inner.read_exactly(len - 4).await?;
        let seq = i32::from_le_bytes(rest[0..4].try_into().unwrap());
        if seq != self.expected_seq {
            return Err(FrameError::Corruption("full frame sequence mismatch"));
        }
        let payload_end = rest.len() - 4;
        let payload = rest.slice(4..payload_end);
        let crc_received = u32::from_le_bytes(rest[payload_end..].try_into().unwrap());

        let mut crc_input = Vec::with_capacity(len);
        crc_input.extend_from_slice(&len_bytes);
        crc_input.extend_from_slice(&rest[..payload_end]);
        let crc_computed = mtproxy_crypto::crc32(&crc_input);
        if crc_computed != crc_received {
            return Err(FrameError::Corruption("full frame CRC mismatch"));
        }

        let padding = padded_len(len) - len;
        if padding > 0 {
            self.inner.read_exactly(padding).await?;
        }

        self.expected_seq += 1;
        Ok(payload)
    }
}

pub struct FullWriter<K> {
    inner: K,
    next_seq: i32,
}

impl<K: ByteSink> FullWriter<K> {
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            next_seq: INITIAL_SEQ,
        }
    }

    pub fn resume(inner: K, next_seq: i32) -> Self {
        Self { inner, next_seq }
    }

    pub fn into_inner_and_seq(self) -> (K, i32) {
        (self.inner, self.next_seq)
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> FrameResult<()> {
        let len = 12 + payload.len();
        let mut frame = Vec::with_capacity(padded_len(len));
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&self.next_seq.to_le_bytes());
        frame.extend_from_slice(payload);
        let crc = mtproxy_crypto::crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let padding = padded_len(len) - len;
        frame.extend(FILLER.iter().cycle().take(padding));

        self.inner.write(&frame, WriteExtra::empty()).await?;
        self.inner.drain().await?;
        self.next_seq += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{TcpSink, TcpSource};
    use tokio::io::duplex;

    #[tokio::test]
    async fn roundtrips_and_advances_sequence() {
        let (client, server) = duplex(8192);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut writer = FullWriter::new(TcpSink::new(client_tx));
        let mut reader = FullReader::new(TcpSource::new(server_rx));

        for i in 0..3u8 {
            let payload = vec![i; 20];
            writer.write_frame(&payload).await.unwrap();
            let got = reader.read_frame().await.unwrap();
            assert_eq!(got.as_ref(), payload.as_slice());
        }
        assert_eq!(reader.expected_seq, INITIAL_SEQ + 3);
    }

    #[tokio::test]
    async fn bad_crc_is_rejected() {
        let len: u32 = 16;
        let mut bad = Vec::new();
        bad.extend_from_slice(&len.to_le_bytes());
        bad.extend_from_slice(&(-2i32).to_le_bytes());
        bad.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let (client, server) = duplex(8192);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);
        let mut sink = TcpSink::new(client_tx);
        sink.write(&bad, WriteExtra::empty()).await.unwrap();
        sink.drain().await.unwrap();
        let mut reader = FullReader::new(TcpSource::new(server_rx));
        assert!(reader.read_frame().await.is_err());
    }
}
