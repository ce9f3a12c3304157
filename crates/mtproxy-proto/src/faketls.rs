// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The outer TLS 1.3 disguise: record framing, ClientHello probe
//! detection, and ServerHello construction. Everything here only deals in
//! bytes — secret matching and the time-window check live in the
//! handshake engine, one layer up.

use bytes::{Bytes, BytesMut};
use mtproxy_crypto::SecureRandom;

use crate::errors::{FrameError, FrameResult};
use crate::io::{ByteSink, ByteSource, WriteExtra};

const CHANGE_CIPHER_SPEC: u8 = 0x14;
const APPLICATION_DATA: u8 = 0x17;
const HANDSHAKE: u8 = 0x16;
const LEGACY_VERSION: [u8; 2] = [0x03, 0x03];
const MAX_RECORD_LEN: usize = 16408;

/// The first 11 bytes of a genuine TLS 1.3 ClientHello record as Telegram
/// clients send it: record header + handshake header + legacy client
/// version, all fixed.
pub const CLIENT_HELLO_PROBE_PREFIX: [u8; 11] =
    [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03];

/// Total bytes of the padded ClientHello the handshake engine reads
/// before it can extract digest and session id.
pub const TLS_HANDSHAKE_LEN: usize = 517;

/// Offset of the 32-byte digest inside the ClientHello blob.
pub const DIGEST_OFFSET: usize = 11;

/// Offset of the 1-byte session-id length inside the ClientHello blob.
pub const SESSION_ID_LEN_OFFSET: usize = 43;

/// Extracts the digest (with its own bytes already zeroed out, ready for
/// the HMAC check) and the session id from a raw ClientHello blob.
pub fn extract_digest_and_session(hello: &[u8]) -> Option<([u8; 32], Vec<u8>)> {
    if hello.len() < SESSION_ID_LEN_OFFSET + 1 {
        return None;
    }
    let digest: [u8; 32] = hello[DIGEST_OFFSET..DIGEST_OFFSET + 32].try_into().ok()?;
    let session_len = hello[SESSION_ID_LEN_OFFSET] as usize;
    let session_start = SESSION_ID_LEN_OFFSET + 1;
    let session = hello.get(session_start..session_start + session_len)?.to_vec();
    Some((digest, session))
}

/// Builds the full byte sequence the proxy sends back on a successful
/// FakeTLS match: ServerHello (with a zeroed 32-byte MAC placeholder at
/// [`DIGEST_OFFSET`]), then ChangeCipherSpec, then an ApplicationData
/// record padded to `cover_cert_len` bytes.
pub fn build_server_hello(session_id: &[u8], cover_cert_len: usize, rng: &mut SecureRandom) -> Vec<u8> {
    let key_share_pubkey = rng.bytes(32);

    let mut body = Vec::new();
    body.extend_from_slice(&LEGACY_VERSION);
    body.extend_from_slice(&[0u8; 32]); // MAC placeholder, spliced in afterwards
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.extend_from_slice(&[0x13, 0x01]); // cipher suite TLS_AES_128_GCM_SHA256
    body.push(0x00); // compression: none

    let mut extensions = Vec::new();
    // key_share: x25519
    extensions.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
    extensions.extend_from_slice(&key_share_pubkey);
    // supported_versions: TLS 1.3
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);

    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(0x02); // ServerHello
    let body_len = body.len() as u32;
    handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut server_hello = Vec::new();
    server_hello.push(HANDSHAKE);
    server_hello.extend_from_slice(&LEGACY_VERSION);
    server_hello.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    server_hello.extend_from_slice(&handshake);

    let mut out = server_hello;
    out.extend_from_slice(&[CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01]);

    let filler = rng.bytes(cover_cert_len);
    out.push(APPLICATION_DATA);
    out.extend_from_slice(&LEGACY_VERSION);
    out.extend_from_slice(&(cover_cert_len as u16).to_be_bytes());
    out.extend_from_slice(&filler);

    out
}

/// Reads the outer FakeTLS record stream, discarding ChangeCipherSpec and
/// yielding the ApplicationData payload as a contiguous byte stream.
pub struct TlsRecordSource<S> {
    inner: S,
}

impl<S: ByteSource> TlsRecordSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    async fn next_application_record(&mut self) -> FrameResult<Bytes> {
        loop {
            let header = self.inner.read_exactly(5).await?;
            let record_type = header[0];
            let len = u16::from_be_bytes([header[3], header[4]]) as usize;
            let payload = self.inner.read_exactly(len).await?;
            match record_type {
                CHANGE_CIPHER_SPEC => continue,
                APPLICATION_DATA => return Ok(payload),
                _ => return Err(FrameError::Corruption("unexpected outer TLS record type")),
            }
        }
    }
}

impl<S: ByteSource> ByteSource for TlsRecordSource<S> {
    async fn read(&mut self, max: usize) -> FrameResult<Bytes> {
        let record = self.next_application_record().await?;
        if record.len() > max {
            Ok(record.slice(..max))
        } else {
            Ok(record)
        }
    }

    async fn read_exactly(&mut self, n: usize) -> FrameResult<Bytes> {
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            let record = self.next_application_record().await?;
            buf.extend_from_slice(&record);
        }
        if buf.len() > n {
            buf.truncate(n);
        }
        Ok(buf.freeze())
    }
}

pub struct TlsRecordSink<K> {
    inner: K,
}

impl<K: ByteSink> TlsRecordSink<K> {
    pub fn new(inner: K) -> Self {
        Self { inner }
    }
}

impl<K: ByteSink> ByteSink for TlsRecordSink<K> {
    async fn write(&mut self, data: &[u8], extra: WriteExtra) -> FrameResult<usize> {
        for chunk in data.chunks(MAX_RECORD_LEN) {
            let mut record = Vec::with_capacity(5 + chunk.len());
            record.push(APPLICATION_DATA);
            record.extend_from_slice(&LEGACY_VERSION);
            record.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            record.extend_from_slice(chunk);
            self.inner.write(&record, extra).await?;
        }
        Ok(data.len())
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
    async fn change_cipher_spec_is_skipped() {
        let (client, server) = duplex(4096);
        let (_client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, _server_tx) = tokio::io::split(server);

        let mut sink = TcpSink::new(client_tx);
        sink.write(&[CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01], WriteExtra::empty())
            .await
            .unwrap();
        let payload = b"inner bytes";
        let mut record = vec![APPLICATION_DATA, 0x03, 0x03];
        record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        record.extend_from_slice(payload);
        sink.write(&record, WriteExtra::empty()).await.unwrap();
        sink.drain().await.unwrap();

        let mut source = TlsRecordSource::new(TcpSource::new(server_rx));
        let got = source.read_exactly(payload.len()).await.unwrap();
        assert_eq!(got.as_ref(), payload);
    }

    #[test]
    fn server_hello_splices_at_digest_offset() {
        let mut rng = SecureRandom::new();
        let hello = build_server_hello(&[0u8; 32], 1024, &mut rng);
        assert_eq!(&hello[DIGEST_OFFSET..DIGEST_OFFSET + 32], &[0u8; 32]);
    }

    #[test]
    fn digest_and_session_extraction_matches_layout() {
        let mut blob = vec![0u8; TLS_HANDSHAKE_LEN];
        blob[DIGEST_OFFSET..DIGEST_OFFSET + 32].copy_from_slice(&[7u8; 32]);
        blob[SESSION_ID_LEN_OFFSET] = 4;
        blob[SESSION_ID_LEN_OFFSET + 1..SESSION_ID_LEN_OFFSET + 5].copy_from_slice(&[1, 2, 3, 4]);

        let (digest, session) = extract_digest_and_session(&blob).unwrap();
        assert_eq!(digest, [7u8; 32]);
        assert_eq!(session, vec![1, 2, 3, 4]);
    }
}
