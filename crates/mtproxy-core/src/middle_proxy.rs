// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The middle-proxy RPC-nonce/RPC-handshake exchange: establishes the
//! AES-CBC keys for a dialed middle-proxy connection and hands back a
//! FULL-framed, CBC-wrapped transport ready for the RPC envelope layer.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use mtproxy_crypto::{md5, sha1, AesCbcCodec, SecureRandom};
use mtproxy_proto::framing::{FullReader, FullWriter};
use mtproxy_proto::io::{TcpSink, TcpSource};
use mtproxy_proto::rpc::{CRYPTO_AES, RPC_HANDSHAKE, RPC_NONCE};
use mtproxy_proto::{CbcSink, CbcSource};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::errors::{CoreError, CoreResult};

const SENDER_PID: [u8; 12] = *b"IPIPPRPDTIME";

pub type MiddleProxyReader = FullReader<CbcSource<TcpSource<OwnedReadHalf>>>;
pub type MiddleProxyWriter = FullWriter<CbcSink<TcpSink<OwnedWriteHalf>>>;

pub struct MiddleProxyConnection {
    pub reader: MiddleProxyReader,
    pub writer: MiddleProxyWriter,
    /// Our address as seen by the middle proxy, used again when building
    /// the RPC envelope's "our endpoint" field.
    pub local_addr: SocketAddr,
}

fn encode_ipv4_le(addr: std::net::Ipv4Addr) -> [u8; 4] {
    let mut octets = addr.octets();
    octets.reverse();
    octets
}

fn derive_key_iv(
    server_nonce: &[u8; 16],
    client_nonce: &[u8; 16],
    crypto_ts: u32,
    srv: SocketAddr,
    clt: SocketAddr,
    purpose: &[u8; 6],
    middle_proxy_secret: &[u8; 64],
) -> ([u8; 32], [u8; 16]) {
    let mut s = Vec::with_capacity(16 + 16 + 4 + 4 + 2 + 6 + 4 + 2 + 64 + 16 + 32 + 16);
    s.extend_from_slice(server_nonce);
    s.extend_from_slice(client_nonce);
    s.extend_from_slice(&crypto_ts.to_le_bytes());

    match (srv, clt) {
        (SocketAddr::V4(srv4), SocketAddr::V4(clt4)) => {
            s.extend_from_slice(&encode_ipv4_le(*srv4.ip()));
            s.extend_from_slice(&clt4.port().to_le_bytes());
            s.extend_from_slice(purpose);
            s.extend_from_slice(&encode_ipv4_le(*clt4.ip()));
            s.extend_from_slice(&srv4.port().to_le_bytes());
            s.extend_from_slice(middle_proxy_secret);
            s.extend_from_slice(server_nonce);
        }
        (SocketAddr::V6(srv6), SocketAddr::V6(clt6)) => {
            // The v4 fields carry zero when the tuple is v6; the real
            // addresses ride in the appended v6 block below.
            s.extend_from_slice(&[0u8; 4]);
            s.extend_from_slice(&clt6.port().to_le_bytes());
            s.extend_from_slice(purpose);
            s.extend_from_slice(&[0u8; 4]);
            s.extend_from_slice(&srv6.port().to_le_bytes());
            s.extend_from_slice(middle_proxy_secret);
            s.extend_from_slice(server_nonce);
            s.extend_from_slice(&clt6.ip().octets());
            s.extend_from_slice(&srv6.ip().octets());
        }
        _ => unreachable!("srv and clt must share an address family"),
    }
    s.extend_from_slice(client_nonce);

    let md5_key = md5(&[&s[1..]]);
    let sha1_key = sha1(&[&s]);
    let mut key = [0u8; 32];
    key[..12].copy_from_slice(&md5_key[..12]);
    key[12..].copy_from_slice(&sha1_key);

    let iv = md5(&[&s[2..]]);
    (key, iv)
}

pub async fn handshake(stream: TcpStream, middle_proxy_secret: &[u8; 64]) -> CoreResult<MiddleProxyConnection> {
    let local_addr = stream.local_addr().map_err(CoreError::Transient)?;
    let peer_addr = stream.peer_addr().map_err(CoreError::Transient)?;
    let (read_half, write_half) = stream.into_split();

    let mut reader = FullReader::new(TcpSource::new(read_half));
    let mut writer = FullWriter::new(TcpSink::new(write_half));

    let mut rng = SecureRandom::new();
    let client_nonce: [u8; 16] = rng.bytes(16).try_into().unwrap();
    let key_selector: [u8; 4] = middle_proxy_secret[0..4].try_into().unwrap();
    let crypto_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut nonce_req = Vec::with_capacity(32);
    nonce_req.extend_from_slice(&RPC_NONCE);
    nonce_req.extend_from_slice(&key_selector);
    nonce_req.extend_from_slice(&CRYPTO_AES.to_le_bytes());
    nonce_req.extend_from_slice(&crypto_ts.to_le_bytes());
    nonce_req.extend_from_slice(&client_nonce);
    writer.write_frame(&nonce_req).await?;

    let nonce_ans = reader.read_frame().await?;
    if nonce_ans.len() < 32 {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc nonce answer truncated"));
    }
    if nonce_ans[0..4] != RPC_NONCE[..] {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc nonce answer tag mismatch"));
    }
    if nonce_ans[4..8] != key_selector[..] {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc nonce key selector mismatch"));
    }
    if nonce_ans[8..12] != CRYPTO_AES.to_le_bytes()[..] {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc nonce crypto schema mismatch"));
    }
    let server_nonce: [u8; 16] = nonce_ans[16..32].try_into().unwrap();

    let (enc_key, enc_iv) = derive_key_iv(
        &server_nonce,
        &client_nonce,
        crypto_ts,
        peer_addr,
        local_addr,
        b"CLIENT",
        middle_proxy_secret,
    );
    let (dec_key, dec_iv) = derive_key_iv(
        &server_nonce,
        &client_nonce,
        crypto_ts,
        peer_addr,
        local_addr,
        b"SERVER",
        middle_proxy_secret,
    );

    let (tcp_source, expected_seq) = reader.into_inner_and_seq();
    let (tcp_sink, next_seq) = writer.into_inner_and_seq();
    let mut reader = FullReader::resume(CbcSource::new(tcp_source, AesCbcCodec::new(dec_key, dec_iv)), expected_seq);
    let mut writer = FullWriter::resume(CbcSink::new(tcp_sink, AesCbcCodec::new(enc_key, enc_iv)), next_seq);

    let mut handshake_req = Vec::with_capacity(32);
    handshake_req.extend_from_slice(&RPC_HANDSHAKE);
    handshake_req.extend_from_slice(&[0u8; 4]);
    handshake_req.extend_from_slice(&SENDER_PID);
    handshake_req.extend_from_slice(&SENDER_PID);
    writer.write_frame(&handshake_req).await?;

    let handshake_ans = reader.read_frame().await?;
    if handshake_ans.len() < 32 {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc handshake answer truncated"));
    }
    if handshake_ans[0..4] != RPC_HANDSHAKE[..] {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc handshake answer tag mismatch"));
    }
    if handshake_ans[20..32] != SENDER_PID[..] {
        return Err(CoreError::MiddleProxyHandshakeFailed("rpc handshake peer pid mismatch"));
    }

    Ok(MiddleProxyConnection {
        reader,
        writer,
        local_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_iv_differ_between_encrypt_and_decrypt_purpose() {
        let server_nonce = [1u8; 16];
        let client_nonce = [2u8; 16];
        let secret = [3u8; 64];
        let srv: SocketAddr = "149.154.175.50:8888".parse().unwrap();
        let clt: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        let (enc_key, enc_iv) = derive_key_iv(&server_nonce, &client_nonce, 1000, srv, clt, b"CLIENT", &secret);
        let (dec_key, dec_iv) = derive_key_iv(&server_nonce, &client_nonce, 1000, srv, clt, b"SERVER", &secret);

        assert_ne!(enc_key, dec_key);
        assert_ne!(enc_iv, dec_iv);
    }

    #[test]
    fn ipv4_is_encoded_byte_reversed() {
        let addr: std::net::Ipv4Addr = "149.154.167.51".parse().unwrap();
        assert_eq!(encode_ipv4_le(addr), [51, 167, 154, 149]);
    }
}
