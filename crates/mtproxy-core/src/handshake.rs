// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The entry point every accepted connection passes through: outer
//! FakeTLS probe detection, then the obfuscated MTProto handshake that
//! picks a user, a protocol variant, and a datacenter.

use mtproxy_config::User;
use mtproxy_crypto::{hmac_sha256, sha256, AesCtr};
use mtproxy_proto::faketls::{self, CLIENT_HELLO_PROBE_PREFIX, TLS_HANDSHAKE_LEN};
use mtproxy_proto::ProtocolTag;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::state::ProxyState;

const HANDSHAKE_LEN: usize = 64;

/// An HMAC-checked window: a connection is accepted if its embedded
/// timestamp is within this many seconds of now in either direction, or
/// if one of the global skew escape hatches applies.
const MIN_TIME_DELTA_SECS: i64 = -20 * 60;
const MAX_TIME_DELTA_SECS: i64 = 10 * 60;
/// Below this, the 4 bytes are read as client uptime rather than a wall
/// clock, and always accepted.
const UPTIME_NOT_WALLCLOCK_THRESHOLD: u32 = 86_400_000;

pub struct MatchedHandshake {
    pub user_index: usize,
    pub protocol: ProtocolTag,
    pub dc_index: i16,
    /// Cipher for client -> proxy bytes, already advanced past the
    /// 64-byte handshake block.
    pub client_to_proxy: AesCtr,
    /// Cipher for proxy -> client bytes, not yet used.
    pub proxy_to_client: AesCtr,
    /// The 48-byte (key || iv) replay fingerprint for the decoding
    /// direction.
    pub fingerprint: Vec<u8>,
    /// Raw key material behind `client_to_proxy`/`proxy_to_client`, kept
    /// around for `fastMode`'s direct-relay key reuse.
    pub dec_key: [u8; 32],
    pub dec_iv: [u8; 16],
    pub enc_key: [u8; 32],
    pub enc_iv: [u8; 16],
}

pub enum ProbeResult {
    Matched(MatchedHandshake),
    /// No user matched, or the connection replayed a prior fingerprint.
    /// `probe_bytes` is everything read so far, to be replayed at the
    /// cover host verbatim.
    Rejected { probe_bytes: Vec<u8> },
}

/// Runs probe detection and the obfuscated handshake over `io`, which
/// must still be positioned at the very first byte the client sent.
pub async fn run<IO>(
    io: &mut IO,
    users: &[User],
    state: &ProxyState,
    ignore_time_skew: bool,
    now_unix: u64,
) -> std::io::Result<ProbeResult>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut prefix = vec![0u8; CLIENT_HELLO_PROBE_PREFIX.len()];
    io.read_exact(&mut prefix).await?;

    if prefix == CLIENT_HELLO_PROBE_PREFIX {
        let mut hello = vec![0u8; TLS_HANDSHAKE_LEN];
        hello[..prefix.len()].copy_from_slice(&prefix);
        io.read_exact(&mut hello[prefix.len()..]).await?;
        run_faketls(io, hello, users, state, ignore_time_skew, now_unix).await
    } else {
        let mut block = vec![0u8; HANDSHAKE_LEN];
        block[..prefix.len()].copy_from_slice(&prefix);
        io.read_exact(&mut block[prefix.len()..]).await?;
        match match_obfuscated_handshake(&mut block, users, state) {
            Some(matched) => Ok(ProbeResult::Matched(matched)),
            None => Ok(ProbeResult::Rejected { probe_bytes: block }),
        }
    }
}

async fn run_faketls<IO>(
    io: &mut IO,
    hello: Vec<u8>,
    users: &[User],
    state: &ProxyState,
    ignore_time_skew: bool,
    now_unix: u64,
) -> std::io::Result<ProbeResult>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let Some((digest, session_id)) = faketls::extract_digest_and_session(&hello) else {
        return Ok(ProbeResult::Rejected { probe_bytes: hello });
    };

    let replay_key = digest[..16].to_vec();
    if state.replay_cache.lock().unwrap().contains(&replay_key) {
        return Ok(ProbeResult::Rejected { probe_bytes: hello });
    }

    let Some((user_index, _)) = match_faketls_secret(&hello, &digest, users, state, ignore_time_skew, now_unix)
    else {
        return Ok(ProbeResult::Rejected { probe_bytes: hello });
    };

    let secret = &users[user_index].secret;
    let mut rng = mtproxy_crypto::SecureRandom::new();
    let mut server_hello = faketls::build_server_hello(&session_id, state.cover_cert_length(), &mut rng);
    let mac_input = [digest.as_slice(), &server_hello].concat();
    let mac = hmac_sha256(secret, &mac_input);
    server_hello[faketls::DIGEST_OFFSET..faketls::DIGEST_OFFSET + 32].copy_from_slice(&mac);

    io.write_all(&server_hello).await?;
    io.flush().await?;
    state.replay_cache.lock().unwrap().insert(&replay_key);

    let mut inner = vec![0u8; HANDSHAKE_LEN];
    read_tls_application_data(io, &mut inner).await?;

    match match_obfuscated_handshake(&mut inner, users, state) {
        Some(matched) => Ok(ProbeResult::Matched(matched)),
        None => Ok(ProbeResult::Rejected { probe_bytes: inner }),
    }
}

/// Reads exactly `buf.len()` bytes of ApplicationData payload out of the
/// TLS record stream, skipping any ChangeCipherSpec records in between.
async fn read_tls_application_data<IO>(io: &mut IO, buf: &mut [u8]) -> std::io::Result<()>
where
    IO: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let mut header = [0u8; 5];
        io.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len];
        io.read_exact(&mut payload).await?;
        if header[0] == 0x17 {
            let take = (buf.len() - filled).min(payload.len());
            buf[filled..filled + take].copy_from_slice(&payload[..take]);
            filled += take;
        }
    }
    Ok(())
}

fn match_faketls_secret(
    hello: &[u8],
    digest: &[u8; 32],
    users: &[User],
    state: &ProxyState,
    ignore_time_skew: bool,
    now_unix: u64,
) -> Option<(usize, u32)> {
    let mut zeroed = hello.to_vec();
    zeroed[faketls::DIGEST_OFFSET..faketls::DIGEST_OFFSET + 32].fill(0);

    for (index, user) in users.iter().enumerate() {
        let expected = hmac_sha256(&user.secret, &zeroed);
        let mut xored = [0u8; 32];
        for i in 0..32 {
            xored[i] = expected[i] ^ digest[i];
        }
        if xored[..28] != [0u8; 28] {
            continue;
        }
        let timestamp = u32::from_le_bytes(xored[28..32].try_into().unwrap());
        if accept_timestamp(
            timestamp,
            now_unix,
            ignore_time_skew,
            state.is_time_skewed.load(std::sync::atomic::Ordering::Relaxed),
        ) {
            return Some((index, timestamp));
        }
    }
    None
}

fn accept_timestamp(timestamp: u32, now_unix: u64, ignore_time_skew: bool, is_time_skewed: bool) -> bool {
    if timestamp < UPTIME_NOT_WALLCLOCK_THRESHOLD {
        return true;
    }
    if ignore_time_skew || is_time_skewed {
        return true;
    }
    let delta = now_unix as i64 - timestamp as i64;
    delta > MIN_TIME_DELTA_SECS && delta < MAX_TIME_DELTA_SECS
}

/// Tries every user's secret against the 64-byte obfuscated handshake
/// block. On a match, decrypts `block` in place, advances the replay
/// cache, and returns the ciphers and routing decision the client
/// encoded.
fn match_obfuscated_handshake(
    block: &mut [u8],
    users: &[User],
    state: &ProxyState,
) -> Option<MatchedHandshake> {
    if block.len() != HANDSHAKE_LEN {
        return None;
    }
    let dec_nonce = &block[8..56];
    let mut enc_nonce = dec_nonce.to_vec();
    enc_nonce.reverse();

    let dec_prekey: [u8; 32] = dec_nonce[0..32].try_into().unwrap();
    let dec_iv: [u8; 16] = dec_nonce[32..48].try_into().unwrap();
    let enc_prekey: [u8; 32] = enc_nonce[0..32].try_into().unwrap();
    let enc_iv: [u8; 16] = enc_nonce[32..48].try_into().unwrap();

    for (index, user) in users.iter().enumerate() {
        let dec_key = sha256(&[&dec_prekey, &user.secret]);
        let enc_key = sha256(&[&enc_prekey, &user.secret]);

        let fingerprint: Vec<u8> = dec_key.iter().chain(dec_iv.iter()).copied().collect();
        if state.replay_cache.lock().unwrap().contains(&fingerprint) {
            continue;
        }

        let mut dec_cipher = AesCtr::new(&dec_key, &dec_iv);
        let mut candidate = block.to_vec();
        dec_cipher.apply(&mut candidate);

        let magic = u32::from_le_bytes(candidate[56..60].try_into().unwrap());
        let Some(protocol) = ProtocolTag::from_magic(magic) else {
            continue;
        };
        let dc_index = i16::from_le_bytes(candidate[60..62].try_into().unwrap());

        block.copy_from_slice(&candidate);
        state.replay_cache.lock().unwrap().insert(&fingerprint);

        let enc_cipher = AesCtr::new(&enc_key, &enc_iv);
        return Some(MatchedHandshake {
            user_index: index,
            protocol,
            dc_index,
            client_to_proxy: dec_cipher,
            proxy_to_client: enc_cipher,
            fingerprint,
            dec_key,
            dec_iv,
            enc_key,
            enc_iv,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(secret: [u8; 16]) -> User {
        User {
            name: "test".into(),
            secret,
            max_tcp_conns: None,
            expiration_date: None,
            data_quota: None,
        }
    }

    #[test]
    fn recovers_the_protocol_tag_and_dc_index_the_client_encoded() {
        let secret = [0x42u8; 16];
        let users = vec![user(secret)];
        let state = ProxyState::new(None, None, 1024, 1024, 2000);

        let mut rng = mtproxy_crypto::SecureRandom::new();
        let mut block = rng.bytes(64);
        block[56..60].copy_from_slice(&ProtocolTag::Intermediate.magic().to_le_bytes());
        block[60..62].copy_from_slice(&2i16.to_le_bytes());

        let dec_nonce = block[8..56].to_vec();
        let mut enc_nonce = dec_nonce.clone();
        enc_nonce.reverse();
        let dec_key = sha256(&[&dec_nonce[0..32], &secret]);
        let dec_iv: [u8; 16] = dec_nonce[32..48].try_into().unwrap();
        let mut cipher = AesCtr::new(&dec_key, &dec_iv);
        cipher.apply(&mut block);

        let matched = match_obfuscated_handshake(&mut block, &users, &state).unwrap();
        assert_eq!(matched.protocol, ProtocolTag::Intermediate);
        assert_eq!(matched.dc_index, 2);
        let _ = enc_nonce;
    }

    #[test]
    fn timestamp_far_in_the_past_is_rejected_without_skew_override() {
        assert!(!accept_timestamp(1_000_000_000, 1_753_600_000, false, false));
    }

    #[test]
    fn ignore_time_skew_accepts_any_timestamp() {
        assert!(accept_timestamp(1_000_000_000, 1_753_600_000, true, false));
    }

    #[test]
    fn uptime_style_timestamps_are_always_accepted() {
        assert!(accept_timestamp(10, 1_753_600_000, false, false));
    }
}
