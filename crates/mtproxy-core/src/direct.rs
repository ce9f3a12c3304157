// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The direct-relay path: negotiates a fresh obfuscated session with a
//! Telegram datacenter and hands back a stream ready to splice against
//! the client, with no RPC envelope and no MTProto reframing.

use mtproxy_crypto::{AesCtr, SecureRandom};
use mtproxy_proto::ProtocolTag;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::errors::{CoreError, CoreResult};
use crate::handshake::MatchedHandshake;

const RESERVED_PREFIXES: [[u8; 4]; 6] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    [0xEE, 0xEE, 0xEE, 0xEE],
    [0xDD, 0xDD, 0xDD, 0xDD],
    [0x16, 0x03, 0x01, 0x02],
];

fn is_acceptable_nonce(nonce: &[u8]) -> bool {
    nonce[0] != 0xEF
        && !RESERVED_PREFIXES.iter().any(|prefix| nonce[0..4] == prefix[..])
        && nonce[4..8] != [0u8; 4][..]
}

fn generate_dc_nonce(rng: &mut SecureRandom) -> [u8; 64] {
    loop {
        let candidate = rng.bytes(64);
        if is_acceptable_nonce(&candidate) {
            return candidate.try_into().unwrap();
        }
    }
}

pub struct DirectConnection {
    pub stream: TcpStream,
    pub encrypt: AesCtr,
    pub decrypt: AesCtr,
}

/// Performs the proxy-to-DC obfuscated handshake over an already-dialed
/// `stream`, selecting `protocol` as the DC-facing framing. `fast_mode`
/// reuses the client's own key material for the encrypt direction instead
/// of deriving a fresh one, at the documented cost of weaker separation
/// between the client and DC legs.
pub async fn handshake(
    mut stream: TcpStream,
    matched: &MatchedHandshake,
    protocol: ProtocolTag,
    fast_mode: bool,
) -> CoreResult<DirectConnection> {
    let mut rng = SecureRandom::new();
    let mut nonce = generate_dc_nonce(&mut rng);
    nonce[56..60].copy_from_slice(&protocol.magic().to_le_bytes());
    nonce[60..62].copy_from_slice(&[0u8; 2]);

    let dec_nonce = &nonce[8..56];
    let mut enc_nonce = dec_nonce.to_vec();
    enc_nonce.reverse();

    // The DC reads its key straight out of the cleartext nonce prefix, so
    // unlike the client-facing handshake there is no hash and no secret here.
    let (encrypt_key, encrypt_iv) = if fast_mode {
        (matched.dec_key, matched.dec_iv)
    } else {
        let key: [u8; 32] = enc_nonce[0..32].try_into().unwrap();
        let iv: [u8; 16] = enc_nonce[32..48].try_into().unwrap();
        (key, iv)
    };
    let decrypt_key: [u8; 32] = dec_nonce[0..32].try_into().unwrap();
    let decrypt_iv: [u8; 16] = dec_nonce[32..48].try_into().unwrap();

    let mut encrypt = AesCtr::new(&encrypt_key, &encrypt_iv);
    let decrypt = AesCtr::new(&decrypt_key, &decrypt_iv);

    let mut wire = nonce;
    encrypt.apply(&mut wire);
    let mut to_send = nonce[..56].to_vec();
    to_send.extend_from_slice(&wire[56..64]);

    stream.write_all(&to_send).await.map_err(CoreError::DcUnavailable)?;
    stream.flush().await.map_err(CoreError::DcUnavailable)?;

    Ok(DirectConnection {
        stream,
        encrypt,
        decrypt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nonces_with_reserved_prefixes() {
        let mut nonce = [0x41u8; 64];
        nonce[0..4].copy_from_slice(b"POST");
        assert!(!is_acceptable_nonce(&nonce));
    }

    #[test]
    fn rejects_leading_0xef_byte() {
        let mut nonce = [0x41u8; 64];
        nonce[0] = 0xEF;
        assert!(!is_acceptable_nonce(&nonce));
    }

    #[test]
    fn rejects_zero_bytes_four_to_eight() {
        let mut nonce = [0x41u8; 64];
        nonce[4..8].copy_from_slice(&[0u8; 4]);
        assert!(!is_acceptable_nonce(&nonce));
    }

    #[test]
    fn generated_nonces_always_pass_their_own_check() {
        let mut rng = SecureRandom::new();
        for _ in 0..50 {
            let nonce = generate_dc_nonce(&mut rng);
            assert!(is_acceptable_nonce(&nonce));
        }
    }
}
