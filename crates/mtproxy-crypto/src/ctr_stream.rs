// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use aes::cipher::{generic_array::GenericArray, BlockEncryptMut, KeyIvInit, StreamCipher};

/// One direction of the obfuscated MTProto stream: AES-256-CTR keyed once at
/// handshake time, then fed the whole connection's byte stream in order.
///
/// Unlike [`AesCbcCodec`] this never needs to track an external IV — the
/// `ctr` crate's internal counter already advances across calls.
pub struct AesCtr {
    cipher: ctr::Ctr128BE<aes::Aes256>,
}

impl AesCtr {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            cipher: ctr::Ctr128BE::<aes::Aes256>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// Encrypts/decrypts `buffer` in place; CTR mode is its own inverse.
    pub fn apply(&mut self, buffer: &mut [u8]) {
        self.cipher.apply_keystream(buffer);
    }
}

/// AES-256-CBC over the middle-proxy RPC transport. The protocol streams an
/// unbounded sequence of 16-byte-aligned frames rather than one shot, so the
/// codec carries its chaining IV forward from call to call instead of
/// resetting it per message.
pub struct AesCbcCodec {
    key: GenericArray<u8, aes::cipher::typenum::U32>,
    iv: [u8; 16],
}

impl AesCbcCodec {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self {
            key: GenericArray::clone_from_slice(&key),
            iv,
        }
    }

    /// Encrypts `buffer` in place. `buffer.len()` MUST be a multiple of 16.
    pub fn encrypt(&mut self, buffer: &mut [u8]) {
        assert_eq!(buffer.len() % 16, 0, "CBC requires block-aligned input");
        let mut encryptor =
            cbc::Encryptor::<aes::Aes256>::new(&self.key, GenericArray::from_slice(&self.iv));
        for block in buffer.chunks_mut(16) {
            let generic = GenericArray::from_mut_slice(block);
            encryptor.encrypt_block_mut(generic);
        }
        if let Some(tail) = buffer.chunks(16).last() {
            self.iv.copy_from_slice(tail);
        }
    }

    /// Decrypts `buffer` in place. `buffer.len()` MUST be a multiple of 16.
    pub fn decrypt(&mut self, buffer: &mut [u8]) {
        use aes::cipher::BlockDecryptMut;
        assert_eq!(buffer.len() % 16, 0, "CBC requires block-aligned input");
        let next_iv: [u8; 16] = buffer[buffer.len() - 16..].try_into().unwrap();
        let mut decryptor =
            cbc::Decryptor::<aes::Aes256>::new(&self.key, GenericArray::from_slice(&self.iv));
        for block in buffer.chunks_mut(16) {
            let generic = GenericArray::from_mut_slice(block);
            decryptor.decrypt_block_mut(generic);
        }
        self.iv = next_iv;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_roundtrips() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let mut tx = AesCtr::new(&key, &iv);
        let mut rx = AesCtr::new(&key, &iv);

        let mut data = b"hello obfuscated mtproto world!".to_vec();
        let original = data.clone();
        tx.apply(&mut data);
        assert_ne!(data, original);
        rx.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn cbc_roundtrips_across_multiple_frames() {
        let key = [3u8; 32];
        let iv = [5u8; 16];
        let mut enc = AesCbcCodec::new(key, iv);
        let mut dec = AesCbcCodec::new(key, iv);

        for frame_len in [16usize, 32, 160] {
            let original = vec![0xAAu8; frame_len];
            let mut buffer = original.clone();
            enc.encrypt(&mut buffer);
            assert_ne!(buffer, original);
            dec.decrypt(&mut buffer);
            assert_eq!(buffer, original);
        }
    }
}
