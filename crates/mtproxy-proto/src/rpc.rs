// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The middle-proxy RPC envelope: wraps each client frame with routing
//! and ad-tag metadata on the way out, and unwraps the middle proxy's
//! three possible response shapes on the way back. This sits on top of
//! the FULL/AES-CBC transport built by [`crate::framing::full`] and
//! [`mtproxy_crypto::AesCbcCodec`]; it does not do any framing itself.

use std::net::IpAddr;

use bytes::Bytes;

use crate::errors::{FrameError, FrameResult};
use crate::framing::ProtocolTag;

pub const RPC_NONCE: [u8; 4] = [0xaa, 0x87, 0xcb, 0x7a];
pub const RPC_HANDSHAKE: [u8; 4] = [0xf5, 0xee, 0x82, 0x76];
pub const RPC_PROXY_REQ: [u8; 4] = [0xee, 0xf1, 0xce, 0x36];
pub const RPC_PROXY_ANS: [u8; 4] = [0x0d, 0xda, 0x03, 0x44];
pub const RPC_CLOSE_EXT: [u8; 4] = [0xa2, 0x34, 0xb6, 0x5e];
pub const RPC_SIMPLE_ACK: [u8; 4] = [0x9b, 0x40, 0xac, 0x3b];

pub const CRYPTO_AES: u32 = 0x0000_0001;

// EXTRA_SIZE (a little-endian u32 of 24, the byte length of the proxy
// tag fields that follow it in the reference server) concatenated with
// the four-byte PROXY_TAG magic.
const EXTRA_SIZE_PROXY_TAG: &[u8] = &[0x18, 0x00, 0x00, 0x00, 0xae, 0x26, 0x1e, 0xdb];

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnvelopeFlags: u32 {
        const NOT_ENCRYPTED = 0x2;
        const HAS_AD_TAG    = 0x8;
        const MAGIC         = 0x1000;
        const EXTMODE2      = 0x20000;
        const PAD           = 0x8000000;
        const INTERMEDIATE  = 0x20000000;
        const ABRIDGED      = 0x40000000;
        const QUICKACK      = 0x80000000;
    }
}

/// Computes the flags word exactly as the writer would for one frame: the
/// protocol-variant bits, the always-on `HAS_AD_TAG|MAGIC|EXTMODE2`, an
/// optional `QUICKACK`, and `NOT_ENCRYPTED` when the payload opens with
/// an all-zero 8-byte auth-key id.
pub fn compute_flags(protocol: ProtocolTag, quickack: bool, payload: &[u8]) -> EnvelopeFlags {
    let mut flags = match protocol {
        ProtocolTag::Abridged => EnvelopeFlags::ABRIDGED,
        ProtocolTag::Intermediate => EnvelopeFlags::INTERMEDIATE,
        ProtocolTag::SecureIntermediate => EnvelopeFlags::INTERMEDIATE | EnvelopeFlags::PAD,
    };
    flags |= EnvelopeFlags::HAS_AD_TAG | EnvelopeFlags::MAGIC | EnvelopeFlags::EXTMODE2;
    if quickack {
        flags |= EnvelopeFlags::QUICKACK;
    }
    if payload.len() >= 8 && payload[..8] == [0u8; 8] {
        flags |= EnvelopeFlags::NOT_ENCRYPTED;
    }
    flags
}

/// Encodes one endpoint as the envelope's 16-byte address field:
/// IPv4-mapped-in-IPv6 (`00..00 ff ff` + 4 address bytes) for v4, the raw
/// 16 bytes for v6.
pub fn encode_address(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => {
            let mut out = [0u8; 16];
            out[10] = 0xff;
            out[11] = 0xff;
            out[12..16].copy_from_slice(&v4.octets());
            out
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn encode_port_le(port: u16) -> [u8; 4] {
    (port as u32).to_le_bytes()
}

pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// Builds one RPC_PROXY_REQ-wrapped frame ready to hand to the FULL
/// writer. `out_conn_id` identifies this connection to the middle proxy
/// and must stay stable for its whole lifetime.
pub fn build_proxy_req(
    out_conn_id: u64,
    remote: &Endpoint,
    ours: &Endpoint,
    ad_tag: &[u8],
    protocol: ProtocolTag,
    quickack: bool,
    payload: &[u8],
) -> Vec<u8> {
    let flags = compute_flags(protocol, quickack, payload);

    let mut out = Vec::with_capacity(4 + 4 + 8 + 20 + 20 + 8 + 1 + ad_tag.len() + 3 + payload.len());
    out.extend_from_slice(&RPC_PROXY_REQ);
    out.extend_from_slice(&flags.bits().to_le_bytes());
    out.extend_from_slice(&out_conn_id.to_le_bytes());
    out.extend_from_slice(&encode_address(remote.addr));
    out.extend_from_slice(&encode_port_le(remote.port));
    out.extend_from_slice(&encode_address(ours.addr));
    out.extend_from_slice(&encode_port_le(ours.port));
    out.extend_from_slice(EXTRA_SIZE_PROXY_TAG);
    out.push(ad_tag.len() as u8);
    out.extend_from_slice(ad_tag);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, PartialEq, Eq)]
pub enum RpcResponse {
    Payload(Bytes),
    Eof,
    SimpleAck([u8; 4]),
}

/// Parses one already-decrypted FULL frame received from the middle
/// proxy into its response shape.
pub fn parse_response(frame: &[u8]) -> FrameResult<RpcResponse> {
    if frame.len() < 4 {
        return Err(FrameError::Corruption("rpc response frame too short"));
    }
    let tag = &frame[0..4];
    if tag == RPC_PROXY_ANS {
        if frame.len() < 16 {
            return Err(FrameError::Corruption("rpc proxy answer header truncated"));
        }
        Ok(RpcResponse::Payload(Bytes::copy_from_slice(&frame[16..])))
    } else if tag == RPC_CLOSE_EXT {
        Ok(RpcResponse::Eof)
    } else if tag == RPC_SIMPLE_ACK {
        if frame.len() < 8 {
            return Err(FrameError::Corruption("rpc simple ack truncated"));
        }
        Ok(RpcResponse::SimpleAck(frame[4..8].try_into().unwrap()))
    } else {
        Err(FrameError::Corruption("unrecognized rpc response tag"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn abridged_zero_payload_sets_exactly_the_documented_flags() {
        let flags = compute_flags(ProtocolTag::Abridged, false, &[0u8; 8]);
        let expected = EnvelopeFlags::HAS_AD_TAG
            | EnvelopeFlags::MAGIC
            | EnvelopeFlags::EXTMODE2
            | EnvelopeFlags::ABRIDGED
            | EnvelopeFlags::NOT_ENCRYPTED;
        assert_eq!(flags, expected);
    }

    #[test]
    fn secure_intermediate_sets_pad_bit() {
        let flags = compute_flags(ProtocolTag::SecureIntermediate, false, &[1u8; 8]);
        assert!(flags.contains(EnvelopeFlags::INTERMEDIATE));
        assert!(flags.contains(EnvelopeFlags::PAD));
        assert!(!flags.contains(EnvelopeFlags::NOT_ENCRYPTED));
    }

    #[test]
    fn ipv4_address_is_mapped_into_ipv6_prefix() {
        let encoded = encode_address(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
        assert_eq!(&encoded[0..10], &[0u8; 10]);
        assert_eq!(&encoded[10..12], &[0xff, 0xff]);
        assert_eq!(&encoded[12..16], &[198, 51, 100, 7]);
    }

    #[test]
    fn parse_response_dispatches_on_tag() {
        let mut ans = RPC_PROXY_ANS.to_vec();
        ans.extend_from_slice(&[0u8; 12]);
        ans.extend_from_slice(b"payload");
        assert_eq!(
            parse_response(&ans).unwrap(),
            RpcResponse::Payload(Bytes::from_static(b"payload"))
        );

        assert_eq!(parse_response(&RPC_CLOSE_EXT).unwrap(), RpcResponse::Eof);

        let mut ack = RPC_SIMPLE_ACK.to_vec();
        ack.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            parse_response(&ack).unwrap(),
            RpcResponse::SimpleAck([1, 2, 3, 4])
        );
    }
}
