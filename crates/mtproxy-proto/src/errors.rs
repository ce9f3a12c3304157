// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::io;

/// Everything that can go wrong while framing or unframing a byte stream.
/// Every variant here maps to a socket abort one layer up; none of these
/// are ever reported to the peer in-band.
#[derive(Debug)]
pub enum FrameError {
    /// Declared length, sequence number, CRC, or TLS record type did not
    /// satisfy the wire format's invariants.
    Corruption(&'static str),
    /// The peer closed before the promised number of bytes arrived.
    UnexpectedEof,
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Corruption(reason) => write!(f, "frame corruption: {}", reason),
            FrameError::UnexpectedEof => write!(f, "unexpected eof mid-frame"),
            FrameError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::UnexpectedEof
        } else {
            FrameError::Io(err)
        }
    }
}

pub type FrameResult<T> = Result<T, FrameError>;
