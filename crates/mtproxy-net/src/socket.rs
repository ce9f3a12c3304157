// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Socket tuning applied at accept and dial time: TCP keepalive with an
//! explicit probe interval/count (`tokio`/std alone can't express this,
//! hence `socket2`) and the adaptive receive-buffer sizing from §5.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

pub fn set_keepalive(stream: &TcpStream, interval: Duration, retries: u32) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval)
        .with_retries(retries);
    sock.set_tcp_keepalive(&keepalive)
}

/// `toClientBufSize`/`toTgBufSize` may be a flat constant or a
/// `(low, margin_users, high)` triple that switches on current load.
#[derive(Clone, Copy, Debug)]
pub enum BufSizePolicy {
    Fixed(usize),
    Tiered {
        low: usize,
        margin_users: usize,
        high: usize,
    },
}

impl BufSizePolicy {
    pub fn resolve(&self, active_connections: usize) -> usize {
        match *self {
            BufSizePolicy::Fixed(n) => n,
            BufSizePolicy::Tiered {
                low,
                margin_users,
                high,
            } => {
                if active_connections < margin_users {
                    high
                } else {
                    low
                }
            }
        }
    }
}

pub fn set_recv_buffer_size(stream: &TcpStream, size: usize) -> io::Result<()> {
    SockRef::from(stream).set_recv_buffer_size(size)
}

pub fn set_send_buffer_size(stream: &TcpStream, size: usize) -> io::Result<()> {
    SockRef::from(stream).set_send_buffer_size(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiered_policy_switches_at_the_margin() {
        let policy = BufSizePolicy::Tiered {
            low: 1024,
            margin_users: 1000,
            high: 65536,
        };
        assert_eq!(policy.resolve(0), 65536);
        assert_eq!(policy.resolve(999), 65536);
        assert_eq!(policy.resolve(1000), 1024);
        assert_eq!(policy.resolve(5000), 1024);
    }

    #[test]
    fn fixed_policy_ignores_load() {
        let policy = BufSizePolicy::Fixed(4096);
        assert_eq!(policy.resolve(0), 4096);
        assert_eq!(policy.resolve(999_999), 4096);
    }
}
