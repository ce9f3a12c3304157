// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The outbound connection pool to Telegram DCs and middle proxies.
//! Entries are plain TCP streams, dialed ahead of need and handed out on
//! `get`; the caller layers whatever handshake the destination requires
//! on top.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 64;

/// Distinguishes pool buckets that share a `(host, port)` but need
/// different post-dial handshakes, so a raw dial meant for one is never
/// handed to the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitKind {
    Direct,
    MiddleProxy,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub init: InitKind,
}

struct Inner {
    slots: Mutex<HashMap<PoolKey, VecDeque<TcpStream>>>,
    capacity: usize,
    connect_timeout: Duration,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, connect_timeout)
    }

    pub fn with_capacity(capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                capacity,
                connect_timeout,
            }),
        }
    }

    /// Returns a usable stream for `key`: a healthy cached one if
    /// available, purging any closed/failed entries found along the way,
    /// otherwise a freshly dialed one. Opportunistically tops the bucket
    /// back up in the background.
    pub async fn get(&self, key: &PoolKey) -> io::Result<TcpStream> {
        let cached = {
            let mut slots = self.inner.slots.lock().await;
            let queue = slots.entry(key.clone()).or_default();
            let mut found = None;
            while let Some(stream) = queue.pop_front() {
                if is_usable(&stream) {
                    found = Some(stream);
                    break;
                }
            }
            found
        };

        self.refill(key);

        match cached {
            Some(stream) => Ok(stream),
            None => self.dial(key).await,
        }
    }

    async fn dial(&self, key: &PoolKey) -> io::Result<TcpStream> {
        let fut = TcpStream::connect((key.host.as_str(), key.port));
        match tokio::time::timeout(self.inner.connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "tg connect timeout")),
        }
    }

    /// Spawns background dials to bring the bucket back up toward
    /// capacity, without blocking the caller that triggered the refill.
    fn refill(&self, key: &PoolKey) {
        let pool = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let deficit = {
                let slots = pool.inner.slots.lock().await;
                let have = slots.get(&key).map(VecDeque::len).unwrap_or(0);
                pool.inner.capacity.saturating_sub(have)
            };
            for _ in 0..deficit.min(4) {
                if let Ok(stream) = pool.dial(&key).await {
                    let mut slots = pool.inner.slots.lock().await;
                    slots.entry(key.clone()).or_default().push_back(stream);
                } else {
                    break;
                }
            }
        });
    }

    /// Number of currently cached (non-dialing) entries for `key`, for
    /// tests and introspection.
    pub async fn len(&self, key: &PoolKey) -> usize {
        let slots = self.inner.slots.lock().await;
        slots.get(key).map(VecDeque::len).unwrap_or(0)
    }
}

fn is_usable(stream: &TcpStream) -> bool {
    stream.peer_addr().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn get_dials_when_pool_is_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::with_capacity(2, Duration::from_secs(1));
        let key = PoolKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            init: InitKind::Direct,
        };
        let stream = pool.get(&key).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn different_init_kinds_use_separate_buckets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::with_capacity(2, Duration::from_secs(1));
        let direct = PoolKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            init: InitKind::Direct,
        };
        let middle = PoolKey {
            init: InitKind::MiddleProxy,
            ..direct.clone()
        };
        let _s1 = pool.get(&direct).await.unwrap();
        let _s2 = pool.get(&middle).await.unwrap();
        assert_ne!(pool.len(&direct).await, usize::MAX);
    }
}
