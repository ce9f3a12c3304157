// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The cover-host tunnel: on a failed handshake probe, replay what the
//! client sent to a configured cover host and splice the two sockets so
//! an outside observer sees exactly what that host would have produced.

use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const COVER_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVED_IP_TTL: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct CoverHost {
    pub host: String,
    pub port: u16,
}

/// Caches the cover host's resolved IP for ~90s so repeated failed
/// probes don't each pay for a fresh DNS lookup.
#[derive(Default)]
pub struct ResolvedIpCache {
    slot: Mutex<Option<(IpAddr, Instant)>>,
}

impl ResolvedIpCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_resolve(&self, host: &str) -> io::Result<IpAddr> {
        let mut slot = self.slot.lock().await;
        if let Some((ip, at)) = *slot {
            if at.elapsed() < RESOLVED_IP_TTL {
                return Ok(ip);
            }
        }
        let mut addrs = tokio::net::lookup_host((host, 0)).await?;
        let ip = addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cover host did not resolve"))?
            .ip();
        *slot = Some((ip, Instant::now()));
        Ok(ip)
    }
}

/// Dials the cover host, replays the client's already-consumed probe
/// bytes, then splices the two sockets bidirectionally until one side
/// closes. Propagates the cover's close style (FIN vs RST) onto the
/// client socket.
pub async fn tunnel_to_cover(
    mut client: TcpStream,
    probe_bytes: &[u8],
    cover: &CoverHost,
    cache: &ResolvedIpCache,
) -> io::Result<()> {
    let ip = cache.get_or_resolve(&cover.host).await?;
    let mut upstream = tokio::time::timeout(
        COVER_DIAL_TIMEOUT,
        TcpStream::connect((ip, cover.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "cover dial timeout"))??;

    upstream.write_all(probe_bytes).await?;

    let (mut client_rd, mut client_wr) = client.split();
    let (mut cover_rd, mut cover_wr) = upstream.split();

    let client_to_cover = tokio::io::copy(&mut client_rd, &mut cover_wr);
    let cover_to_client = tokio::io::copy(&mut cover_rd, &mut client_wr);
    tokio::pin!(client_to_cover, cover_to_client);

    tokio::select! {
        result = &mut cover_to_client => {
            match result {
                Ok(_) => { let _ = client_wr.shutdown().await; }
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => force_reset(&mut client),
                Err(err) => return Err(err),
            }
        }
        result = &mut client_to_cover => {
            result?;
        }
    }
    Ok(())
}

/// Passively drains and discards everything the client sends until EOF,
/// used when the cover host is disabled or unreachable.
pub async fn drain_silently(mut client: TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn force_reset(client: &mut TcpStream) {
    let _ = client.set_linger(Some(Duration::ZERO));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn replays_probe_bytes_and_splices() {
        let cover_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cover_addr = cover_listener.local_addr().unwrap();
        let cover_task = tokio::spawn(async move {
            let (mut sock, _) = cover_listener.accept().await.unwrap();
            let mut got = [0u8; 5];
            sock.read_exact(&mut got).await.unwrap();
            sock.write_all(b"hello back").await.unwrap();
            got
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (sock, _) = client_listener.accept().await.unwrap();
            let cover = CoverHost {
                host: cover_addr.ip().to_string(),
                port: cover_addr.port(),
            };
            let cache = ResolvedIpCache::new();
            tunnel_to_cover(sock, b"probe", &cover, &cache).await.unwrap();
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello back");

        let got_probe = cover_task.await.unwrap();
        assert_eq!(&got_probe, b"probe");
        drop(client);
        let _ = server_task.await;
    }
}
