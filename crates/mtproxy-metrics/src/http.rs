// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A deliberately tiny HTTP/1.1 responder for the metrics port: it reads
//! just enough of the request to know the peer is done talking, ignores
//! the request path entirely, and writes back the stats sink's
//! Prometheus text rendering — or closes silently if the peer isn't
//! whitelisted.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::sink::StatsSink;

pub struct MetricsServer {
    sink: Arc<StatsSink>,
    prefix: String,
    whitelist: Vec<IpAddr>,
}

impl MetricsServer {
    pub fn new(sink: Arc<StatsSink>, prefix: String, whitelist: Vec<IpAddr>) -> Self {
        Self {
            sink,
            prefix,
            whitelist,
        }
    }

    fn is_allowed(&self, peer: IpAddr) -> bool {
        self.whitelist.is_empty() || self.whitelist.contains(&peer)
    }

    /// Accepts connections on `listener` until the task is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!("metrics accept failed: {}", err);
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle(stream, peer.ip()).await {
                    log::debug!("metrics connection from {} failed: {}", peer, err);
                }
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: IpAddr) -> std::io::Result<()> {
        if !self.is_allowed(peer) {
            return stream.shutdown().await;
        }

        let mut buf = [0u8; 2048];
        // A full request line plus headers always ends in "\r\n\r\n"; one
        // read is enough for any client that isn't deliberately adversarial.
        let _ = stream.read(&mut buf).await?;

        let body = self.sink.render(&self.prefix);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn serves_rendered_metrics_to_whitelisted_peer() {
        let sink = Arc::new(StatsSink::new());
        sink.record_connect_all();
        let server = Arc::new(MetricsServer::new(sink, "mtproxy_".into(), vec![]));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("mtproxy_connects_all 1"));
    }

    #[test]
    fn whitelist_rejects_other_peers() {
        let sink = Arc::new(StatsSink::new());
        let server = MetricsServer::new(sink, "mtproxy_".into(), vec!["10.0.0.1".parse().unwrap()]);
        assert!(!server.is_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert!(server.is_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }
}
