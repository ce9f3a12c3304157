// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-connection lifecycle every accepted socket runs through:
//! socket setup, the handshake under a timeout, path selection between
//! direct-to-DC and middle-proxy relay, per-user limit enforcement, and
//! the bidirectional splice with duration/traffic bookkeeping.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mtproxy_config::{BufSize as ConfigBufSize, Settings};
use mtproxy_crypto::SecureRandom;
use mtproxy_metrics::StatsSink;
use mtproxy_net::dc::{self, AddressFamilyPolicy};
use mtproxy_net::socket::{self, BufSizePolicy};
use mtproxy_net::{tunnel_to_cover, ConnectionPool, CoverHost, InitKind, PoolKey, ResolvedIpCache};
use mtproxy_proto::framing::{AbridgedReader, AbridgedWriter, IntermediateReader, IntermediateWriter};
use mtproxy_proto::io::{ByteSink, ByteSource, TcpSink, TcpSource, WriteExtra};
use mtproxy_proto::obfuscation::{ObfuscatedSink, ObfuscatedSource};
use mtproxy_proto::rpc::{build_proxy_req, parse_response, Endpoint, RpcResponse};
use mtproxy_proto::{FrameError, ProtocolTag};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::{CoreError, CoreResult};
use crate::handshake::{self, MatchedHandshake, ProbeResult};
use crate::middle_proxy::{self, MiddleProxyReader, MiddleProxyWriter};
use crate::state::{LimitViolation, ProxyState};
use crate::direct;

/// The reference design's values for outbound sockets; not currently
/// operator-configurable.
const DC_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(40);
const DC_KEEPALIVE_RETRIES: u32 = 5;
const CLIENT_KEEPALIVE_RETRIES: u32 = 3;

/// Everything a connection needs that outlives it: configuration,
/// shared mutable state, stats, the outbound pool, and the cover host.
/// Constructed once and cloned (cheaply, via `Arc`) into every accepted
/// connection's task.
#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    state: Arc<ProxyState>,
    stats: Arc<StatsSink>,
    pool: ConnectionPool,
    cover: Option<CoverHost>,
    cover_cache: Arc<ResolvedIpCache>,
    /// Picked once at startup from `client_handshake_timeout`'s
    /// (min, max) range, per the "random 5-15s at startup" rule.
    handshake_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        state: Arc<ProxyState>,
        stats: Arc<StatsSink>,
        pool: ConnectionPool,
        cover: Option<CoverHost>,
        cover_cache: Arc<ResolvedIpCache>,
    ) -> Self {
        let (min, max) = settings.client_handshake_timeout;
        let handshake_timeout = random_duration_between(min, max);
        Self {
            settings,
            state,
            stats,
            pool,
            cover,
            cover_cache,
            handshake_timeout,
        }
    }

    /// Runs one accepted connection to completion, swallowing every
    /// error into a debug log line: nothing here is ever reported back
    /// to the client in-band.
    pub async fn serve(&self, client: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = self.serve_inner(client, peer_addr).await {
            log::debug!("connection from {peer_addr} ended: {err}");
        }
    }

    async fn serve_inner(&self, mut client: TcpStream, peer_addr: SocketAddr) -> CoreResult<()> {
        self.stats.record_connect_all();
        let _active_guard = ActiveConnGuard::new(&self.state);

        let client_local_addr = client.local_addr().map_err(CoreError::Transient)?;

        socket::set_keepalive(&client, self.settings.client_keepalive, CLIENT_KEEPALIVE_RETRIES)
            .map_err(CoreError::Transient)?;
        let client_buf_size = self.to_clt_buf_size();
        socket::set_recv_buffer_size(&client, client_buf_size).map_err(CoreError::Transient)?;
        socket::set_send_buffer_size(&client, client_buf_size).map_err(CoreError::Transient)?;

        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let probe = match timeout(
            self.handshake_timeout,
            handshake::run(&mut client, &self.settings.users, &self.state, self.settings.ignore_time_skew, now_unix),
        )
        .await
        {
            Ok(Ok(probe)) => probe,
            Ok(Err(io_err)) => return Err(CoreError::Transient(io_err)),
            Err(_elapsed) => {
                self.stats.record_handshake_timeout();
                return Err(CoreError::HandshakeTimeout);
            }
        };

        let matched = match probe {
            ProbeResult::Matched(matched) => matched,
            ProbeResult::Rejected { probe_bytes } => {
                self.stats.record_connect_bad();
                return self.cover_tunnel(client, probe_bytes).await;
            }
        };

        let user_index = matched.user_index;
        let user = &self.settings.users[user_index];
        let user_name = user.name.clone();

        if user.is_expired(unix_to_ddmmyyyy(now_unix)) {
            return Err(CoreError::Expired);
        }
        self.state
            .try_reserve_connection(&user_name, user.max_tcp_conns, user.data_quota)
            .map_err(|violation| match violation {
                LimitViolation::TooManyConns => CoreError::TooManyConns,
                LimitViolation::QuotaExceeded => CoreError::QuotaExceeded,
            })?;

        self.stats.user_connect_start(&user_name);
        let started_at = Instant::now();

        let relay_result = if self.state.use_middle_proxy(self.settings.use_middle_proxy) {
            self.run_middle_proxy(client, peer_addr, client_local_addr, matched).await
        } else {
            self.run_direct(client, matched).await
        };

        self.stats.record_duration(started_at.elapsed().as_secs_f64());
        self.stats.user_connect_end(&user_name);

        match relay_result {
            Ok((from_client, to_client, msgs_from, msgs_to)) => {
                self.stats.user_traffic(&user_name, from_client, to_client, msgs_from, msgs_to);
                self.state.release_connection(&user_name, from_client + to_client);
                Ok(())
            }
            Err(err) => {
                self.state.release_connection(&user_name, 0);
                Err(err)
            }
        }
    }

    async fn cover_tunnel(&self, client: TcpStream, probe_bytes: Vec<u8>) -> CoreResult<()> {
        match &self.cover {
            Some(cover) => tunnel_to_cover(client, &probe_bytes, cover, &self.cover_cache)
                .await
                .map_err(CoreError::Transient),
            None => mtproxy_net::cover::drain_silently(client).await.map_err(CoreError::Transient),
        }
    }

    fn address_family_policy(&self) -> AddressFamilyPolicy {
        AddressFamilyPolicy {
            have_v4: self.state.public_ipv4.is_some(),
            have_v6: self.state.public_ipv6.is_some(),
            prefer_ipv6: self.settings.prefer_ipv6,
        }
    }

    fn to_clt_buf_size(&self) -> usize {
        resolve_buf_size(self.settings.to_clt_bufsize, self.state.active_connections.load(Ordering::Relaxed))
    }

    fn to_tg_buf_size(&self) -> usize {
        resolve_buf_size(self.settings.to_tg_bufsize, self.state.active_connections.load(Ordering::Relaxed))
    }

    /// §4.6: negotiate a fresh obfuscated session with the DC and splice
    /// raw bytes both ways. No message framing is parsed on this path —
    /// the client's own framing survives the round trip unmodified,
    /// re-keyed per direction.
    async fn run_direct(&self, client: TcpStream, matched: MatchedHandshake) -> CoreResult<(u64, u64, u64, u64)> {
        let policy = self.address_family_policy();
        let dc_addr = dc::dc_address(matched.dc_index, policy)
            .ok_or_else(|| CoreError::DcUnavailable(io::Error::new(io::ErrorKind::InvalidInput, "dc index out of range")))?;
        let key = PoolKey {
            host: dc_addr.ip().to_string(),
            port: dc_addr.port(),
            init: InitKind::Direct,
        };
        let dc_stream = timeout(self.settings.tg_connect_timeout, self.pool.get(&key))
            .await
            .map_err(|_| CoreError::DcUnavailable(io::Error::new(io::ErrorKind::TimedOut, "tg connect timeout")))?
            .map_err(CoreError::DcUnavailable)?;
        socket::set_keepalive(&dc_stream, DC_KEEPALIVE_INTERVAL, DC_KEEPALIVE_RETRIES).map_err(CoreError::Transient)?;

        let direct_conn = direct::handshake(dc_stream, &matched, matched.protocol, self.settings.fast_mode).await?;
        let MatchedHandshake {
            client_to_proxy,
            proxy_to_client,
            ..
        } = matched;

        let (client_read, client_write) = client.into_split();
        let (dc_read, dc_write) = direct_conn.stream.into_split();

        let client_src = ObfuscatedSource::new(TcpSource::new(client_read), client_to_proxy);
        let client_sink = ObfuscatedSink::new(TcpSink::new(client_write), proxy_to_client);
        let dc_src = ObfuscatedSource::new(TcpSource::new(dc_read), direct_conn.decrypt);
        let dc_sink = ObfuscatedSink::new(TcpSink::new(dc_write), direct_conn.encrypt);

        let from_client = Arc::new(AtomicU64::new(0));
        let to_client = Arc::new(AtomicU64::new(0));

        let client_to_dc = pump_raw(
            client_src,
            dc_sink,
            self.to_tg_buf_size(),
            Some(self.settings.client_ack_timeout),
            from_client.clone(),
        );
        let dc_to_client = pump_raw(dc_src, client_sink, self.to_clt_buf_size(), None, to_client.clone());
        tokio::pin!(client_to_dc, dc_to_client);

        let result = tokio::select! {
            r = &mut client_to_dc => r,
            r = &mut dc_to_client => r,
        };
        result?;

        Ok((from_client.load(Ordering::Relaxed), to_client.load(Ordering::Relaxed), 0, 0))
    }

    /// §4.7: dial a candidate middle proxy for this DC index, perform its
    /// RPC handshake, then relay message-by-message: each client frame is
    /// wrapped in an RPC_PROXY_REQ envelope; each middle-proxy response is
    /// unwrapped and written back in the client's own framing.
    async fn run_middle_proxy(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        client_local_addr: SocketAddr,
        matched: MatchedHandshake,
    ) -> CoreResult<(u64, u64, u64, u64)> {
        let policy = self.address_family_policy();
        let mut rng = SecureRandom::new();
        let mp_stream = self.dial_middle_proxy(matched.dc_index, policy, &mut rng).await?;
        socket::set_keepalive(&mp_stream, DC_KEEPALIVE_INTERVAL, DC_KEEPALIVE_RETRIES).map_err(CoreError::Transient)?;

        let secret = self.state.middle_proxy_secret();
        let mp_conn = timeout(self.settings.tg_connect_timeout, middle_proxy::handshake(mp_stream, &secret))
            .await
            .map_err(|_| CoreError::MiddleProxyHandshakeFailed("handshake timed out"))??;

        let MatchedHandshake {
            protocol,
            client_to_proxy,
            proxy_to_client,
            ..
        } = matched;

        let (client_read, client_write) = client.into_split();
        let client_src = ObfuscatedSource::new(TcpSource::new(client_read), client_to_proxy);
        let client_sink = ObfuscatedSink::new(TcpSink::new(client_write), proxy_to_client);
        let client_reader = build_client_reader(client_src, protocol);
        let client_writer = build_client_writer(client_sink, protocol);

        let out_conn_id = rng.next_u64();
        let remote = Endpoint {
            addr: peer_addr.ip(),
            port: peer_addr.port(),
        };
        let ours = Endpoint {
            addr: client_local_addr.ip(),
            port: client_local_addr.port(),
        };
        let ad_tag = self.settings.ad_tag.map(|tag| tag.to_vec()).unwrap_or_default();

        let from_client = Arc::new(AtomicU64::new(0));
        let to_client = Arc::new(AtomicU64::new(0));
        let msgs_from = Arc::new(AtomicU64::new(0));
        let msgs_to = Arc::new(AtomicU64::new(0));

        let client_to_middle = pump_client_to_middle(
            client_reader,
            mp_conn.writer,
            remote,
            ours,
            ad_tag,
            protocol,
            out_conn_id,
            self.settings.client_ack_timeout,
            from_client.clone(),
            msgs_from.clone(),
        );
        let middle_to_client = pump_middle_to_client(mp_conn.reader, client_writer, to_client.clone(), msgs_to.clone());
        tokio::pin!(client_to_middle, middle_to_client);

        let result = tokio::select! {
            r = &mut client_to_middle => r,
            r = &mut middle_to_client => r,
        };
        result?;

        Ok((
            from_client.load(Ordering::Relaxed),
            to_client.load(Ordering::Relaxed),
            msgs_from.load(Ordering::Relaxed),
            msgs_to.load(Ordering::Relaxed),
        ))
    }

    async fn dial_middle_proxy(
        &self,
        dc_index: i16,
        policy: AddressFamilyPolicy,
        rng: &mut SecureRandom,
    ) -> CoreResult<TcpStream> {
        let tables = self.state.middle_proxy_tables();
        let table = if policy.use_ipv6() { &tables.v6 } else { &tables.v4 };
        let candidates = table
            .get(&dc_index)
            .filter(|candidates| !candidates.is_empty())
            .ok_or_else(|| CoreError::DcUnavailable(io::Error::new(io::ErrorKind::NotFound, "no middle-proxy candidates for dc")))?;
        let addr = candidates[rng.next_u32() as usize % candidates.len()];
        let key = PoolKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            init: InitKind::MiddleProxy,
        };
        timeout(self.settings.tg_connect_timeout, self.pool.get(&key))
            .await
            .map_err(|_| CoreError::DcUnavailable(io::Error::new(io::ErrorKind::TimedOut, "tg connect timeout")))?
            .map_err(CoreError::DcUnavailable)
    }
}

/// Decrements the process-wide active-connection gauge on every exit
/// path, including early returns via `?`.
struct ActiveConnGuard<'a> {
    state: &'a ProxyState,
}

impl<'a> ActiveConnGuard<'a> {
    fn new(state: &'a ProxyState) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for ActiveConnGuard<'_> {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn resolve_buf_size(cfg: ConfigBufSize, active_connections: usize) -> usize {
    let policy = match cfg {
        ConfigBufSize::Fixed(n) => BufSizePolicy::Fixed(n),
        ConfigBufSize::Tiered { low, margin_users, high } => BufSizePolicy::Tiered { low, margin_users, high },
    };
    policy.resolve(active_connections)
}

fn random_duration_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let offset = SecureRandom::new().next_u64() % span.max(1);
    min + Duration::from_millis(offset)
}

/// Days-since-epoch civil calendar conversion (Howard Hinnant's
/// `civil_from_days`), used only to compare against `expiration_date`
/// without pulling in a date/time crate for one comparison.
fn unix_to_ddmmyyyy(now_unix: u64) -> (u8, u8, u16) {
    let days = (now_unix / 86_400) as i64 + 719_468;
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u64;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let year = year_of_era as i64 + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let year = if month <= 2 { year + 1 } else { year };
    (day, month, year as u16)
}

async fn pump_raw<S: ByteSource, K: ByteSink>(
    mut src: S,
    mut dst: K,
    buf_size: usize,
    idle_timeout: Option<Duration>,
    counter: Arc<AtomicU64>,
) -> CoreResult<()> {
    loop {
        let chunk = match idle_timeout {
            Some(bound) => timeout(bound, src.read(buf_size))
                .await
                .map_err(|_| CoreError::Transient(io::Error::new(io::ErrorKind::TimedOut, "client idle timeout")))??,
            None => src.read(buf_size).await?,
        };
        if chunk.is_empty() {
            dst.write_eof().await?;
            return Ok(());
        }
        dst.write(&chunk, WriteExtra::empty()).await?;
        dst.drain().await?;
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
}

enum ClientFramingReader<S> {
    Abridged(AbridgedReader<S>),
    Intermediate(IntermediateReader<S>),
}

impl<S: ByteSource> ClientFramingReader<S> {
    async fn read_frame(&mut self) -> Result<(Bytes, WriteExtra), FrameError> {
        match self {
            ClientFramingReader::Abridged(reader) => reader.read_frame().await,
            ClientFramingReader::Intermediate(reader) => reader.read_frame().await,
        }
    }
}

enum ClientFramingWriter<K> {
    Abridged(AbridgedWriter<K>),
    Intermediate(IntermediateWriter<K>),
}

impl<K: ByteSink> ClientFramingWriter<K> {
    async fn write_frame(&mut self, payload: &[u8], extra: WriteExtra) -> Result<(), FrameError> {
        match self {
            ClientFramingWriter::Abridged(writer) => writer.write_frame(payload, extra).await,
            ClientFramingWriter::Intermediate(writer) => writer.write_frame(payload, extra).await,
        }
    }
}

fn build_client_reader<S: ByteSource>(inner: S, protocol: ProtocolTag) -> ClientFramingReader<S> {
    match protocol {
        ProtocolTag::Abridged => ClientFramingReader::Abridged(AbridgedReader::new(inner)),
        ProtocolTag::Intermediate => ClientFramingReader::Intermediate(IntermediateReader::new(inner, false)),
        ProtocolTag::SecureIntermediate => ClientFramingReader::Intermediate(IntermediateReader::new(inner, true)),
    }
}

fn build_client_writer<K: ByteSink>(inner: K, protocol: ProtocolTag) -> ClientFramingWriter<K> {
    match protocol {
        ProtocolTag::Abridged => ClientFramingWriter::Abridged(AbridgedWriter::new(inner)),
        ProtocolTag::Intermediate => ClientFramingWriter::Intermediate(IntermediateWriter::new(inner, false)),
        ProtocolTag::SecureIntermediate => ClientFramingWriter::Intermediate(IntermediateWriter::new(inner, true)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_client_to_middle<S: ByteSource>(
    mut reader: ClientFramingReader<S>,
    mut writer: MiddleProxyWriter,
    remote: Endpoint,
    ours: Endpoint,
    ad_tag: Vec<u8>,
    protocol: ProtocolTag,
    out_conn_id: u64,
    idle_timeout: Duration,
    octets: Arc<AtomicU64>,
    msgs: Arc<AtomicU64>,
) -> CoreResult<()> {
    loop {
        let (payload, extra) = timeout(idle_timeout, reader.read_frame())
            .await
            .map_err(|_| CoreError::Transient(io::Error::new(io::ErrorKind::TimedOut, "client idle timeout")))??;
        let quickack = extra.contains(WriteExtra::QUICKACK);
        let envelope = build_proxy_req(out_conn_id, &remote, &ours, &ad_tag, protocol, quickack, &payload);
        octets.fetch_add(payload.len() as u64, Ordering::Relaxed);
        msgs.fetch_add(1, Ordering::Relaxed);
        writer.write_frame(&envelope).await?;
    }
}

async fn pump_middle_to_client<K: ByteSink>(
    mut reader: MiddleProxyReader,
    mut writer: ClientFramingWriter<K>,
    octets: Arc<AtomicU64>,
    msgs: Arc<AtomicU64>,
) -> CoreResult<()> {
    loop {
        let frame = reader.read_frame().await?;
        match parse_response(&frame)? {
            RpcResponse::Payload(payload) => {
                writer.write_frame(&payload, WriteExtra::empty()).await?;
                octets.fetch_add(payload.len() as u64, Ordering::Relaxed);
                msgs.fetch_add(1, Ordering::Relaxed);
            }
            RpcResponse::SimpleAck(tag) => {
                writer.write_frame(&tag, WriteExtra::SIMPLE_ACK).await?;
            }
            RpcResponse::Eof => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_date_matches_known_reference_points() {
        assert_eq!(unix_to_ddmmyyyy(1_785_110_400), (27, 7, 2026));
        assert_eq!(unix_to_ddmmyyyy(0), (1, 1, 1970));
    }

    #[test]
    fn random_duration_stays_within_bounds() {
        let min = Duration::from_secs(5);
        let max = Duration::from_secs(15);
        for _ in 0..20 {
            let d = random_duration_between(min, max);
            assert!(d >= min && d < max);
        }
    }

    #[test]
    fn degenerate_range_returns_the_minimum() {
        let bound = Duration::from_secs(5);
        assert_eq!(random_duration_between(bound, bound), bound);
    }
}
