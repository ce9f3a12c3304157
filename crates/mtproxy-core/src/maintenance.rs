// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Background tasks that keep `ProxyState` current: time-skew
//! detection, the middle-proxy list refresh, the cover-cert length
//! probe, and one-shot public-IP discovery at startup. Each periodic
//! task owns its own loop and never terminates the process on error —
//! a failed round is logged and retried next period.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mtproxy_crypto::SecureRandom;
use mtproxy_proto::faketls::{self, TLS_HANDSHAKE_LEN};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::state::{MiddleProxyTables, ProxyState};

const PROXY_CONFIG_URL: &str = "https://core.telegram.org/getProxyConfig";
const PROXY_CONFIG_V6_URL: &str = "https://core.telegram.org/getProxyConfigV6";
const PROXY_SECRET_URL: &str = "https://core.telegram.org/getProxySecret";

/// How far the `Date:` header may drift from our own clock before we
/// consider ourselves skewed and give up on the middle-proxy path,
/// whose RPC handshake embeds a timestamp the middle proxy itself
/// checks.
const TIME_SKEW_THRESHOLD_SECS: i64 = 30;
const COVER_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const COVER_PROBE_READ_WINDOW: Duration = Duration::from_millis(500);
const MIN_COVER_CERT_LEN: usize = 1024;
const MAX_COVER_CERT_LEN: usize = 4095;

/// Resolves our own public IPv4/IPv6 once at startup. `ProxyState`
/// treats these as immutable afterwards, so this is a plain function
/// rather than a spawned loop.
pub async fn discover_public_ips(http: &reqwest::Client) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let v4 = fetch_text(http, "https://api.ipify.org").await.and_then(|s| s.trim().parse().ok());
    let v6 = fetch_text(http, "https://api6.ipify.org").await.and_then(|s| s.trim().parse().ok());
    (v4, v6)
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> Option<String> {
    match http.get(url).send().await {
        Ok(resp) => resp.text().await.ok(),
        Err(err) => {
            log::debug!("maintenance: GET {url} failed: {err}");
            None
        }
    }
}

/// Periodically compares our clock against Telegram's `Date:` response
/// header and updates `isTimeSkewed`/`disableMiddleProxy` accordingly.
pub async fn run_time_sync(http: reqwest::Client, state: Arc<ProxyState>, period: Duration) {
    loop {
        match check_time_skew(&http).await {
            Ok(skew_secs) => {
                let skewed = skew_secs.abs() > TIME_SKEW_THRESHOLD_SECS;
                state.is_time_skewed.store(skewed, Ordering::Relaxed);
                state.disable_middle_proxy.store(skewed, Ordering::Relaxed);
                if skewed {
                    log::warn!("maintenance: clock skew of {skew_secs}s detected, disabling middle-proxy path");
                }
            }
            Err(err) => log::debug!("maintenance: time sync failed: {err}"),
        }
        sleep(period).await;
    }
}

async fn check_time_skew(http: &reqwest::Client) -> Result<i64, String> {
    let resp = http
        .get(PROXY_SECRET_URL)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let date_header = resp
        .headers()
        .get(reqwest::header::DATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "response had no Date header".to_string())?;
    let remote = parse_http_date(date_header).ok_or_else(|| format!("unparseable Date header: {date_header}"))?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?.as_secs() as i64;
    Ok(now - remote)
}

/// Refreshes the middle-proxy candidate tables and shared secret from
/// Telegram's published endpoints.
pub async fn run_proxy_list_refresh(http: reqwest::Client, state: Arc<ProxyState>, period: Duration) {
    loop {
        match refresh_proxy_lists(&http).await {
            Ok((tables, secret)) => {
                state.replace_middle_proxy_tables(tables);
                if let Some(secret) = secret {
                    state.replace_middle_proxy_secret(secret);
                }
            }
            Err(err) => log::debug!("maintenance: proxy list refresh failed: {err}"),
        }
        sleep(period).await;
    }
}

async fn refresh_proxy_lists(http: &reqwest::Client) -> Result<(MiddleProxyTables, Option<[u8; 64]>), String> {
    let v4_text = fetch_text(http, PROXY_CONFIG_URL).await.ok_or("getProxyConfig unreachable")?;
    let v6_text = fetch_text(http, PROXY_CONFIG_V6_URL).await.ok_or("getProxyConfigV6 unreachable")?;
    let mut tables = MiddleProxyTables::default();
    tables.v4 = parse_proxy_for_lines(&v4_text);
    tables.v6 = parse_proxy_for_lines(&v6_text);

    let secret = match http.get(PROXY_SECRET_URL).send().await {
        Ok(resp) => resp.bytes().await.ok().and_then(|bytes| <[u8; 64]>::try_from(bytes.as_ref()).ok()),
        Err(_) => None,
    };
    Ok((tables, secret))
}

/// Parses lines of the form `proxy_for -2 149.154.175.50:8888;` (host
/// may be bracketed IPv6) into a DC-index keyed table.
fn parse_proxy_for_lines(text: &str) -> crate::state::MiddleProxyTable {
    let mut table: crate::state::MiddleProxyTable = std::collections::HashMap::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("proxy_for") else {
            continue;
        };
        let Some((dc_part, addr_part)) = rest.trim_start().split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(dc_index) = dc_part.trim().parse::<i16>() else {
            continue;
        };
        let addr_part = addr_part.trim().trim_end_matches(';').trim();
        let Some(addr) = parse_host_port(addr_part) else {
            continue;
        };
        table.entry(dc_index).or_default().push(addr);
    }
    table
}

fn parse_host_port(s: &str) -> Option<std::net::SocketAddr> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        format!("[{host}]:{port}").parse().ok()
    } else {
        s.parse().ok()
    }
}

/// Periodically re-probes the cover host's real TLS handshake size so
/// our own ServerHello's ApplicationData padding keeps matching it.
pub async fn run_cover_cert_probe(mask_host: String, mask_port: u16, state: Arc<ProxyState>, period: Duration) {
    loop {
        match probe_cover_cert_length(&mask_host, mask_port).await {
            Ok(len) => state.set_cover_cert_length(len),
            Err(err) => log::debug!("maintenance: cover-cert probe failed: {err}"),
        }
        sleep(period).await;
    }
}

async fn probe_cover_cert_length(host: &str, port: u16) -> std::io::Result<usize> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut rng = SecureRandom::new();
    let mut hello = faketls::CLIENT_HELLO_PROBE_PREFIX.to_vec();
    hello.extend(rng.bytes(TLS_HANDSHAKE_LEN - hello.len()));

    let mut stream = tokio::time::timeout(COVER_PROBE_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "cover probe dial timeout"))??;
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut total = 0usize;
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + COVER_PROBE_READ_WINDOW;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(err)) => return Err(err),
        }
    }
    Ok(total.clamp(MIN_COVER_CERT_LEN, MAX_COVER_CERT_LEN))
}

/// Parses an RFC 7231 `Date:` header (`Sun, 06 Nov 1994 08:49:37 GMT`)
/// into Unix seconds, assuming the value is always UTC as the spec
/// requires.
fn parse_http_date(s: &str) -> Option<i64> {
    let mut parts = s.trim().split_whitespace();
    parts.next()?; // weekday, e.g. "Sun,"
    let day: i64 = parts.next()?.parse().ok()?;
    let month = month_number(parts.next()?)?;
    let year: i64 = parts.next()?.parse().ok()?;
    let mut time_parts = parts.next()?.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;

    Some(days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second)
}

fn month_number(name: &str) -> Option<i64> {
    const NAMES: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    NAMES.iter().position(|m| *m == name).map(|i| i as i64 + 1)
}

/// Inverse of the civil-calendar conversion used for user expiry dates:
/// days since the Unix epoch for a given (year, month, day).
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let year_of_era = (y - era * 400) as u64;
    let month_of_year = month as u64;
    let day_of_year = (153 * (if month_of_year > 2 { month_of_year - 3 } else { month_of_year + 9 }) + 2) / 5
        + day as u64
        - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era as i64 - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_date_header() {
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(784_111_777));
    }

    #[test]
    fn civil_conversion_matches_a_known_reference_point() {
        assert_eq!(days_from_civil(2026, 7, 27) * 86_400, 1_785_110_400);
        assert_eq!(days_from_civil(1970, 1, 1), 0);
    }

    #[test]
    fn parse_proxy_for_lines_extracts_dc_candidates() {
        let text = "proxy_for -2 149.154.175.50:8888;\nproxy_for 1 [2001:db8::1]:443;\nignored\n";
        let table = parse_proxy_for_lines(text);
        assert_eq!(table.get(&-2).unwrap()[0].to_string(), "149.154.175.50:8888");
        assert_eq!(table.get(&1).unwrap()[0].to_string(), "[2001:db8::1]:443");
    }
}
