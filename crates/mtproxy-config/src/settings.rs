// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::user::{RawUser, User};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Missing(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "could not read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "could not parse config file: {}", err),
            ConfigError::Missing(field) => write!(f, "missing required config field: {}", field),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Missing(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum BufSize {
    Fixed(usize),
    Tiered {
        low: usize,
        margin_users: usize,
        high: usize,
    },
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(untagged)]
enum RawBufSize {
    Fixed(usize),
    Tiered {
        low: usize,
        margin_users: usize,
        high: usize,
    },
}

impl RawBufSize {
    fn into_buf_size(self) -> BufSize {
        match self {
            RawBufSize::Fixed(n) => BufSize::Fixed(n),
            RawBufSize::Tiered { low, margin_users, high } => BufSize::Tiered {
                low,
                margin_users,
                high,
            },
        }
    }
}

#[derive(Deserialize, Default, Debug)]
struct RawFile {
    server: Option<RawServer>,
    mtproto: Option<RawMtproto>,
    proxy: Option<RawProxy>,
    metrics: Option<RawMetrics>,
    users: Option<Vec<RawUser>>,
}

#[derive(Deserialize, Default, Debug)]
struct RawServer {
    port: Option<u16>,
    domain: Option<String>,
}

#[derive(Deserialize, Default, Debug)]
struct RawMtproto {
    ad_tag: Option<String>,
    sni: Option<String>,
    mask: Option<bool>,
    mask_host: Option<String>,
    mask_port: Option<u16>,
}

#[derive(Deserialize, Default, Debug)]
struct RawProxy {
    proxy_protocol: Option<bool>,
    use_middle_proxy: Option<bool>,
    fast_mode: Option<bool>,
    replay_check_len: Option<usize>,
    ignore_time_skew: Option<bool>,
    client_ips_len: Option<usize>,
    stats_print_period: Option<u64>,
    proxy_info_update_period: Option<u64>,
    get_time_period: Option<u64>,
    get_cert_len_period: Option<u64>,
    client_keepalive: Option<u64>,
    client_handshake_timeout_min: Option<u64>,
    client_handshake_timeout_max: Option<u64>,
    client_ack_timeout: Option<u64>,
    tg_connect_timeout: Option<u64>,
    to_clt_bufsize: Option<RawBufSize>,
    to_tg_bufsize: Option<RawBufSize>,
    listen_addr_ipv4: Option<String>,
    listen_addr_ipv6: Option<String>,
    listen_unix_sock: Option<String>,
    prefer_ipv6: Option<bool>,
    caddy_reverse_proxy: Option<bool>,
}

#[derive(Deserialize, Default, Debug)]
struct RawMetrics {
    enabled: Option<bool>,
    metrics_port: Option<u16>,
    listen_addr_ipv4: Option<String>,
    listen_addr_ipv6: Option<String>,
    metrics_whitelist: Option<Vec<IpAddr>>,
    metrics_export_links: Option<bool>,
    metrics_prefix: Option<String>,
}

/// Everything the core reads at runtime, read-only once loaded. Merged
/// from two TOML files: values in the second override the first so an
/// operator can keep secrets in a separate file from general settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    pub domain: Option<String>,

    pub ad_tag: Option<[u8; 16]>,
    pub sni: String,
    pub mask: bool,
    pub mask_host: String,
    pub mask_port: u16,

    pub proxy_protocol: bool,
    pub use_middle_proxy: bool,
    pub fast_mode: bool,
    pub replay_check_len: usize,
    pub ignore_time_skew: bool,
    pub client_ips_len: usize,
    pub stats_print_period: Duration,
    pub proxy_info_update_period: Duration,
    pub get_time_period: Duration,
    pub get_cert_len_period: Duration,
    pub client_keepalive: Duration,
    pub client_handshake_timeout: (Duration, Duration),
    pub client_ack_timeout: Duration,
    pub tg_connect_timeout: Duration,
    pub to_clt_bufsize: BufSize,
    pub to_tg_bufsize: BufSize,
    pub listen_addr_ipv4: Ipv4Addr,
    pub listen_addr_ipv6: Option<Ipv6Addr>,
    pub listen_unix_sock: Option<String>,
    pub prefer_ipv6: bool,
    pub caddy_reverse_proxy: bool,

    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub metrics_whitelist: Vec<IpAddr>,
    pub metrics_export_links: bool,
    pub metrics_prefix: String,

    pub users: Vec<User>,
}

impl Settings {
    /// Loads and merges `base_path` and `overlay_path`; fields present in
    /// the overlay win. Either path may be absent on disk, in which case
    /// that file contributes nothing.
    pub fn load(base_path: &Path, overlay_path: &Path) -> Result<Settings, ConfigError> {
        let base = read_optional(base_path)?;
        let overlay = read_optional(overlay_path)?;
        Ok(Settings::merge(base, overlay))
    }

    fn merge(base: RawFile, overlay: RawFile) -> Settings {
        let server = merge_server(base.server, overlay.server);
        let mtproto = merge_mtproto(base.mtproto, overlay.mtproto);
        let proxy = merge_proxy(base.proxy, overlay.proxy);
        let metrics = merge_metrics(base.metrics, overlay.metrics);
        let mut users: Vec<User> = base
            .users
            .unwrap_or_default()
            .into_iter()
            .map(RawUser::into_user)
            .collect();
        if let Some(overlay_users) = overlay.users {
            users.extend(overlay_users.into_iter().map(RawUser::into_user));
        }

        let domain = server.domain.clone();
        let sni = mtproto.sni.clone().or_else(|| domain.clone()).unwrap_or_default();
        let mask_host = mtproto.mask_host.clone().unwrap_or_else(|| sni.clone());

        Settings {
            port: server.port.unwrap_or(3256),
            domain,
            ad_tag: mtproto
                .ad_tag
                .as_deref()
                .map(mtproxy_crypto::hex::coerce_secret),
            sni,
            mask: mtproto.mask.unwrap_or(true),
            mask_host,
            mask_port: mtproto.mask_port.unwrap_or(443),

            proxy_protocol: proxy.proxy_protocol.unwrap_or(false),
            use_middle_proxy: proxy.use_middle_proxy.unwrap_or(true),
            fast_mode: proxy.fast_mode.unwrap_or(false),
            replay_check_len: proxy.replay_check_len.unwrap_or(65536),
            ignore_time_skew: proxy.ignore_time_skew.unwrap_or(false),
            client_ips_len: proxy.client_ips_len.unwrap_or(131072),
            stats_print_period: Duration::from_secs(proxy.stats_print_period.unwrap_or(60)),
            proxy_info_update_period: Duration::from_secs(
                proxy.proxy_info_update_period.unwrap_or(86400),
            ),
            get_time_period: Duration::from_secs(proxy.get_time_period.unwrap_or(600)),
            get_cert_len_period: Duration::from_secs(
                proxy.get_cert_len_period.unwrap_or(5 * 3600),
            ),
            client_keepalive: Duration::from_secs(proxy.client_keepalive.unwrap_or(600)),
            client_handshake_timeout: (
                Duration::from_secs(proxy.client_handshake_timeout_min.unwrap_or(5)),
                Duration::from_secs(proxy.client_handshake_timeout_max.unwrap_or(15)),
            ),
            client_ack_timeout: Duration::from_secs(proxy.client_ack_timeout.unwrap_or(300)),
            tg_connect_timeout: Duration::from_secs(proxy.tg_connect_timeout.unwrap_or(10)),
            to_clt_bufsize: proxy
                .to_clt_bufsize
                .map(RawBufSize::into_buf_size)
                .unwrap_or(BufSize::Fixed(16384)),
            to_tg_bufsize: proxy
                .to_tg_bufsize
                .map(RawBufSize::into_buf_size)
                .unwrap_or(BufSize::Fixed(16384)),
            listen_addr_ipv4: proxy
                .listen_addr_ipv4
                .and_then(|s| s.parse().ok())
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            listen_addr_ipv6: proxy.listen_addr_ipv6.and_then(|s| s.parse().ok()),
            listen_unix_sock: proxy.listen_unix_sock,
            prefer_ipv6: proxy.prefer_ipv6.unwrap_or(false),
            caddy_reverse_proxy: proxy.caddy_reverse_proxy.unwrap_or(false),

            metrics_enabled: metrics.enabled.unwrap_or(false),
            metrics_port: metrics.metrics_port.unwrap_or(3257),
            metrics_whitelist: metrics.metrics_whitelist.unwrap_or_default(),
            metrics_export_links: metrics.metrics_export_links.unwrap_or(false),
            metrics_prefix: metrics.metrics_prefix.unwrap_or_else(|| "mtproxy_".to_string()),

            users,
        }
    }
}

fn read_optional(path: &Path) -> Result<RawFile, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RawFile::default()),
        Err(err) => Err(err.into()),
    }
}

macro_rules! merge_struct {
    ($name:ident, $ty:ty, $($field:ident),+ $(,)?) => {
        fn $name(base: Option<$ty>, overlay: Option<$ty>) -> $ty {
            let base = base.unwrap_or_default();
            let overlay = overlay.unwrap_or_default();
            <$ty> {
                $($field: overlay.$field.or(base.$field)),+
            }
        }
    };
}

merge_struct!(merge_server, RawServer, port, domain);
merge_struct!(
    merge_mtproto,
    RawMtproto,
    ad_tag,
    sni,
    mask,
    mask_host,
    mask_port
);
merge_struct!(
    merge_proxy,
    RawProxy,
    proxy_protocol,
    use_middle_proxy,
    fast_mode,
    replay_check_len,
    ignore_time_skew,
    client_ips_len,
    stats_print_period,
    proxy_info_update_period,
    get_time_period,
    get_cert_len_period,
    client_keepalive,
    client_handshake_timeout_min,
    client_handshake_timeout_max,
    client_ack_timeout,
    tg_connect_timeout,
    to_clt_bufsize,
    to_tg_bufsize,
    listen_addr_ipv4,
    listen_addr_ipv6,
    listen_unix_sock,
    prefer_ipv6,
    caddy_reverse_proxy,
);
merge_struct!(
    merge_metrics,
    RawMetrics,
    enabled,
    metrics_port,
    listen_addr_ipv4,
    listen_addr_ipv6,
    metrics_whitelist,
    metrics_export_links,
    metrics_prefix,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn overlay_field_wins_over_base() {
        let mut base = tempfile::NamedTempFile::new().unwrap();
        write!(base, "[server]\nport = 3256\n").unwrap();
        let mut overlay = tempfile::NamedTempFile::new().unwrap();
        write!(overlay, "[server]\nport = 9999\n").unwrap();

        let settings = Settings::load(base.path(), overlay.path()).unwrap();
        assert_eq!(settings.port, 9999);
    }

    #[test]
    fn missing_overlay_keeps_base_value() {
        let mut base = tempfile::NamedTempFile::new().unwrap();
        write!(base, "[proxy]\nuse_middle_proxy = false\n").unwrap();

        let settings = Settings::load(base.path(), Path::new("/nonexistent.toml")).unwrap();
        assert!(!settings.use_middle_proxy);
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        let settings = Settings::load(empty.path(), empty.path()).unwrap();
        assert_eq!(settings.port, 3256);
        assert_eq!(settings.replay_check_len, 65536);
        assert_eq!(settings.client_ips_len, 131072);
    }
}
