// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide mutable state every connection task reads (and the
//! maintenance tasks write). Centralized here rather than scattered as
//! module statics, per the design notes: each field gets its own guard
//! rather than one coarse lock, since the fields have unrelated write
//! frequencies and none of their updates need to be atomic with each
//! other.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use arc_swap::ArcSwap;

use crate::clientip::ClientIpCache;
use crate::replay::ReplayCache;

/// Running totals the orchestrator checks against `maxTcpConns`/
/// `dataQuota` before letting a new connection splice.
#[derive(Default)]
pub struct UserUsage {
    pub active_conns: u32,
    pub octets_total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitViolation {
    TooManyConns,
    QuotaExceeded,
}

/// One family's middle-proxy candidates, keyed by signed DC index.
pub type MiddleProxyTable = HashMap<i16, Vec<SocketAddr>>;

#[derive(Clone, Default)]
pub struct MiddleProxyTables {
    pub v4: MiddleProxyTable,
    pub v6: MiddleProxyTable,
}

const MIN_COVER_CERT_LEN: usize = 1024;
const MAX_COVER_CERT_LEN: usize = 4096;

pub struct ProxyState {
    /// Discovered once at startup and never written again.
    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,

    middle_proxy_tables: ArcSwap<MiddleProxyTables>,
    middle_proxy_secret: ArcSwap<[u8; 64]>,
    cover_cert_length: AtomicUsize,
    pub is_time_skewed: AtomicBool,
    pub disable_middle_proxy: AtomicBool,

    pub replay_cache: Mutex<ReplayCache>,
    pub client_ip_cache: Mutex<ClientIpCache>,
    pub active_connections: AtomicUsize,
    user_usage: Mutex<HashMap<String, UserUsage>>,
}

impl ProxyState {
    pub fn new(
        public_ipv4: Option<Ipv4Addr>,
        public_ipv6: Option<Ipv6Addr>,
        replay_check_len: usize,
        client_ips_len: usize,
        initial_cover_cert_length: usize,
    ) -> Self {
        Self {
            public_ipv4,
            public_ipv6,
            middle_proxy_tables: ArcSwap::from_pointee(MiddleProxyTables::default()),
            middle_proxy_secret: ArcSwap::from_pointee([0u8; 64]),
            cover_cert_length: AtomicUsize::new(
                initial_cover_cert_length.clamp(MIN_COVER_CERT_LEN, MAX_COVER_CERT_LEN - 1),
            ),
            is_time_skewed: AtomicBool::new(false),
            disable_middle_proxy: AtomicBool::new(false),
            replay_cache: Mutex::new(ReplayCache::new(replay_check_len)),
            client_ip_cache: Mutex::new(ClientIpCache::new(client_ips_len)),
            active_connections: AtomicUsize::new(0),
            user_usage: Mutex::new(HashMap::new()),
        }
    }

    /// Checks `max_tcp_conns`/`data_quota` for `user` and, if both pass,
    /// reserves one connection slot.
    pub fn try_reserve_connection(
        &self,
        user: &str,
        max_tcp_conns: Option<u32>,
        data_quota: Option<u64>,
    ) -> Result<(), LimitViolation> {
        let mut usage = self.user_usage.lock().unwrap();
        let entry = usage.entry(user.to_string()).or_default();
        if let Some(max) = max_tcp_conns {
            if entry.active_conns >= max {
                return Err(LimitViolation::TooManyConns);
            }
        }
        if let Some(quota) = data_quota {
            if entry.octets_total >= quota {
                return Err(LimitViolation::QuotaExceeded);
            }
        }
        entry.active_conns += 1;
        Ok(())
    }

    pub fn release_connection(&self, user: &str, octets: u64) {
        let mut usage = self.user_usage.lock().unwrap();
        if let Some(entry) = usage.get_mut(user) {
            entry.active_conns = entry.active_conns.saturating_sub(1);
            entry.octets_total += octets;
        }
    }

    pub fn middle_proxy_tables(&self) -> arc_swap::Guard<std::sync::Arc<MiddleProxyTables>> {
        self.middle_proxy_tables.load()
    }

    pub fn replace_middle_proxy_tables(&self, tables: MiddleProxyTables) {
        self.middle_proxy_tables.store(std::sync::Arc::new(tables));
    }

    pub fn middle_proxy_secret(&self) -> [u8; 64] {
        **self.middle_proxy_secret.load()
    }

    pub fn replace_middle_proxy_secret(&self, secret: [u8; 64]) {
        self.middle_proxy_secret.store(std::sync::Arc::new(secret));
    }

    pub fn cover_cert_length(&self) -> usize {
        self.cover_cert_length.load(Ordering::Relaxed)
    }

    pub fn set_cover_cert_length(&self, len: usize) {
        self.cover_cert_length
            .store(len.clamp(MIN_COVER_CERT_LEN, MAX_COVER_CERT_LEN - 1), Ordering::Relaxed);
    }

    pub fn use_middle_proxy(&self, configured: bool) -> bool {
        configured && !self.disable_middle_proxy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_cert_length_stays_in_range() {
        let state = ProxyState::new(None, None, 1024, 1024, 10_000_000);
        assert!(state.cover_cert_length() < MAX_COVER_CERT_LEN);
        state.set_cover_cert_length(0);
        assert!(state.cover_cert_length() >= MIN_COVER_CERT_LEN);
    }

    #[test]
    fn disable_middle_proxy_overrides_configured_preference() {
        let state = ProxyState::new(None, None, 1024, 1024, 2000);
        assert!(state.use_middle_proxy(true));
        state.disable_middle_proxy.store(true, Ordering::Relaxed);
        assert!(!state.use_middle_proxy(true));
    }

    #[test]
    fn middle_proxy_tables_round_trip_through_the_swap() {
        let state = ProxyState::new(None, None, 1024, 1024, 2000);
        let mut tables = MiddleProxyTables::default();
        tables.v4.insert(-1, vec!["149.154.175.50:443".parse().unwrap()]);
        state.replace_middle_proxy_tables(tables);
        assert_eq!(state.middle_proxy_tables().v4.get(&-1).unwrap().len(), 1);
    }
}
