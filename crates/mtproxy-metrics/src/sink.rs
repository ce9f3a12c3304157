// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Connection-duration histogram buckets, in seconds, from §8.
pub const DURATION_BUCKETS_SECS: [f64; 11] = [
    0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0, 300.0, 600.0, 1800.0, f64::INFINITY,
];

#[derive(Default)]
struct UserCounters {
    connects: AtomicU64,
    connects_curr: AtomicI64,
    octets: AtomicU64,
    msgs: AtomicU64,
    octets_from: AtomicU64,
    octets_to: AtomicU64,
    msgs_from: AtomicU64,
    msgs_to: AtomicU64,
}

/// Process-wide counters and per-user breakdowns, mutated from many
/// connection tasks concurrently. Per-user entries are guarded by a
/// single `RwLock`-protected map rather than per-entry locks, since
/// writes are short and reads (the metrics scrape) are infrequent.
pub struct StatsSink {
    start: Instant,
    pub connects_all: AtomicU64,
    pub connects_bad: AtomicU64,
    pub handshake_timeouts: AtomicU64,
    duration_buckets: [AtomicU64; 11],
    users: RwLock<HashMap<String, UserCounters>>,
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            connects_all: AtomicU64::new(0),
            connects_bad: AtomicU64::new(0),
            handshake_timeouts: AtomicU64::new(0),
            duration_buckets: Default::default(),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn record_connect_all(&self) {
        self.connects_all.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_bad(&self) {
        self.connects_bad.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_timeout(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Buckets a finished connection's duration into the smallest bucket
    /// that can still hold it.
    pub fn record_duration(&self, duration_secs: f64) {
        for (i, bound) in DURATION_BUCKETS_SECS.iter().enumerate() {
            if duration_secs <= *bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    fn with_user<F: FnOnce(&UserCounters)>(&self, user: &str, f: F) {
        if let Some(counters) = self.users.read().unwrap().get(user) {
            f(counters);
            return;
        }
        let mut users = self.users.write().unwrap();
        let counters = users.entry(user.to_string()).or_default();
        f(counters);
    }

    pub fn user_connect_start(&self, user: &str) {
        self.with_user(user, |c| {
            c.connects.fetch_add(1, Ordering::Relaxed);
            c.connects_curr.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn user_connect_end(&self, user: &str) {
        self.with_user(user, |c| {
            c.connects_curr.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn user_traffic(&self, user: &str, from_client: u64, to_client: u64, msgs_from: u64, msgs_to: u64) {
        self.with_user(user, |c| {
            c.octets.fetch_add(from_client + to_client, Ordering::Relaxed);
            c.octets_from.fetch_add(from_client, Ordering::Relaxed);
            c.octets_to.fetch_add(to_client, Ordering::Relaxed);
            c.msgs.fetch_add(msgs_from + msgs_to, Ordering::Relaxed);
            c.msgs_from.fetch_add(msgs_from, Ordering::Relaxed);
            c.msgs_to.fetch_add(msgs_to, Ordering::Relaxed);
        });
    }

    /// Renders everything in Prometheus text exposition format, with
    /// every metric name prefixed by `prefix`.
    pub fn render(&self, prefix: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("{prefix}uptime {}\n", self.uptime_secs()));
        out.push_str(&format!(
            "{prefix}connects_all {}\n",
            self.connects_all.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "{prefix}connects_bad {}\n",
            self.connects_bad.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "{prefix}handshake_timeouts {}\n",
            self.handshake_timeouts.load(Ordering::Relaxed)
        ));
        for (bound, count) in DURATION_BUCKETS_SECS.iter().zip(self.duration_buckets.iter()) {
            let label = if bound.is_infinite() {
                "+Inf".to_string()
            } else {
                bound.to_string()
            };
            out.push_str(&format!(
                "{prefix}connects_by_duration{{bucket=\"{label}\"}} {}\n",
                count.load(Ordering::Relaxed)
            ));
        }

        for (name, c) in self.users.read().unwrap().iter() {
            out.push_str(&format!(
                "{prefix}user_connects{{user=\"{name}\"}} {}\n",
                c.connects.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_connects_curr{{user=\"{name}\"}} {}\n",
                c.connects_curr.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_octets{{user=\"{name}\"}} {}\n",
                c.octets.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_msgs{{user=\"{name}\"}} {}\n",
                c.msgs.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_octets_from{{user=\"{name}\"}} {}\n",
                c.octets_from.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_octets_to{{user=\"{name}\"}} {}\n",
                c.octets_to.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_msgs_from{{user=\"{name}\"}} {}\n",
                c.msgs_from.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "{prefix}user_msgs_to{{user=\"{name}\"}} {}\n",
                c.msgs_to.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_lands_in_the_smallest_fitting_bucket() {
        let sink = StatsSink::new();
        sink.record_duration(0.05);
        sink.record_duration(45.0);
        let rendered = sink.render("mtproxy_");
        assert!(rendered.contains("bucket=\"0.1\"} 1"));
        assert!(rendered.contains("bucket=\"60\"} 1"));
    }

    #[test]
    fn per_user_counters_track_both_directions() {
        let sink = StatsSink::new();
        sink.user_connect_start("alice");
        sink.user_traffic("alice", 100, 200, 3, 4);
        let rendered = sink.render("mtproxy_");
        assert!(rendered.contains("user_octets{user=\"alice\"} 300"));
        assert!(rendered.contains("user_octets_from{user=\"alice\"} 100"));
        assert!(rendered.contains("user_octets_to{user=\"alice\"} 200"));
        assert!(rendered.contains("user_connects_curr{user=\"alice\"} 1"));
        sink.user_connect_end("alice");
        let rendered = sink.render("mtproxy_");
        assert!(rendered.contains("user_connects_curr{user=\"alice\"} 0"));
    }
}
