// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use serde::Deserialize;

/// One proxy user, immutable after config load. `secret` is already
/// coerced to exactly 16 raw bytes; malformed hex from the TOML file is
/// repaired rather than rejected, per the lenient secret rule.
#[derive(Clone, Debug)]
pub struct User {
    pub name: String,
    pub secret: [u8; 16],
    pub max_tcp_conns: Option<u32>,
    pub expiration_date: Option<(u8, u8, u16)>,
    pub data_quota: Option<u64>,
}

/// The raw shape of one `[[users]]` table as written in TOML, before
/// secret coercion and date parsing.
#[derive(Deserialize, Debug)]
pub struct RawUser {
    pub name: String,
    pub secret: String,
    pub max_tcp_conns: Option<u32>,
    pub expiration_date: Option<String>,
    pub data_quota: Option<u64>,
}

impl RawUser {
    pub fn into_user(self) -> User {
        User {
            name: self.name,
            secret: mtproxy_crypto::hex::coerce_secret(&self.secret),
            max_tcp_conns: self.max_tcp_conns,
            expiration_date: self.expiration_date.as_deref().and_then(parse_ddmmyyyy),
            data_quota: self.data_quota,
        }
    }
}

fn parse_ddmmyyyy(s: &str) -> Option<(u8, u8, u16)> {
    let mut parts = s.split('/');
    let day: u8 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let year: u16 = parts.next()?.parse().ok()?;
    Some((day, month, year))
}

impl User {
    /// Whether `(day, month, year)` is on or after the user's expiration
    /// date, i.e. the user's access should be denied.
    pub fn is_expired(&self, today: (u8, u8, u16)) -> bool {
        match self.expiration_date {
            None => false,
            Some(expiry) => today >= expiry,
        }
    }

    pub fn share_link(&self, server: &str, port: u16, sni: &str) -> String {
        let secret_hex = mtproxy_crypto::hex::encode(&self.secret);
        let sni_hex = mtproxy_crypto::hex::encode(sni.as_bytes());
        format!("https://t.me/proxy?server={server}&port={port}&secret=ee{secret_hex}{sni_hex}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_user_coerces_short_secret() {
        let raw = RawUser {
            name: "alice".into(),
            secret: "dead".into(),
            max_tcp_conns: None,
            expiration_date: None,
            data_quota: None,
        };
        let user = raw.into_user();
        assert_eq!(user.secret.len(), 16);
    }

    #[test]
    fn expiration_compares_by_date_tuple() {
        let raw = RawUser {
            name: "bob".into(),
            secret: "ab".repeat(16),
            max_tcp_conns: None,
            expiration_date: Some("01/06/2026".into()),
            data_quota: None,
        };
        let user = raw.into_user();
        assert!(!user.is_expired((31, 5, 2026)));
        assert!(user.is_expired((1, 6, 2026)));
        assert!(user.is_expired((2, 6, 2026)));
    }

    #[test]
    fn share_link_has_ee_prefix_and_embeds_sni() {
        let raw = RawUser {
            name: "carol".into(),
            secret: "00".repeat(16),
            max_tcp_conns: None,
            expiration_date: None,
            data_quota: None,
        };
        let user = raw.into_user();
        let link = user.share_link("example.com", 3256, "cloudflare.com");
        assert!(link.starts_with("https://t.me/proxy?server=example.com&port=3256&secret=ee"));
        assert!(link.contains(&mtproxy_crypto::hex::encode(b"cloudflare.com")));
    }
}
