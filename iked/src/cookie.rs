//! The stateless cookie defense of a responder under load
//! (RFC 7296, section 2.6)
//!
//! While the half-open SA count is above the threshold, initial
//! IKE_SA_INIT requests are answered with a COOKIE notify computed from
//! a local secret; only initiators echoing it back get state allocated.
//! The secret rotates on a coarse timer and the previous secret stays
//! valid for one rotation so in-flight retries survive.

use hmac::{Mac, SimpleHmac};
use sha2::Sha256;

use crate::crypto;

/// Half-open SAs tolerated before cookies are demanded
pub const COOKIE_THRESHOLD: usize = 16;
/// Seconds between secret rotations
pub const COOKIE_ROTATE_SECS: u64 = 60;
/// Version octet prepended to the MAC, bumped on format changes
const COOKIE_VERSION: u8 = 1;
/// MAC octets kept in the cookie
const COOKIE_MAC_LEN: usize = 16;

/// The responder's cookie state
pub struct CookieJar {
    secret: [u8; 32],
    previous: [u8; 32],
}

impl Default for CookieJar {
    fn default() -> Self {
        let mut secret = [0u8; 32];
        crypto::random_bytes(&mut secret);
        Self {
            secret,
            previous: secret,
        }
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieJar")
    }
}

impl CookieJar {
    /// Roll the secret; the previous one stays verifiable
    pub fn rotate(&mut self) {
        self.previous = self.secret;
        crypto::random_bytes(&mut self.secret);
    }

    /// `COOKIE = version | HMAC(secret, Ni | IPi | SPIi)`
    pub fn mint(&self, nonce_i: &[u8], peer_ip: &std::net::IpAddr, spi_i: u64) -> Vec<u8> {
        Self::compute(&self.secret, nonce_i, peer_ip, spi_i)
    }

    /// Accept a cookie minted from the current or the previous secret
    pub fn verify(
        &self,
        cookie: &[u8],
        nonce_i: &[u8],
        peer_ip: &std::net::IpAddr,
        spi_i: u64,
    ) -> bool {
        crypto::constant_time_eq(cookie, &Self::compute(&self.secret, nonce_i, peer_ip, spi_i))
            || crypto::constant_time_eq(
                cookie,
                &Self::compute(&self.previous, nonce_i, peer_ip, spi_i),
            )
    }

    fn compute(secret: &[u8; 32], nonce_i: &[u8], peer_ip: &std::net::IpAddr, spi_i: u64) -> Vec<u8> {
        let mut mac = <SimpleHmac<Sha256> as Mac>::new_from_slice(secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(nonce_i);
        match peer_ip {
            std::net::IpAddr::V4(v4) => mac.update(&v4.octets()),
            std::net::IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(&spi_i.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut cookie = Vec::with_capacity(1 + COOKIE_MAC_LEN);
        cookie.push(COOKIE_VERSION);
        cookie.extend_from_slice(&digest[..COOKIE_MAC_LEN]);
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn mint_verify_roundtrip() {
        let jar = CookieJar::default();
        let ip = "192.0.2.1".parse().unwrap();
        let cookie = jar.mint(b"nonce", &ip, 42);
        assert!(jar.verify(&cookie, b"nonce", &ip, 42));
        assert!(!jar.verify(&cookie, b"nonce", &ip, 43));
        assert!(!jar.verify(&cookie, b"other", &ip, 42));
        let other_ip = "192.0.2.2".parse().unwrap();
        assert!(!jar.verify(&cookie, b"nonce", &other_ip, 42));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn previous_secret_survives_one_rotation() {
        let mut jar = CookieJar::default();
        let ip = "192.0.2.1".parse().unwrap();
        let cookie = jar.mint(b"nonce", &ip, 7);
        jar.rotate();
        assert!(jar.verify(&cookie, b"nonce", &ip, 7));
        jar.rotate();
        assert!(!jar.verify(&cookie, b"nonce", &ip, 7));
    }
}
