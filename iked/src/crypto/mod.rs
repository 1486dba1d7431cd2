//! Capability objects wrapping the cryptographic primitives
//!
//! A suite is selected at negotiation time, stored on the SA and used
//! through a fixed operation set; no type switching happens in the hot
//! paths. Key material is kept in zeroizing buffers and is never printed
//! by any `Debug` implementation.

pub mod cipher;
pub mod dh;
pub mod prf;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

pub use cipher::Encr;
pub use dh::DhExchange;
pub use prf::{Integrity, Prf};

/// Compare two MACs or tags in time independent of the mismatch position
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Fill a buffer from the operating system's CSPRNG
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A fresh random nonce of the daemon's standard length
pub fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    random_bytes(&mut nonce);
    nonce
}

/// A fresh non-zero 64-bit SPI
pub fn random_ike_spi() -> u64 {
    loop {
        let spi = OsRng.next_u64();
        if spi != 0 {
            return spi;
        }
    }
}

/// A fresh non-zero 32-bit SPI for a child SA
pub fn random_esp_spi() -> u32 {
    loop {
        // SPIs below 256 are reserved by the kernel interface
        let spi = OsRng.next_u32();
        if spi >= 256 {
            return spi;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abcd", b"abc"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn spis_are_never_reserved() {
        for _ in 0..64 {
            assert!(random_ike_spi() != 0);
            assert!(random_esp_spi() >= 256);
        }
    }
}
