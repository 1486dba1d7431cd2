//! Pseudorandom function and integrity algorithm capability objects
//!
//! HMAC based algorithms accept keys of any length per RFC 2104. The
//! AES based PRFs normalize their key to 128 bits first (RFC 4434 for
//! XCBC, RFC 4615 for CMAC). AES-XCBC itself (RFC 3566) is built from
//! the raw block cipher since no packaged construction exists for it.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use hmac::SimpleHmac;
use ikewire::defs::params::{IntegrityAlgorithm, PseudorandomFunction};
use sha1::Sha1;
use sha2::digest::core_api::BlockSizeUser;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{Error, Result};

/// A pseudorandom function selected for an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prf {
    alg: PseudorandomFunction,
}

impl Prf {
    /// Select a pseudorandom function
    pub fn new(alg: PseudorandomFunction) -> Self {
        Self { alg }
    }

    /// Preferred key length in octets; nonce halves are truncated to
    /// this length for the AES based PRFs (RFC 7296, section 2.14)
    pub fn key_len(&self) -> usize {
        match self.alg {
            PseudorandomFunction::HmacSha1 => 20,
            PseudorandomFunction::HmacSha2_256 => 32,
            PseudorandomFunction::HmacSha2_384 => 48,
            PseudorandomFunction::HmacSha2_512 => 64,
            PseudorandomFunction::Aes128Xcbc | PseudorandomFunction::Aes128Cmac => 16,
        }
    }

    /// Whether the PRF only takes keys of exactly [Prf::key_len] octets
    /// (the AES based PRFs); HMAC accepts any length
    pub fn fixed_key_len(&self) -> bool {
        matches!(
            self.alg,
            PseudorandomFunction::Aes128Xcbc | PseudorandomFunction::Aes128Cmac
        )
    }

    /// Output length in octets
    pub fn out_len(&self) -> usize {
        match self.alg {
            PseudorandomFunction::HmacSha1 => 20,
            PseudorandomFunction::HmacSha2_256 => 32,
            PseudorandomFunction::HmacSha2_384 => 48,
            PseudorandomFunction::HmacSha2_512 => 64,
            PseudorandomFunction::Aes128Xcbc | PseudorandomFunction::Aes128Cmac => 16,
        }
    }

    /// Apply the PRF to `data` under `key`
    pub fn apply(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self.alg {
            PseudorandomFunction::HmacSha1 => hmac_apply::<Sha1>(key, data),
            PseudorandomFunction::HmacSha2_256 => hmac_apply::<Sha256>(key, data),
            PseudorandomFunction::HmacSha2_384 => hmac_apply::<Sha384>(key, data),
            PseudorandomFunction::HmacSha2_512 => hmac_apply::<Sha512>(key, data),
            PseudorandomFunction::Aes128Xcbc => {
                aes_xcbc(&xcbc_normalize_key(key), data).to_vec()
            }
            PseudorandomFunction::Aes128Cmac => {
                cmac_apply(&cmac_normalize_key(key), data).to_vec()
            }
        }
    }
}

/// An integrity algorithm selected for an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Integrity {
    alg: IntegrityAlgorithm,
}

impl Integrity {
    /// Select an integrity algorithm; the AEAD placeholder `None` is not
    /// a valid choice here
    pub fn new(alg: IntegrityAlgorithm) -> Result<Self> {
        if alg == IntegrityAlgorithm::None {
            return Err(Error::Crypto("integrity NONE outside an AEAD suite"));
        }
        Ok(Self { alg })
    }

    /// Fixed key length in octets
    pub fn key_len(&self) -> usize {
        match self.alg {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 20,
            IntegrityAlgorithm::AesXcbc96 | IntegrityAlgorithm::AesCmac96 => 16,
            IntegrityAlgorithm::HmacSha2_256_128 => 32,
            IntegrityAlgorithm::HmacSha2_384_192 => 48,
            IntegrityAlgorithm::HmacSha2_512_256 => 64,
        }
    }

    /// Truncated MAC length in octets as it appears on the wire
    pub fn mac_len(&self) -> usize {
        match self.alg {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96
            | IntegrityAlgorithm::AesXcbc96
            | IntegrityAlgorithm::AesCmac96 => 12,
            IntegrityAlgorithm::HmacSha2_256_128 => 16,
            IntegrityAlgorithm::HmacSha2_384_192 => 24,
            IntegrityAlgorithm::HmacSha2_512_256 => 32,
        }
    }

    /// Compute the truncated MAC over `data`
    pub fn sign(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut full = match self.alg {
            IntegrityAlgorithm::None => vec![],
            IntegrityAlgorithm::HmacSha1_96 => hmac_apply::<Sha1>(key, data),
            IntegrityAlgorithm::HmacSha2_256_128 => hmac_apply::<Sha256>(key, data),
            IntegrityAlgorithm::HmacSha2_384_192 => hmac_apply::<Sha384>(key, data),
            IntegrityAlgorithm::HmacSha2_512_256 => hmac_apply::<Sha512>(key, data),
            IntegrityAlgorithm::AesXcbc96 => aes_xcbc(&xcbc_normalize_key(key), data).to_vec(),
            IntegrityAlgorithm::AesCmac96 => cmac_apply(&cmac_normalize_key(key), data).to_vec(),
        };
        full.truncate(self.mac_len());
        full
    }

    /// Verify a truncated MAC in constant time
    pub fn verify(&self, key: &[u8], data: &[u8], mac: &[u8]) -> bool {
        super::constant_time_eq(&self.sign(key, data), mac)
    }
}

fn hmac_apply<D: Digest + BlockSizeUser>(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <SimpleHmac<D> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn cmac_apply(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("key is normalized to 16 octets"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// AES-CMAC-PRF-128 key normalization (RFC 4615, section 3)
fn cmac_normalize_key(key: &[u8]) -> [u8; 16] {
    if let Ok(fixed) = <[u8; 16]>::try_from(key) {
        fixed
    } else {
        cmac_apply(&[0u8; 16], key)
    }
}

/// AES-XCBC-PRF-128 key normalization (RFC 4434, section 2)
fn xcbc_normalize_key(key: &[u8]) -> [u8; 16] {
    match <[u8; 16]>::try_from(key) {
        Ok(fixed) => fixed,
        Err(_) if key.len() < 16 => {
            let mut padded = [0u8; 16];
            padded[..key.len()].copy_from_slice(key);
            padded
        }
        Err(_) => aes_xcbc(&[0u8; 16], key),
    }
}

/// The AES-XCBC-MAC construction of RFC 3566
fn aes_xcbc(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let outer = Aes128::new(key.into());
    let derive = |fill: u8| {
        let mut block = [fill; 16];
        outer.encrypt_block((&mut block).into());
        block
    };
    let k1 = Aes128::new((&derive(0x01)).into());
    let k2 = derive(0x02);
    let k3 = derive(0x03);

    let mut e = [0u8; 16];
    let mut chunks = data.chunks(16).peekable();
    if chunks.peek().is_none() {
        // the empty message is a single padded block
        let mut block = [0u8; 16];
        block[0] = 0x80;
        for i in 0..16 {
            block[i] ^= e[i] ^ k3[i];
        }
        k1.encrypt_block((&mut block).into());
        return block;
    }
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);
        if last {
            let key = if chunk.len() == 16 {
                k2
            } else {
                block[chunk.len()] = 0x80;
                k3
            };
            for i in 0..16 {
                block[i] ^= e[i] ^ key[i];
            }
        } else {
            for i in 0..16 {
                block[i] ^= e[i];
            }
        }
        k1.encrypt_block((&mut block).into());
        e = block;
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        let clean: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..clean.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn hmac_sha1_rfc2202_vector() {
        let prf = Prf::new(PseudorandomFunction::HmacSha1);
        let out = prf.apply(&[0x0b; 20], b"Hi There");
        assert_eq!(out, unhex("b617318655057264e28bc0b6fb378c8ef146be00"));
    }

    #[test]
    fn hmac_sha256_rfc4231_vector() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let out = prf.apply(&[0x0b; 20], b"Hi There");
        assert_eq!(
            out,
            unhex("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")
        );
    }

    #[test]
    fn aes_xcbc_rfc3566_vectors() {
        let key: [u8; 16] = unhex("000102030405060708090a0b0c0d0e0f")
            .try_into()
            .unwrap();
        // test case 1: empty message
        assert_eq!(
            aes_xcbc(&key, b"").to_vec(),
            unhex("75f0251d528ac01c4573dfd584d79f29")
        );
        // test case 2: 3 octets
        assert_eq!(
            aes_xcbc(&key, &unhex("000102")).to_vec(),
            unhex("5b376580ae2f19afe7219ceef172756f")
        );
        // test case 3: exactly one block
        assert_eq!(
            aes_xcbc(&key, &unhex("000102030405060708090a0b0c0d0e0f")).to_vec(),
            unhex("d2a246fa349b68a79998a4394ff7a263")
        );
        // test case 5: 32 octets
        assert_eq!(
            aes_xcbc(
                &key,
                &unhex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            )
            .to_vec(),
            unhex("f54f0ec8d2b9f3d36807734bd5283fd4")
        );
    }

    #[test]
    fn integrity_truncation_and_verify() {
        let integ = Integrity::new(IntegrityAlgorithm::HmacSha2_256_128).unwrap();
        let key = [0x42; 32];
        let mac = integ.sign(&key, b"payload");
        assert_eq!(mac.len(), 16);
        assert!(integ.verify(&key, b"payload", &mac));
        assert!(!integ.verify(&key, b"payloae", &mac));
        let mut cut = mac.clone();
        cut.truncate(15);
        assert!(!integ.verify(&key, b"payload", &cut));
    }

    #[test]
    fn integrity_none_is_rejected() {
        assert!(Integrity::new(IntegrityAlgorithm::None).is_err());
    }
}
