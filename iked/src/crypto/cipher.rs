//! Cipher capability objects for the encrypted payload and for child SA
//! key sizing
//!
//! A suite is fixed at negotiation time: algorithm plus key length.
//! AEAD suites seal and open with associated data; classic suites
//! encrypt/decrypt only and leave integrity to a separate
//! [Integrity](super::Integrity) object. Key material passed in is
//! always key followed by the implicit salt.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{
    BlockCipher, BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit, StreamCipher,
};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::{U11, U12, U16, U8};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use ccm::Ccm;
use chacha20poly1305::ChaCha20Poly1305;
use des::TdesEde3;
use ikewire::defs::params::EncryptionAlgorithm;

use crate::{Error, Result};

/// An encryption transform fixed to a concrete key length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encr {
    alg: EncryptionAlgorithm,
    key_bits: u16,
}

impl Encr {
    /// Resolve an encryption algorithm and optional key length attribute
    /// into a concrete suite, rejecting unexpected key lengths
    pub fn new(alg: EncryptionAlgorithm, key_bits: Option<u16>) -> Result<Self> {
        let key_bits = match (alg, key_bits) {
            (EncryptionAlgorithm::TripleDes, None) => 192,
            (EncryptionAlgorithm::TripleDes, Some(192)) => 192,
            (
                EncryptionAlgorithm::AesCbc
                | EncryptionAlgorithm::AesCtr
                | EncryptionAlgorithm::AesCcm8
                | EncryptionAlgorithm::AesCcm12
                | EncryptionAlgorithm::AesCcm16
                | EncryptionAlgorithm::AesGcm8
                | EncryptionAlgorithm::AesGcm12
                | EncryptionAlgorithm::AesGcm16,
                Some(bits @ (128 | 192 | 256)),
            ) => bits,
            (EncryptionAlgorithm::ChaCha20Poly1305, None | Some(256)) => 256,
            _ => return Err(Error::Crypto("unexpected key length for cipher")),
        };
        Ok(Self { alg, key_bits })
    }

    /// The negotiated algorithm
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.alg
    }

    /// Whether this suite authenticates its own ciphertext
    pub fn is_aead(&self) -> bool {
        self.alg.is_aead()
    }

    /// Cipher key length in octets, without the salt
    pub fn key_len(&self) -> usize {
        usize::from(self.key_bits) / 8
    }

    /// Implicit salt length in octets taken from the key material after
    /// the key proper
    pub fn salt_len(&self) -> usize {
        match self.alg {
            EncryptionAlgorithm::AesCtr
            | EncryptionAlgorithm::AesGcm8
            | EncryptionAlgorithm::AesGcm12
            | EncryptionAlgorithm::AesGcm16
            | EncryptionAlgorithm::ChaCha20Poly1305 => 4,
            EncryptionAlgorithm::AesCcm8
            | EncryptionAlgorithm::AesCcm12
            | EncryptionAlgorithm::AesCcm16 => 3,
            _ => 0,
        }
    }

    /// Octets of key material the key schedule must produce
    pub fn keymat_len(&self) -> usize {
        self.key_len() + self.salt_len()
    }

    /// Length of the IV transmitted in front of the ciphertext
    pub fn iv_len(&self) -> usize {
        match self.alg {
            EncryptionAlgorithm::AesCbc => 16,
            EncryptionAlgorithm::TripleDes => 8,
            // counter and AEAD modes carry an 8-octet explicit IV
            _ => 8,
        }
    }

    /// Block alignment the plaintext is padded to
    pub fn block_len(&self) -> usize {
        match self.alg {
            EncryptionAlgorithm::AesCbc => 16,
            EncryptionAlgorithm::TripleDes => 8,
            _ => 1,
        }
    }

    /// Length of the integrity check value appended by an AEAD suite
    pub fn icv_len(&self) -> usize {
        match self.alg {
            EncryptionAlgorithm::AesCcm8 | EncryptionAlgorithm::AesGcm8 => 8,
            EncryptionAlgorithm::AesCcm12 | EncryptionAlgorithm::AesGcm12 => 12,
            EncryptionAlgorithm::AesCcm16
            | EncryptionAlgorithm::AesGcm16
            | EncryptionAlgorithm::ChaCha20Poly1305 => 16,
            _ => 0,
        }
    }

    /// Encrypt with a classic (non-AEAD) suite; the plaintext must
    /// already be padded to the block length
    pub fn encrypt(&self, keymat: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_sizes(keymat, iv)?;
        if plaintext.len() % self.block_len() != 0 {
            return Err(Error::Crypto("plaintext not padded to block length"));
        }
        let mut buf = plaintext.to_vec();
        match (self.alg, self.key_bits) {
            (EncryptionAlgorithm::AesCbc, 128) => cbc_encrypt::<Aes128>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCbc, 192) => cbc_encrypt::<Aes192>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCbc, 256) => cbc_encrypt::<Aes256>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::TripleDes, _) => cbc_encrypt::<TdesEde3>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCtr, bits) => self.ctr_apply(bits, keymat, iv, &mut buf)?,
            _ => return Err(Error::Crypto("AEAD suite used without associated data")),
        }
        Ok(buf)
    }

    /// Decrypt with a classic (non-AEAD) suite
    pub fn decrypt(&self, keymat: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_sizes(keymat, iv)?;
        if ciphertext.len() % self.block_len() != 0 {
            return Err(Error::Crypto("ciphertext not aligned to block length"));
        }
        let mut buf = ciphertext.to_vec();
        match (self.alg, self.key_bits) {
            (EncryptionAlgorithm::AesCbc, 128) => cbc_decrypt::<Aes128>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCbc, 192) => cbc_decrypt::<Aes192>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCbc, 256) => cbc_decrypt::<Aes256>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::TripleDes, _) => cbc_decrypt::<TdesEde3>(keymat, iv, &mut buf)?,
            (EncryptionAlgorithm::AesCtr, bits) => self.ctr_apply(bits, keymat, iv, &mut buf)?,
            _ => return Err(Error::Crypto("AEAD suite used without associated data")),
        }
        Ok(buf)
    }

    /// Seal plaintext with an AEAD suite; returns ciphertext followed by
    /// the integrity check value
    pub fn seal(&self, keymat: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_sizes(keymat, iv)?;
        let (key, salt) = keymat.split_at(self.key_len());
        let nonce = [salt, iv].concat();
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match (self.alg, self.key_bits) {
            (EncryptionAlgorithm::AesGcm8, 128) => {
                aead_seal::<AesGcm<Aes128, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm8, 192) => {
                aead_seal::<AesGcm<Aes192, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm8, 256) => {
                aead_seal::<AesGcm<Aes256, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 128) => {
                aead_seal::<AesGcm<Aes128, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 192) => {
                aead_seal::<AesGcm<Aes192, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 256) => {
                aead_seal::<AesGcm<Aes256, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 128) => {
                aead_seal::<AesGcm<Aes128, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 192) => {
                aead_seal::<AesGcm<Aes192, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 256) => {
                aead_seal::<AesGcm<Aes256, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 128) => {
                aead_seal::<Ccm<Aes128, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 192) => {
                aead_seal::<Ccm<Aes192, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 256) => {
                aead_seal::<Ccm<Aes256, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 128) => {
                aead_seal::<Ccm<Aes128, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 192) => {
                aead_seal::<Ccm<Aes192, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 256) => {
                aead_seal::<Ccm<Aes256, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 128) => {
                aead_seal::<Ccm<Aes128, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 192) => {
                aead_seal::<Ccm<Aes192, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 256) => {
                aead_seal::<Ccm<Aes256, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::ChaCha20Poly1305, _) => {
                aead_seal::<ChaCha20Poly1305>(key, &nonce, payload)
            }
            _ => Err(Error::Crypto("classic suite used as AEAD")),
        }
    }

    /// Open an AEAD sealed buffer (ciphertext followed by the ICV); a
    /// failed tag check is indistinguishable from any other failure
    pub fn open(&self, keymat: &[u8], iv: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        self.check_sizes(keymat, iv)?;
        let (key, salt) = keymat.split_at(self.key_len());
        let nonce = [salt, iv].concat();
        let payload = Payload { msg: sealed, aad };
        match (self.alg, self.key_bits) {
            (EncryptionAlgorithm::AesGcm8, 128) => {
                aead_open::<AesGcm<Aes128, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm8, 192) => {
                aead_open::<AesGcm<Aes192, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm8, 256) => {
                aead_open::<AesGcm<Aes256, U12, U8>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 128) => {
                aead_open::<AesGcm<Aes128, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 192) => {
                aead_open::<AesGcm<Aes192, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm12, 256) => {
                aead_open::<AesGcm<Aes256, U12, U12>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 128) => {
                aead_open::<AesGcm<Aes128, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 192) => {
                aead_open::<AesGcm<Aes192, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesGcm16, 256) => {
                aead_open::<AesGcm<Aes256, U12, U16>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 128) => {
                aead_open::<Ccm<Aes128, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 192) => {
                aead_open::<Ccm<Aes192, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm8, 256) => {
                aead_open::<Ccm<Aes256, U8, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 128) => {
                aead_open::<Ccm<Aes128, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 192) => {
                aead_open::<Ccm<Aes192, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm12, 256) => {
                aead_open::<Ccm<Aes256, U12, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 128) => {
                aead_open::<Ccm<Aes128, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 192) => {
                aead_open::<Ccm<Aes192, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::AesCcm16, 256) => {
                aead_open::<Ccm<Aes256, U16, U11>>(key, &nonce, payload)
            }
            (EncryptionAlgorithm::ChaCha20Poly1305, _) => {
                aead_open::<ChaCha20Poly1305>(key, &nonce, payload)
            }
            _ => Err(Error::Crypto("classic suite used as AEAD")),
        }
    }

    fn ctr_apply(&self, bits: u16, keymat: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        // RFC 5930: counter block is salt || IV || 1
        let (key, salt) = keymat.split_at(self.key_len());
        let mut counter = [0u8; 16];
        counter[..4].copy_from_slice(salt);
        counter[4..12].copy_from_slice(iv);
        counter[15] = 1;
        match bits {
            128 => ctr_xor::<Aes128>(key, &counter, buf),
            192 => ctr_xor::<Aes192>(key, &counter, buf),
            256 => ctr_xor::<Aes256>(key, &counter, buf),
            _ => Err(Error::Crypto("unexpected key length for cipher")),
        }
    }

    fn check_sizes(&self, keymat: &[u8], iv: &[u8]) -> Result<()> {
        if keymat.len() != self.keymat_len() {
            return Err(Error::Crypto("key material of unexpected length"));
        }
        if iv.len() != self.iv_len() {
            return Err(Error::Crypto("IV of unexpected length"));
        }
        Ok(())
    }
}

fn cbc_encrypt<C: BlockEncryptMut + BlockCipher + KeyInit>(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<()> {
    let len = buf.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("key material of unexpected length"))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::Crypto("plaintext not padded to block length"))?;
    Ok(())
}

fn cbc_decrypt<C: BlockDecryptMut + BlockCipher + KeyInit>(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<()> {
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("key material of unexpected length"))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::Crypto("ciphertext not aligned to block length"))?;
    Ok(())
}

fn ctr_xor<C: BlockEncryptMut + BlockCipher + KeyInit + BlockSizeUser<BlockSize = U16>>(
    key: &[u8],
    counter: &[u8; 16],
    buf: &mut [u8],
) -> Result<()> {
    let mut cipher = ctr::Ctr128BE::<C>::new_from_slices(key, counter)
        .map_err(|_| Error::Crypto("key material of unexpected length"))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn aead_seal<A: Aead + KeyInit>(key: &[u8], nonce: &[u8], payload: Payload) -> Result<Vec<u8>> {
    let cipher =
        A::new_from_slice(key).map_err(|_| Error::Crypto("key material of unexpected length"))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| Error::Crypto("seal failed"))
}

fn aead_open<A: Aead + KeyInit>(key: &[u8], nonce: &[u8], payload: Payload) -> Result<Vec<u8>> {
    let cipher =
        A::new_from_slice(key).map_err(|_| Error::Crypto("key material of unexpected length"))?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| Error::Crypto("open failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_validation() {
        assert!(Encr::new(EncryptionAlgorithm::AesCbc, Some(128)).is_ok());
        assert!(Encr::new(EncryptionAlgorithm::AesCbc, Some(100)).is_err());
        assert!(Encr::new(EncryptionAlgorithm::AesCbc, None).is_err());
        assert!(Encr::new(EncryptionAlgorithm::TripleDes, None).is_ok());
        assert!(Encr::new(EncryptionAlgorithm::ChaCha20Poly1305, Some(128)).is_err());
    }

    #[test]
    fn cbc_roundtrip() {
        let encr = Encr::new(EncryptionAlgorithm::AesCbc, Some(256)).unwrap();
        let keymat = vec![0x11; encr.keymat_len()];
        let iv = vec![0x22; encr.iv_len()];
        let plaintext = vec![0x33; 48];
        let ciphertext = encr.encrypt(&keymat, &iv, &plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(encr.decrypt(&keymat, &iv, &ciphertext).unwrap(), plaintext);
        // unpadded input is refused
        assert!(encr.encrypt(&keymat, &iv, &plaintext[..47]).is_err());
    }

    #[test]
    fn tdes_roundtrip() {
        let encr = Encr::new(EncryptionAlgorithm::TripleDes, None).unwrap();
        assert_eq!(encr.keymat_len(), 24);
        assert_eq!(encr.block_len(), 8);
        let keymat = vec![0x11; 24];
        let iv = vec![0x22; 8];
        let plaintext = vec![0x33; 32];
        let ciphertext = encr.encrypt(&keymat, &iv, &plaintext).unwrap();
        assert_eq!(encr.decrypt(&keymat, &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn ctr_roundtrip() {
        let encr = Encr::new(EncryptionAlgorithm::AesCtr, Some(128)).unwrap();
        assert_eq!(encr.keymat_len(), 16 + 4);
        let keymat = vec![0x41; 20];
        let iv = vec![0x42; 8];
        let plaintext = b"counter mode needs no padding".to_vec();
        let ciphertext = encr.encrypt(&keymat, &iv, &plaintext).unwrap();
        assert_eq!(encr.decrypt(&keymat, &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn gcm_seal_open_with_aad() {
        let encr = Encr::new(EncryptionAlgorithm::AesGcm16, Some(256)).unwrap();
        assert_eq!(encr.keymat_len(), 32 + 4);
        let keymat = vec![0x51; 36];
        let iv = vec![0x52; 8];
        let sealed = encr.seal(&keymat, &iv, b"header", b"secret").unwrap();
        assert_eq!(sealed.len(), 6 + 16);
        assert_eq!(
            encr.open(&keymat, &iv, b"header", &sealed).unwrap(),
            b"secret"
        );
        // tampered associated data must fail the open
        assert!(encr.open(&keymat, &iv, b"headex", &sealed).is_err());
        // truncated tag must fail the open
        assert!(encr.open(&keymat, &iv, b"header", &sealed[..21]).is_err());
    }

    #[test]
    fn gcm8_tag_length() {
        let encr = Encr::new(EncryptionAlgorithm::AesGcm8, Some(128)).unwrap();
        let keymat = vec![0x51; 20];
        let iv = vec![0x52; 8];
        let sealed = encr.seal(&keymat, &iv, b"", b"datagram").unwrap();
        assert_eq!(sealed.len(), 8 + 8);
        assert_eq!(encr.open(&keymat, &iv, b"", &sealed).unwrap(), b"datagram");
    }

    #[test]
    fn chacha_seal_open() {
        let encr = Encr::new(EncryptionAlgorithm::ChaCha20Poly1305, None).unwrap();
        assert_eq!(encr.keymat_len(), 32 + 4);
        let keymat = vec![0x61; 36];
        let iv = vec![0x62; 8];
        let sealed = encr.seal(&keymat, &iv, b"aad", b"payload").unwrap();
        assert_eq!(encr.open(&keymat, &iv, b"aad", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn ccm_seal_open() {
        let encr = Encr::new(EncryptionAlgorithm::AesCcm8, Some(128)).unwrap();
        assert_eq!(encr.salt_len(), 3);
        let keymat = vec![0x71; 19];
        let iv = vec![0x72; 8];
        let sealed = encr.seal(&keymat, &iv, b"aad", b"payload").unwrap();
        assert_eq!(sealed.len(), 7 + 8);
        assert_eq!(encr.open(&keymat, &iv, b"aad", &sealed).unwrap(), b"payload");
    }
}
