//! The IKEv2 key schedule: SKEYSEED, the prf+ expansion and the SK_*
//! key split (RFC 7296, sections 2.13 to 2.18)

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{Encr, Integrity, Prf};
use crate::{Error, Result};

/// The seven signing keys of an established IKE SA
///
/// With an AEAD encryption suite the SK_a halves are empty and the SK_e
/// halves include the implicit salt.
pub struct SkKeys {
    /// Derivation key feeding child SA and rekey key material
    pub sk_d: Zeroizing<Vec<u8>>,
    /// Integrity key protecting messages sent by the initiator
    pub sk_ai: Zeroizing<Vec<u8>>,
    /// Integrity key protecting messages sent by the responder
    pub sk_ar: Zeroizing<Vec<u8>>,
    /// Encryption key for messages sent by the initiator
    pub sk_ei: Zeroizing<Vec<u8>>,
    /// Encryption key for messages sent by the responder
    pub sk_er: Zeroizing<Vec<u8>>,
    /// Key the initiator's AUTH payload is computed with
    pub sk_pi: Zeroizing<Vec<u8>>,
    /// Key the responder's AUTH payload is computed with
    pub sk_pr: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SkKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // lengths only, the keys themselves never reach a log line
        f.debug_struct("SkKeys")
            .field("sk_d", &self.sk_d.len())
            .field("sk_a", &self.sk_ai.len())
            .field("sk_e", &self.sk_ei.len())
            .field("sk_p", &self.sk_pi.len())
            .finish()
    }
}

/// `SKEYSEED = prf(Ni | Nr, g^ir)`
///
/// For the AES based PRFs the nonce halves are truncated to half the
/// fixed key size each (RFC 7296, section 2.14).
pub fn skeyseed(prf: &Prf, ni: &[u8], nr: &[u8], shared: &[u8]) -> Zeroizing<Vec<u8>> {
    let key: Vec<u8> = if prf.fixed_key_len() {
        let half = prf.key_len() / 2;
        [&ni[..half.min(ni.len())], &nr[..half.min(nr.len())]].concat()
    } else {
        [ni, nr].concat()
    };
    Zeroizing::new(prf.apply(&key, shared))
}

/// `SKEYSEED' = prf(SK_d old, g^ir (new) | Ni | Nr)` for IKE SA rekeys;
/// the shared secret is absent only when the rekey omitted a fresh
/// key exchange
pub fn skeyseed_rekey(
    prf: &Prf,
    sk_d_old: &[u8],
    shared: Option<&[u8]>,
    ni: &[u8],
    nr: &[u8],
) -> Zeroizing<Vec<u8>> {
    let data = [shared.unwrap_or_default(), ni, nr].concat();
    Zeroizing::new(prf.apply(sk_d_old, &data))
}

/// The `prf+` length expansion:
/// `T1 = prf(K, S | 0x01)`, `Tn = prf(K, Tn-1 | S | n)`
///
/// The counter is a single octet, bounding the output at 255 blocks.
pub fn prfplus(prf: &Prf, key: &[u8], seed: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    if len > 255 * prf.out_len() {
        return Err(Error::Crypto("prf+ output request exceeds 255 blocks"));
    }
    let mut out = Zeroizing::new(Vec::with_capacity(len + prf.out_len()));
    let mut block: Vec<u8> = vec![];
    let mut counter = 1u8;
    while out.len() < len {
        let mut data = Vec::with_capacity(block.len() + seed.len() + 1);
        data.extend_from_slice(&block);
        data.extend_from_slice(seed);
        data.push(counter);
        block = prf.apply(key, &data);
        out.extend_from_slice(&block);
        counter = counter.wrapping_add(1);
    }
    block.zeroize();
    out.truncate(len);
    Ok(out)
}

/// Split `prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)` into the seven SK_ keys
#[allow(clippy::too_many_arguments)]
pub fn sk_keys(
    prf: &Prf,
    encr: &Encr,
    integ: Option<&Integrity>,
    skeyseed: &[u8],
    ni: &[u8],
    nr: &[u8],
    spi_i: u64,
    spi_r: u64,
) -> Result<SkKeys> {
    let a_len = integ.map(Integrity::key_len).unwrap_or(0);
    let e_len = encr.keymat_len();
    let p_len = prf.key_len();
    let d_len = prf.key_len();
    let total = d_len + 2 * a_len + 2 * e_len + 2 * p_len;

    let seed = [
        ni,
        nr,
        &spi_i.to_be_bytes()[..],
        &spi_r.to_be_bytes()[..],
    ]
    .concat();
    let stream = prfplus(prf, skeyseed, &seed, total)?;

    let mut offset = 0;
    let mut take = |n: usize| {
        let piece = Zeroizing::new(stream[offset..offset + n].to_vec());
        offset += n;
        piece
    };
    Ok(SkKeys {
        sk_d: take(d_len),
        sk_ai: take(a_len),
        sk_ar: take(a_len),
        sk_ei: take(e_len),
        sk_er: take(e_len),
        sk_pi: take(p_len),
        sk_pr: take(p_len),
    })
}

/// Child SA key material:
/// `KEYMAT = prf+(SK_d, [g^ir (new) |] Ni | Nr)`
///
/// Keys are taken in the order initiator-to-responder encryption,
/// initiator-to-responder integrity, then the responder-to-initiator
/// pair (RFC 7296, section 2.17).
pub struct ChildKeys {
    /// Encryption key material for traffic the initiator sends
    pub encr_i: Zeroizing<Vec<u8>>,
    /// Integrity key for traffic the initiator sends
    pub integ_i: Zeroizing<Vec<u8>>,
    /// Encryption key material for traffic the responder sends
    pub encr_r: Zeroizing<Vec<u8>>,
    /// Integrity key for traffic the responder sends
    pub integ_r: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for ChildKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildKeys")
            .field("encr", &self.encr_i.len())
            .field("integ", &self.integ_i.len())
            .finish()
    }
}

/// Derive the key material of one child SA pair
pub fn child_keys(
    prf: &Prf,
    encr: &Encr,
    integ: Option<&Integrity>,
    sk_d: &[u8],
    shared: Option<&[u8]>,
    ni: &[u8],
    nr: &[u8],
) -> Result<ChildKeys> {
    let e_len = encr.keymat_len();
    let a_len = integ.map(Integrity::key_len).unwrap_or(0);
    let seed = [shared.unwrap_or_default(), ni, nr].concat();
    let stream = prfplus(prf, sk_d, &seed, 2 * (e_len + a_len))?;

    let mut offset = 0;
    let mut take = |n: usize| {
        let piece = Zeroizing::new(stream[offset..offset + n].to_vec());
        offset += n;
        piece
    };
    Ok(ChildKeys {
        encr_i: take(e_len),
        integ_i: take(a_len),
        encr_r: take(e_len),
        integ_r: take(a_len),
    })
}

#[cfg(test)]
mod tests {
    use ikewire::defs::params::{
        EncryptionAlgorithm, IntegrityAlgorithm, PseudorandomFunction,
    };

    use super::*;

    #[test]
    fn prfplus_is_deterministic_and_length_exact() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let a = prfplus(&prf, b"key", b"seed", 100).unwrap();
        let b = prfplus(&prf, b"key", b"seed", 100).unwrap();
        assert_eq!(*a, *b);
        assert_eq!(a.len(), 100);
        // a longer request extends, never rewrites, the early blocks
        let c = prfplus(&prf, b"key", b"seed", 200).unwrap();
        assert_eq!(&c[..100], &a[..]);
        // different seeds diverge
        let d = prfplus(&prf, b"key", b"seee", 100).unwrap();
        assert_ne!(*a, *d);
    }

    #[test]
    fn prfplus_bounds_the_counter() {
        let prf = Prf::new(PseudorandomFunction::HmacSha1);
        assert!(prfplus(&prf, b"k", b"s", 255 * 20).is_ok());
        assert!(prfplus(&prf, b"k", b"s", 255 * 20 + 1).is_err());
    }

    #[test]
    fn both_peers_derive_identical_keys() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let encr = Encr::new(EncryptionAlgorithm::AesCbc, Some(256)).unwrap();
        let integ = Integrity::new(IntegrityAlgorithm::HmacSha2_256_128).unwrap();
        let (ni, nr, shared) = ([0x01u8; 32], [0x02u8; 32], [0x03u8; 256]);

        let seed_i = skeyseed(&prf, &ni, &nr, &shared);
        let seed_r = skeyseed(&prf, &ni, &nr, &shared);
        assert_eq!(*seed_i, *seed_r);

        let keys = sk_keys(&prf, &encr, Some(&integ), &seed_i, &ni, &nr, 7, 9).unwrap();
        assert_eq!(keys.sk_d.len(), 32);
        assert_eq!(keys.sk_ai.len(), 32);
        assert_eq!(keys.sk_ar.len(), 32);
        assert_eq!(keys.sk_ei.len(), 32);
        assert_eq!(keys.sk_er.len(), 32);
        assert_eq!(keys.sk_pi.len(), 32);
        assert_eq!(keys.sk_pr.len(), 32);
        // all seven keys are pairwise distinct
        let all = [
            &keys.sk_d, &keys.sk_ai, &keys.sk_ar, &keys.sk_ei, &keys.sk_er, &keys.sk_pi,
            &keys.sk_pr,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(***a, ***b);
            }
        }
    }

    #[test]
    fn aead_suite_has_no_integrity_keys() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let encr = Encr::new(EncryptionAlgorithm::AesGcm16, Some(128)).unwrap();
        let seed = skeyseed(&prf, &[1; 32], &[2; 32], &[3; 32]);
        let keys = sk_keys(&prf, &encr, None, &seed, &[1; 32], &[2; 32], 1, 2).unwrap();
        assert_eq!(keys.sk_ai.len(), 0);
        assert_eq!(keys.sk_ar.len(), 0);
        // encryption keys carry the 4-octet salt
        assert_eq!(keys.sk_ei.len(), 16 + 4);
    }

    #[test]
    fn child_keymat_order_and_lengths() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let encr = Encr::new(EncryptionAlgorithm::TripleDes, None).unwrap();
        let integ = Integrity::new(IntegrityAlgorithm::HmacSha1_96).unwrap();
        let keys = child_keys(&prf, &encr, Some(&integ), &[7; 32], None, &[1; 32], &[2; 32])
            .unwrap();
        assert_eq!(keys.encr_i.len(), 24);
        assert_eq!(keys.integ_i.len(), 20);
        assert_ne!(*keys.encr_i, *keys.encr_r);
        // a PFS rekey with a fresh shared secret yields different keys
        let pfs = child_keys(
            &prf,
            &encr,
            Some(&integ),
            &[7; 32],
            Some(&[9; 32]),
            &[1; 32],
            &[2; 32],
        )
        .unwrap();
        assert_ne!(*keys.encr_i, *pfs.encr_i);
    }
}
