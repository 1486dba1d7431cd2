//! Key exchange capability objects
//!
//! Classical MODP groups run over [num_bigint_dig], the NIST curves over
//! the RustCrypto curve crates, Curve25519 over [x25519_dalek] and the
//! hybrid post-quantum method combines ML-KEM-768 ([fips203]) with
//! X25519. An exchange object is created per negotiation, hands out the
//! local public value and consumes itself to produce the shared secret.
//!
//! MODP groups 17 and 18 and the Curve448/Brainpool-era ECP groups keep
//! their registry entries but are not enabled for negotiation.

use fips203::ml_kem_768;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use ikewire::defs::params::KeyExchangeMethod;
use num_bigint_dig::BigUint;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// RFC 2409, second Oakley group (1024-bit MODP)
const MODP_1024: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

/// RFC 3526, group 5 (1536-bit MODP)
const MODP_1536: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

/// RFC 3526, group 14 (2048-bit MODP)
const MODP_2048: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// RFC 3526, group 15 (3072-bit MODP)
const MODP_3072: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
    A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
    ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
    D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
    08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// RFC 3526, group 16 (4096-bit MODP)
const MODP_4096: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
    A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
    ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
    D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
    08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7\
    88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8\
    DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2\
    233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9\
    93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF";

/// Minimum private exponent, octets (512 bits covers every enabled group)
const MODP_EXPONENT_LEN: usize = 64;

enum Secret {
    Modp {
        prime: BigUint,
        exponent: Zeroizing<Vec<u8>>,
    },
    Ecp256(p256::ecdh::EphemeralSecret),
    Ecp384(p384::ecdh::EphemeralSecret),
    Ecp521(p521::ecdh::EphemeralSecret),
    Curve25519(x25519_dalek::EphemeralSecret),
    MlKem768X25519 {
        decaps: Box<ml_kem_768::DecapsKey>,
        x25519: x25519_dalek::EphemeralSecret,
    },
}

/// An in-progress key exchange for one group
pub struct DhExchange {
    group: KeyExchangeMethod,
    public: Vec<u8>,
    secret: Secret,
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the secret share must never leak into logs
        f.debug_struct("DhExchange")
            .field("group", &self.group)
            .field("public_len", &self.public.len())
            .finish()
    }
}

impl DhExchange {
    /// Create the initiator side of an exchange: a fresh key pair whose
    /// public value goes into the KE payload
    pub fn new(group: KeyExchangeMethod) -> Result<Self> {
        let (public, secret) = match group {
            KeyExchangeMethod::Modp1024
            | KeyExchangeMethod::Modp1536
            | KeyExchangeMethod::Modp2048
            | KeyExchangeMethod::Modp3072
            | KeyExchangeMethod::Modp4096 => {
                let prime = modp_prime(group)?;
                let mut exponent = Zeroizing::new(vec![0u8; MODP_EXPONENT_LEN]);
                super::random_bytes(&mut exponent);
                let public = BigUint::from(2u32).modpow(&BigUint::from_bytes_be(&exponent), &prime);
                (
                    to_fixed_width(&public, modp_len(group)?),
                    Secret::Modp { prime, exponent },
                )
            }
            KeyExchangeMethod::Ecp256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = p256::EncodedPoint::from(secret.public_key());
                (uncompressed_coords(public.as_bytes()), Secret::Ecp256(secret))
            }
            KeyExchangeMethod::Ecp384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = p384::EncodedPoint::from(secret.public_key());
                (uncompressed_coords(public.as_bytes()), Secret::Ecp384(secret))
            }
            KeyExchangeMethod::Ecp521 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = p521::EncodedPoint::from(secret.public_key());
                (uncompressed_coords(public.as_bytes()), Secret::Ecp521(secret))
            }
            KeyExchangeMethod::Curve25519 => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                (public.as_bytes().to_vec(), Secret::Curve25519(secret))
            }
            KeyExchangeMethod::MlKem768X25519 => {
                let (encaps, decaps) = ml_kem_768::KG::try_keygen()
                    .map_err(|_| Error::Crypto("ML-KEM key generation failed"))?;
                let x_secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let x_public = x25519_dalek::PublicKey::from(&x_secret);
                let mut public = encaps.into_bytes().to_vec();
                public.extend_from_slice(x_public.as_bytes());
                (
                    public,
                    Secret::MlKem768X25519 {
                        decaps: Box::new(decaps),
                        x25519: x_secret,
                    },
                )
            }
            _ => return Err(Error::Crypto("key exchange method not enabled")),
        };
        Ok(Self {
            group,
            public,
            secret,
        })
    }

    /// The group this exchange runs in
    pub fn group(&self) -> KeyExchangeMethod {
        self.group
    }

    /// The local public value in the group's wire encoding
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Complete the exchange with the peer's public value
    pub fn complete(self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match self.secret {
            Secret::Modp { prime, exponent } => {
                modp_shared(&prime, &exponent, peer_public, self.public.len())
            }
            Secret::Ecp256(secret) => {
                let point = sec1_point::<33>(peer_public)
                    .and_then(|b| p256::PublicKey::from_sec1_bytes(&b).ok())
                    .ok_or(Error::Crypto("malformed ECP peer value"))?;
                Ok(nonzero(
                    secret.diffie_hellman(&point).raw_secret_bytes().to_vec(),
                )?)
            }
            Secret::Ecp384(secret) => {
                let point = sec1_point::<49>(peer_public)
                    .and_then(|b| p384::PublicKey::from_sec1_bytes(&b).ok())
                    .ok_or(Error::Crypto("malformed ECP peer value"))?;
                Ok(nonzero(
                    secret.diffie_hellman(&point).raw_secret_bytes().to_vec(),
                )?)
            }
            Secret::Ecp521(secret) => {
                let point = sec1_point::<67>(peer_public)
                    .and_then(|b| p521::PublicKey::from_sec1_bytes(&b).ok())
                    .ok_or(Error::Crypto("malformed ECP peer value"))?;
                Ok(nonzero(
                    secret.diffie_hellman(&point).raw_secret_bytes().to_vec(),
                )?)
            }
            Secret::Curve25519(secret) => {
                let public: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed Curve25519 peer value"))?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(public));
                // reject the low order results mapping everything to zero
                if !shared.was_contributory() {
                    return Err(Error::Crypto("low order Curve25519 peer value"));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            Secret::MlKem768X25519 { decaps, x25519 } => {
                // responder value is KEM ciphertext followed by its X25519 share
                if peer_public.len() != ml_kem_768::CT_LEN + 32 {
                    return Err(Error::Crypto("malformed hybrid peer value"));
                }
                let (ct, x_peer) = peer_public.split_at(ml_kem_768::CT_LEN);
                let ct: [u8; ml_kem_768::CT_LEN] = ct
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed hybrid peer value"))?;
                let ct = ml_kem_768::CipherText::try_from_bytes(ct)
                    .map_err(|_| Error::Crypto("malformed ML-KEM ciphertext"))?;
                let kem_ss = decaps
                    .try_decaps(&ct)
                    .map_err(|_| Error::Crypto("ML-KEM decapsulation failed"))?;
                let x_public: [u8; 32] = x_peer
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed Curve25519 peer value"))?;
                let x_ss = x25519.diffie_hellman(&x25519_dalek::PublicKey::from(x_public));
                if !x_ss.was_contributory() {
                    return Err(Error::Crypto("low order Curve25519 peer value"));
                }
                let mut shared = Zeroizing::new(kem_ss.into_bytes().to_vec());
                shared.extend_from_slice(x_ss.as_bytes());
                Ok(shared)
            }
        }
    }

    /// Create the responder side: consume the initiator's public value
    /// and produce our own public value plus the shared secret in one
    /// step (the KEM hybrid cannot hand out a public value earlier)
    pub fn respond(
        group: KeyExchangeMethod,
        initiator_public: &[u8],
    ) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        match group {
            KeyExchangeMethod::MlKem768X25519 => {
                if initiator_public.len() != ml_kem_768::EK_LEN + 32 {
                    return Err(Error::Crypto("malformed hybrid peer value"));
                }
                let (ek, x_peer) = initiator_public.split_at(ml_kem_768::EK_LEN);
                let ek: [u8; ml_kem_768::EK_LEN] = ek
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed hybrid peer value"))?;
                let encaps = ml_kem_768::EncapsKey::try_from_bytes(ek)
                    .map_err(|_| Error::Crypto("malformed ML-KEM encapsulation key"))?;
                let (kem_ss, ct) = encaps
                    .try_encaps()
                    .map_err(|_| Error::Crypto("ML-KEM encapsulation failed"))?;

                let x_secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let x_local = x25519_dalek::PublicKey::from(&x_secret);
                let x_public: [u8; 32] = x_peer
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed Curve25519 peer value"))?;
                let x_ss = x_secret.diffie_hellman(&x25519_dalek::PublicKey::from(x_public));
                if !x_ss.was_contributory() {
                    return Err(Error::Crypto("low order Curve25519 peer value"));
                }

                let mut public = ct.into_bytes().to_vec();
                public.extend_from_slice(x_local.as_bytes());
                let mut shared = Zeroizing::new(kem_ss.into_bytes().to_vec());
                shared.extend_from_slice(x_ss.as_bytes());
                Ok((public, shared))
            }
            _ => {
                let exchange = Self::new(group)?;
                let public = exchange.public.clone();
                let shared = exchange.complete(initiator_public)?;
                Ok((public, shared))
            }
        }
    }

    /// Expected octet length of a peer's public value, used to reject
    /// malformed KE payloads before any computation
    pub fn peer_len(group: KeyExchangeMethod, initiator: bool) -> Result<usize> {
        Ok(match group {
            KeyExchangeMethod::Modp1024
            | KeyExchangeMethod::Modp1536
            | KeyExchangeMethod::Modp2048
            | KeyExchangeMethod::Modp3072
            | KeyExchangeMethod::Modp4096 => modp_len(group)?,
            KeyExchangeMethod::Ecp256 => 64,
            KeyExchangeMethod::Ecp384 => 96,
            KeyExchangeMethod::Ecp521 => 132,
            KeyExchangeMethod::Curve25519 => 32,
            KeyExchangeMethod::MlKem768X25519 => {
                if initiator {
                    ml_kem_768::EK_LEN + 32
                } else {
                    ml_kem_768::CT_LEN + 32
                }
            }
            _ => return Err(Error::Crypto("key exchange method not enabled")),
        })
    }
}

fn modp_prime(group: KeyExchangeMethod) -> Result<BigUint> {
    let hex = match group {
        KeyExchangeMethod::Modp1024 => MODP_1024,
        KeyExchangeMethod::Modp1536 => MODP_1536,
        KeyExchangeMethod::Modp2048 => MODP_2048,
        KeyExchangeMethod::Modp3072 => MODP_3072,
        KeyExchangeMethod::Modp4096 => MODP_4096,
        _ => return Err(Error::Crypto("key exchange method not enabled")),
    };
    BigUint::parse_bytes(hex.as_bytes(), 16).ok_or(Error::Internal("bad MODP constant".into()))
}

fn modp_len(group: KeyExchangeMethod) -> Result<usize> {
    Ok(match group {
        KeyExchangeMethod::Modp1024 => 128,
        KeyExchangeMethod::Modp1536 => 192,
        KeyExchangeMethod::Modp2048 => 256,
        KeyExchangeMethod::Modp3072 => 384,
        KeyExchangeMethod::Modp4096 => 512,
        _ => return Err(Error::Crypto("key exchange method not enabled")),
    })
}

fn modp_shared(
    prime: &BigUint,
    exponent: &[u8],
    peer_public: &[u8],
    width: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if peer_public.len() != width {
        return Err(Error::Crypto("malformed MODP peer value"));
    }
    let peer = BigUint::from_bytes_be(peer_public);
    let one = BigUint::from(1u32);
    // 1 < y < p-1 keeps the identity and inverse-identity out
    if peer <= one || peer >= prime - &one {
        return Err(Error::Crypto("degenerate MODP peer value"));
    }
    let shared = peer.modpow(&BigUint::from_bytes_be(exponent), prime);
    if shared <= one || shared >= prime - &one {
        return Err(Error::Crypto("degenerate MODP shared secret"));
    }
    Ok(Zeroizing::new(to_fixed_width(&shared, width)))
}

/// Big-endian encoding left-padded with zeroes to the group width
fn to_fixed_width(value: &BigUint, width: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; width.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}

/// RFC 5903 transmits the bare x||y coordinates; strip the SEC1 0x04 tag
fn uncompressed_coords(sec1: &[u8]) -> Vec<u8> {
    sec1[1..].to_vec()
}

/// Rebuild a SEC1 uncompressed point from bare x||y coordinates;
/// `HALF` is the coordinate length plus one for the tag
fn sec1_point<const HALF: usize>(coords: &[u8]) -> Option<Vec<u8>> {
    if coords.len() != 2 * (HALF - 1) {
        return None;
    }
    let mut sec1 = Vec::with_capacity(1 + coords.len());
    sec1.push(0x04);
    sec1.extend_from_slice(coords);
    Some(sec1)
}

fn nonzero(shared: Vec<u8>) -> Result<Zeroizing<Vec<u8>>> {
    if shared.iter().all(|&b| b == 0) {
        return Err(Error::Crypto("all-zero shared secret"));
    }
    Ok(Zeroizing::new(shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agree(group: KeyExchangeMethod) {
        let initiator = DhExchange::new(group).unwrap();
        let initiator_public = initiator.public().to_vec();
        assert_eq!(
            initiator_public.len(),
            DhExchange::peer_len(group, true).unwrap()
        );
        let (responder_public, responder_shared) =
            DhExchange::respond(group, &initiator_public).unwrap();
        let initiator_shared = initiator.complete(&responder_public).unwrap();
        assert_eq!(*initiator_shared, *responder_shared);
        assert!(!initiator_shared.iter().all(|&b| b == 0));
    }

    #[test]
    fn modp_2048_agreement() {
        agree(KeyExchangeMethod::Modp2048);
    }

    #[test]
    fn modp_1024_agreement() {
        agree(KeyExchangeMethod::Modp1024);
    }

    #[test]
    fn ecp_256_agreement() {
        agree(KeyExchangeMethod::Ecp256);
    }

    #[test]
    fn ecp_384_agreement() {
        agree(KeyExchangeMethod::Ecp384);
    }

    #[test]
    fn curve25519_agreement() {
        agree(KeyExchangeMethod::Curve25519);
    }

    #[test]
    fn mlkem_hybrid_agreement() {
        agree(KeyExchangeMethod::MlKem768X25519);
    }

    #[test]
    fn modp_rejects_degenerate_values() {
        let exchange = DhExchange::new(KeyExchangeMethod::Modp2048).unwrap();
        let width = exchange.public().len();
        // y = 1
        let mut one = vec![0u8; width];
        one[width - 1] = 1;
        assert!(DhExchange::new(KeyExchangeMethod::Modp2048)
            .unwrap()
            .complete(&one)
            .is_err());
        // y = 0
        let zero = vec![0u8; width];
        assert!(exchange.complete(&zero).is_err());
    }

    #[test]
    fn curve25519_rejects_low_order_point() {
        let exchange = DhExchange::new(KeyExchangeMethod::Curve25519).unwrap();
        // the all-zero point is in the low order subgroup
        assert!(exchange.complete(&[0u8; 32]).is_err());
    }

    #[test]
    fn wrong_length_peer_value_is_rejected() {
        let exchange = DhExchange::new(KeyExchangeMethod::Ecp256).unwrap();
        assert!(exchange.complete(&[0x41; 63]).is_err());
        let exchange = DhExchange::new(KeyExchangeMethod::Modp2048).unwrap();
        assert!(exchange.complete(&[0x41; 255]).is_err());
    }

    #[test]
    fn disabled_groups_refuse_creation() {
        assert!(DhExchange::new(KeyExchangeMethod::Modp8192).is_err());
        assert!(DhExchange::new(KeyExchangeMethod::Curve448).is_err());
        assert!(DhExchange::new(KeyExchangeMethod::Sntrup761X25519).is_err());
    }
}
