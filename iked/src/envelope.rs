//! Sealing and opening of the encrypted payload (SK) and its fragmented
//! variant (SKF)
//!
//! Outbound, the inner payload chain is padded to the cipher's block
//! alignment with a trailing pad-length octet, encrypted under a fresh
//! IV and either authenticated by the AEAD itself or covered by a MAC
//! spanning from the first header octet through the ciphertext.
//! Inbound, integrity is verified first (in constant time), then the
//! ciphertext is decrypted and the inner chain parsed. Every crypto
//! failure surfaces as the same silent-discard error.

use ikewire::defs::params::ExchangeType;
use ikewire::defs::{EncryptedPayload, Fragment, Message, Payload};
use ikewire::generator::build_payload_chain;

use crate::crypto;
use crate::frag;
use crate::sa::IkeCrypto;
use crate::{Error, Result};

/// Everything needed to frame an encrypted message
#[derive(Debug, Clone, Copy)]
pub struct MessageMeta {
    /// Initiator SPI of the IKE header
    pub spi_i: u64,
    /// Responder SPI of the IKE header
    pub spi_r: u64,
    /// Exchange the message belongs to
    pub exchange_type: ExchangeType,
    /// Initiator flag of the IKE header
    pub initiator: bool,
    /// Response flag of the IKE header
    pub response: bool,
    /// Message id
    pub message_id: u32,
}

/// Conservative IPv6 minimum MTU the fragmentation threshold derives from
pub const FRAG_MTU: usize = 1280;

/// Largest plaintext fragment body so a sealed fragment datagram stays
/// under the path MTU
pub fn fragment_threshold(crypto: &IkeCrypto) -> usize {
    let overhead = 28    // IKE header
        + 4              // generic payload header
        + 4              // fragment numbering
        + 8              // UDP header
        + 40             // IPv6 header
        + crypto.encr.iv_len()
        + icv_len(crypto)
        + crypto.encr.block_len(); // padding slack
    FRAG_MTU.saturating_sub(overhead)
}

fn icv_len(crypto: &IkeCrypto) -> usize {
    if crypto.encr.is_aead() {
        crypto.encr.icv_len()
    } else {
        crypto.integ.as_ref().map(|i| i.mac_len()).unwrap_or(0)
    }
}

/// Pad the chain to the block alignment and append the pad-length octet
fn pad(chain: &[u8], block: usize) -> Vec<u8> {
    let pad_len = (block - (chain.len() + 1) % block) % block;
    let mut plaintext = Vec::with_capacity(chain.len() + pad_len + 1);
    plaintext.extend_from_slice(chain);
    plaintext.extend(std::iter::repeat(0u8).take(pad_len));
    plaintext.push(pad_len as u8);
    plaintext
}

/// Remove the padding appended by [pad]
fn unpad(mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
    let pad_len = usize::from(*plaintext.last().ok_or(Error::Crypto("empty plaintext"))?);
    if pad_len + 1 > plaintext.len() {
        return Err(Error::Crypto("pad length exceeds plaintext"));
    }
    plaintext.truncate(plaintext.len() - pad_len - 1);
    Ok(plaintext)
}

/// Seal an inner payload chain into a complete SK datagram
pub fn seal(
    crypto: &IkeCrypto,
    sk_e: &[u8],
    sk_a: &[u8],
    meta: &MessageMeta,
    inner: &[Payload],
) -> Result<Vec<u8>> {
    let (first, chain) = build_payload_chain(inner)?;
    seal_one(crypto, sk_e, sk_a, meta, None, first, &chain)
}

/// Seal an inner payload chain into SKF fragment datagrams when it
/// exceeds the MTU derived threshold, or a single SK datagram otherwise
pub fn seal_fragmented(
    crypto: &IkeCrypto,
    sk_e: &[u8],
    sk_a: &[u8],
    meta: &MessageMeta,
    inner: &[Payload],
) -> Result<Vec<Vec<u8>>> {
    let (first, chain) = build_payload_chain(inner)?;
    let pieces = frag::split(&chain, fragment_threshold(crypto));
    if pieces.is_empty() {
        return Ok(vec![seal_one(crypto, sk_e, sk_a, meta, None, first, &chain)?]);
    }
    let total = pieces.len() as u16;
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            let number = i as u16 + 1;
            // only the first fragment names the inner payload type
            let inner_first = if number == 1 { first } else { 0 };
            seal_one(
                crypto,
                sk_e,
                sk_a,
                meta,
                Some((number, total)),
                inner_first,
                piece,
            )
        })
        .collect()
}

fn seal_one(
    crypto: &IkeCrypto,
    sk_e: &[u8],
    sk_a: &[u8],
    meta: &MessageMeta,
    fragment: Option<(u16, u16)>,
    first: u8,
    chain: &[u8],
) -> Result<Vec<u8>> {
    let plaintext = pad(chain, crypto.encr.block_len());
    let mut iv = vec![0u8; crypto.encr.iv_len()];
    crypto::random_bytes(&mut iv);
    let icv = icv_len(crypto);
    let data_len = iv.len() + plaintext.len() + icv;

    let payload = match fragment {
        None => Payload::Encrypted(EncryptedPayload {
            next_payload: first,
            data: vec![0u8; data_len],
        }),
        Some((number, total)) => Payload::EncryptedFragment(Fragment {
            fragment_number: number,
            total_fragments: total,
            next_payload: first,
            data: vec![0u8; data_len],
        }),
    };
    let mut datagram = Message {
        initiator_spi: meta.spi_i,
        responder_spi: meta.spi_r,
        exchange_type: meta.exchange_type,
        initiator: meta.initiator,
        response: meta.response,
        message_id: meta.message_id,
        payloads: vec![payload],
    }
    .try_build()?;

    let total_len = datagram.len();
    let body = total_len - data_len;
    datagram[body..body + iv.len()].copy_from_slice(&iv);

    if crypto.encr.is_aead() {
        // RFC 5282: associated data runs through the payload header (and
        // the fragment numbering for SKF), excluding the IV
        let sealed = crypto.encr.seal(sk_e, &iv, &datagram[..body], &plaintext)?;
        datagram[body + iv.len()..].copy_from_slice(&sealed);
    } else {
        let integ = crypto
            .integ
            .as_ref()
            .ok_or(Error::Crypto("suite without integrity"))?;
        let ciphertext = crypto.encr.encrypt(sk_e, &iv, &plaintext)?;
        datagram[body + iv.len()..total_len - icv].copy_from_slice(&ciphertext);
        let mac = integ.sign(sk_a, &datagram[..total_len - icv]);
        datagram[total_len - icv..].copy_from_slice(&mac);
    }
    Ok(datagram)
}

/// Open the encrypted body of an SK or SKF payload
///
/// `datagram` are the verbatim received octets of the whole message and
/// `data` is the IV+ciphertext+ICV body taken from the parsed payload.
/// Returns the decrypted, unpadded inner chain.
pub fn open(
    crypto: &IkeCrypto,
    sk_e: &[u8],
    sk_a: &[u8],
    datagram: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let iv_len = crypto.encr.iv_len();
    let icv = icv_len(crypto);
    if data.len() < iv_len + icv || datagram.len() < data.len() {
        return Err(Error::Crypto("encrypted payload too short"));
    }
    let iv = &data[..iv_len];
    let body = datagram.len() - data.len();

    let plaintext = if crypto.encr.is_aead() {
        crypto
            .encr
            .open(sk_e, iv, &datagram[..body], &data[iv_len..])?
    } else {
        let integ = crypto
            .integ
            .as_ref()
            .ok_or(Error::Crypto("suite without integrity"))?;
        let (covered, mac) = datagram.split_at(datagram.len() - icv);
        if !integ.verify(sk_a, covered, mac) {
            return Err(Error::Crypto("integrity check failed"));
        }
        crypto
            .encr
            .decrypt(sk_e, iv, &data[iv_len..data.len() - icv])?
    };
    unpad(plaintext)
}

#[cfg(test)]
mod tests {
    use ikewire::defs::params::{
        EncryptionAlgorithm, IntegrityAlgorithm, PseudorandomFunction,
    };
    use ikewire::defs::NotifyType;

    use crate::crypto::{Encr, Integrity, Prf};

    use super::*;

    fn meta() -> MessageMeta {
        MessageMeta {
            spi_i: 0x1111,
            spi_r: 0x2222,
            exchange_type: ExchangeType::Informational,
            initiator: true,
            response: false,
            message_id: 3,
        }
    }

    fn mac_then_encrypt() -> IkeCrypto {
        IkeCrypto {
            prf: Prf::new(PseudorandomFunction::HmacSha2_256),
            encr: Encr::new(EncryptionAlgorithm::AesCbc, Some(256)).unwrap(),
            integ: Some(Integrity::new(IntegrityAlgorithm::HmacSha2_256_128).unwrap()),
        }
    }

    fn aead() -> IkeCrypto {
        IkeCrypto {
            prf: Prf::new(PseudorandomFunction::HmacSha2_256),
            encr: Encr::new(EncryptionAlgorithm::AesGcm16, Some(128)).unwrap(),
            integ: None,
        }
    }

    fn inner() -> Vec<Payload> {
        vec![
            Payload::Notify(ikewire::defs::Notification::status(
                ikewire::defs::params::NotifyStatus::MobikeSupported,
            )),
            Payload::Nonce(vec![0x13; 32]),
        ]
    }

    fn open_parsed(
        crypto: &IkeCrypto,
        sk_e: &[u8],
        sk_a: &[u8],
        datagram: &[u8],
    ) -> (u8, Vec<u8>) {
        let parsed = Message::try_parse(datagram).unwrap();
        let enc = parsed
            .payloads
            .iter()
            .find_map(|p| match p {
                Payload::Encrypted(e) => Some(e.clone()),
                _ => None,
            })
            .unwrap();
        (
            enc.next_payload,
            open(crypto, sk_e, sk_a, datagram, &enc.data).unwrap(),
        )
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn seal_open_mac_then_encrypt() {
        let crypto = mac_then_encrypt();
        let sk_e = vec![0x31; 32];
        let sk_a = vec![0x32; 32];
        let datagram = seal(&crypto, &sk_e, &sk_a, &meta(), &inner()).unwrap();
        let (first, chain) = open_parsed(&crypto, &sk_e, &sk_a, &datagram);
        let payloads = Message::parse_inner(first, &chain).unwrap();
        assert_eq!(payloads, inner());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn seal_open_aead() {
        let crypto = aead();
        let sk_e = vec![0x41; 20];
        let datagram = seal(&crypto, &sk_e, &[], &meta(), &inner()).unwrap();
        let (first, chain) = open_parsed(&crypto, &sk_e, &[], &datagram);
        let payloads = Message::parse_inner(first, &chain).unwrap();
        assert_eq!(payloads, inner());
        // notify survived the round trip
        assert!(matches!(
            &payloads[0],
            Payload::Notify(n) if n.notify_type == NotifyType::Status(
                ikewire::defs::params::NotifyStatus::MobikeSupported
            )
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tampered_ciphertext_is_rejected() {
        for crypto in [mac_then_encrypt(), aead()] {
            let sk_e = vec![0x51; crypto.encr.keymat_len()];
            let sk_a = vec![0x52; crypto.integ.map(|i| i.key_len()).unwrap_or(0)];
            let mut datagram = seal(&crypto, &sk_e, &sk_a, &meta(), &inner()).unwrap();
            let last = datagram.len() - 1;
            datagram[last] ^= 0x01;
            let parsed = Message::try_parse(&datagram).unwrap();
            let enc = parsed
                .payloads
                .iter()
                .find_map(|p| match p {
                    Payload::Encrypted(e) => Some(e.clone()),
                    _ => None,
                })
                .unwrap();
            assert!(open(&crypto, &sk_e, &sk_a, &datagram, &enc.data).is_err());
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn wrong_key_is_rejected() {
        let crypto = aead();
        let datagram = seal(&crypto, &[0x61; 20], &[], &meta(), &inner()).unwrap();
        let parsed = Message::try_parse(&datagram).unwrap();
        let enc = parsed
            .payloads
            .iter()
            .find_map(|p| match p {
                Payload::Encrypted(e) => Some(e.clone()),
                _ => None,
            })
            .unwrap();
        assert!(open(&crypto, &[0x62; 20], &[], &datagram, &enc.data).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn large_message_fragments_and_reassembles() {
        let crypto = mac_then_encrypt();
        let sk_e = vec![0x71; 32];
        let sk_a = vec![0x72; 32];
        let big = vec![Payload::Certificate(ikewire::defs::Certificate {
            encoding: ikewire::defs::params::CertificateEncoding::X509CertificateSignature,
            data: vec![0xAB; 4000],
        })];
        let datagrams = seal_fragmented(&crypto, &sk_e, &sk_a, &meta(), &big).unwrap();
        assert!(datagrams.len() >= 3);
        for datagram in &datagrams {
            assert!(datagram.len() <= FRAG_MTU);
        }

        let mut table = crate::frag::ReassemblyTable::default();
        let now = std::time::Instant::now();
        let mut done = None;
        for datagram in &datagrams {
            let parsed = Message::try_parse(datagram).unwrap();
            let frag = parsed
                .payloads
                .iter()
                .find_map(|p| match p {
                    Payload::EncryptedFragment(f) => Some(f.clone()),
                    _ => None,
                })
                .unwrap();
            let piece = open(&crypto, &sk_e, &sk_a, datagram, &frag.data).unwrap();
            done = table.insert(
                now,
                parsed.message_id,
                frag.fragment_number,
                frag.total_fragments,
                frag.next_payload,
                piece,
            );
        }
        let (first, chain) = done.unwrap();
        let payloads = Message::parse_inner(first, &chain).unwrap();
        assert_eq!(payloads, big);
    }
}
