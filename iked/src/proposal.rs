//! Transform sets, their wire representation and the mutual-choice
//! negotiation
//!
//! Negotiation scores every acceptable combination of offered transforms
//! against the local preference order and picks the combination with the
//! lowest score, so the earliest configured algorithms win without any
//! special casing per transform type.

use ikewire::defs::params::{
    EncryptionAlgorithm, ExtendedSequenceNumbers, IntegrityAlgorithm, KeyExchangeMethod,
    PseudorandomFunction, SecurityProtocol,
};
use ikewire::defs::{Proposal, Transform};
use itertools::iproduct;
use serde::{Deserialize, Serialize};

/// IKE SA transform preferences in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IkeTransforms {
    /// Encryption algorithms with optional key length in bits
    pub encr: Vec<(EncryptionAlgorithm, Option<u16>)>,
    /// Pseudorandom functions
    pub prf: Vec<PseudorandomFunction>,
    /// Integrity algorithms; ignored for AEAD encryption choices
    pub integ: Vec<IntegrityAlgorithm>,
    /// Key exchange methods
    pub ke: Vec<KeyExchangeMethod>,
}

impl Default for IkeTransforms {
    fn default() -> Self {
        Self {
            encr: vec![
                (EncryptionAlgorithm::AesGcm16, Some(256)),
                (EncryptionAlgorithm::AesGcm16, Some(128)),
                (EncryptionAlgorithm::ChaCha20Poly1305, None),
                (EncryptionAlgorithm::AesCbc, Some(256)),
                (EncryptionAlgorithm::AesCbc, Some(128)),
            ],
            prf: vec![
                PseudorandomFunction::HmacSha2_256,
                PseudorandomFunction::HmacSha2_384,
                PseudorandomFunction::HmacSha2_512,
                PseudorandomFunction::HmacSha1,
            ],
            integ: vec![
                IntegrityAlgorithm::HmacSha2_256_128,
                IntegrityAlgorithm::HmacSha2_384_192,
                IntegrityAlgorithm::HmacSha2_512_256,
                IntegrityAlgorithm::HmacSha1_96,
            ],
            ke: vec![
                KeyExchangeMethod::Curve25519,
                KeyExchangeMethod::MlKem768X25519,
                KeyExchangeMethod::Ecp256,
                KeyExchangeMethod::Ecp384,
                KeyExchangeMethod::Modp4096,
                KeyExchangeMethod::Modp3072,
                KeyExchangeMethod::Modp2048,
            ],
        }
    }
}

/// Child SA transform preferences in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EspTransforms {
    /// Encryption algorithms with optional key length in bits
    pub encr: Vec<(EncryptionAlgorithm, Option<u16>)>,
    /// Integrity algorithms; ignored for AEAD encryption choices
    pub integ: Vec<IntegrityAlgorithm>,
    /// Extended sequence number modes
    pub esn: Vec<ExtendedSequenceNumbers>,
}

impl Default for EspTransforms {
    fn default() -> Self {
        Self {
            encr: vec![
                (EncryptionAlgorithm::AesGcm16, Some(256)),
                (EncryptionAlgorithm::AesGcm16, Some(128)),
                (EncryptionAlgorithm::ChaCha20Poly1305, None),
                (EncryptionAlgorithm::AesCbc, Some(256)),
                (EncryptionAlgorithm::AesCbc, Some(128)),
                (EncryptionAlgorithm::TripleDes, None),
            ],
            integ: vec![
                IntegrityAlgorithm::HmacSha2_256_128,
                IntegrityAlgorithm::HmacSha2_384_192,
                IntegrityAlgorithm::HmacSha2_512_256,
                IntegrityAlgorithm::HmacSha1_96,
            ],
            esn: vec![ExtendedSequenceNumbers::Esn, ExtendedSequenceNumbers::None],
        }
    }
}

/// The agreed transform combination for an IKE SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IkeSuite {
    /// Number of the accepted proposal, echoed back in the response
    pub proposal_number: u8,
    /// Chosen encryption algorithm and key length
    pub encr: (EncryptionAlgorithm, Option<u16>),
    /// Chosen pseudorandom function
    pub prf: PseudorandomFunction,
    /// Chosen integrity algorithm; `None` with AEAD encryption
    pub integ: Option<IntegrityAlgorithm>,
    /// Chosen key exchange method
    pub ke: KeyExchangeMethod,
}

/// The agreed transform combination for a child SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EspSuite {
    /// Number of the accepted proposal, echoed back in the response
    pub proposal_number: u8,
    /// Chosen encryption algorithm and key length
    pub encr: (EncryptionAlgorithm, Option<u16>),
    /// Chosen integrity algorithm; `None` with AEAD encryption
    pub integ: Option<IntegrityAlgorithm>,
    /// Whether extended sequence numbers are in use
    pub esn: ExtendedSequenceNumbers,
    /// Optional fresh key exchange method for PFS rekeys
    pub ke: Option<KeyExchangeMethod>,
}

impl IkeTransforms {
    /// Build the wire proposal offering every configured combination
    pub fn to_proposal(&self, number: u8, spi: Vec<u8>) -> Proposal {
        let mut transforms = vec![];
        for (alg, bits) in &self.encr {
            transforms.push(Transform::Encryption(*alg, *bits));
        }
        for prf in &self.prf {
            transforms.push(Transform::PseudoRandomFunction(*prf));
        }
        // AEAD-only offers have no integrity transform at all
        if self.encr.iter().any(|(alg, _)| !alg.is_aead()) {
            for integ in &self.integ {
                transforms.push(Transform::Integrity(*integ));
            }
        }
        for ke in &self.ke {
            transforms.push(Transform::KeyExchange(*ke));
        }
        Proposal {
            number,
            protocol: SecurityProtocol::InternetKeyExchange,
            spi,
            transforms,
        }
    }

    /// Pick the best mutual combination out of the peer's proposals
    pub fn negotiate(&self, offered: &[Proposal]) -> Option<IkeSuite> {
        let mut best: Option<(usize, IkeSuite)> = None;
        for proposal in offered
            .iter()
            .filter(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
        {
            let encr = scored(&self.encr, &encryptions(proposal));
            let prf = scored(&self.prf, &prfs(proposal));
            let ke = scored(&self.ke, &kes(proposal));
            let integ = scored(&self.integ, &integs(proposal));

            for (enc_score, enc) in &encr {
                let aead = enc.0.is_aead();
                let integ_choices: Vec<(usize, Option<IntegrityAlgorithm>)> = if aead {
                    vec![(0, None)]
                } else {
                    integ.iter().map(|(s, i)| (*s, Some(*i))).collect()
                };
                for ((prf_score, prf), (ke_score, ke), (integ_score, integ)) in iproduct!(
                    prf.iter().copied(),
                    ke.iter().copied(),
                    integ_choices.iter().copied()
                ) {
                    let score = enc_score + prf_score + ke_score + integ_score;
                    if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                        best = Some((
                            score,
                            IkeSuite {
                                proposal_number: proposal.number,
                                encr: *enc,
                                prf,
                                integ,
                                ke,
                            },
                        ));
                    }
                }
            }
        }
        best.map(|(_, suite)| suite)
    }
}

impl EspTransforms {
    /// Build the wire proposal offering every configured combination
    pub fn to_proposal(
        &self,
        number: u8,
        spi: u32,
        pfs_ke: Option<KeyExchangeMethod>,
    ) -> Proposal {
        let mut transforms = vec![];
        for (alg, bits) in &self.encr {
            transforms.push(Transform::Encryption(*alg, *bits));
        }
        if self.encr.iter().any(|(alg, _)| !alg.is_aead()) {
            for integ in &self.integ {
                transforms.push(Transform::Integrity(*integ));
            }
        }
        if let Some(ke) = pfs_ke {
            transforms.push(Transform::KeyExchange(ke));
        }
        for esn in &self.esn {
            transforms.push(Transform::SequenceNumber(*esn));
        }
        Proposal {
            number,
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            spi: spi.to_be_bytes().to_vec(),
            transforms,
        }
    }

    /// Pick the best mutual combination out of the peer's proposals;
    /// returns the chosen suite and the peer's SPI from the proposal
    pub fn negotiate(&self, offered: &[Proposal]) -> Option<(EspSuite, u32)> {
        let mut best: Option<(usize, EspSuite, u32)> = None;
        for proposal in offered
            .iter()
            .filter(|p| p.protocol == SecurityProtocol::EncapsulatingSecurityPayload)
        {
            let peer_spi = u32::from_be_bytes(proposal.spi.as_slice().try_into().ok()?);
            let encr = scored(&self.encr, &encryptions(proposal));
            let esn_offered = esns(proposal);
            let esn = scored(&self.esn, &esn_offered);
            let integ = scored(&self.integ, &integs(proposal));
            // a PFS rekey offer carries a KE transform that is accepted
            // as-is when the group matches the policy of the parent
            let ke = kes(proposal).first().copied();

            for (enc_score, enc) in &encr {
                let aead = enc.0.is_aead();
                let integ_choices: Vec<(usize, Option<IntegrityAlgorithm>)> = if aead {
                    vec![(0, None)]
                } else {
                    integ.iter().map(|(s, i)| (*s, Some(*i))).collect()
                };
                for ((esn_score, esn), (integ_score, integ)) in
                    iproduct!(esn.iter().copied(), integ_choices.iter().copied())
                {
                    let score = enc_score + esn_score + integ_score;
                    if best.as_ref().map(|(s, ..)| score < *s).unwrap_or(true) {
                        best = Some((
                            score,
                            EspSuite {
                                proposal_number: proposal.number,
                                encr: *enc,
                                integ,
                                esn,
                                ke,
                            },
                            peer_spi,
                        ));
                    }
                }
            }
        }
        best.map(|(_, suite, spi)| (suite, spi))
    }
}

impl IkeSuite {
    /// The single-combination proposal echoed in a response
    pub fn to_proposal(&self, spi: Vec<u8>) -> Proposal {
        let mut transforms = vec![
            Transform::Encryption(self.encr.0, self.encr.1),
            Transform::PseudoRandomFunction(self.prf),
        ];
        if let Some(integ) = self.integ {
            transforms.push(Transform::Integrity(integ));
        }
        transforms.push(Transform::KeyExchange(self.ke));
        Proposal {
            number: self.proposal_number,
            protocol: SecurityProtocol::InternetKeyExchange,
            spi,
            transforms,
        }
    }
}

impl EspSuite {
    /// The single-combination proposal echoed in a response
    pub fn to_proposal(&self, spi: u32) -> Proposal {
        let mut transforms = vec![Transform::Encryption(self.encr.0, self.encr.1)];
        if let Some(integ) = self.integ {
            transforms.push(Transform::Integrity(integ));
        }
        if let Some(ke) = self.ke {
            transforms.push(Transform::KeyExchange(ke));
        }
        transforms.push(Transform::SequenceNumber(self.esn));
        Proposal {
            number: self.proposal_number,
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            spi: spi.to_be_bytes().to_vec(),
            transforms,
        }
    }
}

/// Intersect the peer's offer with the local preference list, keeping the
/// local position as score
fn scored<T: PartialEq + Copy>(local: &[T], offered: &[T]) -> Vec<(usize, T)> {
    local
        .iter()
        .enumerate()
        .filter(|(_, l)| offered.contains(l))
        .map(|(score, l)| (score, *l))
        .collect()
}

fn encryptions(p: &Proposal) -> Vec<(EncryptionAlgorithm, Option<u16>)> {
    p.transforms
        .iter()
        .filter_map(|t| match t {
            Transform::Encryption(a, l) => Some((*a, *l)),
            _ => None,
        })
        .collect()
}

fn prfs(p: &Proposal) -> Vec<PseudorandomFunction> {
    p.transforms
        .iter()
        .filter_map(|t| match t {
            Transform::PseudoRandomFunction(f) => Some(*f),
            _ => None,
        })
        .collect()
}

fn integs(p: &Proposal) -> Vec<IntegrityAlgorithm> {
    p.transforms
        .iter()
        .filter_map(|t| match t {
            Transform::Integrity(i) => Some(*i),
            _ => None,
        })
        .collect()
}

fn kes(p: &Proposal) -> Vec<KeyExchangeMethod> {
    p.transforms
        .iter()
        .filter_map(|t| match t {
            Transform::KeyExchange(k) => Some(*k),
            _ => None,
        })
        .collect()
}

fn esns(p: &Proposal) -> Vec<ExtendedSequenceNumbers> {
    let offered: Vec<_> = p
        .transforms
        .iter()
        .filter_map(|t| match t {
            Transform::SequenceNumber(s) => Some(*s),
            _ => None,
        })
        .collect();
    if offered.is_empty() {
        // ESN transform omitted means classic sequence numbers
        vec![ExtendedSequenceNumbers::None]
    } else {
        offered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ike_negotiation_prefers_local_order() {
        let local = IkeTransforms::default();
        let peer = IkeTransforms {
            encr: vec![
                (EncryptionAlgorithm::AesCbc, Some(128)),
                (EncryptionAlgorithm::AesGcm16, Some(256)),
            ],
            prf: vec![PseudorandomFunction::HmacSha2_256],
            integ: vec![IntegrityAlgorithm::HmacSha2_256_128],
            ke: vec![KeyExchangeMethod::Curve25519],
        };
        let offered = peer.to_proposal(1, vec![]);
        let suite = local.negotiate(&[offered]).unwrap();
        // the AEAD choice wins although the peer listed CBC first
        assert_eq!(suite.encr, (EncryptionAlgorithm::AesGcm16, Some(256)));
        assert_eq!(suite.integ, None);
        assert_eq!(suite.ke, KeyExchangeMethod::Curve25519);
    }

    #[test]
    fn ike_negotiation_fails_without_overlap() {
        let local = IkeTransforms {
            encr: vec![(EncryptionAlgorithm::AesGcm16, Some(256))],
            prf: vec![PseudorandomFunction::HmacSha2_256],
            integ: vec![],
            ke: vec![KeyExchangeMethod::Curve25519],
        };
        let peer = IkeTransforms {
            encr: vec![(EncryptionAlgorithm::AesCbc, Some(128))],
            prf: vec![PseudorandomFunction::HmacSha1],
            integ: vec![IntegrityAlgorithm::HmacSha1_96],
            ke: vec![KeyExchangeMethod::Modp2048],
        };
        assert!(local.negotiate(&[peer.to_proposal(1, vec![])]).is_none());
    }

    #[test]
    fn esp_negotiation_legacy_suite() {
        let local = EspTransforms {
            encr: vec![
                (EncryptionAlgorithm::AesGcm16, Some(256)),
                (EncryptionAlgorithm::TripleDes, None),
            ],
            integ: vec![
                IntegrityAlgorithm::HmacSha2_256_128,
                IntegrityAlgorithm::HmacSha1_96,
            ],
            esn: vec![ExtendedSequenceNumbers::Esn, ExtendedSequenceNumbers::None],
        };
        let peer = EspTransforms {
            encr: vec![(EncryptionAlgorithm::TripleDes, None)],
            integ: vec![IntegrityAlgorithm::HmacSha1_96],
            esn: vec![ExtendedSequenceNumbers::Esn],
        };
        let (suite, spi) = local
            .negotiate(&[peer.to_proposal(1, 0x11223344, None)])
            .unwrap();
        assert_eq!(spi, 0x11223344);
        assert_eq!(suite.encr, (EncryptionAlgorithm::TripleDes, None));
        assert_eq!(suite.integ, Some(IntegrityAlgorithm::HmacSha1_96));
        assert_eq!(suite.esn, ExtendedSequenceNumbers::Esn);
    }

    #[test]
    fn response_proposal_roundtrip() {
        let local = IkeTransforms::default();
        let offered = local.to_proposal(1, vec![]);
        let suite = local.negotiate(&[offered]).unwrap();
        let echoed = suite.to_proposal(vec![]);
        // negotiating against the echo yields the same suite
        assert_eq!(local.negotiate(&[echoed]).unwrap(), suite);
    }
}
