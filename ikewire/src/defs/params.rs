//! IKEv2 parameters and their parsers as defined in the IANA IKEv2 list
//! found at https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use super::UnparseableParameter;

/// Flag signalling that the sender is the original initiator of the IKE SA
pub const FLAG_INITIATOR: u8 = 0b0000_1000;
/// Flag signalling that the sender can speak a higher major version
pub const FLAG_VERSION: u8 = 0b0001_0000;
/// Flag signalling that the message is a response to a request with this message id
pub const FLAG_RESPONSE: u8 = 0b0010_0000;

/// Flag in the critical/reserved octet of a generic payload header that
/// demands the receiver reject the whole message when the payload type
/// is not understood
pub const FLAG_CRITICAL: u8 = 0b1000_0000;

/// Flag in an attribute type selecting the fixed-length TV encoding
pub const FLAG_ATTRIBUTE_FORMAT: u16 = 0x8000;

/// Transform attribute type carrying the key length in bits
pub const ATTRIBUTE_KEY_LENGTH: u16 = 14;

/// Type of the exchange being carried out
///
/// This constrains the payloads sent in each message of an exchange.
/// Values 0-33 are reserved, 45-239 are currently unassigned and
/// 240-255 reserved for private use. Also see [UnparseableParameter].
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExchangeType {
    // RFC 7296
    IkeSaInit = 34,
    // RFC 7296
    IkeAuth = 35,
    // RFC 7296
    CreateChildSa = 36,
    // RFC 7296
    Informational = 37,
    // RFC 5723
    IkeSessionResume = 38,
    // RFC 9242
    IkeIntermediate = 43,
    // RFC 9370
    IkeFollowupKeyExchange = 44,
}

impl TryFrom<u8> for ExchangeType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=33 => Err(UnparseableParameter::Reserved),
            34 => Ok(ExchangeType::IkeSaInit),
            35 => Ok(ExchangeType::IkeAuth),
            36 => Ok(ExchangeType::CreateChildSa),
            37 => Ok(ExchangeType::Informational),
            38 => Ok(ExchangeType::IkeSessionResume),
            39..=42 => Err(UnparseableParameter::Unassigned),
            43 => Ok(ExchangeType::IkeIntermediate),
            44 => Ok(ExchangeType::IkeFollowupKeyExchange),
            45..=239 => Err(UnparseableParameter::Unassigned),
            240..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a payload in the payload chain of a message
///
/// Refer to https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml
/// for details. Values 1-32 are reserved (they collide with IKEv1 payload
/// numbers), 55-127 are currently unassigned and 128-255 are reserved for
/// private use. Also see [UnparseableParameter].
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PayloadType {
    // RFC 7296
    NoNextPayload = 0,
    // RFC 7296
    SecurityAssociation = 33,
    // RFC 7296
    KeyExchange = 34,
    // RFC 7296
    IdentificationInitiator = 35,
    // RFC 7296
    IdentificationResponder = 36,
    // RFC 7296
    Certificate = 37,
    // RFC 7296
    CertificateRequest = 38,
    // RFC 7296
    Authentication = 39,
    // RFC 7296
    Nonce = 40,
    // RFC 7296
    Notify = 41,
    // RFC 7296
    Delete = 42,
    // RFC 7296
    VendorID = 43,
    // RFC 7296
    TrafficSelectorInitiator = 44,
    // RFC 7296
    TrafficSelectorResponder = 45,
    // RFC 7296
    EncryptedAndAuthenticated = 46,
    // RFC 7296
    Configuration = 47,
    // RFC 7296
    ExtensibleAuthentication = 48,
    // RFC 6467
    GenericSecurePasswordMethod = 49,
    // RFC 7383
    EncryptedAndAuthenticatedFragment = 53,
    // RFC 8019
    PuzzleSolution = 54,
}

impl TryFrom<u8> for PayloadType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::NoNextPayload),
            1..=32 => Err(UnparseableParameter::Reserved),
            33 => Ok(PayloadType::SecurityAssociation),
            34 => Ok(PayloadType::KeyExchange),
            35 => Ok(PayloadType::IdentificationInitiator),
            36 => Ok(PayloadType::IdentificationResponder),
            37 => Ok(PayloadType::Certificate),
            38 => Ok(PayloadType::CertificateRequest),
            39 => Ok(PayloadType::Authentication),
            40 => Ok(PayloadType::Nonce),
            41 => Ok(PayloadType::Notify),
            42 => Ok(PayloadType::Delete),
            43 => Ok(PayloadType::VendorID),
            44 => Ok(PayloadType::TrafficSelectorInitiator),
            45 => Ok(PayloadType::TrafficSelectorResponder),
            46 => Ok(PayloadType::EncryptedAndAuthenticated),
            47 => Ok(PayloadType::Configuration),
            48 => Ok(PayloadType::ExtensibleAuthentication),
            49 => Ok(PayloadType::GenericSecurePasswordMethod),
            50..=52 => Err(UnparseableParameter::Unassigned),
            53 => Ok(PayloadType::EncryptedAndAuthenticatedFragment),
            54 => Ok(PayloadType::PuzzleSolution),
            55..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a transform substructure inside a proposal
///
/// Value 0 is reserved, 6-240 are unassigned or used by extensions not
/// implemented here and 241-255 are reserved for private use.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    ExtendedSequenceNumbers = 5,
}

impl TryFrom<u8> for TransformType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(TransformType::EncryptionAlgorithm),
            2 => Ok(TransformType::PseudoRandomFunction),
            3 => Ok(TransformType::IntegrityAlgorithm),
            4 => Ok(TransformType::KeyExchangeMethod),
            5 => Ok(TransformType::ExtendedSequenceNumbers),
            6..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Protocol an SA proposal or notification refers to
///
/// Value 0 is reserved (used on the wire when no SPI is attached to a
/// notification), 5-200 are unassigned and 201-255 reserved for private use.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SecurityProtocol {
    InternetKeyExchange = 1,
    AuthenticationHeader = 2,
    EncapsulatingSecurityPayload = 3,
}

impl TryFrom<u8> for SecurityProtocol {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(SecurityProtocol::InternetKeyExchange),
            2 => Ok(SecurityProtocol::AuthenticationHeader),
            3 => Ok(SecurityProtocol::EncapsulatingSecurityPayload),
            4 => Err(UnparseableParameter::Reserved),
            5..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Transform IDs of transform type 1 (encryption algorithm)
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize, EnumIter)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum EncryptionAlgorithm {
    // RFC 2451
    TripleDes = 3,
    // RFC 7296
    Null = 11,
    // RFC 3602
    AesCbc = 12,
    // RFC 3686
    AesCtr = 13,
    // RFC 4309
    AesCcm8 = 14,
    // RFC 4309
    AesCcm12 = 15,
    // RFC 4309
    AesCcm16 = 16,
    // RFC 4106
    AesGcm8 = 18,
    // RFC 4106
    AesGcm12 = 19,
    // RFC 4106
    AesGcm16 = 20,
    // RFC 7634
    ChaCha20Poly1305 = 28,
}

impl TryFrom<u16> for EncryptionAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            3 => Ok(EncryptionAlgorithm::TripleDes),
            11 => Ok(EncryptionAlgorithm::Null),
            12 => Ok(EncryptionAlgorithm::AesCbc),
            13 => Ok(EncryptionAlgorithm::AesCtr),
            14 => Ok(EncryptionAlgorithm::AesCcm8),
            15 => Ok(EncryptionAlgorithm::AesCcm12),
            16 => Ok(EncryptionAlgorithm::AesCcm16),
            18 => Ok(EncryptionAlgorithm::AesGcm8),
            19 => Ok(EncryptionAlgorithm::AesGcm12),
            20 => Ok(EncryptionAlgorithm::AesGcm16),
            28 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            1..=2 | 4..=10 | 17 | 21..=27 | 29..=1023 => Err(UnparseableParameter::Unassigned),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

impl EncryptionAlgorithm {
    /// Whether the algorithm is an AEAD construction, meaning the proposal
    /// carries no separate integrity transform and the encrypted payload
    /// ends in an integrity check value computed by the cipher itself
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            EncryptionAlgorithm::AesCcm8
                | EncryptionAlgorithm::AesCcm12
                | EncryptionAlgorithm::AesCcm16
                | EncryptionAlgorithm::AesGcm8
                | EncryptionAlgorithm::AesGcm12
                | EncryptionAlgorithm::AesGcm16
                | EncryptionAlgorithm::ChaCha20Poly1305
        )
    }
}

/// Transform IDs of transform type 2 (pseudorandom function)
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize, EnumIter)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum PseudorandomFunction {
    // RFC 2104
    HmacSha1 = 2,
    // RFC 4434
    Aes128Xcbc = 4,
    // RFC 4868
    HmacSha2_256 = 5,
    // RFC 4868
    HmacSha2_384 = 6,
    // RFC 4868
    HmacSha2_512 = 7,
    // RFC 4615
    Aes128Cmac = 8,
}

impl TryFrom<u16> for PseudorandomFunction {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            2 => Ok(PseudorandomFunction::HmacSha1),
            4 => Ok(PseudorandomFunction::Aes128Xcbc),
            5 => Ok(PseudorandomFunction::HmacSha2_256),
            6 => Ok(PseudorandomFunction::HmacSha2_384),
            7 => Ok(PseudorandomFunction::HmacSha2_512),
            8 => Ok(PseudorandomFunction::Aes128Cmac),
            1 | 3 | 9..=1023 => Err(UnparseableParameter::Unassigned),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Transform IDs of transform type 3 (integrity algorithm)
///
/// The `None` variant (0) is only valid in combination with an AEAD
/// encryption algorithm.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize, EnumIter)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum IntegrityAlgorithm {
    // RFC 7296
    None = 0,
    // RFC 2404
    HmacSha1_96 = 2,
    // RFC 3566
    AesXcbc96 = 5,
    // RFC 4494
    AesCmac96 = 8,
    // RFC 4868
    HmacSha2_256_128 = 12,
    // RFC 4868
    HmacSha2_384_192 = 13,
    // RFC 4868
    HmacSha2_512_256 = 14,
}

impl TryFrom<u16> for IntegrityAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IntegrityAlgorithm::None),
            2 => Ok(IntegrityAlgorithm::HmacSha1_96),
            5 => Ok(IntegrityAlgorithm::AesXcbc96),
            8 => Ok(IntegrityAlgorithm::AesCmac96),
            12 => Ok(IntegrityAlgorithm::HmacSha2_256_128),
            13 => Ok(IntegrityAlgorithm::HmacSha2_384_192),
            14 => Ok(IntegrityAlgorithm::HmacSha2_512_256),
            1 | 3..=4 | 6..=7 | 9..=11 | 15..=1023 => Err(UnparseableParameter::Unassigned),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Transform IDs of transform type 4 (key exchange method)
///
/// The method was called "Diffie-Hellman group" before RFC 9370 and the
/// wire values are still commonly referred to as group numbers.
///
/// The two hybrid post-quantum methods at 1035/1036 live in the
/// private-use range; the values follow the convention established by
/// OpenSSH and OpenBSD for the SNTRUP761+X25519 combiner.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize, EnumIter)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum KeyExchangeMethod {
    // RFC 7296
    None = 0,
    // RFC 7296, 768-bit MODP
    Modp768 = 1,
    // RFC 7296, 1024-bit MODP
    Modp1024 = 2,
    // RFC 3526
    Modp1536 = 5,
    // RFC 3526
    Modp2048 = 14,
    // RFC 3526
    Modp3072 = 15,
    // RFC 3526
    Modp4096 = 16,
    // RFC 3526
    Modp6144 = 17,
    // RFC 3526
    Modp8192 = 18,
    // RFC 5903, NIST P-256
    Ecp256 = 19,
    // RFC 5903, NIST P-384
    Ecp384 = 20,
    // RFC 5903, NIST P-521
    Ecp521 = 21,
    // RFC 5114
    Ecp192 = 25,
    // RFC 5114
    Ecp224 = 26,
    // RFC 8031
    Curve25519 = 31,
    // RFC 8031
    Curve448 = 32,
    // private use, SNTRUP761 KEM combined with X25519
    Sntrup761X25519 = 1035,
    // private use, ML-KEM-768 (FIPS 203) combined with X25519
    MlKem768X25519 = 1036,
}

impl TryFrom<u16> for KeyExchangeMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyExchangeMethod::None),
            1 => Ok(KeyExchangeMethod::Modp768),
            2 => Ok(KeyExchangeMethod::Modp1024),
            5 => Ok(KeyExchangeMethod::Modp1536),
            14 => Ok(KeyExchangeMethod::Modp2048),
            15 => Ok(KeyExchangeMethod::Modp3072),
            16 => Ok(KeyExchangeMethod::Modp4096),
            17 => Ok(KeyExchangeMethod::Modp6144),
            18 => Ok(KeyExchangeMethod::Modp8192),
            19 => Ok(KeyExchangeMethod::Ecp256),
            20 => Ok(KeyExchangeMethod::Ecp384),
            21 => Ok(KeyExchangeMethod::Ecp521),
            25 => Ok(KeyExchangeMethod::Ecp192),
            26 => Ok(KeyExchangeMethod::Ecp224),
            31 => Ok(KeyExchangeMethod::Curve25519),
            32 => Ok(KeyExchangeMethod::Curve448),
            1035 => Ok(KeyExchangeMethod::Sntrup761X25519),
            1036 => Ok(KeyExchangeMethod::MlKem768X25519),
            3..=4 | 6..=13 | 22..=24 | 27..=30 | 33..=1023 => {
                Err(UnparseableParameter::Unassigned)
            }
            1024..=1034 | 1037..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Transform IDs of transform type 5 (extended sequence numbers)
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ExtendedSequenceNumbers {
    None = 0,
    Esn = 1,
}

impl TryFrom<u16> for ExtendedSequenceNumbers {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExtendedSequenceNumbers::None),
            1 => Ok(ExtendedSequenceNumbers::Esn),
            2..=65535 => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Types of error notifications as per RFC 7296, section 3.10.1
///
/// Notify message types in the range 0-16383 are intended for reporting
/// errors. An implementation receiving a Notify payload with one of these
/// types that it does not recognize in a response MUST assume that the
/// corresponding request has failed entirely.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyError {
    UnsupportedCriticalPayload = 1,
    InvalidIkeSpi = 4,
    InvalidMajorVersion = 5,
    InvalidSyntax = 7,
    InvalidMessageId = 9,
    InvalidSpi = 11,
    NoProposalChosen = 14,
    InvalidKePayload = 17,
    AuthenticationFailed = 24,
    SinglePairRequired = 34,
    NoAdditionalSas = 35,
    InternalAddressFailure = 36,
    FailedCpRequired = 37,
    TsUnacceptable = 38,
    InvalidSelectors = 39,
    TemporaryFailure = 43,
    ChildSaNotFound = 44,
}

impl TryFrom<u16> for NotifyError {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, UnparseableParameter> {
        match value {
            1 => Ok(NotifyError::UnsupportedCriticalPayload),
            4 => Ok(NotifyError::InvalidIkeSpi),
            5 => Ok(NotifyError::InvalidMajorVersion),
            7 => Ok(NotifyError::InvalidSyntax),
            9 => Ok(NotifyError::InvalidMessageId),
            11 => Ok(NotifyError::InvalidSpi),
            14 => Ok(NotifyError::NoProposalChosen),
            17 => Ok(NotifyError::InvalidKePayload),
            24 => Ok(NotifyError::AuthenticationFailed),
            34 => Ok(NotifyError::SinglePairRequired),
            35 => Ok(NotifyError::NoAdditionalSas),
            36 => Ok(NotifyError::InternalAddressFailure),
            37 => Ok(NotifyError::FailedCpRequired),
            38 => Ok(NotifyError::TsUnacceptable),
            39 => Ok(NotifyError::InvalidSelectors),
            43 => Ok(NotifyError::TemporaryFailure),
            44 => Ok(NotifyError::ChildSaNotFound),
            0 | 2..=3 | 6 | 8 | 10 | 12..=13 | 15..=16 | 18..=23 | 25..=33 => {
                Err(UnparseableParameter::Reserved)
            }
            40..=42 | 45..=8191 => Err(UnparseableParameter::Unassigned),
            8192..=16383 => Err(UnparseableParameter::PrivateUse),
            16384..=65535 => Err(UnparseableParameter::OutOfRange),
        }
    }
}

/// Types of status notifications as per RFC 7296, section 3.10.1
///
/// Notify payloads with status types (16384 and above) MAY be added to any
/// message and MUST be ignored if not recognized. They indicate
/// capabilities and, as part of SA negotiation, are used to negotiate
/// non-cryptographic parameters.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyStatus {
    // RFC 7296
    InitialContact = 16384,
    // RFC 7296
    SetWindowSize = 16385,
    // RFC 7296
    AdditionalTsPossible = 16386,
    // RFC 7296
    IpcompSupported = 16387,
    // RFC 7296
    NatDetectionSourceIp = 16388,
    // RFC 7296
    NatDetectionDestinationIp = 16389,
    // RFC 7296
    Cookie = 16390,
    // RFC 7296
    UseTransportMode = 16391,
    // RFC 7296
    HttpCertLookupSupported = 16392,
    // RFC 7296
    RekeySa = 16393,
    // RFC 7296
    EspTfcPaddingNotSupported = 16394,
    // RFC 7296
    NonFirstFragmentsAlso = 16395,
    // RFC 4555
    MobikeSupported = 16396,
    // RFC 4555
    AdditionalIp4Address = 16397,
    // RFC 4555
    AdditionalIp6Address = 16398,
    // RFC 4555
    NoAdditionalAddresses = 16399,
    // RFC 4555
    UpdateSaAddresses = 16400,
    // RFC 4555
    Cookie2 = 16401,
    // RFC 4555
    NoNatsAllowed = 16402,
    // RFC 4478
    AuthLifetime = 16403,
    // RFC 5685
    RedirectSupported = 16406,
    // RFC 5685
    Redirect = 16407,
    // RFC 5685
    RedirectedFrom = 16408,
    // RFC 7383
    FragmentationSupported = 16430,
    // RFC 7427
    SignatureHashAlgorithms = 16431,
}

impl TryFrom<u16> for NotifyStatus {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, UnparseableParameter> {
        match value {
            0..=16383 => Err(UnparseableParameter::OutOfRange),
            16384 => Ok(NotifyStatus::InitialContact),
            16385 => Ok(NotifyStatus::SetWindowSize),
            16386 => Ok(NotifyStatus::AdditionalTsPossible),
            16387 => Ok(NotifyStatus::IpcompSupported),
            16388 => Ok(NotifyStatus::NatDetectionSourceIp),
            16389 => Ok(NotifyStatus::NatDetectionDestinationIp),
            16390 => Ok(NotifyStatus::Cookie),
            16391 => Ok(NotifyStatus::UseTransportMode),
            16392 => Ok(NotifyStatus::HttpCertLookupSupported),
            16393 => Ok(NotifyStatus::RekeySa),
            16394 => Ok(NotifyStatus::EspTfcPaddingNotSupported),
            16395 => Ok(NotifyStatus::NonFirstFragmentsAlso),
            16396 => Ok(NotifyStatus::MobikeSupported),
            16397 => Ok(NotifyStatus::AdditionalIp4Address),
            16398 => Ok(NotifyStatus::AdditionalIp6Address),
            16399 => Ok(NotifyStatus::NoAdditionalAddresses),
            16400 => Ok(NotifyStatus::UpdateSaAddresses),
            16401 => Ok(NotifyStatus::Cookie2),
            16402 => Ok(NotifyStatus::NoNatsAllowed),
            16403 => Ok(NotifyStatus::AuthLifetime),
            16406 => Ok(NotifyStatus::RedirectSupported),
            16407 => Ok(NotifyStatus::Redirect),
            16408 => Ok(NotifyStatus::RedirectedFrom),
            16430 => Ok(NotifyStatus::FragmentationSupported),
            16431 => Ok(NotifyStatus::SignatureHashAlgorithms),
            16404..=16405 | 16409..=16429 | 16432..=40959 => {
                Err(UnparseableParameter::Unassigned)
            }
            40960..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Types of an identification payload body as per RFC 7296, section 3.5
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum IdType {
    Ipv4Address = 1,
    Fqdn = 2,
    UserFqdn = 3,
    Ipv6Address = 5,
    DerAsn1Dn = 9,
    DerAsn1Gn = 10,
    KeyId = 11,
}

impl TryFrom<u8> for IdType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(IdType::Ipv4Address),
            2 => Ok(IdType::Fqdn),
            3 => Ok(IdType::UserFqdn),
            4 => Err(UnparseableParameter::Reserved),
            5 => Ok(IdType::Ipv6Address),
            6..=8 => Err(UnparseableParameter::Reserved),
            9 => Ok(IdType::DerAsn1Dn),
            10 => Ok(IdType::DerAsn1Gn),
            11 => Ok(IdType::KeyId),
            12 => Err(UnparseableParameter::Reserved),
            13..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Indicator for the encoding of certificates and related data
///
/// Values 0 and 5 are reserved, 16-200 are unassigned and 201-255 are
/// reserved for private use.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CertificateEncoding {
    Pkcs7WrappedX509Certificate = 1,
    PgpCertificate = 2,
    DnsSignedKey = 3,
    X509CertificateSignature = 4,
    KerberosTokens = 6,
    CertificateRevocationList = 7,
    AuthorityRevocationList = 8,
    SpkiCertificate = 9,
    X509CertificateAttribute = 10,
    RawRsaKey = 11, // deprecated
    HashUrlX509Certificate = 12,
    HashUrlX509Bundle = 13,
    OcspContent = 14,
    RawPublicKey = 15,
}

impl TryFrom<u8> for CertificateEncoding {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(CertificateEncoding::Pkcs7WrappedX509Certificate),
            2 => Ok(CertificateEncoding::PgpCertificate),
            3 => Ok(CertificateEncoding::DnsSignedKey),
            4 => Ok(CertificateEncoding::X509CertificateSignature),
            5 => Err(UnparseableParameter::Reserved),
            6 => Ok(CertificateEncoding::KerberosTokens),
            7 => Ok(CertificateEncoding::CertificateRevocationList),
            8 => Ok(CertificateEncoding::AuthorityRevocationList),
            9 => Ok(CertificateEncoding::SpkiCertificate),
            10 => Ok(CertificateEncoding::X509CertificateAttribute),
            11 => Ok(CertificateEncoding::RawRsaKey),
            12 => Ok(CertificateEncoding::HashUrlX509Certificate),
            13 => Ok(CertificateEncoding::HashUrlX509Bundle),
            14 => Ok(CertificateEncoding::OcspContent),
            15 => Ok(CertificateEncoding::RawPublicKey),
            16..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of authentication method being used
///
/// Value 0 is reserved, values 4-8 and 15-200 are unassigned and
/// values 201-255 are reserved for private use.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AuthMethod {
    RsaDigitalSignature = 1,
    SharedKeyMessageIntegrityCode = 2,
    DssDigitalSignature = 3,
    EcdsaSha256P256 = 9,
    EcdsaSha384P384 = 10,
    EcdsaSha512P521 = 11,
    GenericSecurePassword = 12,
    NullAuthentication = 13,
    DigitalSignature = 14,
}

impl TryFrom<u8> for AuthMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(AuthMethod::RsaDigitalSignature),
            2 => Ok(AuthMethod::SharedKeyMessageIntegrityCode),
            3 => Ok(AuthMethod::DssDigitalSignature),
            4..=8 => Err(UnparseableParameter::Unassigned),
            9 => Ok(AuthMethod::EcdsaSha256P256),
            10 => Ok(AuthMethod::EcdsaSha384P384),
            11 => Ok(AuthMethod::EcdsaSha512P521),
            12 => Ok(AuthMethod::GenericSecurePassword),
            13 => Ok(AuthMethod::NullAuthentication),
            14 => Ok(AuthMethod::DigitalSignature),
            15..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a single traffic selector as per RFC 7296, section 3.13.1
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TrafficSelectorType {
    Ipv4AddressRange = 7,
    Ipv6AddressRange = 8,
}

impl TryFrom<u8> for TrafficSelectorType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=6 => Err(UnparseableParameter::Reserved),
            7 => Ok(TrafficSelectorType::Ipv4AddressRange),
            8 => Ok(TrafficSelectorType::Ipv6AddressRange),
            9..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a configuration payload as per RFC 7296, section 3.15
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ConfigType {
    Request = 1,
    Reply = 2,
    Set = 3,
    Ack = 4,
}

impl TryFrom<u8> for ConfigType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(ConfigType::Request),
            2 => Ok(ConfigType::Reply),
            3 => Ok(ConfigType::Set),
            4 => Ok(ConfigType::Ack),
            5..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Attribute types inside a configuration payload as per RFC 7296,
/// section 3.15.1
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ConfigAttributeType {
    InternalIp4Address = 1,
    InternalIp4Netmask = 2,
    InternalIp4Dns = 3,
    InternalIp4Nbns = 4,
    InternalIp4Dhcp = 6,
    ApplicationVersion = 7,
    InternalIp6Address = 8,
    InternalIp6Dns = 10,
    InternalIp6Dhcp = 12,
    InternalIp4Subnet = 13,
    SupportedAttributes = 14,
    InternalIp6Subnet = 15,
}

impl TryFrom<u16> for ConfigAttributeType {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 | 5 | 9 | 11 => Err(UnparseableParameter::Reserved),
            1 => Ok(ConfigAttributeType::InternalIp4Address),
            2 => Ok(ConfigAttributeType::InternalIp4Netmask),
            3 => Ok(ConfigAttributeType::InternalIp4Dns),
            4 => Ok(ConfigAttributeType::InternalIp4Nbns),
            6 => Ok(ConfigAttributeType::InternalIp4Dhcp),
            7 => Ok(ConfigAttributeType::ApplicationVersion),
            8 => Ok(ConfigAttributeType::InternalIp6Address),
            10 => Ok(ConfigAttributeType::InternalIp6Dns),
            12 => Ok(ConfigAttributeType::InternalIp6Dhcp),
            13 => Ok(ConfigAttributeType::InternalIp4Subnet),
            14 => Ok(ConfigAttributeType::SupportedAttributes),
            15 => Ok(ConfigAttributeType::InternalIp6Subnet),
            16..=16383 => Err(UnparseableParameter::Unassigned),
            16384..=32767 => Err(UnparseableParameter::PrivateUse),
            32768..=65535 => Err(UnparseableParameter::OutOfRange),
        }
    }
}

/// Code field of an EAP message as per RFC 3748, section 4
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl TryFrom<u8> for EapCode {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EapCode::Request),
            2 => Ok(EapCode::Response),
            3 => Ok(EapCode::Success),
            4 => Ok(EapCode::Failure),
            0 | 5..=255 => Err(UnparseableParameter::OutOfRange),
        }
    }
}
