//! High-level definitions of an IKEv2 message and its payloads

pub mod header;
pub mod params;

use std::net::IpAddr;

use serde::Serialize;

use self::params::{
    AuthMethod, CertificateEncoding, ConfigType, EapCode, EncryptionAlgorithm, ExchangeType,
    ExtendedSequenceNumbers, IdType, IntegrityAlgorithm, KeyExchangeMethod, NotifyError,
    NotifyStatus, PayloadType, PseudorandomFunction, SecurityProtocol, TrafficSelectorType,
};

/// When parsing a parameter from its integer representation, there are
/// several "regions" in the definitions that can't be covered by a Rust
/// enum. Typically, the last two regions of the parameter definitions are
/// unassigned and/or reserved for private use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnparseableParameter {
    /// The parameter is reserved and must not be used, as it may conflict
    /// with older standards
    Reserved,
    /// The parameter has no recognized meaning by any known standard
    Unassigned,
    /// The parameter is reserved for private use by proprietary
    /// implementations and not part of a standard
    PrivateUse,
    /// The parameter can not reach the value this resolves to, as such
    /// the packet where it originates from must be invalid
    OutOfRange,
}

/// The high-level representation of a single IKEv2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// SPI chosen by the original initiator of the IKE SA
    pub initiator_spi: u64,
    /// SPI chosen by the responder, zero before it answered
    pub responder_spi: u64,
    /// The exchange this message belongs to
    pub exchange_type: ExchangeType,
    /// Whether the sender is the original initiator of the IKE SA
    pub initiator: bool,
    /// Whether this message is a response
    pub response: bool,
    /// Message identifier tying a response to its request
    pub message_id: u32,
    /// The decoded payload chain in wire order
    pub payloads: Vec<Payload>,
}

impl Message {
    /// Find the first payload matching the extractor, e.g.
    /// `msg.find(|p| match p { Payload::Nonce(n) => Some(n), _ => None })`
    pub fn find<'m, T: ?Sized>(
        &'m self,
        extract: impl Fn(&'m Payload) -> Option<&'m T>,
    ) -> Option<&'m T> {
        self.payloads.iter().find_map(extract)
    }

    /// Iterate over all notify payloads of the message
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// Look up a status notification by type
    pub fn status_notify(&self, status: NotifyStatus) -> Option<&Notification> {
        self.notifications()
            .find(|n| n.notify_type == NotifyType::Status(status))
    }

    /// Look up an error notification by type
    pub fn error_notify(&self, error: NotifyError) -> Option<&Notification> {
        self.notifications()
            .find(|n| n.notify_type == NotifyType::Error(error))
    }
}

/// A single payload of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Set of proposals offered or the single one accepted
    SecurityAssociation(SecurityAssociation),
    /// Public key exchange value of the sender
    KeyExchange(KeyExchange),
    /// Identity asserted by the initiator
    IdInitiator(Identity),
    /// Identity asserted by the responder
    IdResponder(Identity),
    /// A certificate or related revocation data
    Certificate(Certificate),
    /// Hints which trust anchors the sender accepts
    CertificateRequest(CertificateRequest),
    /// Proof of identity over the exchange octets
    Authentication(Authentication),
    /// Random nonce between 16 and 256 octets
    Nonce(Vec<u8>),
    /// Error or status notification
    Notify(Notification),
    /// Deletion announcement for one or more SAs
    Delete(Delete),
    /// Opaque vendor identification
    VendorId(Vec<u8>),
    /// Traffic selectors restricting the initiator side of a child SA
    TsInitiator(TrafficSelectors),
    /// Traffic selectors restricting the responder side of a child SA
    TsResponder(TrafficSelectors),
    /// The encrypted-and-authenticated envelope; body is IV plus
    /// ciphertext plus ICV, opened by a layer above this crate
    Encrypted(EncryptedPayload),
    /// Configuration request/reply (virtual addresses and friends)
    Configuration(Configuration),
    /// One message of an EAP conversation
    Eap(EapMessage),
    /// One fragment of a fragmented encrypted message (RFC 7383)
    EncryptedFragment(Fragment),
}

impl From<&Payload> for PayloadType {
    fn from(value: &Payload) -> Self {
        match value {
            Payload::SecurityAssociation(_) => PayloadType::SecurityAssociation,
            Payload::KeyExchange(_) => PayloadType::KeyExchange,
            Payload::IdInitiator(_) => PayloadType::IdentificationInitiator,
            Payload::IdResponder(_) => PayloadType::IdentificationResponder,
            Payload::Certificate(_) => PayloadType::Certificate,
            Payload::CertificateRequest(_) => PayloadType::CertificateRequest,
            Payload::Authentication(_) => PayloadType::Authentication,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::VendorId(_) => PayloadType::VendorID,
            Payload::TsInitiator(_) => PayloadType::TrafficSelectorInitiator,
            Payload::TsResponder(_) => PayloadType::TrafficSelectorResponder,
            Payload::Encrypted(_) => PayloadType::EncryptedAndAuthenticated,
            Payload::Configuration(_) => PayloadType::Configuration,
            Payload::Eap(_) => PayloadType::ExtensibleAuthentication,
            Payload::EncryptedFragment(_) => PayloadType::EncryptedAndAuthenticatedFragment,
        }
    }
}

/// An SA payload: the list of proposals offered by the sender
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityAssociation {
    /// Proposals in preference order; a response contains exactly one
    pub proposals: Vec<Proposal>,
}

/// A single proposal within an SA payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Number of the proposal within the payload, starting at 1
    pub number: u8,
    /// Protocol the proposal negotiates keys for
    pub protocol: SecurityProtocol,
    /// SPI of the sender for this protocol; empty in the initial IKE
    /// negotiation
    pub spi: Vec<u8>,
    /// The offered transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Construct a new proposal without any transforms
    pub fn new_empty(number: u8, protocol: SecurityProtocol, spi: Vec<u8>) -> Self {
        Self {
            number,
            protocol,
            spi,
            transforms: vec![],
        }
    }

    /// Iterate over the key exchange methods offered by this proposal
    pub fn key_exchange_methods(&self) -> impl Iterator<Item = KeyExchangeMethod> + '_ {
        self.transforms.iter().filter_map(|t| match t {
            Transform::KeyExchange(m) => Some(*m),
            _ => None,
        })
    }
}

/// A single transform of a proposal: one concrete algorithm choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Transform {
    /// An encryption algorithm with an optional key length in bits
    Encryption(EncryptionAlgorithm, Option<u16>),
    /// A pseudorandom function for key derivation
    PseudoRandomFunction(PseudorandomFunction),
    /// An integrity algorithm
    Integrity(IntegrityAlgorithm),
    /// A key exchange method (classical group, curve or hybrid)
    KeyExchange(KeyExchangeMethod),
    /// Extended sequence number mode for child SAs
    SequenceNumber(ExtendedSequenceNumbers),
}

/// A key exchange payload: the sender's public value for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    /// The group the value belongs to
    pub group: KeyExchangeMethod,
    /// The raw public value in the group's wire encoding
    pub data: Vec<u8>,
}

/// An identity as carried in an ID payload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Identity {
    /// Discriminator for the interpretation of the raw bytes
    pub id_type: IdType,
    /// Raw identification data (address octets, FQDN bytes, DER DN, ...)
    pub data: Vec<u8>,
}

/// A certificate payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Encoding of the carried data
    pub encoding: CertificateEncoding,
    /// The certificate, CRL or raw key bytes
    pub data: Vec<u8>,
}

/// A certificate request payload; the data is a concatenation of SHA-1
/// digests of the SubjectPublicKeyInfo of acceptable trust anchors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Encoding of certificates the sender asks for
    pub encoding: CertificateEncoding,
    /// Concatenated 20-octet trust anchor hints
    pub hashes: Vec<u8>,
}

/// An authentication payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    /// Method used to compute the data
    pub method: AuthMethod,
    /// Signature or MAC over the exchange octets
    pub data: Vec<u8>,
}

/// The decoded variant of a notify message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotifyType {
    /// Error notification (type < 16384)
    Error(NotifyError),
    /// Status notification (type >= 16384)
    Status(NotifyStatus),
}

/// A notify payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Protocol of the SA the notification concerns, when an SPI is
    /// attached
    pub protocol: Option<SecurityProtocol>,
    /// SPI of the concerned SA, when attached
    pub spi: Option<Vec<u8>>,
    /// The notification type
    pub notify_type: NotifyType,
    /// Type-specific notification data
    pub data: Vec<u8>,
}

impl Notification {
    /// Construct a status notification without SPI and data
    pub fn status(status: NotifyStatus) -> Self {
        Self {
            protocol: None,
            spi: None,
            notify_type: NotifyType::Status(status),
            data: vec![],
        }
    }

    /// Construct a status notification without SPI carrying data
    pub fn status_with_data(status: NotifyStatus, data: Vec<u8>) -> Self {
        Self {
            protocol: None,
            spi: None,
            notify_type: NotifyType::Status(status),
            data,
        }
    }

    /// Construct an error notification without SPI and data
    pub fn error(error: NotifyError) -> Self {
        Self {
            protocol: None,
            spi: None,
            notify_type: NotifyType::Error(error),
            data: vec![],
        }
    }

    /// Construct an error notification without SPI carrying data
    pub fn error_with_data(error: NotifyError, data: Vec<u8>) -> Self {
        Self {
            protocol: None,
            spi: None,
            notify_type: NotifyType::Error(error),
            data,
        }
    }
}

/// A delete payload announcing removal of one or more SAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    /// Protocol of the SAs being deleted
    pub protocol: SecurityProtocol,
    /// SPIs of the deleted SAs; empty when the enclosing IKE SA itself
    /// is deleted
    pub spis: Vec<Vec<u8>>,
}

/// A single traffic selector (an address range, port range and protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficSelector {
    /// Address family of the range
    pub ts_type: TrafficSelectorType,
    /// Restricted IP protocol, or zero for any
    pub ip_protocol: u8,
    /// First permitted port
    pub start_port: u16,
    /// Last permitted port
    pub end_port: u16,
    /// First address of the permitted range
    pub start_addr: IpAddr,
    /// Last address of the permitted range
    pub end_addr: IpAddr,
}

/// A TSi or TSr payload carrying one or more selectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelectors {
    /// The selectors in wire order
    pub selectors: Vec<TrafficSelector>,
}

/// A single attribute of a configuration payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAttribute {
    /// Raw attribute type; recognized values decode via
    /// [params::ConfigAttributeType]
    pub attribute_type: u16,
    /// Attribute value; empty in a request asking the peer to assign one
    pub value: Vec<u8>,
}

/// A configuration payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Whether this is a request, reply, set or ack
    pub cfg_type: ConfigType,
    /// The carried attributes
    pub attributes: Vec<ConfigAttribute>,
}

/// A single EAP message as carried in an EAP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapMessage {
    /// Request/response/success/failure
    pub code: EapCode,
    /// Identifier matching a response to its request
    pub identifier: u8,
    /// EAP method type; absent for success/failure messages
    pub eap_type: Option<u8>,
    /// Method-specific data
    pub data: Vec<u8>,
}

/// The body of an SK payload, still sealed
///
/// The next-payload field of the SK payload's generic header names the
/// first payload of the chain hidden inside the ciphertext, so it is
/// carried here instead of continuing the outer chain; an SK payload is
/// always the last payload of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Payload type of the first inner payload
    pub next_payload: u8,
    /// IV, ciphertext and integrity check value
    pub data: Vec<u8>,
}

/// One fragment of a fragmented encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Number of this fragment, starting at 1
    pub fragment_number: u16,
    /// Total number of fragments of the message
    pub total_fragments: u16,
    /// Inner next-payload type; only meaningful on fragment 1
    pub next_payload: u8,
    /// The encrypted fragment body (IV plus ciphertext plus ICV)
    pub data: Vec<u8>,
}
