//! Module containing network level header structs for pieces of the protocol

use zerocopy::network_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::params::{FLAG_ATTRIBUTE_FORMAT, FLAG_CRITICAL};

/// The fixed 28-octet IKE header prepended to every message
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Initiator's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Responder's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                          Message ID                           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                            Length                             |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct IkeHeader {
    /// SPI chosen by the original initiator of the IKE SA; never zero
    /// except in a responder request for a cookie-less retry
    pub initiator_spi: U64,
    /// SPI chosen by the responder; zero in the first message of the
    /// IKE_SA_INIT exchange
    pub responder_spi: U64,
    /// Payload type of the first payload following the header
    pub next_payload: u8,
    /// Major and minor version in 4 bits each, 0x20 for IKEv2
    pub version: u8,
    /// The exchange this message belongs to; see
    /// [super::params::ExchangeType]
    pub exchange_type: u8,
    /// Initiator, version and response bits; see
    /// [super::params::FLAG_INITIATOR] and friends
    pub flags: u8,
    /// Monotonically increasing identifier shared by a request and its
    /// response; used for retransmission matching and replay rejection
    pub message_id: U32,
    /// Total length of the message (header included) in octets
    pub length: U32,
}

/// The generic payload header shared by every payload in the chain
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Next Payload  |C|  RESERVED   |         Payload Length        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct GenericPayloadHeader {
    /// Payload type of the next payload in the chain, or zero for the last
    pub next_payload: u8,
    /// Critical bit plus seven reserved bits; a set critical bit on an
    /// unrecognized payload type makes the whole message unacceptable
    pub critical: u8,
    /// Length in octets of the current payload, including this header
    pub payload_length: U16,
}

impl GenericPayloadHeader {
    /// Whether the sender demands rejection of the message if this
    /// payload's type is not supported
    pub fn is_critical(&self) -> bool {
        self.critical & FLAG_CRITICAL == FLAG_CRITICAL
    }
}

/// Protocol header for a Proposal substructure of an SA payload
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |         Proposal Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                        SPI (variable)                         ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                        <Transforms>                           ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ProposalHeader {
    /// Whether another proposal follows this one: 0 for the last
    /// proposal, 2 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current proposal, including the header itself
    pub proposal_length: U16,
    /// Number of this proposal within the SA payload; numbering starts at
    /// 1 and increments by one per proposal, and a responder accepting a
    /// proposal echoes its number back unchanged
    pub proposal_num: u8,
    /// Protocol this proposal negotiates keys for (IKE, AH or ESP);
    /// see [super::params::SecurityProtocol]
    pub protocol_id: u8,
    /// Size of the SPI carried in this proposal: 0 for the initial IKE
    /// negotiation, 8 for an IKE rekey and 4 for AH/ESP child proposals
    pub spi_size: u8,
    /// Number of transform substructures following the SPI
    pub num_transforms: u8,
}

/// Protocol header for a Transform substructure of a proposal
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |        Transform Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |Transform Type |   RESERVED    |          Transform ID         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                      Transform Attributes                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The transform attributes are not part of the header and thus not
/// included in the struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TransformHeader {
    /// Whether another transform follows this one: 0 for the last
    /// transform, 3 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current transform, including the header itself
    pub transform_length: U16,
    /// Type of transformation found in the body of this substructure;
    /// see RFC 7296, section 3.3.2; also see
    /// [super::params::TransformType]
    pub transform_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved2: u8,
    /// Identifier of the concrete algorithm, interpreted relative to the
    /// transform type; for example transform type 1 with ID 20 selects
    /// AES-GCM with a 16-octet ICV
    pub transform_id: U16,
}

/// Protocol field for attributes of a Transform as per RFC 7296, section 3.3.5
///
/// ```text
///                         1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |A|       Attribute Type        |    AF=0  Attribute Length     |
///     |F|                             |    AF=1  Attribute Value      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                   AF=0  Attribute Value                       |
///     |                   AF=1  Not Transmitted                       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The fixed-length TV variant can be parsed solely from this header;
/// the variable-length TLV variant carries its data after the header.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AttributeHeader {
    /// Type of the attribute with the format flag in the top bit
    pub attribute_type: U16,
    /// Fixed-length value (TV) or data length (TLV); the only attribute
    /// in use by IKEv2 is the key length in bits, which is TV-encoded
    pub attribute_value: U16,
}

impl AttributeHeader {
    /// Determine whether the fixed-length TV variant is used or the
    /// variable-length TLV variant
    pub fn is_fixed_length(&self) -> bool {
        u16::from(self.attribute_type) & FLAG_ATTRIBUTE_FORMAT == FLAG_ATTRIBUTE_FORMAT
    }
}

/// Protocol header for key exchange payloads
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   Diffie-Hellman Group Num    |           RESERVED            |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Key Exchange Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The group number MUST match a key exchange method in a proposal of the
/// SA payload sent in the same message. The key exchange data is not part
/// of the header and thus not included in the struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct KeyExchangeHeader {
    /// Group number as per [super::params::KeyExchangeMethod]
    pub dh_group_num: U16,
    /// Ignored but must be set to 0
    pub reserved: U16,
}

/// Protocol header for notify payloads
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |      Notify Message Type      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                Security Parameter Index (SPI)                 ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Notification Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Of the notifications defined in RFC 7296, an SPI is included only with
/// INVALID_SELECTORS, REKEY_SA and CHILD_SA_NOT_FOUND. If the SPI field
/// is empty, the protocol ID MUST be sent as zero and ignored on receipt.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct NotifyHeader {
    /// Type of the SA the notification concerns, or zero when no SPI
    /// is attached
    pub protocol_id: u8,
    /// Length in octets of the SPI, or zero if no SPI is applicable;
    /// MUST be zero for notifications concerning the IKE SA
    pub spi_size: u8,
    /// The notify message type; types below 16384 report errors, others
    /// carry status. See [super::params::NotifyError] and
    /// [super::params::NotifyStatus].
    pub notify_message_type: U16,
}

impl NotifyHeader {
    /// Whether the carried type is in the error range
    pub fn is_error(&self) -> bool {
        self.notify_message_type.get() < 16384
    }
}

/// Protocol header for delete payloads (RFC 7296, section 3.11)
///
/// A delete for the IKE SA carries no SPIs (the enclosing SA is meant);
/// deletes for AH/ESP carry one or more 4-octet SPIs after the header.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct DeleteHeader {
    /// Protocol of the SAs being deleted
    pub protocol_id: u8,
    /// Octet length of a single SPI; zero for IKE, four for AH/ESP
    pub spi_size: u8,
    /// Number of SPIs following the header
    pub num_spis: U16,
}

/// Protocol header for identification payloads (RFC 7296, section 3.5);
/// the identification data follows the header
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct IdHeader {
    /// Type of the identification data; see [super::params::IdType]
    pub id_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Protocol header for authentication payloads (RFC 7296, section 3.8);
/// the authentication data follows the header
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AuthHeader {
    /// Method used to compute the authentication data; see
    /// [super::params::AuthMethod]
    pub auth_method: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Protocol header for traffic selector payloads (RFC 7296, section 3.13)
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TrafficSelectorPayloadHeader {
    /// Number of selector substructures following the header
    pub num_ts: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// A single traffic selector substructure
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   TS Type     |IP Protocol ID*|       Selector Length         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |           Start Port*         |           End Port*           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Starting Address*                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Ending Address*                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TrafficSelectorHeader {
    /// Address family of the selector; see
    /// [super::params::TrafficSelectorType]
    pub ts_type: u8,
    /// IP protocol (e.g. UDP, TCP, ICMP) the selector is restricted to,
    /// or zero for any
    pub ip_protocol: u8,
    /// Length of the whole substructure including this header
    pub selector_length: U16,
    /// First port of the permitted range; 0 with end 65535 means any
    pub start_port: U16,
    /// Last port of the permitted range
    pub end_port: U16,
}

/// Protocol header for configuration payloads (RFC 7296, section 3.15)
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ConfigurationHeader {
    /// Request/reply/set/ack; see [super::params::ConfigType]
    pub cfg_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Header of a configuration attribute (RFC 7296, section 3.15.1);
/// the top bit of the type is reserved and must be zero
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ConfigAttributeHeader {
    /// Attribute type; see [super::params::ConfigAttributeType]
    pub attribute_type: U16,
    /// Octet length of the value following the header; zero-length
    /// attributes are requests for the responder to fill the value
    pub length: U16,
}

/// Fixed part of an EAP message carried in an EAP payload (RFC 3748)
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct EapHeader {
    /// Request/response/success/failure; see [super::params::EapCode]
    pub code: u8,
    /// Identifier matching responses to requests within the conversation
    pub identifier: u8,
    /// Octet length of the whole EAP message including this header
    pub length: U16,
}

/// Header of an encrypted fragment payload as per RFC 7383, section 2.5
///
/// Fragment numbering starts at 1; only the first fragment carries the
/// inner next-payload type, all others send zero.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct FragmentHeader {
    /// Number of this fragment within the message, starting at 1
    pub fragment_number: U16,
    /// Total number of fragments the message was split into
    pub total_fragments: U16,
}
