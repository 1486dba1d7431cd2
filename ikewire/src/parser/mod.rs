//! Parser functionality to convert network-level bytes into
//! [Message](crate::defs::Message) structs
//!
//! Use the [Message::try_parse](crate::defs::Message::try_parse)
//! associated function as an entrypoint.
//!
//! Every length field is checked against the enclosing buffer before any
//! data behind it is touched, and every iteration of the payload chain
//! consumes at least one generic header, so decoding arbitrary input
//! terminates in work linear in the buffer size and either yields a
//! well-formed [Message] or a [ParserError].

mod conf;
mod notify;
mod packet;
mod payload;
mod sa;
mod ts;

use thiserror::Error;

use crate::defs::UnparseableParameter;

/// Upper bound on the number of payloads accepted in a single message;
/// chains longer than this are cut off with an error before allocation
pub const MAX_PAYLOADS: usize = 64;

/// Failure while parsing a [Message] from network-level byte representation
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParserError {
    #[error("Buffer too small to parse the packet")]
    BufferTooSmall,
    #[error("Wrong protocol version, expected IKEv2")]
    WrongVersion,
    #[error("Header length exceeds the received datagram")]
    TruncatedMessage,
    #[error("Payload length smaller than its own header")]
    PayloadLengthUnderflow,
    #[error("Payload length exceeds the enclosing message")]
    PayloadOverrun,
    #[error("More than {MAX_PAYLOADS} payloads in one message")]
    TooManyPayloads,
    #[error("Unknown payload type {0} marked critical")]
    UnknownCriticalPayload(u8),
    #[error("Parameter could not be parsed: {0:#?}")]
    UnparseableParameter(UnparseableParameter),
    #[error("Proposal numbering doesn't start at 1")]
    InvalidProposalNumberingStart,
    #[error("Proposal numbering doesn't increment by 1")]
    InvalidProposalNumbering,
    #[error("Substructure count does not match the payload body")]
    SubstructureMismatch,
    #[error("Traffic selector of inconsistent length")]
    InvalidSelector,
    #[error("Notification carries an illegal SPI/protocol combination")]
    ProtocolViolation,
}

impl From<UnparseableParameter> for ParserError {
    fn from(value: UnparseableParameter) -> Self {
        Self::UnparseableParameter(value)
    }
}

/// Simple type alias for results of payload-level parser functions
///
/// The `Ok` value is `None` for payloads that are well-formed but must be
/// ignored per RFC 7296 (e.g. notifications of an unrecognized status
/// type).
pub type PayloadResult<T> = Result<Option<T>, ParserError>;
