use log::warn;
use zerocopy::FromBytes;

use crate::defs::header::{GenericPayloadHeader, IkeHeader};
use crate::defs::params::{ExchangeType, PayloadType};
use crate::defs::params::{FLAG_INITIATOR, FLAG_RESPONSE};
use crate::defs::{Message, Payload};
use crate::parser::{ParserError, MAX_PAYLOADS};
use crate::{IKE_HEADER_SIZE, IKE_VERSION_VALUE};

impl Message {
    /// Parse a buffer into a [Message], if possible.
    ///
    /// The buffer must contain exactly one datagram starting with the IKE
    /// header (a non-ESP marker, if any, has to be stripped by the
    /// caller). The length noted in each payload header is used to split
    /// the buffer and feed the pieces into sub-parser functions, after it
    /// has been checked against the enclosing message length. A packet
    /// must therefore have both correct payload header information and
    /// inner structural integrity; otherwise parsing fails.
    pub fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = IkeHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        if header.version != IKE_VERSION_VALUE {
            return Err(ParserError::WrongVersion);
        }
        let total = header.length.get() as usize;
        if total > buf.len() || total < IKE_HEADER_SIZE {
            return Err(ParserError::TruncatedMessage);
        }
        if total < buf.len() {
            warn!(
                "Ignoring {} trailing bytes after the message",
                buf.len() - total
            );
        }

        let payloads = parse_chain(&buf[IKE_HEADER_SIZE..total], header.next_payload)?;

        Ok(Self {
            initiator_spi: header.initiator_spi.get(),
            responder_spi: header.responder_spi.get(),
            exchange_type: ExchangeType::try_from(header.exchange_type)?,
            initiator: header.flags & FLAG_INITIATOR == FLAG_INITIATOR,
            response: header.flags & FLAG_RESPONSE == FLAG_RESPONSE,
            message_id: header.message_id.get(),
            payloads,
        })
    }

    /// Parse the plaintext obtained by opening an encrypted payload into
    /// the inner payload chain.
    ///
    /// `next_payload` is the inner first payload type taken from the SK
    /// payload (or from fragment number 1 of a fragmented message).
    pub fn parse_inner(next_payload: u8, plaintext: &[u8]) -> Result<Vec<Payload>, ParserError> {
        parse_chain(plaintext, next_payload)
    }
}

/// Walk a payload chain. Payloads of an unknown type are skipped with a
/// log line unless their critical bit is set, which fails the whole
/// message. An encrypted payload (plain or fragment) terminates the
/// chain: its next-payload field describes its hidden content.
fn parse_chain(buf: &[u8], mut next_payload: u8) -> Result<Vec<Payload>, ParserError> {
    let mut offset = 0;
    let mut payloads = vec![];

    while next_payload != PayloadType::NoNextPayload as u8 {
        if payloads.len() >= MAX_PAYLOADS {
            return Err(ParserError::TooManyPayloads);
        }
        let generic = GenericPayloadHeader::ref_from_prefix(
            buf.get(offset..).ok_or(ParserError::PayloadOverrun)?,
        )
        .ok_or(ParserError::BufferTooSmall)?;
        let consumed = generic.payload_length.get() as usize;
        if consumed < size_of::<GenericPayloadHeader>() {
            return Err(ParserError::PayloadLengthUnderflow);
        }
        let body = buf
            .get(offset + size_of::<GenericPayloadHeader>()..offset + consumed)
            .ok_or(ParserError::PayloadOverrun)?;

        match PayloadType::try_from(next_payload) {
            Ok(
                current @ (PayloadType::EncryptedAndAuthenticated
                | PayloadType::EncryptedAndAuthenticatedFragment),
            ) => {
                if let Some(decoded) = Payload::try_parse(current, generic.next_payload, body)? {
                    payloads.push(decoded);
                }
                return Ok(payloads);
            }
            Ok(current) => {
                if let Some(decoded) = Payload::try_parse(current, generic.next_payload, body)? {
                    payloads.push(decoded);
                }
            }
            Err(_) if generic.is_critical() => {
                return Err(ParserError::UnknownCriticalPayload(next_payload));
            }
            Err(_) => {
                warn!("Unknown non-critical payload type ignored: {next_payload}");
            }
        }

        next_payload = generic.next_payload;
        offset += consumed;
    }

    if offset < buf.len() {
        warn!(
            "Ignoring {} dangling bytes after the payload chain",
            buf.len() - offset
        );
    }
    Ok(payloads)
}
