use zerocopy::network_endian::{U32, U64};
use zerocopy::AsBytes;

use crate::defs::header::IkeHeader;
use crate::defs::params::{PayloadType, FLAG_INITIATOR, FLAG_RESPONSE};
use crate::defs::{Message, Payload};
use crate::generator::{GeneratorError, ESTIMATED_PAYLOAD_LENGTH};
use crate::{IKE_HEADER_SIZE, IKE_VERSION_VALUE};

impl Message {
    /// Convert a [Message] into its network representation.
    ///
    /// Payloads are emitted in the order of the `payloads` vector; each
    /// one is chained to the type of its successor via the next-payload
    /// field of its generic header.
    pub fn try_build(&self) -> Result<Vec<u8>, GeneratorError> {
        if self.payloads.len() >= 255 {
            return Err(GeneratorError::TooManyPayloads);
        }
        let mut payloads = Vec::with_capacity(ESTIMATED_PAYLOAD_LENGTH * self.payloads.len());
        for (i, payload) in self.payloads.iter().enumerate() {
            payloads.extend(payload.try_build(match self.payloads.get(i + 1) {
                None => PayloadType::NoNextPayload,
                Some(next) => next.into(),
            })?);
        }

        let packet_length = IKE_HEADER_SIZE + payloads.len();
        if u32::try_from(packet_length).is_err() {
            return Err(GeneratorError::MessageTooLarge);
        }
        let header = IkeHeader {
            initiator_spi: U64::from(self.initiator_spi),
            responder_spi: U64::from(self.responder_spi),
            next_payload: match self.payloads.first() {
                None => PayloadType::NoNextPayload,
                Some(t) => t.into(),
            } as u8,
            version: IKE_VERSION_VALUE,
            exchange_type: self.exchange_type as u8,
            flags: (if self.initiator { FLAG_INITIATOR } else { 0 })
                | (if self.response { FLAG_RESPONSE } else { 0 }),
            message_id: U32::from(self.message_id),
            length: U32::from(packet_length as u32),
        };

        let mut packet = Vec::with_capacity(packet_length);
        packet.extend_from_slice(header.as_bytes());
        packet.extend(payloads);
        Ok(packet)
    }
}

impl Payload {
    /// The next-payload discriminant this payload puts on the wire:
    /// encrypted payloads carry their inner first payload type instead of
    /// chaining to a successor
    pub(crate) fn wire_next_payload(&self, next: PayloadType) -> u8 {
        match self {
            Payload::Encrypted(e) => e.next_payload,
            Payload::EncryptedFragment(f) => f.next_payload,
            _ => next as u8,
        }
    }
}
