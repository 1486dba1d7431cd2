//! Implementations of the associated `try_build` functions of the message
//! types that convert high-level Rust structs into network-encoded byte
//! vectors

mod conf;
mod notify;
mod packet;
mod payload;
mod sa;
mod transform;
mod ts;

use thiserror::Error;

use crate::defs::params::PayloadType;
use crate::defs::Payload;

/// Estimation of the payload size used for buffer pre-allocation
pub(crate) const ESTIMATED_PAYLOAD_LENGTH: usize = 64;

/// Build a bare payload chain without an IKE header, returning the type
/// of the first payload and the encoded bytes
///
/// This is the plaintext that goes into an encrypted payload; the first
/// payload type ends up in the next-payload field of the SK payload (or
/// of fragment number 1).
pub fn build_payload_chain(payloads: &[Payload]) -> Result<(u8, Vec<u8>), GeneratorError> {
    if payloads.len() >= 255 {
        return Err(GeneratorError::TooManyPayloads);
    }
    let mut chain = Vec::with_capacity(ESTIMATED_PAYLOAD_LENGTH * payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        chain.extend(payload.try_build(match payloads.get(i + 1) {
            None => PayloadType::NoNextPayload,
            Some(next) => next.into(),
        })?);
    }
    let first = match payloads.first() {
        None => PayloadType::NoNextPayload,
        Some(p) => p.into(),
    } as u8;
    Ok((first, chain))
}

/// Failure while building the network representation of a [Message](crate::defs::Message)
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum GeneratorError {
    #[error("A message is limited to 255 payloads")]
    TooManyPayloads,
    #[error("A nonce must be between 16 and 256 octets")]
    InvalidNonceLength,
    #[error("Payload data exceeds the 16-bit payload length field")]
    PayloadTooLarge,
    #[error("A proposal is limited to 255 transforms")]
    TooManyTransforms,
    #[error("An SPI is limited to 255 octets")]
    SpiTooLarge,
    #[error("Message exceeds the 32-bit length field")]
    MessageTooLarge,
}
