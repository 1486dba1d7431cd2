use log::warn;
use zerocopy::FromBytes;

use crate::defs::header::{AttributeHeader, ProposalHeader, TransformHeader};
use crate::defs::params::{
    EncryptionAlgorithm, ExtendedSequenceNumbers, IntegrityAlgorithm, KeyExchangeMethod,
    PseudorandomFunction, SecurityProtocol, TransformType, ATTRIBUTE_KEY_LENGTH,
    FLAG_ATTRIBUTE_FORMAT,
};
use crate::defs::{Proposal, SecurityAssociation, Transform};
use crate::parser::ParserError;

impl SecurityAssociation {
    /// Parses a buffer into a [SecurityAssociation]. The buffer must not
    /// contain the generic payload header, only the list of proposals.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let mut proposals = vec![];
        let mut offset = 0;
        let mut more = !buf.is_empty();

        while more {
            let header = ProposalHeader::ref_from_prefix(
                buf.get(offset..).ok_or(ParserError::PayloadOverrun)?,
            )
            .ok_or(ParserError::BufferTooSmall)?;
            let length = header.proposal_length.get() as usize;
            if length < size_of::<ProposalHeader>() {
                return Err(ParserError::PayloadLengthUnderflow);
            }
            let body = buf
                .get(offset + size_of::<ProposalHeader>()..offset + length)
                .ok_or(ParserError::PayloadOverrun)?;

            let proposal = Proposal::try_parse(header, body)?;
            // Proposal numbering starts at 1 and increments by 1 so the
            // receiver can echo the accepted number back unambiguously
            match proposals.last() {
                None if proposal.number != 1 => {
                    return Err(ParserError::InvalidProposalNumberingStart)
                }
                Some(Proposal { number, .. }) if proposal.number != number + 1 => {
                    return Err(ParserError::InvalidProposalNumbering)
                }
                _ => {}
            }
            proposals.push(proposal);

            more = header.last_substruct != 0;
            offset += length;
        }
        Ok(Self { proposals })
    }
}

impl Proposal {
    pub(crate) fn try_parse(header: &ProposalHeader, body: &[u8]) -> Result<Self, ParserError> {
        let spi_size = header.spi_size as usize;
        let spi = body.get(..spi_size).ok_or(ParserError::PayloadOverrun)?.to_vec();

        let mut transforms = vec![];
        let mut offset = spi_size;
        for _ in 0..header.num_transforms {
            let transform_header = TransformHeader::ref_from_prefix(
                body.get(offset..).ok_or(ParserError::SubstructureMismatch)?,
            )
            .ok_or(ParserError::BufferTooSmall)?;
            let length = transform_header.transform_length.get() as usize;
            if length < size_of::<TransformHeader>() {
                return Err(ParserError::PayloadLengthUnderflow);
            }
            let attributes = body
                .get(offset + size_of::<TransformHeader>()..offset + length)
                .ok_or(ParserError::PayloadOverrun)?;

            // A transform ID the local registry does not know is skipped,
            // not fatal: the peer may offer newer algorithms alongside
            // ones we can negotiate (RFC 7296, section 3.3.6)
            match Transform::try_parse(transform_header, attributes) {
                Ok(transform) => transforms.push(transform),
                Err(ParserError::UnparseableParameter(region)) => {
                    let id = transform_header.transform_id.get();
                    warn!("Skipping unknown transform id {id} ({region:?})");
                }
                Err(e) => return Err(e),
            }
            offset += length;
        }
        Ok(Self {
            number: header.proposal_num,
            protocol: SecurityProtocol::try_from(header.protocol_id)?,
            spi,
            transforms,
        })
    }
}

impl Transform {
    pub(crate) fn try_parse(
        header: &TransformHeader,
        attributes: &[u8],
    ) -> Result<Self, ParserError> {
        let id = header.transform_id.get();
        Ok(match TransformType::try_from(header.transform_type)? {
            TransformType::EncryptionAlgorithm => Transform::Encryption(
                EncryptionAlgorithm::try_from(id)?,
                parse_key_length(attributes)?,
            ),
            TransformType::PseudoRandomFunction => {
                Transform::PseudoRandomFunction(PseudorandomFunction::try_from(id)?)
            }
            TransformType::IntegrityAlgorithm => {
                Transform::Integrity(IntegrityAlgorithm::try_from(id)?)
            }
            TransformType::KeyExchangeMethod => {
                Transform::KeyExchange(KeyExchangeMethod::try_from(id)?)
            }
            TransformType::ExtendedSequenceNumbers => {
                Transform::SequenceNumber(ExtendedSequenceNumbers::try_from(id)?)
            }
        })
    }
}

/// Extract the key length attribute, the only transform attribute in use
/// by IKEv2. Other attribute types are skipped; a TLV-encoded attribute
/// consumes its noted data length.
fn parse_key_length(mut attributes: &[u8]) -> Result<Option<u16>, ParserError> {
    let mut key_length = None;
    while !attributes.is_empty() {
        let header =
            AttributeHeader::ref_from_prefix(attributes).ok_or(ParserError::BufferTooSmall)?;
        let attribute_type = header.attribute_type.get() & !FLAG_ATTRIBUTE_FORMAT;
        let consumed = if header.is_fixed_length() {
            if attribute_type == ATTRIBUTE_KEY_LENGTH {
                key_length = Some(header.attribute_value.get());
            }
            size_of::<AttributeHeader>()
        } else {
            size_of::<AttributeHeader>() + header.attribute_value.get() as usize
        };
        attributes = attributes
            .get(consumed..)
            .ok_or(ParserError::PayloadOverrun)?;
    }
    Ok(key_length)
}
