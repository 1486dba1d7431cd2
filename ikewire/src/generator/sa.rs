use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::defs::header::ProposalHeader;
use crate::defs::{Proposal, SecurityAssociation};
use crate::generator::GeneratorError;

impl SecurityAssociation {
    /// Convert a [SecurityAssociation] into a network-level vector of
    /// bytes, without the generic payload header
    pub(crate) fn try_build(&self) -> Result<Vec<u8>, GeneratorError> {
        let mut body = vec![];
        for (i, proposal) in self.proposals.iter().enumerate() {
            body.extend(proposal.try_build(i == self.proposals.len() - 1)?);
        }
        Ok(body)
    }
}

impl Proposal {
    /// Convert a [Proposal] into a network-level vector of bytes
    ///
    /// The argument `last` defines if any proposal is following this
    /// proposal (false) or if this proposal is the last proposal in the
    /// Security Association payload (true).
    pub(crate) fn try_build(&self, last: bool) -> Result<Vec<u8>, GeneratorError> {
        if self.transforms.len() > 255 {
            return Err(GeneratorError::TooManyTransforms);
        }
        if self.spi.len() > 255 {
            return Err(GeneratorError::SpiTooLarge);
        }
        let mut transforms = Vec::with_capacity(12 * self.transforms.len());
        for (i, transform) in self.transforms.iter().enumerate() {
            transforms.extend(transform.build(i == self.transforms.len() - 1));
        }

        let length = size_of::<ProposalHeader>() + self.spi.len() + transforms.len();
        if u16::try_from(length).is_err() {
            return Err(GeneratorError::PayloadTooLarge);
        }
        let header = ProposalHeader {
            last_substruct: if last { 0 } else { 2 },
            reserved: 0,
            proposal_length: U16::from(length as u16),
            proposal_num: self.number,
            protocol_id: self.protocol as u8,
            spi_size: self.spi.len() as u8,
            num_transforms: self.transforms.len() as u8,
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(&self.spi);
        packet.extend(transforms);
        Ok(packet)
    }
}
