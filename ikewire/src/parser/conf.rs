use zerocopy::FromBytes;

use crate::defs::header::{ConfigAttributeHeader, ConfigurationHeader};
use crate::defs::params::ConfigType;
use crate::defs::{ConfigAttribute, Configuration};
use crate::parser::ParserError;

/// Parse the body of a configuration payload into its attribute list
pub(crate) fn parse_configuration(body: &[u8]) -> Result<Configuration, ParserError> {
    let header = ConfigurationHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
    let cfg_type = ConfigType::try_from(header.cfg_type)?;

    let mut attributes = vec![];
    let mut rest = &body[size_of::<ConfigurationHeader>()..];
    while !rest.is_empty() {
        let attribute =
            ConfigAttributeHeader::ref_from_prefix(rest).ok_or(ParserError::BufferTooSmall)?;
        let length = attribute.length.get() as usize;
        let value = rest
            .get(size_of::<ConfigAttributeHeader>()..size_of::<ConfigAttributeHeader>() + length)
            .ok_or(ParserError::PayloadOverrun)?;
        attributes.push(ConfigAttribute {
            // the top bit is a reserved leftover of the IKEv1 encoding
            attribute_type: attribute.attribute_type.get() & 0x7fff,
            value: value.to_vec(),
        });
        rest = &rest[size_of::<ConfigAttributeHeader>() + length..];
    }
    Ok(Configuration {
        cfg_type,
        attributes,
    })
}
