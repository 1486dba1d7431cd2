use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::defs::header::{ConfigAttributeHeader, ConfigurationHeader};
use crate::defs::Configuration;

impl Configuration {
    /// Convert a [Configuration] payload into a network-level vector of
    /// bytes, without the generic payload header
    pub(crate) fn build(&self) -> Vec<u8> {
        let header = ConfigurationHeader {
            cfg_type: self.cfg_type as u8,
            reserved: [0; 3],
        };
        let mut body = header.as_bytes().to_vec();
        for attribute in &self.attributes {
            let attribute_header = ConfigAttributeHeader {
                attribute_type: U16::from(attribute.attribute_type & 0x7fff),
                length: U16::from(attribute.value.len() as u16),
            };
            body.extend_from_slice(attribute_header.as_bytes());
            body.extend_from_slice(&attribute.value);
        }
        body
    }
}
