use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::FromBytes;

use crate::defs::header::{TrafficSelectorHeader, TrafficSelectorPayloadHeader};
use crate::defs::params::TrafficSelectorType;
use crate::defs::{TrafficSelector, TrafficSelectors};
use crate::parser::ParserError;

/// Parse the body of a TSi/TSr payload into its selector list
pub(crate) fn parse_selectors(body: &[u8]) -> Result<TrafficSelectors, ParserError> {
    let header =
        TrafficSelectorPayloadHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;

    let mut selectors = vec![];
    let mut offset = size_of::<TrafficSelectorPayloadHeader>();
    for _ in 0..header.num_ts {
        let ts = TrafficSelectorHeader::ref_from_prefix(
            body.get(offset..).ok_or(ParserError::SubstructureMismatch)?,
        )
        .ok_or(ParserError::BufferTooSmall)?;
        let length = ts.selector_length.get() as usize;
        let ts_type = TrafficSelectorType::try_from(ts.ts_type)?;

        // A selector is exactly its header plus two addresses of the
        // family's width; anything else is malformed
        let addr_len = match ts_type {
            TrafficSelectorType::Ipv4AddressRange => 4,
            TrafficSelectorType::Ipv6AddressRange => 16,
        };
        if length != size_of::<TrafficSelectorHeader>() + 2 * addr_len {
            return Err(ParserError::InvalidSelector);
        }
        let addresses = body
            .get(offset + size_of::<TrafficSelectorHeader>()..offset + length)
            .ok_or(ParserError::PayloadOverrun)?;

        selectors.push(TrafficSelector {
            ts_type,
            ip_protocol: ts.ip_protocol,
            start_port: ts.start_port.get(),
            end_port: ts.end_port.get(),
            start_addr: parse_addr(&addresses[..addr_len]),
            end_addr: parse_addr(&addresses[addr_len..]),
        });
        offset += length;
    }
    Ok(TrafficSelectors { selectors })
}

fn parse_addr(octets: &[u8]) -> IpAddr {
    match octets.len() {
        4 => {
            let mut v4 = [0u8; 4];
            v4.copy_from_slice(octets);
            IpAddr::V4(Ipv4Addr::from(v4))
        }
        _ => {
            let mut v6 = [0u8; 16];
            v6.copy_from_slice(octets);
            IpAddr::V6(Ipv6Addr::from(v6))
        }
    }
}
