use std::net::IpAddr;

use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::defs::header::{TrafficSelectorHeader, TrafficSelectorPayloadHeader};
use crate::defs::{TrafficSelector, TrafficSelectors};

impl TrafficSelectors {
    /// Convert a [TrafficSelectors] payload into a network-level vector
    /// of bytes, without the generic payload header
    pub(crate) fn build(&self) -> Vec<u8> {
        let header = TrafficSelectorPayloadHeader {
            num_ts: self.selectors.len() as u8,
            reserved: [0; 3],
        };
        let mut body = header.as_bytes().to_vec();
        for selector in &self.selectors {
            body.extend(selector.build());
        }
        body
    }
}

impl TrafficSelector {
    fn build(&self) -> Vec<u8> {
        let addr_len = match self.start_addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        let length = size_of::<TrafficSelectorHeader>() + 2 * addr_len;
        let header = TrafficSelectorHeader {
            ts_type: self.ts_type as u8,
            ip_protocol: self.ip_protocol,
            selector_length: U16::from(length as u16),
            start_port: U16::from(self.start_port),
            end_port: U16::from(self.end_port),
        };
        let mut body = Vec::with_capacity(length);
        body.extend_from_slice(header.as_bytes());
        push_addr(&mut body, &self.start_addr);
        push_addr(&mut body, &self.end_addr);
        body
    }
}

fn push_addr(body: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => body.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => body.extend_from_slice(&v6.octets()),
    }
}
