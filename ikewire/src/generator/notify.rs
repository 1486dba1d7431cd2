use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::defs::header::NotifyHeader;
use crate::defs::{Notification, NotifyType};

impl Notification {
    /// Convert a [Notification] into a network-level vector of bytes,
    /// without the generic payload header
    pub(crate) fn build(&self) -> Vec<u8> {
        let raw_type = match self.notify_type {
            NotifyType::Error(e) => e as u16,
            NotifyType::Status(s) => s as u16,
        };
        let spi = self.spi.as_deref().unwrap_or(&[]);
        let header = NotifyHeader {
            protocol_id: self.protocol.map(|p| p as u8).unwrap_or(0),
            spi_size: spi.len() as u8,
            notify_message_type: U16::from(raw_type),
        };
        let mut body = Vec::with_capacity(size_of::<NotifyHeader>() + spi.len() + self.data.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(spi);
        body.extend_from_slice(&self.data);
        body
    }
}
