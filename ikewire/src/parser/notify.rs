use log::{debug, warn};
use zerocopy::FromBytes;

use crate::defs::header::NotifyHeader;
use crate::defs::params::{NotifyError, NotifyStatus, SecurityProtocol};
use crate::defs::{Notification, NotifyType};
use crate::parser::{ParserError, PayloadResult};

/// Parses the body of a notify payload.
///
/// An unrecognized error type in a request, or any unrecognized status
/// type, must be ignored per RFC 7296, section 3.10.1; such payloads
/// yield `Ok(None)` with a log line rather than failing the message.
pub(crate) fn parse_notify(body: &[u8]) -> PayloadResult<Notification> {
    let header = NotifyHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
    let spi_size = header.spi_size as usize;
    let raw_type = header.notify_message_type.get();

    let notify_type = if header.is_error() {
        match NotifyError::try_from(raw_type) {
            Ok(e) => NotifyType::Error(e),
            Err(region) => {
                warn!("Ignoring notify payload of unknown error type {raw_type} ({region:?})");
                return Ok(None);
            }
        }
    } else {
        match NotifyStatus::try_from(raw_type) {
            Ok(s) => NotifyType::Status(s),
            Err(region) => {
                debug!("Ignoring notify payload of unknown status type {raw_type} ({region:?})");
                return Ok(None);
            }
        }
    };

    // A notification concerning the IKE SA never carries an SPI; when the
    // SPI field is empty the protocol ID must be zero
    let protocol = match (spi_size, header.protocol_id) {
        (0, 0) => None,
        (0, _) => return Err(ParserError::ProtocolViolation),
        (_, raw) => match SecurityProtocol::try_from(raw) {
            Ok(SecurityProtocol::InternetKeyExchange) => {
                return Err(ParserError::ProtocolViolation)
            }
            Ok(p) => Some(p),
            Err(e) => return Err(e.into()),
        },
    };

    let spi = if spi_size > 0 {
        Some(
            body.get(size_of::<NotifyHeader>()..size_of::<NotifyHeader>() + spi_size)
                .ok_or(ParserError::PayloadOverrun)?
                .to_vec(),
        )
    } else {
        None
    };

    Ok(Some(Notification {
        protocol,
        spi,
        notify_type,
        data: body
            .get(size_of::<NotifyHeader>() + spi_size..)
            .ok_or(ParserError::PayloadOverrun)?
            .to_vec(),
    }))
}
