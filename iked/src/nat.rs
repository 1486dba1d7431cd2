//! NAT detection and traversal helpers (RFC 7296 section 2.23, RFC 3948)
//!
//! During IKE_SA_INIT each side sends a NAT_DETECTION_SOURCE_IP notify
//! for its own endpoint and a NAT_DETECTION_DESTINATION_IP notify for
//! the peer's. A digest that does not match the addresses seen on the
//! datagram reveals a NAT on the respective side, after which the
//! exchange floats to the NAT-T port and ESP is UDP encapsulated.

use std::net::SocketAddr;

use ikewire::defs::params::NotifyStatus;
use ikewire::defs::{Message, Notification};
use sha1::{Digest, Sha1};

/// The keepalive octet sent on the NAT-T port to hold the mapping open
pub const KEEPALIVE: [u8; 1] = [0xff];

/// `SHA1(SPIi | SPIr | IP | port)` over one endpoint
pub fn detection_hash(spi_i: u64, spi_r: u64, endpoint: &SocketAddr) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(spi_i.to_be_bytes());
    hasher.update(spi_r.to_be_bytes());
    match endpoint.ip() {
        std::net::IpAddr::V4(v4) => hasher.update(v4.octets()),
        std::net::IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.update(endpoint.port().to_be_bytes());
    hasher.finalize().to_vec()
}

/// The two notify payloads a sender adds to its IKE_SA_INIT message
pub fn detection_notifies(
    spi_i: u64,
    spi_r: u64,
    local: &SocketAddr,
    peer: &SocketAddr,
) -> [Notification; 2] {
    [
        Notification::status_with_data(
            NotifyStatus::NatDetectionSourceIp,
            detection_hash(spi_i, spi_r, local),
        ),
        Notification::status_with_data(
            NotifyStatus::NatDetectionDestinationIp,
            detection_hash(spi_i, spi_r, peer),
        ),
    ]
}

/// Evaluate the peer's detection notifies against the datagram addresses
///
/// Returns `(peer_behind_nat, local_behind_nat)`; absent notifies mean
/// the peer does not support NAT traversal and both are false.
pub fn evaluate(msg: &Message, sender: &SocketAddr, receiver: &SocketAddr) -> (bool, bool) {
    let mut peer_behind = false;
    let mut local_behind = false;
    let mut seen = false;

    for notification in msg.notifications() {
        match notification.notify_type {
            ikewire::defs::NotifyType::Status(NotifyStatus::NatDetectionSourceIp) => {
                seen = true;
                // source hash mismatch: the sender's address was rewritten
                if notification.data != detection_hash(msg.initiator_spi, msg.responder_spi, sender)
                {
                    peer_behind = true;
                }
            }
            ikewire::defs::NotifyType::Status(NotifyStatus::NatDetectionDestinationIp) => {
                seen = true;
                // destination hash mismatch: our address was rewritten
                if notification.data
                    != detection_hash(msg.initiator_spi, msg.responder_spi, receiver)
                {
                    local_behind = true;
                }
            }
            _ => {}
        }
    }
    if !seen {
        return (false, false);
    }
    (peer_behind, local_behind)
}

#[cfg(test)]
mod tests {
    use ikewire::defs::params::ExchangeType;
    use ikewire::defs::Payload;

    use super::*;

    fn message(spi_i: u64, local: &SocketAddr, peer: &SocketAddr) -> Message {
        Message {
            initiator_spi: spi_i,
            responder_spi: 0,
            exchange_type: ExchangeType::IkeSaInit,
            initiator: true,
            response: false,
            message_id: 0,
            payloads: detection_notifies(spi_i, 0, local, peer)
                .into_iter()
                .map(Payload::Notify)
                .collect(),
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn no_nat_when_addresses_match() {
        let a: SocketAddr = "192.0.2.1:500".parse().unwrap();
        let b: SocketAddr = "198.51.100.2:500".parse().unwrap();
        let msg = message(7, &a, &b);
        assert_eq!(evaluate(&msg, &a, &b), (false, false));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn sender_rewrite_flags_peer() {
        let a: SocketAddr = "10.0.0.1:500".parse().unwrap();
        let rewritten: SocketAddr = "192.0.2.99:4500".parse().unwrap();
        let b: SocketAddr = "198.51.100.2:500".parse().unwrap();
        let msg = message(7, &a, &b);
        // the datagram arrived from the NAT's outside address
        assert_eq!(evaluate(&msg, &rewritten, &b), (true, false));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn receiver_rewrite_flags_local() {
        let a: SocketAddr = "192.0.2.1:500".parse().unwrap();
        let b: SocketAddr = "198.51.100.2:500".parse().unwrap();
        let nat_inside: SocketAddr = "10.1.1.5:500".parse().unwrap();
        let msg = message(9, &a, &b);
        assert_eq!(evaluate(&msg, &a, &nat_inside), (false, true));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn absent_notifies_mean_no_nat() {
        let a: SocketAddr = "192.0.2.1:500".parse().unwrap();
        let msg = Message {
            initiator_spi: 1,
            responder_spi: 0,
            exchange_type: ExchangeType::IkeSaInit,
            initiator: true,
            response: false,
            message_id: 0,
            payloads: vec![],
        };
        assert_eq!(evaluate(&msg, &a, &a), (false, false));
    }
}
