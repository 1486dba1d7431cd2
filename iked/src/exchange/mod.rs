//! The four IKEv2 exchanges and their shared helpers
//!
//! Each submodule contributes handler methods to
//! [Engine](crate::engine::Engine); this module holds the pieces every
//! exchange needs: AUTH octet construction, traffic selector
//! conversion and the park state of an SA waiting for the CA process.

mod auth;
mod child;
mod informational;
mod sa_init;

use ikewire::defs::params::TrafficSelectorType;
use ikewire::defs::{Payload, TrafficSelector};

use crate::crypto::{DhExchange, Prf};
use crate::policy::{AddrPrefix, FlowConfig};
use crate::sa::IkeId;

/// `prf(SK_px, IDx')` where `IDx'` is the ID payload body (type,
/// reserved, data) as sent on the wire
pub fn id_hash(prf: &Prf, sk_p: &[u8], id: &IkeId) -> Vec<u8> {
    let wire = id.to_wire();
    let mut body = vec![wire.id_type as u8, 0, 0, 0];
    body.extend_from_slice(&wire.data);
    prf.apply(sk_p, &body)
}

/// The octets an AUTH payload covers: the signer's unmodified first
/// message, the peer's nonce and the hashed identity
pub fn auth_octets(prf: &Prf, init_message: &[u8], peer_nonce: &[u8], sk_p: &[u8], id: &IkeId) -> Vec<u8> {
    let mut octets =
        Vec::with_capacity(init_message.len() + peer_nonce.len() + prf.out_len());
    octets.extend_from_slice(init_message);
    octets.extend_from_slice(peer_nonce);
    octets.extend(id_hash(prf, sk_p, id));
    octets
}

/// The shared-secret AUTH value:
/// `prf(prf(secret, "Key Pad for IKEv2"), octets)`; also used with the
/// EAP MSK in place of the secret
pub fn psk_auth(prf: &Prf, secret: &[u8], octets: &[u8]) -> Vec<u8> {
    let pad = prf.apply(secret, b"Key Pad for IKEv2");
    prf.apply(&pad, octets)
}

/// Convert a policy flow into the selector offered on the wire
pub fn selector_from_prefix(prefix: &AddrPrefix, proto: u8) -> TrafficSelector {
    let (start_addr, end_addr) = prefix.range();
    TrafficSelector {
        ts_type: if prefix.addr.is_ipv4() {
            TrafficSelectorType::Ipv4AddressRange
        } else {
            TrafficSelectorType::Ipv6AddressRange
        },
        ip_protocol: proto,
        start_port: 0,
        end_port: 65535,
        start_addr,
        end_addr,
    }
}

/// The selector pair a policy's flows produce, from the view of the
/// flow's source side
pub fn selectors_for_flows(flows: &[FlowConfig]) -> (Vec<TrafficSelector>, Vec<TrafficSelector>) {
    let local = flows
        .iter()
        .map(|f| selector_from_prefix(&f.src, f.proto))
        .collect();
    let peer = flows
        .iter()
        .map(|f| selector_from_prefix(&f.dst, f.proto))
        .collect();
    (local, peer)
}

/// Narrow an offered selector list against what the policy permits:
/// every offered selector must lie inside one permitted selector, and
/// the permitted intersection is echoed back
pub fn narrow_selectors(
    offered: &[TrafficSelector],
    permitted: &[TrafficSelector],
) -> Option<Vec<TrafficSelector>> {
    let mut narrowed = vec![];
    for offer in offered {
        let fit = permitted.iter().find(|p| {
            p.ts_type == offer.ts_type
                && (p.ip_protocol == 0 || p.ip_protocol == offer.ip_protocol)
                && p.start_addr <= offer.start_addr
                && offer.end_addr <= p.end_addr
                && p.start_port <= offer.start_port
                && offer.end_port <= p.end_port
        })?;
        let mut selector = *offer;
        if fit.ip_protocol != 0 {
            selector.ip_protocol = fit.ip_protocol;
        }
        narrowed.push(selector);
    }
    (!narrowed.is_empty()).then_some(narrowed)
}

/// Why an SA is parked waiting for the CA process, and everything
/// needed to resume in O(1) once the reply names the SA
pub enum AwaitingCa {
    /// Peer chain verification is in flight
    Cert,
    /// Peer AUTH verification is in flight; on success the stashed
    /// inner payloads finish the IKE_AUTH handling
    AuthVerdict {
        /// Decrypted inner payloads of the peer's IKE_AUTH
        inner: Vec<Payload>,
        /// Whether we handle a request (responder) or response
        response: bool,
    },
    /// Our signature for an outgoing request is being produced; once it
    /// arrives the stashed payloads are completed and sent
    Signature {
        /// Payloads of our IKE_AUTH request, AUTH payload still missing
        inner: Vec<Payload>,
    },
    /// Our signature for the IKE_AUTH response is being produced; the
    /// peer's request payloads are kept to finish the child negotiation
    SignatureForResponse {
        /// Decrypted inner payloads of the peer's IKE_AUTH request
        peer_inner: Vec<Payload>,
    },
}

/// A child rekey exchange in flight, kept for collision resolution
pub struct PendingChildRekey {
    /// Local SPI of the child being replaced
    pub old_spi_local: u32,
    /// Message id of our CREATE_CHILD_SA request
    pub message_id: u32,
    /// Our nonce in the exchange
    pub our_nonce: Vec<u8>,
    /// Fresh key exchange when the policy demands PFS
    pub dh: Option<DhExchange>,
    /// Local SPI reserved for the replacement child
    pub new_spi_local: u32,
    /// The peer started a rekey of the same child at the same time;
    /// its exchange's lowest nonce decides the tie-break
    pub collision_peer_nonce: Option<Vec<u8>>,
}

impl std::fmt::Debug for PendingChildRekey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingChildRekey")
            .field("old_spi_local", &format_args!("{:#010x}", self.old_spi_local))
            .field("collision", &self.collision_peer_nonce.is_some())
            .finish()
    }
}

use std::time::Instant;

use ikewire::defs::params::ExchangeType;
use ikewire::defs::Message;
use tracing::debug;

use crate::engine::{Engine, Output};
use crate::sa::IkeSa;
use crate::timer::{TimerKey, TimerKind};
use crate::{Error, Result};

impl Engine {
    /// A request on an established (or establishing) SA: dedup against
    /// the response cache, open the envelope, dispatch by exchange
    pub(crate) fn handle_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        peer: std::net::SocketAddr,
        msg: &Message,
        raw: &[u8],
    ) -> Result<Vec<Output>> {
        if msg.message_id < sa.msgids.next_recv {
            // duplicate request: the cached response, never re-execution
            if let Some(cached) = sa.responses.get(msg.message_id) {
                debug!(message_id = msg.message_id, "answering duplicate from cache");
                return Ok(cached
                    .clone()
                    .into_iter()
                    .map(|bytes| self.datagram_out(sa, bytes))
                    .collect());
            }
            return Ok(vec![]);
        }
        if msg.message_id != sa.msgids.next_recv {
            debug!(
                message_id = msg.message_id,
                expected = sa.msgids.next_recv,
                "request outside the window"
            );
            return Ok(vec![]);
        }
        let Some(inner) = self.open_message(now, sa, msg, raw)? else {
            // fragments still missing
            return Ok(vec![]);
        };
        sa.reassembly.remove(msg.message_id);

        match msg.exchange_type {
            ExchangeType::IkeAuth => self.handle_auth_request(now, sa, msg, inner),
            ExchangeType::CreateChildSa => self.handle_create_child_request(now, sa, msg, inner),
            ExchangeType::Informational => {
                self.handle_informational_request(now, sa, peer, msg, inner)
            }
            _ => Err(Error::Protocol("unexpected exchange type")),
        }
    }

    /// A response to one of our requests: match it, cancel the
    /// retransmission, open the envelope, dispatch by exchange
    pub(crate) fn handle_response(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        raw: &[u8],
    ) -> Result<Vec<Output>> {
        let Some(request) = sa.requests.acknowledge(msg.message_id) else {
            debug!(message_id = msg.message_id, "response without a request");
            return Ok(vec![]);
        };
        self.timers.cancel(&TimerKey {
            sa: sa.local_spi(),
            kind: TimerKind::Retransmit(msg.message_id),
        });
        sa.dpd_misses = 0;

        let Some(inner) = self.open_message(now, sa, msg, raw)? else {
            return Ok(vec![]);
        };
        sa.reassembly.remove(msg.message_id);

        let mut outputs = match msg.exchange_type {
            ExchangeType::IkeAuth => self.handle_auth_response(now, sa, msg, inner)?,
            ExchangeType::CreateChildSa => {
                self.handle_create_child_response(now, sa, &request, msg, inner)?
            }
            ExchangeType::Informational => {
                self.handle_informational_response(now, sa, &request, msg, inner)?
            }
            _ => return Err(Error::Protocol("unexpected exchange type")),
        };

        // a freed window slot sends the next queued request
        if let Some((exchange, payloads)) = sa.outbox.pop_front() {
            outputs.extend(self.send_request(now, sa, exchange, payloads)?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use ikewire::defs::params::PseudorandomFunction;

    use super::*;

    #[test]
    fn psk_auth_is_keyed_and_deterministic() {
        let prf = Prf::new(PseudorandomFunction::HmacSha2_256);
        let a = psk_auth(&prf, b"secret", b"octets");
        assert_eq!(a, psk_auth(&prf, b"secret", b"octets"));
        assert_ne!(a, psk_auth(&prf, b"other", b"octets"));
        assert_ne!(a, psk_auth(&prf, b"secret", b"octetz"));
    }

    fn ts(start: &str, end: &str, proto: u8, ports: (u16, u16)) -> TrafficSelector {
        TrafficSelector {
            ts_type: TrafficSelectorType::Ipv4AddressRange,
            ip_protocol: proto,
            start_port: ports.0,
            end_port: ports.1,
            start_addr: start.parse::<IpAddr>().unwrap(),
            end_addr: end.parse::<IpAddr>().unwrap(),
        }
    }

    #[test]
    fn narrowing_accepts_contained_selectors() {
        let permitted = vec![ts("10.0.0.0", "10.0.255.255", 0, (0, 65535))];
        let offered = vec![ts("10.0.1.0", "10.0.1.255", 17, (0, 65535))];
        let narrowed = narrow_selectors(&offered, &permitted).unwrap();
        assert_eq!(narrowed, offered);
    }

    #[test]
    fn narrowing_rejects_wider_offers() {
        let permitted = vec![ts("10.0.0.0", "10.0.255.255", 0, (0, 65535))];
        let offered = vec![ts("10.0.0.0", "10.1.0.0", 0, (0, 65535))];
        assert!(narrow_selectors(&offered, &permitted).is_none());
    }

    #[test]
    fn id_hash_depends_on_identity() {
        let prf = Prf::new(PseudorandomFunction::HmacSha1);
        let a = id_hash(&prf, b"key", &IkeId::Fqdn("a.example.org".into()));
        let b = id_hash(&prf, b"key", &IkeId::Fqdn("b.example.org".into()));
        assert_ne!(a, b);
    }
}
