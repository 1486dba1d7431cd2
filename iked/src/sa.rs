//! The IKE SA and child SA data model
//!
//! An [IkeSa] exclusively owns its children, queues and reassembly
//! state; it shares its [Policy](crate::policy::Policy) through a
//! refcount and tags its children with the SPI pair instead of a back
//! pointer, so lookups stay index based.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ikewire::defs::params::{IdType, SecurityProtocol};
use ikewire::defs::{Identity, TrafficSelector};
use serde::{Deserialize, Serialize};

use crate::crypto::{DhExchange, Encr, Integrity, Prf};
use crate::frag::ReassemblyTable;
use crate::kdf::{ChildKeys, SkKeys};
use crate::msg::{ResponseCache, RetransmitQueue};
use crate::policy::{AddrPrefix, Lifetime, Policy};
use crate::proposal::{EspSuite, IkeSuite};
use crate::{Error, Result};

/// Which side of the IKE SA this daemon is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// We sent the first IKE_SA_INIT
    Initiator,
    /// The peer sent the first IKE_SA_INIT
    Responder,
}

/// Lifecycle state of an IKE SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SaState {
    /// Created, nothing sent yet
    Init,
    /// IKE_SA_INIT request is on the wire
    SaInitSent,
    /// IKE_SA_INIT completed, keys derived
    SaInitDone,
    /// IKE_AUTH request is on the wire
    AuthSent,
    /// An EAP conversation is in progress
    Eap,
    /// EAP succeeded, final AUTH pair outstanding
    EapSuccess,
    /// Peer authenticated, waiting for the first child to install
    AuthSuccess,
    /// Fully established
    Established,
    /// Delete requested or failed, draining
    Closing,
    /// Gone; kept only until the registry drops it
    Closed,
}

/// A peer or local identity in parsed form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IkeId {
    /// An IPv4 address identity
    Ipv4(Ipv4Addr),
    /// An IPv6 address identity
    Ipv6(Ipv6Addr),
    /// A fully qualified domain name
    Fqdn(String),
    /// An RFC 822 mail address
    UserFqdn(String),
    /// A DER encoded X.500 distinguished name
    Asn1Dn(Vec<u8>),
    /// An opaque octet string
    KeyId(Vec<u8>),
}

impl IkeId {
    /// Parse a wire identity payload into its typed form
    pub fn from_wire(id: &Identity) -> Result<Self> {
        Ok(match id.id_type {
            IdType::Ipv4Address => {
                let octets: [u8; 4] = id
                    .data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Protocol("malformed IPv4 identity"))?;
                IkeId::Ipv4(octets.into())
            }
            IdType::Ipv6Address => {
                let octets: [u8; 16] = id
                    .data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Protocol("malformed IPv6 identity"))?;
                IkeId::Ipv6(octets.into())
            }
            IdType::Fqdn => IkeId::Fqdn(
                String::from_utf8(id.data.clone())
                    .map_err(|_| Error::Protocol("FQDN identity is not UTF-8"))?,
            ),
            IdType::UserFqdn => IkeId::UserFqdn(
                String::from_utf8(id.data.clone())
                    .map_err(|_| Error::Protocol("USER_FQDN identity is not UTF-8"))?,
            ),
            IdType::DerAsn1Dn => IkeId::Asn1Dn(id.data.clone()),
            IdType::KeyId => IkeId::KeyId(id.data.clone()),
            IdType::DerAsn1Gn => return Err(Error::Protocol("GeneralName identities unsupported")),
        })
    }

    /// Encode into the wire identity payload
    pub fn to_wire(&self) -> Identity {
        match self {
            IkeId::Ipv4(addr) => Identity {
                id_type: IdType::Ipv4Address,
                data: addr.octets().to_vec(),
            },
            IkeId::Ipv6(addr) => Identity {
                id_type: IdType::Ipv6Address,
                data: addr.octets().to_vec(),
            },
            IkeId::Fqdn(name) => Identity {
                id_type: IdType::Fqdn,
                data: name.as_bytes().to_vec(),
            },
            IkeId::UserFqdn(name) => Identity {
                id_type: IdType::UserFqdn,
                data: name.as_bytes().to_vec(),
            },
            IkeId::Asn1Dn(der) => Identity {
                id_type: IdType::DerAsn1Dn,
                data: der.clone(),
            },
            IkeId::KeyId(data) => Identity {
                id_type: IdType::KeyId,
                data: data.clone(),
            },
        }
    }

    /// The identity of a plain address, used when nothing is configured
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IkeId::Ipv4(v4),
            IpAddr::V6(v6) => IkeId::Ipv6(v6),
        }
    }
}

impl std::fmt::Display for IkeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IkeId::Ipv4(a) => write!(f, "{a}"),
            IkeId::Ipv6(a) => write!(f, "{a}"),
            IkeId::Fqdn(n) => write!(f, "{n}"),
            IkeId::UserFqdn(n) => write!(f, "{n}"),
            IkeId::Asn1Dn(der) => write!(f, "dn:{} octets", der.len()),
            IkeId::KeyId(data) => write!(f, "keyid:{} octets", data.len()),
        }
    }
}

/// NAT traversal state of an SA
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NatState {
    /// Our address/port hash did not match: we are behind a NAT
    pub local_behind: bool,
    /// The peer's hash did not match: it is behind a NAT
    pub peer_behind: bool,
    /// Traffic floated to the NAT-T port with non-ESP markers
    pub active: bool,
}

impl NatState {
    /// Whether any NAT sits between the peers
    pub fn detected(&self) -> bool {
        self.local_behind || self.peer_behind
    }
}

/// Message id bookkeeping for one SA
#[derive(Debug, Clone, Copy)]
pub struct MsgIds {
    /// Id of the next request we will send
    pub next_send: u32,
    /// Id of the next request we expect from the peer
    pub next_recv: u32,
    /// Window size granted by the peer via SET_WINDOW_SIZE
    pub window: u32,
}

impl Default for MsgIds {
    fn default() -> Self {
        Self {
            next_send: 0,
            next_recv: 0,
            window: 1,
        }
    }
}

/// The negotiated algorithm objects of an established IKE SA
pub struct IkeCrypto {
    /// Pseudorandom function for all derivations
    pub prf: Prf,
    /// Encryption suite of the SK payload
    pub encr: Encr,
    /// Integrity transform; `None` for AEAD suites
    pub integ: Option<Integrity>,
}

/// A parent security association with one peer
pub struct IkeSa {
    /// SPI chosen by the initiator side
    pub spi_i: u64,
    /// SPI chosen by the responder side; zero while half open
    pub spi_r: u64,
    /// Which side we are
    pub role: Role,
    /// Current state
    pub state: SaState,
    /// The policy this SA was born from
    pub policy: Arc<Policy>,
    /// Negotiated IKE transform combination
    pub suite: Option<IkeSuite>,
    /// Selected algorithm objects, present from SaInitDone on
    pub ike_crypto: Option<IkeCrypto>,
    /// In-flight key exchange, consumed when the peer's share arrives
    pub dh: Option<DhExchange>,
    /// Initiator nonce
    pub nonce_i: Vec<u8>,
    /// Responder nonce
    pub nonce_r: Vec<u8>,
    /// The seven SK_ keys; immutable once Established, replaced only by
    /// a rekey creating a successor SA
    pub keys: Option<SkKeys>,
    /// Identity we present
    pub local_id: Option<IkeId>,
    /// Identity the peer proved
    pub peer_id: Option<IkeId>,
    /// DER certificate the peer sent, for the CA process
    pub peer_cert: Option<Vec<u8>>,
    /// Our UDP endpoint
    pub local: SocketAddr,
    /// The peer's UDP endpoint
    pub peer: SocketAddr,
    /// NAT traversal state
    pub nat: NatState,
    /// Message id windows
    pub msgids: MsgIds,
    /// Outstanding requests awaiting their response
    pub requests: RetransmitQueue,
    /// Cached responses answering duplicate requests
    pub responses: ResponseCache,
    /// Verbatim octets of our IKE_SA_INIT message, signed during AUTH
    pub our_init_message: Vec<u8>,
    /// Verbatim octets of the peer's IKE_SA_INIT message
    pub peer_init_message: Vec<u8>,
    /// Cookie the responder demanded, echoed in the retry
    pub cookie: Option<Vec<u8>>,
    /// Children owned by this SA
    pub children: Vec<ChildSa>,
    /// Kernel flows installed on behalf of this SA
    pub flows: Vec<Flow>,
    /// Fragment reassembly bookkeeping
    pub reassembly: ReassemblyTable,
    /// Peer advertised MOBIKE_SUPPORTED
    pub peer_mobike: bool,
    /// Peer advertised IKEV2_FRAGMENTATION_SUPPORTED
    pub peer_frag: bool,
    /// Peer advertised SHA-2 capable signature hashes (RFC 7427)
    pub peer_sigsha2: bool,
    /// Consecutive unanswered liveness probes
    pub dpd_misses: u32,
    /// Address leased to the peer from the policy pool
    pub pool_lease: Option<IpAddr>,
    /// In-flight rekey of this IKE SA
    pub rekey: Option<RekeyState>,
    /// In-flight rekey of one of the children
    pub child_rekey: Option<crate::exchange::PendingChildRekey>,
    /// EAP conversation state on the responder
    pub eap: Option<crate::eap::EapState>,
    /// MSK derived by a completed EAP method
    pub eap_msk: Option<zeroize::Zeroizing<Vec<u8>>>,
    /// An UPDATE_SA_ADDRESSES request of ours is outstanding
    pub mobike_pending: bool,
    /// Parked sub-state while the CA process works on this SA
    pub awaiting_ca: Option<crate::exchange::AwaitingCa>,
    /// Requests waiting for a free slot in the peer's window
    pub outbox: std::collections::VecDeque<(ikewire::defs::params::ExchangeType, Vec<ikewire::defs::Payload>)>,
}

impl std::fmt::Debug for IkeSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeSa")
            .field("spi_i", &format_args!("{:#018x}", self.spi_i))
            .field("spi_r", &format_args!("{:#018x}", self.spi_r))
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Tracking of a CREATE_CHILD_SA exchange rekeying this IKE SA
#[derive(Debug)]
pub struct RekeyState {
    /// SPI pair of the successor SA being keyed
    pub new_spi_i: u64,
    /// Responder half of the successor SPI pair
    pub new_spi_r: u64,
    /// Our nonce in the rekey exchange, for the collision tie-break
    pub our_nonce: Vec<u8>,
    /// Peer nonce once seen
    pub peer_nonce: Option<Vec<u8>>,
}

impl IkeSa {
    /// The SPI the registry files this SA under
    pub fn local_spi(&self) -> u64 {
        match self.role {
            Role::Initiator => self.spi_i,
            Role::Responder => self.spi_r,
        }
    }

    /// Both SPI halves as the child SA parent tag
    pub fn spi_pair(&self) -> (u64, u64) {
        (self.spi_i, self.spi_r)
    }

    /// Whether this SA may carry encrypted exchanges yet
    pub fn has_keys(&self) -> bool {
        self.keys.is_some() && self.ike_crypto.is_some()
    }

    /// Enforce the invariants of the Established state
    pub fn establish(&mut self) -> Result<()> {
        if self.spi_i == 0 || self.spi_r == 0 {
            return Err(Error::Internal("established SA with a zero SPI".into()));
        }
        if !self.has_keys() {
            return Err(Error::Internal("established SA without keys".into()));
        }
        self.state = SaState::Established;
        Ok(())
    }

    /// Find one of our children by the SPI the peer addresses it with
    pub fn child_by_peer_spi(&mut self, spi: u32) -> Option<&mut ChildSa> {
        self.children.iter_mut().find(|c| c.spi_peer == spi)
    }

    /// Find one of our children by our inbound SPI
    pub fn child_by_local_spi(&mut self, spi: u32) -> Option<&mut ChildSa> {
        self.children.iter_mut().find(|c| c.spi_local == spi)
    }

    /// Keys protecting what we send and what we receive, in that order
    pub fn send_recv_keys(&self) -> Result<(&[u8], &[u8], &[u8], &[u8])> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(Error::Internal("no keys on SA".into()))?;
        Ok(match self.role {
            Role::Initiator => (&keys.sk_ei, &keys.sk_ai, &keys.sk_er, &keys.sk_ar),
            Role::Responder => (&keys.sk_er, &keys.sk_ar, &keys.sk_ei, &keys.sk_ai),
        })
    }
}

/// Direction of a kernel flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FlowDirection {
    /// Cleartext entering the tunnel
    Out,
    /// Decrypted traffic leaving the tunnel
    In,
}

/// A kernel policy entry telling it which packets to protect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Flow {
    /// Source prefix
    pub src: AddrPrefix,
    /// Destination prefix
    pub dst: AddrPrefix,
    /// Upper layer protocol, zero for any
    pub proto: u8,
    /// Direction of the entry
    pub direction: FlowDirection,
    /// Routing domain it lives in
    pub rdomain: u32,
}

/// A pair of ESP keys for one selector bundle
pub struct ChildSa {
    /// SPI of our inbound SA (the peer sends with it)
    pub spi_local: u32,
    /// SPI of the peer's inbound SA (we send with it)
    pub spi_peer: u32,
    /// ESP or AH
    pub protocol: SecurityProtocol,
    /// Negotiated transform combination
    pub suite: EspSuite,
    /// Derived key material; kept for MOBIKE endpoint updates
    pub keys: Option<ChildKeys>,
    /// Selectors restricting traffic we emit
    pub ts_local: Vec<TrafficSelector>,
    /// Selectors restricting traffic the peer emits
    pub ts_peer: Vec<TrafficSelector>,
    /// SPI pair of the owning IKE SA, a non-owning tag
    pub parent: (u64, u64),
    /// Whether the child was created by our CREATE_CHILD_SA/IKE_AUTH
    /// request (key directions depend on it)
    pub initiated_by_us: bool,
    /// Compression parameter index when IPCOMP was negotiated
    pub ipcomp_cpi: Option<u16>,
    /// Present in the kernel SADB
    pub loaded: bool,
    /// Rekey and expiry limits
    pub lifetime: Lifetime,
    /// Seconds the SA has been installed, fed by kernel queries
    pub age: Duration,
}

impl std::fmt::Debug for ChildSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSa")
            .field("spi_local", &format_args!("{:#010x}", self.spi_local))
            .field("spi_peer", &format_args!("{:#010x}", self.spi_peer))
            .field("loaded", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn identity_wire_roundtrip() {
        let ids = [
            IkeId::Ipv4("192.0.2.1".parse().unwrap()),
            IkeId::Ipv6("2001:db8::1".parse().unwrap()),
            IkeId::Fqdn("gw.example.org".into()),
            IkeId::UserFqdn("user@example.org".into()),
            IkeId::Asn1Dn(vec![0x30, 0x03, 0x31, 0x01, 0x00]),
            IkeId::KeyId(vec![1, 2, 3, 4]),
        ];
        for id in ids {
            assert_eq!(IkeId::from_wire(&id.to_wire()).unwrap(), id);
        }
    }

    #[test]
    fn malformed_address_identity_is_rejected() {
        let id = Identity {
            id_type: IdType::Ipv4Address,
            data: vec![1, 2, 3],
        };
        assert!(IkeId::from_wire(&id).is_err());
    }
}
