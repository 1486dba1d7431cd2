//! Administrator-declared policies and the compiled, skip-step indexed
//! policy table used to match incoming connections
//!
//! Policies keep their configuration order as priority. For every policy
//! and every match attribute the compiled table stores the index of the
//! next policy that differs in that attribute, so a failed comparison
//! jumps over the whole span of policies sharing the value instead of
//! testing them one by one.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::proposal::{EspTransforms, IkeTransforms};
use crate::sa::IkeId;

/// An address prefix such as `10.0.1.0/24`, used for peer and traffic
/// matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPrefix {
    /// Network address
    pub addr: IpAddr,
    /// Prefix length in bits
    pub prefix_len: u8,
}

impl AddrPrefix {
    /// A prefix matching any IPv4 address
    pub fn any4() -> Self {
        Self {
            addr: IpAddr::from([0, 0, 0, 0]),
            prefix_len: 0,
        }
    }

    /// A prefix matching any IPv6 address
    pub fn any6() -> Self {
        Self {
            addr: IpAddr::from([0u16; 8]),
            prefix_len: 0,
        }
    }

    /// Whether `other` lies within this prefix; addresses of a different
    /// family never match
    pub fn contains(&self, other: &IpAddr) -> bool {
        match (self.addr, other) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix_len.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix_len.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }

    /// First and last address of the prefix, for traffic selector ranges
    pub fn range(&self) -> (IpAddr, IpAddr) {
        match self.addr {
            IpAddr::V4(net) => {
                let bits = u32::from(self.prefix_len.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                let base = u32::from(net) & mask;
                (
                    IpAddr::V4((base).into()),
                    IpAddr::V4((base | !mask).into()),
                )
            }
            IpAddr::V6(net) => {
                let bits = u32::from(self.prefix_len.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                let base = u128::from(net) & mask;
                (
                    IpAddr::V6((base).into()),
                    IpAddr::V6((base | !mask).into()),
                )
            }
        }
    }
}

/// How a policy authenticates its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    /// A pre-shared key known to both sides
    PreSharedKey(Vec<u8>),
    /// Certificate based digital signatures; the concrete method follows
    /// the key type and the peer's advertised hash algorithms
    Signature,
    /// Raw public key lookup from the pubkey directory
    RawPublicKey,
    /// The responder demands an EAP conversation; the inner method
    /// authenticates against the user database while the gateway proves
    /// itself with the shared credential
    EapMschapV2 {
        /// name → password source
        users: Vec<EapUser>,
        /// credential the gateway's own AUTH payload is computed with
        gateway_psk: Vec<u8>,
    },
}

/// One user of the EAP database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EapUser {
    /// Login name transmitted in the EAP identity
    pub name: String,
    /// The user's password
    pub password: String,
}

/// Whether the daemon dials out for this policy or only answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    /// Initiate as soon as the daemon starts (or the policy loads)
    Active,
    /// Wait for the peer to initiate
    Passive,
}

/// One flow (traffic selector pair) of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Source prefix of cleartext traffic to protect
    pub src: AddrPrefix,
    /// Destination prefix of cleartext traffic to protect
    pub dst: AddrPrefix,
    /// Upper layer protocol, zero for any
    pub proto: u8,
}

/// Lifetimes after which a child SA is rekeyed or torn down
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Lifetime {
    /// Soft byte limit triggering a rekey
    pub soft_bytes: u64,
    /// Hard byte limit tearing the SA down
    pub hard_bytes: u64,
    /// Soft time limit triggering a rekey, seconds
    pub soft_seconds: u64,
    /// Hard time limit tearing the SA down, seconds
    pub hard_seconds: u64,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self {
            soft_bytes: 4 * 1024 * 1024 * 1024,
            hard_bytes: 5 * 1024 * 1024 * 1024,
            soft_seconds: 3 * 3600,
            hard_seconds: 4 * 3600,
        }
    }
}

/// The administrator-declared template binding a peer selector to
/// proposals, authentication, traffic selectors and virtual-interface
/// configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTemplate {
    /// Name for logging and the control interface
    pub name: String,
    /// Dial or answer
    pub mode: PolicyMode,
    /// Peer addresses this policy covers; `None` matches any peer
    pub peer: Option<AddrPrefix>,
    /// Local addresses this policy covers; `None` matches any
    pub local: Option<AddrPrefix>,
    /// Remote identity required of the peer, if any
    pub peer_id: Option<IkeId>,
    /// Identity presented to the peer, overriding the global one
    pub local_id: Option<IkeId>,
    /// Authentication for both sides
    pub auth: AuthConfig,
    /// IKE SA transforms; `None` selects the built-in default set
    pub ike_transforms: Option<IkeTransforms>,
    /// Child SA transforms; `None` selects the built-in default set
    pub esp_transforms: Option<EspTransforms>,
    /// Flows negotiated for the first and subsequent child SAs
    pub flows: Vec<FlowConfig>,
    /// Inner addresses handed to peers requesting one
    pub pool: Option<AddrPrefix>,
    /// Ask the peer for an inner address when dialing out
    #[serde(default)]
    pub request_address: bool,
    /// Child SA lifetimes
    pub lifetime: Lifetime,
    /// Require a fresh DH exchange on every child rekey
    pub pfs: bool,
}

impl PolicyTemplate {
    /// Check template consistency; called from config validation
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("policy without a name".into());
        }
        if self.flows.is_empty() {
            return Err(format!("policy {} has no flows", self.name));
        }
        if self.lifetime.soft_bytes >= self.lifetime.hard_bytes
            || self.lifetime.soft_seconds >= self.lifetime.hard_seconds
        {
            return Err(format!(
                "policy {}: soft lifetime must undercut the hard lifetime",
                self.name
            ));
        }
        if let AuthConfig::PreSharedKey(key) = &self.auth {
            if key.is_empty() {
                return Err(format!("policy {} has an empty pre-shared key", self.name));
            }
        }
        Ok(())
    }
}

/// The match attributes a skip step is kept for, in comparison order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum SkipAttr {
    AddressFamily = 0,
    PeerPrefix = 1,
    LocalPrefix = 2,
}

const SKIP_COUNT: usize = 3;

/// A compiled policy shared between the table and the SAs born from it
///
/// SAs hold an `Arc` of their policy, so a policy logically removed on
/// reload lingers until its last SA releases it; the table itself only
/// ever hands out clones of the `Arc`.
#[derive(Debug)]
pub struct Policy {
    /// The administrator's template
    pub template: PolicyTemplate,
    /// Position in the compiled table, used by the control interface
    pub index: usize,
}

/// The compiled, ordered policy table
#[derive(Debug, Default)]
pub struct PolicyTable {
    policies: Vec<Arc<Policy>>,
    /// skips[i][attr] is the index of the first policy after `i` whose
    /// attribute differs from policy i's
    skips: Vec<[usize; SKIP_COUNT]>,
}

fn family_of(prefix: Option<&AddrPrefix>) -> Option<bool> {
    prefix.map(|p| p.addr.is_ipv4())
}

impl PolicyTable {
    /// Compile the template list into a searchable table
    pub fn compile(templates: &[PolicyTemplate]) -> Self {
        let policies: Vec<Arc<Policy>> = templates
            .iter()
            .enumerate()
            .map(|(index, template)| {
                Arc::new(Policy {
                    template: template.clone(),
                    index,
                })
            })
            .collect();

        let count = policies.len();
        let mut skips = vec![[0usize; SKIP_COUNT]; count];
        for i in 0..count {
            for attr in [
                SkipAttr::AddressFamily,
                SkipAttr::PeerPrefix,
                SkipAttr::LocalPrefix,
            ] {
                let mut next = i + 1;
                while next < count && !Self::attr_differs(&policies[i], &policies[next], attr) {
                    next += 1;
                }
                skips[i][attr as usize] = next;
            }
        }
        Self { policies, skips }
    }

    fn attr_differs(a: &Policy, b: &Policy, attr: SkipAttr) -> bool {
        match attr {
            SkipAttr::AddressFamily => {
                family_of(a.template.peer.as_ref()) != family_of(b.template.peer.as_ref())
            }
            SkipAttr::PeerPrefix => a.template.peer != b.template.peer,
            SkipAttr::LocalPrefix => a.template.local != b.template.local,
        }
    }

    /// Find the highest priority policy matching a peer
    ///
    /// `peer_id` is `None` before the peer authenticated; a policy
    /// demanding an identity still matches then and is re-checked once
    /// the identity is proven.
    pub fn lookup(
        &self,
        local: &IpAddr,
        peer: &IpAddr,
        peer_id: Option<&IkeId>,
    ) -> Option<Arc<Policy>> {
        let mut i = 0;
        while i < self.policies.len() {
            let policy = &self.policies[i];
            let template = &policy.template;

            if let Some(prefix) = &template.peer {
                if prefix.addr.is_ipv4() != peer.is_ipv4() {
                    i = self.skips[i][SkipAttr::AddressFamily as usize];
                    continue;
                }
                if !prefix.contains(peer) {
                    i = self.skips[i][SkipAttr::PeerPrefix as usize];
                    continue;
                }
            }
            if let Some(prefix) = &template.local {
                if !prefix.contains(local) {
                    i = self.skips[i][SkipAttr::LocalPrefix as usize];
                    continue;
                }
            }
            if let (Some(required), Some(offered)) = (&template.peer_id, peer_id) {
                if required != offered {
                    i += 1;
                    continue;
                }
            }
            debug!(policy = %template.name, "policy matched");
            return Some(policy.clone());
        }
        None
    }

    /// All policies in priority order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }

    /// Number of compiled policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::IkeId;

    fn template(name: &str, peer: Option<AddrPrefix>) -> PolicyTemplate {
        PolicyTemplate {
            name: name.into(),
            mode: PolicyMode::Passive,
            peer,
            local: None,
            peer_id: None,
            local_id: None,
            auth: AuthConfig::PreSharedKey(b"test".to_vec()),
            ike_transforms: None,
            esp_transforms: None,
            flows: vec![FlowConfig {
                src: AddrPrefix::any4(),
                dst: AddrPrefix::any4(),
                proto: 0,
            }],
            pool: None,
            request_address: false,
            lifetime: Lifetime::default(),
            pfs: false,
        }
    }

    fn prefix(s: &str, len: u8) -> AddrPrefix {
        AddrPrefix {
            addr: s.parse().unwrap(),
            prefix_len: len,
        }
    }

    #[test]
    fn prefix_contains() {
        let p = prefix("10.1.0.0", 16);
        assert!(p.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!p.contains(&"10.2.2.3".parse().unwrap()));
        assert!(!p.contains(&"::1".parse().unwrap()));
        assert!(AddrPrefix::any4().contains(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn prefix_range() {
        let (start, end) = prefix("192.0.2.0", 24).range();
        assert_eq!(start, "192.0.2.0".parse::<IpAddr>().unwrap());
        assert_eq!(end, "192.0.2.255".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn lookup_priority_order() {
        let table = PolicyTable::compile(&[
            template("specific", Some(prefix("192.0.2.0", 24))),
            template("wide", Some(prefix("192.0.0.0", 8))),
            template("any", None),
        ]);
        let local = "10.0.0.1".parse().unwrap();
        let hit = table
            .lookup(&local, &"192.0.2.7".parse().unwrap(), None)
            .unwrap();
        assert_eq!(hit.template.name, "specific");
        let hit = table
            .lookup(&local, &"192.0.9.7".parse().unwrap(), None)
            .unwrap();
        assert_eq!(hit.template.name, "wide");
        let hit = table
            .lookup(&local, &"203.0.113.9".parse().unwrap(), None)
            .unwrap();
        assert_eq!(hit.template.name, "any");
    }

    #[test]
    fn skip_steps_jump_shared_prefixes() {
        // five policies sharing a peer prefix differing only in peer id,
        // then a distinct catch-all: a peer outside the prefix must land
        // on the catch-all without visiting the clones one by one
        let mut templates = vec![];
        for i in 0..5 {
            let mut t = template(&format!("clone{i}"), Some(prefix("198.51.100.0", 24)));
            t.peer_id = Some(IkeId::Fqdn(format!("peer{i}.example.org")));
            templates.push(t);
        }
        templates.push(template("fallback", None));
        let table = PolicyTable::compile(&templates);

        // the skip entry of the first clone jumps directly to the fallback
        assert_eq!(table.skips[0][SkipAttr::PeerPrefix as usize], 5);

        let hit = table
            .lookup(
                &"10.0.0.1".parse().unwrap(),
                &"203.0.113.1".parse().unwrap(),
                None,
            )
            .unwrap();
        assert_eq!(hit.template.name, "fallback");
    }

    #[test]
    fn id_mismatch_falls_through() {
        let mut a = template("with-id", Some(prefix("198.51.100.0", 24)));
        a.peer_id = Some(IkeId::Fqdn("alpha.example.org".into()));
        let b = template("without-id", Some(prefix("198.51.100.0", 24)));
        let table = PolicyTable::compile(&[a, b]);

        let id = IkeId::Fqdn("beta.example.org".into());
        let hit = table
            .lookup(
                &"10.0.0.1".parse().unwrap(),
                &"198.51.100.3".parse().unwrap(),
                Some(&id),
            )
            .unwrap();
        assert_eq!(hit.template.name, "without-id");
    }
}
