//! The in-memory configuration object handed to the core at startup and
//! on reload
//!
//! Parsing a configuration file into this object is the job of an
//! external frontend; the core only validates and ingests it. A rejected
//! reload keeps the previous configuration in force.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyTemplate;
use crate::{Error, Result};

/// Default IKE port
pub const IKE_PORT: u16 = 500;
/// Default NAT traversal port
pub const NATT_PORT: u16 = 4500;

/// Everything the daemon can be told by its administrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ordered list of peer-match templates
    pub policies: Vec<PolicyTemplate>,
    /// Identity presented to peers when a policy does not override it
    pub local_id: Option<crate::sa::IkeId>,
    /// Path of the local certificate matching `local_id`
    pub local_cert: Option<PathBuf>,
    /// Directory holding trust anchor certificates
    pub ca_dir: PathBuf,
    /// Directory holding certificate revocation lists
    pub crl_dir: PathBuf,
    /// Directory holding local identity certificates
    pub cert_dir: PathBuf,
    /// Directory holding raw public keys, named by peer identity
    pub pubkey_dir: PathBuf,
    /// Addresses to bind the IKE and NAT-T sockets on
    pub listen: Vec<IpAddr>,
    /// IKE port, 500 unless testing
    pub ike_port: u16,
    /// NAT-T port, 4500 unless testing
    pub natt_port: u16,
    /// Offer and accept RFC 7383 message fragmentation
    pub fragmentation: bool,
    /// Offer and accept RFC 4555 MOBIKE
    pub mobike: bool,
    /// Delete an existing IKE SA of the same peer identity once a new
    /// one establishes
    pub enforce_single_ike_sa: bool,
    /// Hand a reconnecting peer the inner address it held before
    pub sticky_address_pool: bool,
    /// Interval between dead peer detection probes on an idle SA
    pub dpd_interval: Duration,
    /// Consecutive unanswered probes before the peer counts as dead
    pub dpd_retries: u32,
    /// Interval between NAT-T keepalive packets
    pub natt_keepalive: Duration,
    /// OCSP responder to query, if any
    pub ocsp_url: Option<String>,
    /// Accepted clock skew of OCSP responses
    pub ocsp_tolerate: Duration,
    /// Maximum age of an OCSP response, zero for no limit
    pub ocsp_maxage: Duration,
    /// Kernel routing table / rdomain the flows are installed in
    pub rdomain: u32,
    /// Upper bound accepted for a peer's SET_WINDOW_SIZE
    pub max_window: u32,
    /// Interface index of the virtual interface leased inner addresses
    /// land on; `None` disables route programming
    #[serde(default)]
    pub vroute_ifindex: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policies: vec![],
            local_id: None,
            local_cert: None,
            ca_dir: PathBuf::from("/etc/iked/ca"),
            crl_dir: PathBuf::from("/etc/iked/crls"),
            cert_dir: PathBuf::from("/etc/iked/certs"),
            pubkey_dir: PathBuf::from("/etc/iked/pubkeys"),
            listen: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            ike_port: IKE_PORT,
            natt_port: NATT_PORT,
            fragmentation: true,
            mobike: true,
            enforce_single_ike_sa: false,
            sticky_address_pool: false,
            dpd_interval: Duration::from_secs(60),
            dpd_retries: 5,
            natt_keepalive: Duration::from_secs(20),
            ocsp_url: None,
            ocsp_tolerate: Duration::from_secs(30),
            ocsp_maxage: Duration::ZERO,
            rdomain: 0,
            max_window: 32,
            vroute_ifindex: None,
        }
    }
}

impl Config {
    /// Validate a configuration before it replaces the running one
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::Config("no listen address".into()));
        }
        if self.ike_port == self.natt_port {
            return Err(Error::Config("IKE and NAT-T port must differ".into()));
        }
        if self.max_window == 0 {
            return Err(Error::Config("window size lower bound is 1".into()));
        }
        if self.dpd_retries == 0 {
            return Err(Error::Config("at least one DPD retry is required".into()));
        }
        for (i, policy) in self.policies.iter().enumerate() {
            policy
                .validate()
                .map_err(|e| Error::Config(format!("policy {i}: {e}")))?;
        }
        Ok(())
    }

    /// Socket addresses for the IKE port binds
    pub fn ike_binds(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.listen.iter().map(|a| SocketAddr::new(*a, self.ike_port))
    }

    /// Socket addresses for the NAT-T port binds
    pub fn natt_binds(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.listen
            .iter()
            .map(|a| SocketAddr::new(*a, self.natt_port))
    }
}
