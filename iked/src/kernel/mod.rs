//! The kernel IPsec coupling: programming ESP SAs and flow policies
//! through a platform backend
//!
//! The state machine only ever talks to the [SadbBackend] trait; the
//! PF_KEYv2 implementation in [pfkey] programs a real kernel and the
//! in-memory implementation in [mock] backs the tests.

pub mod mock;
pub mod pfkey;

use std::net::IpAddr;
use std::time::Duration;

use ikewire::defs::params::{EncryptionAlgorithm, IntegrityAlgorithm, SecurityProtocol};

use crate::sa::{ChildSa, Flow, IkeSa};
use crate::{Error, Result};

/// Everything a backend needs to install one directed ESP SA
#[derive(Debug, Clone)]
pub struct KernelSa {
    /// SPI the receiving side demultiplexes on
    pub spi: u32,
    /// ESP or AH
    pub protocol: SecurityProtocol,
    /// Outer source address
    pub src: IpAddr,
    /// Outer destination address
    pub dst: IpAddr,
    /// Encryption algorithm and key material (key plus salt)
    pub encr: (EncryptionAlgorithm, Vec<u8>),
    /// Integrity algorithm and key, absent for AEAD suites
    pub integ: Option<(IntegrityAlgorithm, Vec<u8>)>,
    /// Extended sequence numbers
    pub esn: bool,
    /// UDP encapsulation ports when NAT-T is active (src, dst)
    pub udpencap: Option<(u16, u16)>,
    /// Routing domain
    pub rdomain: u32,
}

/// Lifetime counters the kernel reports for an installed SA
#[derive(Debug, Clone, Copy, Default)]
pub struct SaLifetimes {
    /// Hard byte limit
    pub hard_bytes: u64,
    /// Soft byte limit
    pub soft_bytes: u64,
    /// Bytes processed so far
    pub current_bytes: u64,
    /// Seconds since installation
    pub current_age: Duration,
}

/// The SA programmer every platform implements once
pub trait SadbBackend: Send {
    /// Downcast support for tests inspecting a mock backend
    fn as_any(&self) -> &dyn std::any::Any;
    /// Install a directed SA; returns once the kernel confirmed it
    fn add(&mut self, sa: &KernelSa) -> Result<()>;
    /// Remove a directed SA; removing an absent SA is not an error
    fn delete(&mut self, sa: &KernelSa) -> Result<()>;
    /// Seconds since the SA last carried traffic, `None` for never
    fn last_used(&mut self, sa: &KernelSa) -> Result<Option<Duration>>;
    /// Lifetime counters feeding the rekey and expire logic
    fn lifetimes(&mut self, sa: &KernelSa) -> Result<SaLifetimes>;
    /// Rewrite the outer addresses of an installed SA (MOBIKE)
    fn update_addresses(
        &mut self,
        sa: &KernelSa,
        src: IpAddr,
        dst: IpAddr,
        udpencap: Option<(u16, u16)>,
    ) -> Result<()>;
    /// Install a flow policy
    fn flow_add(&mut self, flow: &Flow) -> Result<()>;
    /// Remove a flow policy; removing an absent flow is not an error
    fn flow_delete(&mut self, flow: &Flow) -> Result<()>;
    /// Drop every SA and flow this daemon installed
    fn flush(&mut self) -> Result<()>;
}

/// Build the inbound/outbound kernel SA pair of a child
///
/// The initiator of the child's creation uses the initiator-to-responder
/// keys for what it sends; key directions flip on the other side.
pub fn kernel_pair(ike: &IkeSa, child: &ChildSa, rdomain: u32) -> Result<(KernelSa, KernelSa)> {
    let keys = child
        .keys
        .as_ref()
        .ok_or(Error::Internal("child SA without key material".into()))?;
    let (encr_alg, _) = child.suite.encr;
    let integ_alg = child.suite.integ;

    // the creator of the child sends with the initiator-to-responder keys
    let (out_e, out_a, in_e, in_a) = if child.initiated_by_us {
        (&keys.encr_i, &keys.integ_i, &keys.encr_r, &keys.integ_r)
    } else {
        (&keys.encr_r, &keys.integ_r, &keys.encr_i, &keys.integ_i)
    };

    let udpencap = ike
        .nat
        .active
        .then(|| (ike.local.port(), ike.peer.port()));
    let outbound = KernelSa {
        spi: child.spi_peer,
        protocol: child.protocol,
        src: ike.local.ip(),
        dst: ike.peer.ip(),
        encr: (encr_alg, out_e.to_vec()),
        integ: integ_alg.map(|alg| (alg, out_a.to_vec())),
        esn: child.suite.esn == ikewire::defs::params::ExtendedSequenceNumbers::Esn,
        udpencap,
        rdomain,
    };
    let inbound = KernelSa {
        spi: child.spi_local,
        protocol: child.protocol,
        src: ike.peer.ip(),
        dst: ike.local.ip(),
        encr: (encr_alg, in_e.to_vec()),
        integ: integ_alg.map(|alg| (alg, in_a.to_vec())),
        esn: child.suite.esn == ikewire::defs::params::ExtendedSequenceNumbers::Esn,
        udpencap: udpencap.map(|(s, d)| (d, s)),
        rdomain,
    };
    Ok((inbound, outbound))
}
