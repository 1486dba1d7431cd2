//! The PF_KEYv2 (RFC 2367) backend programming the kernel SADB over an
//! AF_KEY socket
//!
//! Messages are built from packed extension structs; all PF_KEY lengths
//! count 8-octet units and, unlike the IKE wire format, stay in host
//! byte order (SPIs inside the sadb_sa extension are the exception and
//! travel in network order). Replies are matched on the sequence number
//! and the kernel's errno field is surfaced as a kernel error.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use ikewire::defs::params::{EncryptionAlgorithm, IntegrityAlgorithm, SecurityProtocol};
use tracing::{debug, warn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::sa::{Flow, FlowDirection};
use crate::{Error, Result};

use super::{KernelSa, SadbBackend, SaLifetimes};

const PF_KEY_V2: i32 = 2;

const SADB_UPDATE: u8 = 2;
const SADB_ADD: u8 = 3;
const SADB_DELETE: u8 = 4;
const SADB_GET: u8 = 5;
const SADB_FLUSH: u8 = 9;
const SADB_X_SPDADD: u8 = 18;
const SADB_X_SPDDELETE: u8 = 19;
const SADB_X_SPDFLUSH: u8 = 21;

const SADB_SATYPE_AH: u8 = 2;
const SADB_SATYPE_ESP: u8 = 3;

const SADB_EXT_SA: u16 = 1;
const SADB_EXT_LIFETIME_CURRENT: u16 = 2;
const SADB_EXT_LIFETIME_HARD: u16 = 3;
const SADB_EXT_LIFETIME_SOFT: u16 = 4;
const SADB_EXT_ADDRESS_SRC: u16 = 5;
const SADB_EXT_ADDRESS_DST: u16 = 6;
const SADB_EXT_KEY_AUTH: u16 = 8;
const SADB_EXT_KEY_ENCRYPT: u16 = 9;
const SADB_X_EXT_POLICY: u16 = 18;
const SADB_X_EXT_NAT_T_TYPE: u16 = 20;
const SADB_X_EXT_NAT_T_SPORT: u16 = 21;
const SADB_X_EXT_NAT_T_DPORT: u16 = 22;

const SADB_SASTATE_MATURE: u8 = 1;

// authentication algorithm numbers of the kernel registry
const SADB_AALG_SHA1HMAC: u8 = 3;
const SADB_X_AALG_SHA2_256HMAC: u8 = 5;
const SADB_X_AALG_SHA2_384HMAC: u8 = 6;
const SADB_X_AALG_SHA2_512HMAC: u8 = 7;
const SADB_X_AALG_AES_XCBC_MAC: u8 = 9;

// encryption algorithm numbers of the kernel registry
const SADB_EALG_3DESCBC: u8 = 3;
const SADB_X_EALG_AESCBC: u8 = 12;
const SADB_X_EALG_AESCTR: u8 = 13;
const SADB_X_EALG_AES_GCM_ICV8: u8 = 18;
const SADB_X_EALG_AES_GCM_ICV12: u8 = 19;
const SADB_X_EALG_AES_GCM_ICV16: u8 = 20;

const UDP_ENCAP_ESPINUDP: u8 = 2;

// ipsec_policy direction/type values used by SADB_X_SPDADD
const IPSEC_DIR_INBOUND: u8 = 1;
const IPSEC_DIR_OUTBOUND: u8 = 2;
const IPSEC_POLICY_IPSEC: u16 = 2;

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbMsg {
    version: u8,
    msg_type: u8,
    errno: u8,
    satype: u8,
    len: u16,
    reserved: u16,
    seq: u32,
    pid: u32,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbExt {
    len: u16,
    exttype: u16,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbSa {
    len: u16,
    exttype: u16,
    spi: u32, // network order
    replay: u8,
    state: u8,
    auth: u8,
    encrypt: u8,
    flags: u32,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbAddress {
    len: u16,
    exttype: u16,
    proto: u8,
    prefixlen: u8,
    reserved: u16,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbKey {
    len: u16,
    exttype: u16,
    bits: u16,
    reserved: u16,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbLifetime {
    len: u16,
    exttype: u16,
    allocations: u32,
    bytes: u64,
    addtime: u64,
    usetime: u64,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbNatTType {
    len: u16,
    exttype: u16,
    natt_type: u8,
    reserved: [u8; 3],
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbNatTPort {
    len: u16,
    exttype: u16,
    port: u16, // network order
    reserved: u16,
}

#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct SadbXPolicy {
    len: u16,
    exttype: u16,
    policy_type: u16,
    dir: u8,
    reserved: u8,
    id: u32,
    priority: u32,
}

/// A PF_KEYv2 socket to the running kernel
pub struct PfkeySadb {
    socket: OwnedFd,
    seq: u32,
}

impl std::fmt::Debug for PfkeySadb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfkeySadb").field("seq", &self.seq).finish()
    }
}

impl PfkeySadb {
    /// Open the AF_KEY socket; requires the privileges of the parent or
    /// IKEv2 process depending on the platform
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2) call, the result is checked below
        let fd = unsafe { libc::socket(libc::PF_KEY, libc::SOCK_RAW, PF_KEY_V2) };
        if fd < 0 {
            return Err(Error::Kernel(format!(
                "opening the PF_KEY socket: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: fd was just returned by socket(2) and is owned here
        Ok(Self {
            socket: unsafe { OwnedFd::from_raw_fd(fd) },
            seq: 0,
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Send one composed message and wait for the kernel's echo with the
    /// same sequence number
    fn transact(&mut self, msg: Vec<u8>, seq: u32) -> Result<Vec<u8>> {
        let mut stream = std::fs::File::from(
            self.socket
                .try_clone()
                .map_err(|e| Error::Kernel(format!("PF_KEY socket clone: {e}")))?,
        );
        stream
            .write_all(&msg)
            .map_err(|e| Error::Kernel(format!("PF_KEY write: {e}")))?;

        let mut buf = [0u8; 8192];
        loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| Error::Kernel(format!("PF_KEY read: {e}")))?;
            let Some(header) = SadbMsg::read_from_prefix(&buf[..n]) else {
                return Err(Error::Kernel("short PF_KEY reply".into()));
            };
            // replies are consumed in event order and matched on seq
            if header.seq != seq && header.pid != std::process::id() {
                debug!(seq = header.seq, "skipping unrelated PF_KEY message");
                continue;
            }
            if header.errno != 0 {
                return Err(Error::Kernel(format!(
                    "kernel refused PF_KEY request: {}",
                    std::io::Error::from_raw_os_error(i32::from(header.errno))
                )));
            }
            return Ok(buf[..n].to_vec());
        }
    }

    fn message(&mut self, msg_type: u8, satype: u8, extensions: &[Vec<u8>]) -> (Vec<u8>, u32) {
        let seq = self.next_seq();
        let ext_len: usize = extensions.iter().map(Vec::len).sum();
        let header = SadbMsg {
            version: PF_KEY_V2 as u8,
            msg_type,
            errno: 0,
            satype,
            len: ((size_of::<SadbMsg>() + ext_len) / 8) as u16,
            reserved: 0,
            seq,
            pid: std::process::id(),
        };
        let mut out = header.as_bytes().to_vec();
        for ext in extensions {
            out.extend_from_slice(ext);
        }
        (out, seq)
    }
}

/// Pad an extension to the 8-octet unit PF_KEY requires and patch its
/// length field
fn finish_ext(mut ext: Vec<u8>) -> Vec<u8> {
    while ext.len() % 8 != 0 {
        ext.push(0);
    }
    let units = (ext.len() / 8) as u16;
    ext[..2].copy_from_slice(&units.to_ne_bytes());
    ext
}

fn ext_sa(sa: &KernelSa) -> Result<Vec<u8>> {
    let header = SadbSa {
        len: 0,
        exttype: SADB_EXT_SA,
        spi: sa.spi.to_be(),
        replay: 64,
        state: SADB_SASTATE_MATURE,
        auth: sa
            .integ
            .as_ref()
            .map(|(alg, _)| auth_alg(*alg))
            .transpose()?
            .unwrap_or(0),
        encrypt: encr_alg(sa.encr.0)?,
        flags: 0,
    };
    Ok(finish_ext(header.as_bytes().to_vec()))
}

fn ext_address(exttype: u16, addr: &IpAddr, prefixlen: Option<u8>) -> Vec<u8> {
    let header = SadbAddress {
        len: 0,
        exttype,
        proto: 0,
        prefixlen: prefixlen.unwrap_or(match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }),
        reserved: 0,
    };
    let mut ext = header.as_bytes().to_vec();
    ext.extend_from_slice(&sockaddr_bytes(addr));
    finish_ext(ext)
}

fn ext_key(exttype: u16, key: &[u8]) -> Vec<u8> {
    let header = SadbKey {
        len: 0,
        exttype,
        bits: (key.len() * 8) as u16,
        reserved: 0,
    };
    let mut ext = header.as_bytes().to_vec();
    ext.extend_from_slice(key);
    finish_ext(ext)
}

fn ext_lifetime(exttype: u16, bytes: u64, seconds: u64) -> Vec<u8> {
    let header = SadbLifetime {
        len: 0,
        exttype,
        allocations: 0,
        bytes,
        addtime: seconds,
        usetime: 0,
    };
    finish_ext(header.as_bytes().to_vec())
}

fn ext_natt(sa: &KernelSa) -> Vec<Vec<u8>> {
    let Some((sport, dport)) = sa.udpencap else {
        return vec![];
    };
    let natt_type = SadbNatTType {
        len: 0,
        exttype: SADB_X_EXT_NAT_T_TYPE,
        natt_type: UDP_ENCAP_ESPINUDP,
        reserved: [0; 3],
    };
    let natt_sport = SadbNatTPort {
        len: 0,
        exttype: SADB_X_EXT_NAT_T_SPORT,
        port: sport.to_be(),
        reserved: 0,
    };
    let natt_dport = SadbNatTPort {
        len: 0,
        exttype: SADB_X_EXT_NAT_T_DPORT,
        port: dport.to_be(),
        reserved: 0,
    };
    vec![
        finish_ext(natt_type.as_bytes().to_vec()),
        finish_ext(natt_sport.as_bytes().to_vec()),
        finish_ext(natt_dport.as_bytes().to_vec()),
    ]
}

fn sockaddr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
            // SAFETY: sockaddr_in is plain old data
            unsafe {
                std::slice::from_raw_parts(
                    (&sin as *const libc::sockaddr_in).cast::<u8>(),
                    size_of::<libc::sockaddr_in>(),
                )
            }
            .to_vec()
        }
        IpAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr.s6_addr = v6.octets();
            // SAFETY: sockaddr_in6 is plain old data
            unsafe {
                std::slice::from_raw_parts(
                    (&sin6 as *const libc::sockaddr_in6).cast::<u8>(),
                    size_of::<libc::sockaddr_in6>(),
                )
            }
            .to_vec()
        }
    }
}

fn satype(protocol: SecurityProtocol) -> u8 {
    match protocol {
        SecurityProtocol::AuthenticationHeader => SADB_SATYPE_AH,
        _ => SADB_SATYPE_ESP,
    }
}

fn encr_alg(alg: EncryptionAlgorithm) -> Result<u8> {
    Ok(match alg {
        EncryptionAlgorithm::TripleDes => SADB_EALG_3DESCBC,
        EncryptionAlgorithm::AesCbc => SADB_X_EALG_AESCBC,
        EncryptionAlgorithm::AesCtr => SADB_X_EALG_AESCTR,
        EncryptionAlgorithm::AesGcm8 => SADB_X_EALG_AES_GCM_ICV8,
        EncryptionAlgorithm::AesGcm12 => SADB_X_EALG_AES_GCM_ICV12,
        EncryptionAlgorithm::AesGcm16 => SADB_X_EALG_AES_GCM_ICV16,
        _ => {
            return Err(Error::Kernel(format!(
                "cipher {alg:?} is not programmable via PF_KEY"
            )))
        }
    })
}

fn auth_alg(alg: IntegrityAlgorithm) -> Result<u8> {
    Ok(match alg {
        IntegrityAlgorithm::HmacSha1_96 => SADB_AALG_SHA1HMAC,
        IntegrityAlgorithm::HmacSha2_256_128 => SADB_X_AALG_SHA2_256HMAC,
        IntegrityAlgorithm::HmacSha2_384_192 => SADB_X_AALG_SHA2_384HMAC,
        IntegrityAlgorithm::HmacSha2_512_256 => SADB_X_AALG_SHA2_512HMAC,
        IntegrityAlgorithm::AesXcbc96 => SADB_X_AALG_AES_XCBC_MAC,
        _ => {
            return Err(Error::Kernel(format!(
                "integrity {alg:?} is not programmable via PF_KEY"
            )))
        }
    })
}

impl SadbBackend for PfkeySadb {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn add(&mut self, sa: &KernelSa) -> Result<()> {
        let mut extensions = vec![
            ext_sa(sa)?,
            ext_address(SADB_EXT_ADDRESS_SRC, &sa.src, None),
            ext_address(SADB_EXT_ADDRESS_DST, &sa.dst, None),
            ext_key(SADB_EXT_KEY_ENCRYPT, &sa.encr.1),
        ];
        if let Some((_, key)) = &sa.integ {
            extensions.push(ext_key(SADB_EXT_KEY_AUTH, key));
        }
        extensions.extend(ext_natt(sa));
        let (msg, seq) = self.message(SADB_ADD, satype(sa.protocol), &extensions);
        self.transact(msg, seq)?;
        debug!(spi = format_args!("{:#010x}", sa.spi), "SADB add confirmed");
        Ok(())
    }

    fn delete(&mut self, sa: &KernelSa) -> Result<()> {
        let extensions = vec![
            ext_sa(sa)?,
            ext_address(SADB_EXT_ADDRESS_SRC, &sa.src, None),
            ext_address(SADB_EXT_ADDRESS_DST, &sa.dst, None),
        ];
        let (msg, seq) = self.message(SADB_DELETE, satype(sa.protocol), &extensions);
        match self.transact(msg, seq) {
            Ok(_) => Ok(()),
            // deleting twice must stay silent
            Err(Error::Kernel(e)) if e.contains("No such") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn last_used(&mut self, sa: &KernelSa) -> Result<Option<Duration>> {
        let lifetimes = self.lifetimes(sa)?;
        Ok((lifetimes.current_bytes > 0).then_some(lifetimes.current_age))
    }

    fn lifetimes(&mut self, sa: &KernelSa) -> Result<SaLifetimes> {
        let extensions = vec![
            ext_sa(sa)?,
            ext_address(SADB_EXT_ADDRESS_SRC, &sa.src, None),
            ext_address(SADB_EXT_ADDRESS_DST, &sa.dst, None),
        ];
        let (msg, seq) = self.message(SADB_GET, satype(sa.protocol), &extensions);
        let reply = self.transact(msg, seq)?;

        let mut lifetimes = SaLifetimes::default();
        let mut offset = size_of::<SadbMsg>();
        while let Some(ext) = SadbExt::read_from_prefix(&reply[offset..]) {
            let ext_bytes = usize::from(ext.len) * 8;
            if ext_bytes == 0 || offset + ext_bytes > reply.len() {
                break;
            }
            if matches!(
                ext.exttype,
                SADB_EXT_LIFETIME_CURRENT | SADB_EXT_LIFETIME_HARD | SADB_EXT_LIFETIME_SOFT
            ) {
                if let Some(lifetime) = SadbLifetime::read_from_prefix(&reply[offset..]) {
                    match ext.exttype {
                        SADB_EXT_LIFETIME_CURRENT => {
                            lifetimes.current_bytes = lifetime.bytes;
                            lifetimes.current_age = Duration::from_secs(lifetime.addtime);
                        }
                        SADB_EXT_LIFETIME_HARD => lifetimes.hard_bytes = lifetime.bytes,
                        _ => lifetimes.soft_bytes = lifetime.bytes,
                    }
                }
            }
            offset += ext_bytes;
        }
        Ok(lifetimes)
    }

    fn update_addresses(
        &mut self,
        sa: &KernelSa,
        src: IpAddr,
        dst: IpAddr,
        udpencap: Option<(u16, u16)>,
    ) -> Result<()> {
        let moved = KernelSa {
            src,
            dst,
            udpencap,
            ..sa.clone()
        };
        let mut extensions = vec![
            ext_sa(&moved)?,
            ext_address(SADB_EXT_ADDRESS_SRC, &moved.src, None),
            ext_address(SADB_EXT_ADDRESS_DST, &moved.dst, None),
        ];
        extensions.extend(ext_natt(&moved));
        let (msg, seq) = self.message(SADB_UPDATE, satype(sa.protocol), &extensions);
        self.transact(msg, seq)?;
        Ok(())
    }

    fn flow_add(&mut self, flow: &Flow) -> Result<()> {
        self.spd_op(SADB_X_SPDADD, flow)
    }

    fn flow_delete(&mut self, flow: &Flow) -> Result<()> {
        match self.spd_op(SADB_X_SPDDELETE, flow) {
            Ok(()) => Ok(()),
            Err(Error::Kernel(e)) if e.contains("No such") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> Result<()> {
        let (msg, seq) = self.message(SADB_FLUSH, SADB_SATYPE_ESP, &[]);
        self.transact(msg, seq)?;
        let (msg, seq) = self.message(SADB_X_SPDFLUSH, 0, &[]);
        if let Err(e) = self.transact(msg, seq) {
            warn!("flushing the SPD failed: {e}");
        }
        Ok(())
    }
}

impl PfkeySadb {
    fn spd_op(&mut self, op: u8, flow: &Flow) -> Result<()> {
        let policy = SadbXPolicy {
            len: 0,
            exttype: SADB_X_EXT_POLICY,
            policy_type: IPSEC_POLICY_IPSEC,
            dir: match flow.direction {
                FlowDirection::In => IPSEC_DIR_INBOUND,
                FlowDirection::Out => IPSEC_DIR_OUTBOUND,
            },
            reserved: 0,
            id: 0,
            priority: 0,
        };
        let extensions = vec![
            finish_ext(policy.as_bytes().to_vec()),
            ext_address(SADB_EXT_ADDRESS_SRC, &flow.src.addr, Some(flow.src.prefix_len)),
            ext_address(SADB_EXT_ADDRESS_DST, &flow.dst.addr, Some(flow.dst.prefix_len)),
            ext_lifetime(SADB_EXT_LIFETIME_HARD, 0, 0),
        ];
        let (msg, seq) = self.message(op, 0, &extensions);
        self.transact(msg, seq)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sa() -> KernelSa {
        KernelSa {
            spi: 0x11223344,
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            src: "192.0.2.1".parse().unwrap(),
            dst: "198.51.100.2".parse().unwrap(),
            encr: (EncryptionAlgorithm::AesCbc, vec![0x41; 16]),
            integ: Some((IntegrityAlgorithm::HmacSha2_256_128, vec![0x42; 32])),
            esn: false,
            udpencap: Some((4500, 4500)),
            rdomain: 0,
        }
    }

    #[test]
    fn extensions_are_unit_padded() {
        let sa = sample_sa();
        for ext in [
            ext_sa(&sa).unwrap(),
            ext_address(SADB_EXT_ADDRESS_SRC, &sa.src, None),
            ext_key(SADB_EXT_KEY_ENCRYPT, &sa.encr.1),
            ext_lifetime(SADB_EXT_LIFETIME_HARD, 1, 2),
        ] {
            assert_eq!(ext.len() % 8, 0);
            let units = u16::from_ne_bytes([ext[0], ext[1]]);
            assert_eq!(usize::from(units) * 8, ext.len());
        }
    }

    #[test]
    fn sa_extension_carries_network_order_spi() {
        let ext = ext_sa(&sample_sa()).unwrap();
        // spi sits after len and exttype
        assert_eq!(&ext[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn unsupported_cipher_is_refused() {
        let mut sa = sample_sa();
        sa.encr.0 = EncryptionAlgorithm::ChaCha20Poly1305;
        assert!(ext_sa(&sa).is_err());
    }

    #[test]
    fn natt_extensions_present_only_when_encapsulated() {
        let mut sa = sample_sa();
        assert_eq!(ext_natt(&sa).len(), 3);
        sa.udpencap = None;
        assert!(ext_natt(&sa).is_empty());
    }
}
