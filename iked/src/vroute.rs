//! Virtual interface addresses and routes for client policies
//!
//! Installs the inner address a peer assigned us on the virtual
//! interface, a host route to the peer via the pre-tunnel gateway (so
//! the encrypted traffic itself does not loop into the tunnel), and the
//! tunnel routes. Systems refuse replacing the default route directly,
//! so a default is split into the two halves 0.0.0.0/1 and 128.0.0.0/1
//! (::/1 and 8000::/1 for IPv6). Every change is recorded on a cleanup
//! list that teardown replays in reverse order.

use std::net::IpAddr;

use tracing::{debug, info};

use crate::policy::AddrPrefix;
use crate::Result;

/// One primitive the platform route backend implements
pub trait RouteBackend: Send {
    /// Add an address to the virtual interface
    fn addr_add(&mut self, addr: &AddrPrefix) -> Result<()>;
    /// Remove an address from the virtual interface
    fn addr_delete(&mut self, addr: &AddrPrefix) -> Result<()>;
    /// Add a route to `dst` via `gateway` into the routing table
    fn route_add(&mut self, dst: &AddrPrefix, gateway: Option<IpAddr>, rdomain: u32)
        -> Result<()>;
    /// Remove a route added by [RouteBackend::route_add]
    fn route_delete(&mut self, dst: &AddrPrefix, rdomain: u32) -> Result<()>;
    /// The gateway currently routing `dst`, if any
    fn route_get(&mut self, dst: &IpAddr, rdomain: u32) -> Result<Option<IpAddr>>;
}

/// One recorded change, undone in reverse on cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
enum Recorded {
    Address(AddrPrefix),
    Route(AddrPrefix, u32),
}

/// The virtual-route programmer with its cleanup journal
pub struct VirtualRoutes<B: RouteBackend> {
    backend: B,
    rdomain: u32,
    journal: Vec<Recorded>,
}

impl<B: RouteBackend> VirtualRoutes<B> {
    /// Wrap a platform backend for the given routing domain
    pub fn new(backend: B, rdomain: u32) -> Self {
        Self {
            backend,
            rdomain,
            journal: vec![],
        }
    }

    /// Install an inner address handed to us by the peer
    pub fn install_address(&mut self, addr: AddrPrefix) -> Result<()> {
        self.backend.addr_add(&addr)?;
        self.journal.push(Recorded::Address(addr));
        info!(?addr, "virtual address installed");
        Ok(())
    }

    /// Route the peer's outer address via the current gateway so the
    /// encapsulated traffic keeps using the physical path
    pub fn install_peer_route(&mut self, peer: IpAddr) -> Result<()> {
        let gateway = self.backend.route_get(&peer, self.rdomain)?;
        let host = AddrPrefix {
            addr: peer,
            prefix_len: if peer.is_ipv4() { 32 } else { 128 },
        };
        self.backend.route_add(&host, gateway, self.rdomain)?;
        self.journal.push(Recorded::Route(host, self.rdomain));
        Ok(())
    }

    /// Install the tunnel routes for a negotiated selector; a default
    /// route is split into its two halves
    pub fn install_flow_route(&mut self, dst: AddrPrefix) -> Result<()> {
        if dst.prefix_len == 0 {
            for half in split_default(dst.addr.is_ipv4()) {
                self.backend.route_add(&half, None, self.rdomain)?;
                self.journal.push(Recorded::Route(half, self.rdomain));
            }
            return Ok(());
        }
        self.backend.route_add(&dst, None, self.rdomain)?;
        self.journal.push(Recorded::Route(dst, self.rdomain));
        Ok(())
    }

    /// Undo every recorded change, newest first
    pub fn cleanup(&mut self) {
        while let Some(entry) = self.journal.pop() {
            let result = match &entry {
                Recorded::Address(addr) => self.backend.addr_delete(addr),
                Recorded::Route(dst, rdomain) => self.backend.route_delete(dst, *rdomain),
            };
            if let Err(e) = result {
                debug!("cleanup of {entry:?} failed: {e}");
            }
        }
    }

    /// Number of journaled changes
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Access the wrapped backend, for tests
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// The two halves covering everything without touching the default route
fn split_default(v4: bool) -> [AddrPrefix; 2] {
    if v4 {
        [
            AddrPrefix {
                addr: IpAddr::from([0, 0, 0, 0]),
                prefix_len: 1,
            },
            AddrPrefix {
                addr: IpAddr::from([128, 0, 0, 0]),
                prefix_len: 1,
            },
        ]
    } else {
        [
            AddrPrefix {
                addr: IpAddr::from([0u16; 8]),
                prefix_len: 1,
            },
            AddrPrefix {
                addr: IpAddr::from([0x8000, 0, 0, 0, 0, 0, 0, 0]),
                prefix_len: 1,
            },
        ]
    }
}

/// Backends

/// In-memory route table for tests
#[derive(Debug, Default)]
pub struct MockRoutes {
    /// installed interface addresses
    pub addrs: Vec<AddrPrefix>,
    /// installed routes with their gateway
    pub routes: Vec<(AddrPrefix, Option<IpAddr>, u32)>,
    /// canned answer for [RouteBackend::route_get]
    pub gateway: Option<IpAddr>,
    /// every operation in call order, for ordering assertions
    pub log: Vec<String>,
}

impl RouteBackend for MockRoutes {
    fn addr_add(&mut self, addr: &AddrPrefix) -> Result<()> {
        self.addrs.push(*addr);
        self.log.push(format!("addr+ {addr:?}"));
        Ok(())
    }

    fn addr_delete(&mut self, addr: &AddrPrefix) -> Result<()> {
        self.addrs.retain(|a| a != addr);
        self.log.push(format!("addr- {addr:?}"));
        Ok(())
    }

    fn route_add(&mut self, dst: &AddrPrefix, gateway: Option<IpAddr>, rdomain: u32) -> Result<()> {
        self.routes.push((*dst, gateway, rdomain));
        self.log.push(format!("route+ {dst:?}"));
        Ok(())
    }

    fn route_delete(&mut self, dst: &AddrPrefix, rdomain: u32) -> Result<()> {
        self.routes.retain(|(d, _, r)| !(d == dst && *r == rdomain));
        self.log.push(format!("route- {dst:?}"));
        Ok(())
    }

    fn route_get(&mut self, _dst: &IpAddr, _rdomain: u32) -> Result<Option<IpAddr>> {
        Ok(self.gateway)
    }
}

pub use netlink::NetlinkRoutes;

mod netlink {
    //! An rtnetlink backend building its messages by hand over an
    //! AF_NETLINK route socket

    use std::io::{Read, Write};
    use std::net::IpAddr;
    use std::os::fd::{FromRawFd, OwnedFd};

    use zerocopy::{AsBytes, FromBytes, FromZeroes};

    use crate::policy::AddrPrefix;
    use crate::{Error, Result};

    use super::RouteBackend;

    const RTM_NEWROUTE: u16 = 24;
    const RTM_DELROUTE: u16 = 25;
    const RTM_GETROUTE: u16 = 26;
    const RTM_NEWADDR: u16 = 20;
    const RTM_DELADDR: u16 = 21;

    const NLM_F_REQUEST: u16 = 0x01;
    const NLM_F_ACK: u16 = 0x04;
    const NLM_F_CREATE: u16 = 0x400;
    const NLM_F_EXCL: u16 = 0x200;

    const NLMSG_ERROR: u16 = 2;

    const RTA_DST: u16 = 1;
    const RTA_GATEWAY: u16 = 5;
    const RTA_TABLE: u16 = 15;
    const IFA_LOCAL: u16 = 2;

    const RT_TABLE_MAIN: u8 = 254;
    const RT_SCOPE_UNIVERSE: u8 = 0;
    const RT_SCOPE_LINK: u8 = 253;
    const RTN_UNICAST: u8 = 1;
    const RTPROT_STATIC: u8 = 4;

    #[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
    #[repr(C)]
    struct NlMsgHdr {
        len: u32,
        msg_type: u16,
        flags: u16,
        seq: u32,
        pid: u32,
    }

    #[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
    #[repr(C)]
    struct RtMsg {
        family: u8,
        dst_len: u8,
        src_len: u8,
        tos: u8,
        table: u8,
        protocol: u8,
        scope: u8,
        rtype: u8,
        flags: u32,
    }

    #[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
    #[repr(C)]
    struct IfAddrMsg {
        family: u8,
        prefixlen: u8,
        flags: u8,
        scope: u8,
        index: u32,
    }

    fn rta(rta_type: u16, data: &[u8]) -> Vec<u8> {
        let len = 4 + data.len();
        let mut out = Vec::with_capacity((len + 3) & !3);
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&rta_type.to_ne_bytes());
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
        match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    fn family(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() {
            libc::AF_INET as u8
        } else {
            libc::AF_INET6 as u8
        }
    }

    /// The AF_NETLINK backend
    pub struct NetlinkRoutes {
        socket: OwnedFd,
        seq: u32,
        /// interface index of the virtual interface addresses land on
        ifindex: u32,
    }

    impl std::fmt::Debug for NetlinkRoutes {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("NetlinkRoutes")
                .field("ifindex", &self.ifindex)
                .finish()
        }
    }

    impl NetlinkRoutes {
        /// Open the route socket; `ifindex` names the virtual interface
        pub fn open(ifindex: u32) -> Result<Self> {
            // SAFETY: plain socket(2) call, the result is checked below
            let fd = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW,
                    libc::NETLINK_ROUTE,
                )
            };
            if fd < 0 {
                return Err(Error::Kernel(format!(
                    "opening the netlink socket: {}",
                    std::io::Error::last_os_error()
                )));
            }
            // SAFETY: fd was just returned by socket(2) and is owned here
            Ok(Self {
                socket: unsafe { OwnedFd::from_raw_fd(fd) },
                seq: 0,
                ifindex,
            })
        }

        fn transact(&mut self, msg: Vec<u8>) -> Result<Vec<u8>> {
            let mut stream = std::fs::File::from(
                self.socket
                    .try_clone()
                    .map_err(|e| Error::Kernel(format!("netlink socket clone: {e}")))?,
            );
            stream
                .write_all(&msg)
                .map_err(|e| Error::Kernel(format!("netlink write: {e}")))?;
            let mut buf = [0u8; 8192];
            let n = stream
                .read(&mut buf)
                .map_err(|e| Error::Kernel(format!("netlink read: {e}")))?;
            let header = NlMsgHdr::read_from_prefix(&buf[..n])
                .ok_or(Error::Kernel("short netlink reply".into()))?;
            if header.msg_type == NLMSG_ERROR {
                let errno = i32::from_ne_bytes(
                    buf[size_of::<NlMsgHdr>()..size_of::<NlMsgHdr>() + 4]
                        .try_into()
                        .map_err(|_| Error::Kernel("short netlink error".into()))?,
                );
                if errno != 0 {
                    return Err(Error::Kernel(format!(
                        "kernel refused netlink request: {}",
                        std::io::Error::from_raw_os_error(-errno)
                    )));
                }
            }
            Ok(buf[..n].to_vec())
        }

        fn route_msg(
            &mut self,
            msg_type: u16,
            flags: u16,
            dst: &AddrPrefix,
            gateway: Option<IpAddr>,
            rdomain: u32,
        ) -> Vec<u8> {
            self.seq = self.seq.wrapping_add(1);
            let rtm = RtMsg {
                family: family(&dst.addr),
                dst_len: dst.prefix_len,
                src_len: 0,
                tos: 0,
                table: RT_TABLE_MAIN,
                protocol: RTPROT_STATIC,
                scope: if gateway.is_some() {
                    RT_SCOPE_UNIVERSE
                } else {
                    RT_SCOPE_LINK
                },
                rtype: RTN_UNICAST,
                flags: 0,
            };
            let mut attrs = rta(RTA_DST, &addr_bytes(&dst.addr));
            if let Some(gw) = gateway {
                attrs.extend(rta(RTA_GATEWAY, &addr_bytes(&gw)));
            }
            if rdomain != 0 {
                attrs.extend(rta(RTA_TABLE, &rdomain.to_ne_bytes()));
            }
            let len = size_of::<NlMsgHdr>() + size_of::<RtMsg>() + attrs.len();
            let header = NlMsgHdr {
                len: len as u32,
                msg_type,
                flags,
                seq: self.seq,
                pid: 0,
            };
            let mut msg = header.as_bytes().to_vec();
            msg.extend_from_slice(rtm.as_bytes());
            msg.extend(attrs);
            msg
        }
    }

    impl RouteBackend for NetlinkRoutes {
        fn addr_add(&mut self, addr: &AddrPrefix) -> Result<()> {
            self.seq = self.seq.wrapping_add(1);
            let ifa = IfAddrMsg {
                family: family(&addr.addr),
                prefixlen: addr.prefix_len,
                flags: 0,
                scope: 0,
                index: self.ifindex,
            };
            let attrs = rta(IFA_LOCAL, &addr_bytes(&addr.addr));
            let len = size_of::<NlMsgHdr>() + size_of::<IfAddrMsg>() + attrs.len();
            let header = NlMsgHdr {
                len: len as u32,
                msg_type: RTM_NEWADDR,
                flags: NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
                seq: self.seq,
                pid: 0,
            };
            let mut msg = header.as_bytes().to_vec();
            msg.extend_from_slice(ifa.as_bytes());
            msg.extend(attrs);
            self.transact(msg)?;
            Ok(())
        }

        fn addr_delete(&mut self, addr: &AddrPrefix) -> Result<()> {
            self.seq = self.seq.wrapping_add(1);
            let ifa = IfAddrMsg {
                family: family(&addr.addr),
                prefixlen: addr.prefix_len,
                flags: 0,
                scope: 0,
                index: self.ifindex,
            };
            let attrs = rta(IFA_LOCAL, &addr_bytes(&addr.addr));
            let len = size_of::<NlMsgHdr>() + size_of::<IfAddrMsg>() + attrs.len();
            let header = NlMsgHdr {
                len: len as u32,
                msg_type: RTM_DELADDR,
                flags: NLM_F_REQUEST | NLM_F_ACK,
                seq: self.seq,
                pid: 0,
            };
            let mut msg = header.as_bytes().to_vec();
            msg.extend_from_slice(ifa.as_bytes());
            msg.extend(attrs);
            self.transact(msg)?;
            Ok(())
        }

        fn route_add(
            &mut self,
            dst: &AddrPrefix,
            gateway: Option<IpAddr>,
            rdomain: u32,
        ) -> Result<()> {
            let msg = self.route_msg(
                RTM_NEWROUTE,
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
                dst,
                gateway,
                rdomain,
            );
            self.transact(msg)?;
            Ok(())
        }

        fn route_delete(&mut self, dst: &AddrPrefix, rdomain: u32) -> Result<()> {
            let msg = self.route_msg(RTM_DELROUTE, NLM_F_REQUEST | NLM_F_ACK, dst, None, rdomain);
            self.transact(msg)?;
            Ok(())
        }

        fn route_get(&mut self, dst: &IpAddr, rdomain: u32) -> Result<Option<IpAddr>> {
            let host = AddrPrefix {
                addr: *dst,
                prefix_len: if dst.is_ipv4() { 32 } else { 128 },
            };
            let msg = self.route_msg(RTM_GETROUTE, NLM_F_REQUEST, &host, None, rdomain);
            let reply = self.transact(msg)?;

            // walk the attributes of the first answer for a gateway
            let mut offset = size_of::<NlMsgHdr>() + size_of::<RtMsg>();
            while offset + 4 <= reply.len() {
                let rta_len = u16::from_ne_bytes([reply[offset], reply[offset + 1]]) as usize;
                let rta_type = u16::from_ne_bytes([reply[offset + 2], reply[offset + 3]]);
                if rta_len < 4 || offset + rta_len > reply.len() {
                    break;
                }
                if rta_type == RTA_GATEWAY {
                    let data = &reply[offset + 4..offset + rta_len];
                    return Ok(match data.len() {
                        4 => {
                            let octets: [u8; 4] = data.try_into().unwrap_or([0; 4]);
                            Some(IpAddr::from(octets))
                        }
                        16 => {
                            let octets: [u8; 16] = data.try_into().unwrap_or([0; 16]);
                            Some(IpAddr::from(octets))
                        }
                        _ => None,
                    });
                }
                offset += (rta_len + 3) & !3;
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn default_route_splits_into_halves() {
        let mut routes = VirtualRoutes::new(MockRoutes::default(), 0);
        routes
            .install_flow_route(AddrPrefix {
                addr: "0.0.0.0".parse().unwrap(),
                prefix_len: 0,
            })
            .unwrap();
        let installed: Vec<String> = routes
            .backend()
            .routes
            .iter()
            .map(|(p, _, _)| format!("{}/{}", p.addr, p.prefix_len))
            .collect();
        assert_eq!(installed, vec!["0.0.0.0/1", "128.0.0.0/1"]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn peer_route_uses_existing_gateway() {
        let mut backend = MockRoutes::default();
        backend.gateway = Some("192.0.2.254".parse().unwrap());
        let mut routes = VirtualRoutes::new(backend, 0);
        routes
            .install_peer_route("198.51.100.7".parse().unwrap())
            .unwrap();
        let (dst, gateway, _) = routes.backend().routes[0];
        assert_eq!(dst.prefix_len, 32);
        assert_eq!(gateway, Some("192.0.2.254".parse().unwrap()));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn cleanup_replays_in_reverse_order()  {
        let mut routes = VirtualRoutes::new(MockRoutes::default(), 0);
        routes
            .install_address(AddrPrefix {
                addr: "10.9.0.5".parse().unwrap(),
                prefix_len: 32,
            })
            .unwrap();
        routes
            .install_peer_route("198.51.100.7".parse().unwrap())
            .unwrap();
        routes
            .install_flow_route(AddrPrefix {
                addr: "0.0.0.0".parse().unwrap(),
                prefix_len: 0,
            })
            .unwrap();
        assert_eq!(routes.journal_len(), 4);

        routes.cleanup();
        assert_eq!(routes.journal_len(), 0);
        assert!(routes.backend().addrs.is_empty());
        assert!(routes.backend().routes.is_empty());

        // removals happen newest-first: the split halves, the peer
        // route, finally the address
        let log = &routes.backend().log;
        let removals: Vec<&String> = log.iter().filter(|l| l.contains('-')).collect();
        assert!(removals[0].contains("128.0.0.0"));
        assert!(removals[3].contains("addr-"));
    }
}
