//! Typed inter-process messages over socket pairs
//!
//! Every message is one datagram: a fixed header followed by the
//! serialized payload, optionally accompanied by a file descriptor in
//! SCM_RIGHTS ancillary data. Senders never block: composing queues the
//! message and the queue drains whenever the socket turns writable.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use tracing::trace;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::ca::{CaReply, CaRequest};
use crate::config::Config;
use crate::control::{ControlCommand, ControlReply};
use crate::{Error, Result};

/// Largest accepted IPC datagram
const MAX_IPC_SIZE: usize = 512 * 1024;

/// The fixed header preceding every payload
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Copy, Clone)]
#[repr(C)]
struct ImsgHeader {
    /// Discriminant mirroring the payload variant, for tracing
    msg_type: u32,
    /// Octet length of the payload following the header
    len: u32,
    /// Opaque correlation id chosen by the sender
    peer_id: u32,
    /// Sender pid
    pid: u32,
}

/// Everything the processes say to each other
#[derive(Debug, Serialize, Deserialize)]
pub enum IpcPayload {
    /// Parent pushes a (re)loaded configuration
    ConfigPush(Box<Config>),
    /// Parent pushes the local private key to the CA process; carried
    /// out of band of the config object so it never crosses into the
    /// IKEv2 process
    KeyPush(Vec<u8>),
    /// Flush state: everything, only policies, only SAs, or the user
    /// database
    Reset(ResetScope),
    /// Load the negotiated flows into the kernel
    Couple,
    /// Remove every flow from the kernel but keep the SAs
    Decouple,
    /// An fd follows in ancillary data; the payload names its purpose
    PassFd(FdPurpose),
    /// A peer leased the engine an inner address; the parent installs
    /// it on the virtual interface with the tunnel routes
    AddressLease {
        /// The leased inner address
        address: std::net::IpAddr,
        /// Outer peer address for the pre-tunnel host route
        peer: std::net::IpAddr,
    },
    /// CA process publishes the trust anchor hints for CERTREQ payloads
    CertReqHints(Vec<u8>),
    /// IKEv2 engine asks the CA process for certificate work
    CaRequest(CaRequest),
    /// CA process answers
    CaReply(CaReply),
    /// Control process relays an administrator command
    ControlCommand(ControlCommand),
    /// A single part of the (possibly multi-part) answer
    ControlReply(ControlReply),
    /// Orderly shutdown announcement
    Shutdown,
}

impl IpcPayload {
    fn discriminant(&self) -> u32 {
        match self {
            IpcPayload::ConfigPush(_) => 1,
            IpcPayload::KeyPush(_) => 2,
            IpcPayload::Reset(_) => 3,
            IpcPayload::Couple => 4,
            IpcPayload::Decouple => 5,
            IpcPayload::PassFd(_) => 6,
            IpcPayload::AddressLease { .. } => 7,
            IpcPayload::CertReqHints(_) => 8,
            IpcPayload::CaRequest(_) => 9,
            IpcPayload::CaReply(_) => 10,
            IpcPayload::ControlCommand(_) => 11,
            IpcPayload::ControlReply(_) => 12,
            IpcPayload::Shutdown => 13,
        }
    }
}

/// What a passed file descriptor is for
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FdPurpose {
    /// UDP socket bound to the IKE port
    UdpIke,
    /// UDP socket bound to the NAT-T port
    UdpNatt,
    /// The PF_KEY socket
    Pfkey,
    /// The control listening socket
    Control,
}

/// Scope of a reset command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetScope {
    /// Drop everything
    All,
    /// Drop the policy table
    Policies,
    /// Drop every SA
    Sas,
    /// Drop the EAP user database
    Users,
    /// Drop the certificate stores
    Ca,
}

struct OutMsg {
    bytes: Vec<u8>,
    fd: Option<OwnedFd>,
}

/// One end of an IPC channel
pub struct ImsgChannel {
    socket: UnixDatagram,
    outq: VecDeque<OutMsg>,
}

impl std::fmt::Debug for ImsgChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImsgChannel")
            .field("queued", &self.outq.len())
            .finish()
    }
}

impl ImsgChannel {
    /// A connected channel pair, one end per process (or per task in
    /// the tests)
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixDatagram::pair()
            .map_err(|e| Error::Internal(format!("socketpair: {e}")))?;
        Ok((Self::from_socket(a), Self::from_socket(b)))
    }

    /// Wrap an inherited datagram socket
    pub fn from_socket(socket: UnixDatagram) -> Self {
        Self {
            socket,
            outq: VecDeque::new(),
        }
    }

    /// Wrap the file descriptor a child inherited from the parent
    pub fn from_inherited_fd(fd: OwnedFd) -> Result<Self> {
        let std_socket = std::os::unix::net::UnixDatagram::from(fd);
        std_socket
            .set_nonblocking(true)
            .map_err(|e| Error::Internal(format!("nonblocking: {e}")))?;
        let socket = UnixDatagram::from_std(std_socket)
            .map_err(|e| Error::Internal(format!("tokio wrap: {e}")))?;
        Ok(Self::from_socket(socket))
    }

    /// Queue a message; never blocks the caller
    pub fn compose(
        &mut self,
        peer_id: u32,
        payload: &IpcPayload,
        fd: Option<OwnedFd>,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::Internal(format!("IPC encode: {e}")))?;
        if body.len() > MAX_IPC_SIZE {
            return Err(Error::Resource("IPC message exceeds the size cap"));
        }
        let header = ImsgHeader {
            msg_type: payload.discriminant(),
            len: body.len() as u32,
            peer_id,
            pid: std::process::id(),
        };
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend(body);
        self.outq.push_back(OutMsg { bytes, fd });
        Ok(())
    }

    /// Whether queued messages are waiting for a writable socket
    pub fn has_pending(&self) -> bool {
        !self.outq.is_empty()
    }

    /// Drain the queue as far as the socket allows
    pub async fn flush(&mut self) -> Result<()> {
        while !self.outq.is_empty() {
            self.socket
                .ready(Interest::WRITABLE)
                .await
                .map_err(|e| Error::Internal(format!("IPC poll: {e}")))?;
            let result = {
                let Some(msg) = self.outq.front() else {
                    break;
                };
                self.socket.try_io(Interest::WRITABLE, || {
                    send_with_fd(
                        self.socket.as_raw_fd(),
                        &msg.bytes,
                        msg.fd.as_ref().map(AsRawFd::as_raw_fd),
                    )
                })
            };
            match result {
                Ok(_) => {
                    self.outq.pop_front();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Internal(format!("IPC send: {e}"))),
            }
        }
        Ok(())
    }

    /// Receive the next message together with its optional descriptor
    pub async fn recv(&mut self) -> Result<(u32, IpcPayload, Option<OwnedFd>)> {
        loop {
            self.socket
                .ready(Interest::READABLE)
                .await
                .map_err(|e| Error::Internal(format!("IPC poll: {e}")))?;
            let result = self.socket.try_io(Interest::READABLE, || {
                recv_with_fd(self.socket.as_raw_fd())
            });
            match result {
                Ok((bytes, fd)) => {
                    let header = ImsgHeader::read_from_prefix(bytes.as_slice())
                        .ok_or(Error::Internal("short IPC message".into()))?;
                    let body = bytes
                        .get(size_of::<ImsgHeader>()..size_of::<ImsgHeader>() + header.len as usize)
                        .ok_or(Error::Internal("truncated IPC message".into()))?;
                    let payload: IpcPayload = serde_json::from_slice(body)
                        .map_err(|e| Error::Internal(format!("IPC decode: {e}")))?;
                    trace!(msg_type = header.msg_type, "IPC message received");
                    return Ok((header.peer_id, payload, fd));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Internal(format!("IPC recv: {e}"))),
            }
        }
    }
}

/// sendmsg(2) with an optional SCM_RIGHTS descriptor
fn send_with_fd(socket: RawFd, bytes: &[u8], fd: Option<RawFd>) -> std::io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = [0u8; 64];
    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as _;
        // SAFETY: control buffer is large enough for one descriptor
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    // SAFETY: msg points at valid buffers for the duration of the call
    let n = unsafe { libc::sendmsg(socket, &msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// recvmsg(2) collecting an optional SCM_RIGHTS descriptor
fn recv_with_fd(socket: RawFd) -> std::io::Result<(Vec<u8>, Option<OwnedFd>)> {
    let mut buf = vec![0u8; MAX_IPC_SIZE + size_of::<ImsgHeader>()];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: msg points at valid buffers for the duration of the call
    let n = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(n as usize);

    let mut fd = None;
    // SAFETY: the kernel filled msg_control with well-formed cmsgs
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((buf, fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_without_fd() {
        let (mut a, mut b) = ImsgChannel::pair().unwrap();
        a.compose(7, &IpcPayload::Couple, None).unwrap();
        a.compose(8, &IpcPayload::Reset(ResetScope::Sas), None).unwrap();
        assert!(a.has_pending());
        a.flush().await.unwrap();
        assert!(!a.has_pending());

        let (peer_id, payload, fd) = b.recv().await.unwrap();
        assert_eq!(peer_id, 7);
        assert!(matches!(payload, IpcPayload::Couple));
        assert!(fd.is_none());
        let (peer_id, payload, _) = b.recv().await.unwrap();
        assert_eq!(peer_id, 8);
        assert!(matches!(payload, IpcPayload::Reset(ResetScope::Sas)));
    }

    #[tokio::test]
    async fn descriptor_crosses_the_channel() {
        let (mut a, mut b) = ImsgChannel::pair().unwrap();
        // pass one end of a fresh socketpair across and write through it
        let (left, right) = std::os::unix::net::UnixDatagram::pair().unwrap();
        a.compose(
            1,
            &IpcPayload::PassFd(FdPurpose::UdpIke),
            Some(OwnedFd::from(left)),
        )
        .unwrap();
        a.flush().await.unwrap();

        let (_, payload, fd) = b.recv().await.unwrap();
        assert!(matches!(payload, IpcPayload::PassFd(FdPurpose::UdpIke)));
        let received = std::os::unix::net::UnixDatagram::from(fd.unwrap());
        received.send(b"through the passed fd").unwrap();
        let mut buf = [0u8; 64];
        let n = right.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"through the passed fd");
    }
}
