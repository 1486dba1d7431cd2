//! The privilege-separated process layout
//!
//! The parent re-executes its own binary once per child role, hands each
//! child one end of a socketpair as file descriptor 3 and brokers the
//! message fan-out between them. The parent keeps the privileged
//! sockets (UDP binds, control listener) and passes them down as
//! descriptors; each child drops into its own chroot and unprivileged
//! user before touching any input.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::ca::CertStore;
use crate::config::Config;
use crate::control::{ControlReply, ControlServer};
use crate::engine::{Engine, Output};
use crate::ipc::{FdPurpose, ImsgChannel, IpcPayload};
use crate::kernel::pfkey::PfkeySadb;
use crate::{Error, Result};

/// The descriptor number a child finds its parent channel on
pub const CHILD_CHANNEL_FD: RawFd = 3;

/// The unprivileged account the children run as
pub const UNPRIV_USER: &str = "_iked";

/// Largest UDP datagram the engine will look at
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The four cooperating processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcRole {
    /// Supervisor owning the privileged interfaces
    Parent,
    /// Certificate and key store
    Ca,
    /// The protocol engine
    Ikev2,
    /// The administrative socket
    Control,
}

impl ProcRole {
    /// The flag value used on the re-exec command line
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcRole::Parent => "parent",
            ProcRole::Ca => "ca",
            ProcRole::Ikev2 => "ikev2",
            ProcRole::Control => "control",
        }
    }

    /// Parse the re-exec flag value
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "parent" => ProcRole::Parent,
            "ca" => ProcRole::Ca,
            "ikev2" => ProcRole::Ikev2,
            "control" => ProcRole::Control,
            _ => return None,
        })
    }
}

/// Drop into the unprivileged account and an empty root
///
/// Children call this before processing any untrusted input; running as
/// root without the account present is refused.
pub fn drop_privileges(chroot_dir: &str) -> Result<()> {
    // SAFETY: getuid has no preconditions
    if unsafe { libc::getuid() } != 0 {
        debug!("not running as root, skipping privilege drop");
        return Ok(());
    }
    let name = std::ffi::CString::new(UNPRIV_USER)
        .map_err(|_| Error::Internal("user name".into()))?;
    // SAFETY: getpwnam with a valid C string; the result is checked
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        return Err(Error::Config(format!("user {UNPRIV_USER} does not exist")));
    }
    // SAFETY: passwd was checked for null above
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };
    let root = std::ffi::CString::new(chroot_dir)
        .map_err(|_| Error::Internal("chroot path".into()))?;
    // SAFETY: plain chroot/chdir/setres[gu]id calls, results checked
    unsafe {
        if libc::chroot(root.as_ptr()) != 0 || libc::chdir(b"/\0".as_ptr().cast()) != 0 {
            return Err(Error::Config(format!(
                "chroot {chroot_dir}: {}",
                std::io::Error::last_os_error()
            )));
        }
        if libc::setresgid(gid, gid, gid) != 0 || libc::setresuid(uid, uid, uid) != 0 {
            return Err(Error::Config(format!(
                "dropping privileges: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    info!(user = UNPRIV_USER, chroot = chroot_dir, "privileges dropped");
    Ok(())
}

fn socketpair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: socketpair fills fds on success, which is checked
    if unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM,
            0,
            fds.as_mut_ptr(),
        )
    } != 0
    {
        return Err(Error::Internal(format!(
            "socketpair: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: both descriptors were just created and are owned here
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Re-execute ourselves as a child process with its channel on fd 3
fn spawn_child(role: ProcRole, channel: OwnedFd) -> Result<std::process::Child> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Internal(format!("current_exe: {e}")))?;
    let raw = channel.as_raw_fd();
    let mut command = std::process::Command::new(exe);
    command
        .arg("-P")
        .arg(role.as_str())
        .stdin(Stdio::null());
    // SAFETY: dup2/fcntl in the forked child before exec touch only
    // freshly created descriptors
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(raw, CHILD_CHANNEL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let flags = libc::fcntl(CHILD_CHANNEL_FD, libc::F_GETFD);
            libc::fcntl(CHILD_CHANNEL_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            Ok(())
        });
    }
    let child = command
        .spawn()
        .map_err(|e| Error::Internal(format!("spawning {}: {e}", role.as_str())))?;
    drop(channel);
    info!(role = role.as_str(), pid = child.id(), "child started");
    Ok(child)
}

/// The parent: fork the children, pass the sockets down, broker the
/// fan-out
pub async fn run_parent(config: Config, control_path: PathBuf, key_file: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    let (ca_parent, ca_child) = socketpair()?;
    let (ike_parent, ike_child) = socketpair()?;
    let (control_parent, control_child) = socketpair()?;

    let mut children = vec![
        spawn_child(ProcRole::Ca, ca_child)?,
        spawn_child(ProcRole::Ikev2, ike_child)?,
        spawn_child(ProcRole::Control, control_child)?,
    ];

    let mut ca = channel_from(ca_parent)?;
    let mut ikev2 = channel_from(ike_parent)?;
    let mut control = channel_from(control_parent)?;

    // configuration first, then the privileged descriptors
    ca.compose(0, &IpcPayload::ConfigPush(Box::new(config.clone())), None)?;
    if let Some(path) = key_file {
        let der = std::fs::read(&path)
            .map_err(|e| Error::Config(format!("key file {}: {e}", path.display())))?;
        ca.compose(0, &IpcPayload::KeyPush(der), None)?;
    }
    ikev2.compose(0, &IpcPayload::ConfigPush(Box::new(config.clone())), None)?;

    for addr in config.ike_binds() {
        let socket = std::net::UdpSocket::bind(addr)
            .map_err(|e| Error::Config(format!("binding {addr}: {e}")))?;
        ikev2.compose(0, &IpcPayload::PassFd(FdPurpose::UdpIke), Some(socket.into()))?;
    }
    for addr in config.natt_binds() {
        let socket = std::net::UdpSocket::bind(addr)
            .map_err(|e| Error::Config(format!("binding {addr}: {e}")))?;
        ikev2.compose(0, &IpcPayload::PassFd(FdPurpose::UdpNatt), Some(socket.into()))?;
    }
    let listener = std::os::unix::net::UnixListener::bind(&control_path)
        .or_else(|_| {
            let _ = std::fs::remove_file(&control_path);
            std::os::unix::net::UnixListener::bind(&control_path)
        })
        .map_err(|e| Error::Config(format!("control socket: {e}")))?;
    control.compose(0, &IpcPayload::PassFd(FdPurpose::Control), Some(listener.into()))?;

    ca.flush().await?;
    ikev2.flush().await?;
    control.flush().await?;

    // the parent owns the virtual interface routes
    let mut vroutes = match config.vroute_ifindex {
        Some(ifindex) => Some(crate::vroute::VirtualRoutes::new(
            crate::vroute::NetlinkRoutes::open(ifindex)?,
            config.rdomain,
        )),
        None => None,
    };
    info!("parent initialized, entering the fan-out loop");

    // the loop ends on ctrl-c or on a dying child (its channel errors
    // out, e.g. after a fatal engine failure); either way the same
    // controlled teardown runs
    let result = parent_loop(&mut ca, &mut ikev2, &mut control, &mut vroutes).await;
    if let Err(e) = &result {
        error!("fan-out loop failed: {e}");
    }
    info!("shutting down");
    if let Some(vroutes) = vroutes.as_mut() {
        // undo every route change, newest first
        vroutes.cleanup();
    }
    for channel in [&mut ca, &mut ikev2, &mut control] {
        let _ = channel.compose(0, &IpcPayload::Shutdown, None);
        let _ = channel.flush().await;
    }
    for child in &mut children {
        let _ = child.wait();
    }
    result
}

/// The parent's fan-out: runs until ctrl-c (`Ok`) or until a channel to
/// a child breaks (`Err`)
async fn parent_loop(
    ca: &mut ImsgChannel,
    ikev2: &mut ImsgChannel,
    control: &mut ImsgChannel,
    vroutes: &mut Option<crate::vroute::VirtualRoutes<crate::vroute::NetlinkRoutes>>,
) -> Result<()> {
    loop {
        tokio::select! {
            received = ca.recv() => {
                let (peer_id, payload, fd) = received?;
                // everything the CA says goes to the engine
                ikev2.compose(peer_id, &payload, fd)?;
                ikev2.flush().await?;
            }
            received = ikev2.recv() => {
                let (peer_id, payload, fd) = received?;
                match payload {
                    IpcPayload::CaRequest(_) => {
                        ca.compose(peer_id, &payload, fd)?;
                        ca.flush().await?;
                    }
                    IpcPayload::ControlReply(_) => {
                        control.compose(peer_id, &payload, fd)?;
                        control.flush().await?;
                    }
                    IpcPayload::AddressLease { address, peer } => {
                        if let Some(vroutes) = vroutes.as_mut() {
                            install_lease(vroutes, address, peer);
                        }
                    }
                    other => debug!(?other, "unrouted message from the engine"),
                }
            }
            received = control.recv() => {
                let (peer_id, payload, fd) = received?;
                match &payload {
                    IpcPayload::ControlCommand(_) => {
                        ikev2.compose(peer_id, &payload, fd)?;
                        ikev2.flush().await?;
                    }
                    other => debug!(?other, "unrouted message from control"),
                }
            }
            status = tokio::signal::ctrl_c() => {
                status.map_err(|e| Error::Internal(format!("signal: {e}")))?;
                return Ok(());
            }
        }
    }
}

fn channel_from(fd: OwnedFd) -> Result<ImsgChannel> {
    ImsgChannel::from_inherited_fd(fd)
}

/// Entry of a re-executed child: pick up fd 3 and run the role
pub async fn run_child(role: ProcRole) -> Result<()> {
    // SAFETY: the parent put our channel on fd 3 before exec
    let channel = ImsgChannel::from_inherited_fd(unsafe { OwnedFd::from_raw_fd(CHILD_CHANNEL_FD) })?;
    match role {
        ProcRole::Parent => Err(Error::Internal("parent cannot be re-executed".into())),
        ProcRole::Ca => run_ca(channel).await,
        ProcRole::Ikev2 => run_ikev2(channel).await,
        ProcRole::Control => run_control(channel).await,
    }
}

/// The CA process: a read-only filesystem view of the trust material
async fn run_ca(mut channel: ImsgChannel) -> Result<()> {
    let mut store = CertStore::empty();
    let mut config: Option<Config> = None;
    loop {
        let (peer_id, payload, _fd) = channel.recv().await?;
        match payload {
            IpcPayload::ConfigPush(new_config) => {
                store = CertStore::load(&new_config);
                config = Some(*new_config);
                channel.compose(0, &IpcPayload::CertReqHints(store.certreq_hints()), None)?;
                channel.flush().await?;
            }
            IpcPayload::KeyPush(der) => {
                if let Err(e) = store.set_key_der(&der) {
                    warn!("installing the private key: {e}");
                }
                // the key is in memory, nothing on disk is needed anymore
                drop_privileges("/var/empty")?;
            }
            IpcPayload::Reset(crate::ipc::ResetScope::Ca) => {
                if let Some(config) = &config {
                    store = CertStore::load(config);
                }
            }
            IpcPayload::CaRequest(request) => {
                let reply = store.handle(request);
                channel.compose(peer_id, &IpcPayload::CaReply(reply), None)?;
                channel.flush().await?;
            }
            IpcPayload::Shutdown => return Ok(()),
            other => debug!(?other, "ignored in the CA process"),
        }
    }
}

/// The IKEv2 process: the engine, its sockets and timers
async fn run_ikev2(mut channel: ImsgChannel) -> Result<()> {
    // wait for the configuration before anything else
    let config = loop {
        let (_, payload, _) = channel.recv().await?;
        if let IpcPayload::ConfigPush(config) = payload {
            break *config;
        }
    };

    let kernel = PfkeySadb::open()?;
    let mut engine = Engine::new(config, Box::new(kernel), Instant::now())?;

    // collect the sockets the parent passes down
    let mut ike_sockets: Vec<UdpSocket> = vec![];
    let mut natt_sockets: Vec<UdpSocket> = vec![];
    while ike_sockets.is_empty() || natt_sockets.is_empty() {
        let (_, payload, fd) = channel.recv().await?;
        match (payload, fd) {
            (IpcPayload::PassFd(FdPurpose::UdpIke), Some(fd)) => {
                ike_sockets.push(udp_from_fd(fd)?);
            }
            (IpcPayload::PassFd(FdPurpose::UdpNatt), Some(fd)) => {
                natt_sockets.push(udp_from_fd(fd)?);
            }
            (other, _) => debug!(?other, "ignored while collecting sockets"),
        }
    }
    drop_privileges("/var/empty")?;
    info!("IKEv2 engine running");

    // dial the active policies
    let actives: Vec<(String, SocketAddr)> = engine_active_peers(&engine);
    for (name, peer) in actives {
        let local = SocketAddr::new(
            engine
                .config()
                .listen
                .first()
                .copied()
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            engine.config().ike_port,
        );
        match engine.initiate(Instant::now(), &name, local, peer) {
            Ok(outputs) => {
                perform_outputs(&mut channel, &ike_sockets, &natt_sockets, outputs).await?;
            }
            Err(e) => warn!(policy = %name, "dialing: {e}"),
        }
    }

    let mut ike_buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut natt_buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let deadline = engine.next_deadline();
        let sleeper = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            received = ike_sockets[0].recv_from(&mut ike_buf) => {
                let (n, peer) = received.map_err(|e| Error::Internal(format!("recv: {e}")))?;
                let local = ike_sockets[0]
                    .local_addr()
                    .map_err(|e| Error::Internal(format!("local_addr: {e}")))?;
                let outputs =
                    engine.handle_datagram(Instant::now(), local, peer, false, &ike_buf[..n]);
                perform_outputs(&mut channel, &ike_sockets, &natt_sockets, outputs).await?;
            }
            received = natt_sockets[0].recv_from(&mut natt_buf) => {
                let (n, peer) = received.map_err(|e| Error::Internal(format!("recv: {e}")))?;
                let local = natt_sockets[0]
                    .local_addr()
                    .map_err(|e| Error::Internal(format!("local_addr: {e}")))?;
                // keepalives die here, real traffic sheds its marker
                if n > 4 && natt_buf[..4] == ikewire::NON_ESP_MARKER {
                    let outputs =
                        engine.handle_datagram(Instant::now(), local, peer, true, &natt_buf[4..n]);
                    perform_outputs(&mut channel, &ike_sockets, &natt_sockets, outputs).await?;
                }
            }
            received = channel.recv() => {
                let (peer_id, payload, _fd) = received?;
                match payload {
                    IpcPayload::ConfigPush(config) => {
                        if let Err(e) = engine.reload(*config) {
                            warn!("reload refused: {e}");
                        }
                    }
                    IpcPayload::CertReqHints(hints) => {
                        engine.set_certreq_hints(hints);
                    }
                    IpcPayload::CaReply(reply) => {
                        let outputs = engine.handle_ca_reply(Instant::now(), reply);
                        perform_outputs(&mut channel, &ike_sockets, &natt_sockets, outputs).await?;
                    }
                    IpcPayload::ControlCommand(command) => {
                        for part in engine.control(Instant::now(), command) {
                            channel.compose(peer_id, &IpcPayload::ControlReply(part), None)?;
                        }
                        channel.compose(peer_id, &IpcPayload::ControlReply(ControlReply::End), None)?;
                        channel.flush().await?;
                    }
                    IpcPayload::Reset(scope) => engine.reset(Instant::now(), scope),
                    IpcPayload::Couple => {
                        if let Err(e) = engine.couple() {
                            warn!("couple: {e}");
                        }
                    }
                    IpcPayload::Decouple => {
                        if let Err(e) = engine.decouple() {
                            warn!("decouple: {e}");
                        }
                    }
                    IpcPayload::Shutdown => return Ok(()),
                    other => debug!(?other, "ignored in the IKEv2 process"),
                }
            }
            _ = sleeper => {
                let outputs = engine.handle_timer(Instant::now());
                perform_outputs(&mut channel, &ike_sockets, &natt_sockets, outputs).await?;
            }
        }
    }
}

/// The control process: bridge the administrative socket to the engine
/// through [ControlServer]
async fn run_control(mut channel: ImsgChannel) -> Result<()> {
    // the listener arrives as a descriptor from the parent
    let server = loop {
        let (_, payload, fd) = channel.recv().await?;
        match (payload, fd) {
            (IpcPayload::PassFd(FdPurpose::Control), Some(fd)) => {
                let std_listener = std::os::unix::net::UnixListener::from(fd);
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| Error::Internal(format!("nonblocking: {e}")))?;
                let listener = tokio::net::UnixListener::from_std(std_listener)
                    .map_err(|e| Error::Internal(format!("tokio wrap: {e}")))?;
                break ControlServer::from_listener(listener);
            }
            (IpcPayload::Shutdown, _) => return Ok(()),
            (other, _) => debug!(?other, "ignored while waiting for the listener"),
        }
    };
    drop_privileges("/var/empty")?;
    info!("control socket ready");

    loop {
        tokio::select! {
            accepted = server.accept() => {
                let mut stream = accepted?;
                match server.bridge(&mut stream, &mut channel).await {
                    // a shutdown arrived while the conversation ran
                    Ok(false) => return Ok(()),
                    Ok(true) => {}
                    Err(e) => debug!("control client: {e}"),
                }
            }
            received = channel.recv() => {
                let (_, payload, _) = received?;
                if matches!(payload, IpcPayload::Shutdown) {
                    return Ok(());
                }
            }
        }
    }
}

async fn perform_outputs(
    channel: &mut ImsgChannel,
    ike_sockets: &[UdpSocket],
    natt_sockets: &[UdpSocket],
    outputs: Vec<Output>,
) -> Result<()> {
    for output in outputs {
        match output {
            Output::Datagram {
                peer, natt, bytes, ..
            } => {
                if natt {
                    let mut marked = Vec::with_capacity(4 + bytes.len());
                    marked.extend_from_slice(&ikewire::NON_ESP_MARKER);
                    marked.extend_from_slice(&bytes);
                    if let Err(e) = natt_sockets[0].send_to(&marked, peer).await {
                        warn!(%peer, "send: {e}");
                    }
                } else if let Err(e) = ike_sockets[0].send_to(&bytes, peer).await {
                    warn!(%peer, "send: {e}");
                }
            }
            Output::CaRequest(request) => {
                channel.compose(0, &IpcPayload::CaRequest(request), None)?;
                channel.flush().await?;
            }
            Output::Lease { address, peer } => {
                channel.compose(0, &IpcPayload::AddressLease { address, peer }, None)?;
                channel.flush().await?;
            }
            Output::Fatal { reason } => {
                // an internal invariant broke: leave the event loop so
                // the process exits and the parent tears everything down
                error!(%reason, "fatal engine failure, shutting down");
                return Err(Error::Internal(reason));
            }
        }
    }
    Ok(())
}

/// Program a leased inner address: the address itself, the host route
/// to the peer via the old gateway, and the tunnel routes
fn install_lease(
    vroutes: &mut crate::vroute::VirtualRoutes<crate::vroute::NetlinkRoutes>,
    address: std::net::IpAddr,
    peer: std::net::IpAddr,
) {
    let prefix = crate::policy::AddrPrefix {
        addr: address,
        prefix_len: if address.is_ipv4() { 32 } else { 128 },
    };
    if let Err(e) = vroutes.install_address(prefix) {
        warn!("installing the leased address: {e}");
        return;
    }
    if let Err(e) = vroutes.install_peer_route(peer) {
        warn!("installing the peer host route: {e}");
    }
    let default = crate::policy::AddrPrefix {
        addr: if address.is_ipv4() {
            std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        } else {
            std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        },
        prefix_len: 0,
    };
    if let Err(e) = vroutes.install_flow_route(default) {
        warn!("installing the tunnel routes: {e}");
    }
}

fn udp_from_fd(fd: OwnedFd) -> Result<UdpSocket> {
    let std_socket = std::net::UdpSocket::from(fd);
    std_socket
        .set_nonblocking(true)
        .map_err(|e| Error::Internal(format!("nonblocking: {e}")))?;
    UdpSocket::from_std(std_socket).map_err(|e| Error::Internal(format!("tokio wrap: {e}")))
}

fn engine_active_peers(engine: &Engine) -> Vec<(String, SocketAddr)> {
    engine
        .config()
        .policies
        .iter()
        .filter(|p| p.mode == crate::policy::PolicyMode::Active)
        .filter_map(|p| {
            p.peer.map(|prefix| {
                (
                    p.name.clone(),
                    SocketAddr::new(prefix.addr, engine.config().ike_port),
                )
            })
        })
        .collect()
}
