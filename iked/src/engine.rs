//! The sans-I/O IKEv2 engine
//!
//! Owns the SA registry, the policy table, the timer wheel and the
//! kernel backend. Every entry point takes the current instant and
//! returns the outputs (datagrams to transmit, CA requests) that the
//! surrounding event loop performs; no entry point blocks and no state
//! is shared outside the engine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use ikewire::defs::params::{ExchangeType, NotifyError};
use ikewire::defs::{Message, Notification, Payload};
use tracing::{debug, error, info, warn};

use crate::ca::{CaReply, CaRequest};
use crate::config::Config;
use crate::control::{ControlCommand, ControlReply, FlowSummary, PolicySummary, SaSummary};
use crate::cookie::{CookieJar, COOKIE_ROTATE_SECS, COOKIE_THRESHOLD};
use crate::envelope::{self, MessageMeta};
use crate::ipc::ResetScope;
use crate::kernel::{kernel_pair, SadbBackend};
use crate::msg::PendingRequest;
use crate::policy::PolicyTable;
use crate::pool::AddressPool;
use crate::sa::{IkeSa, SaState};
use crate::timer::{TimerKey, TimerKind, TimerWheel};
use crate::{Error, Result};

/// An action the event loop must carry out
#[derive(Debug)]
pub enum Output {
    /// Transmit one UDP datagram
    Datagram {
        /// Local endpoint to send from
        local: SocketAddr,
        /// Peer endpoint to send to
        peer: SocketAddr,
        /// Use the NAT-T socket with the non-ESP marker
        natt: bool,
        /// The wire bytes
        bytes: Vec<u8>,
    },
    /// Dispatch asynchronous certificate work to the CA process
    CaRequest(CaRequest),
    /// The peer leased us an inner address; the parent programs it onto
    /// the virtual interface together with the tunnel routes
    Lease {
        /// The leased inner address
        address: IpAddr,
        /// Outer address of the peer, for the host route
        peer: IpAddr,
    },
    /// An internal invariant broke; the event loop must exit so the
    /// supervisor can tear the daemon down in an orderly way
    Fatal {
        /// What went wrong, for the shutdown log line
        reason: String,
    },
}

/// The engine state of the IKEv2 process
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) policies: PolicyTable,
    pub(crate) sas: HashMap<u64, IkeSa>,
    pub(crate) timers: TimerWheel,
    pub(crate) cookies: CookieJar,
    pub(crate) kernel: Box<dyn SadbBackend>,
    pub(crate) pools: HashMap<String, AddressPool>,
    /// active/passive toggle of the kernel coupling
    pub(crate) coupled: bool,
    /// half-open responder SAs, feeding the cookie threshold
    pub(crate) half_open: usize,
    /// concatenated SHA-1 SPKI digests of the CA's trust anchors,
    /// offered to peers in CERTREQ payloads
    pub(crate) certreq_hints: Vec<u8>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sas", &self.sas.len())
            .field("policies", &self.policies.len())
            .field("coupled", &self.coupled)
            .finish()
    }
}

impl Engine {
    /// Build an engine from a validated configuration and a kernel
    /// backend
    pub fn new(config: Config, kernel: Box<dyn SadbBackend>, now: Instant) -> Result<Self> {
        config.validate()?;
        let policies = PolicyTable::compile(&config.policies);
        let mut pools = HashMap::new();
        for template in &config.policies {
            if let Some(prefix) = template.pool {
                pools.insert(
                    template.name.clone(),
                    AddressPool::new(prefix, config.sticky_address_pool),
                );
            }
        }
        let mut engine = Self {
            config,
            policies,
            sas: HashMap::new(),
            timers: TimerWheel::default(),
            cookies: CookieJar::default(),
            kernel,
            pools,
            coupled: true,
            half_open: 0,
            certreq_hints: vec![],
        };
        engine.timers.arm(
            now,
            Duration::from_secs(COOKIE_ROTATE_SECS),
            TimerKey {
                sa: 0,
                kind: TimerKind::CookieRotate,
            },
        );
        Ok(engine)
    }

    /// Swap in a reloaded configuration; a validation failure keeps the
    /// previous configuration in force
    pub fn reload(&mut self, config: Config) -> Result<()> {
        config.validate()?;
        self.policies = PolicyTable::compile(&config.policies);
        self.pools.clear();
        for template in &config.policies {
            if let Some(prefix) = template.pool {
                self.pools.insert(
                    template.name.clone(),
                    AddressPool::new(prefix, config.sticky_address_pool),
                );
            }
        }
        self.config = config;
        info!(policies = self.policies.len(), "configuration reloaded");
        Ok(())
    }

    /// Earliest armed timer, for the event loop's sleep
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Whether the responder currently demands cookies
    pub fn under_load(&self) -> bool {
        self.half_open >= COOKIE_THRESHOLD
    }

    /// One UDP datagram arrived; `bytes` must start at the IKE header
    /// (non-ESP marker and keepalives are the transport's business)
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        natt: bool,
        bytes: &[u8],
    ) -> Vec<Output> {
        let msg = match Message::try_parse(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                // parse errors on a fresh exchange: drop
                debug!(%peer, "dropping unparseable datagram: {e}");
                return vec![];
            }
        };
        // the envelope and AUTH computations need the exact message octets
        let exact_len = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize;
        let raw = &bytes[..exact_len.min(bytes.len())];

        if msg.exchange_type == ExchangeType::IkeSaInit {
            return self.handle_sa_init(now, local, peer, natt, &msg, raw);
        }

        // the sender sets the initiator flag if it initiated the SA, so
        // our half of the SPI pair follows from it
        let local_spi = if msg.initiator {
            msg.responder_spi
        } else {
            msg.initiator_spi
        };
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            debug!(%peer, spi = format_args!("{local_spi:#018x}"), "no SA for datagram");
            return vec![];
        };
        let was_established = sa.state == SaState::Established;

        let outputs = if msg.response {
            self.handle_response(now, &mut sa, &msg, raw)
        } else {
            self.handle_request(now, &mut sa, peer, &msg, raw)
        };

        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(Error::Parse(_)) | Err(Error::Protocol(_)) => {
                // parse errors on an existing SA: one INVALID_SYNTAX,
                // then the SA goes away
                warn!(sa = ?sa, "protocol failure, closing SA");
                let out = self.refuse(now, &mut sa, &msg, NotifyError::InvalidSyntax);
                self.sas.insert(local_spi, sa);
                return out;
            }
            Err(Error::Authentication(reason)) => {
                warn!(sa = ?sa, reason, "authentication failed");
                let out = self.refuse(now, &mut sa, &msg, NotifyError::AuthenticationFailed);
                self.sas.insert(local_spi, sa);
                return out;
            }
            Err(Error::Crypto(reason)) => {
                // never give a cryptographic oracle
                debug!(sa = ?sa, reason, "crypto failure, discarding silently");
                vec![]
            }
            Err(Error::Resource(reason)) => {
                debug!(reason, "resource exhaustion, dropping message");
                vec![]
            }
            Err(Error::Internal(reason)) => {
                // internal failures are fatal: hand the shutdown signal
                // to the event loop instead of limping on
                error!(sa = ?sa, %reason, "internal invariant broke");
                self.sas.insert(local_spi, sa);
                return vec![Output::Fatal { reason }];
            }
            Err(e) => {
                warn!(sa = ?sa, "unhandled failure: {e}");
                vec![]
            }
        };

        let mut outputs = outputs;
        if sa.state == SaState::Closed {
            self.drop_sa(&mut sa);
        } else {
            let newly_established = !was_established && sa.state == SaState::Established;
            self.sas.insert(local_spi, sa);
            if newly_established {
                outputs.extend(self.enforce_single_sa(now, local_spi));
            }
        }
        outputs
    }

    /// A due timer fired
    pub fn handle_timer(&mut self, now: Instant) -> Vec<Output> {
        let mut outputs = vec![];
        for key in self.timers.pop_due(now) {
            match key.kind {
                TimerKind::CookieRotate => {
                    self.cookies.rotate();
                    self.timers.arm(
                        now,
                        Duration::from_secs(COOKIE_ROTATE_SECS),
                        TimerKey {
                            sa: 0,
                            kind: TimerKind::CookieRotate,
                        },
                    );
                }
                TimerKind::Retransmit(message_id) => {
                    outputs.extend(self.retransmit(now, key.sa, message_id));
                }
                TimerKind::Dpd => {
                    outputs.extend(self.send_dpd(now, key.sa));
                }
                TimerKind::Keepalive => {
                    outputs.extend(self.send_keepalive(now, key.sa));
                }
                TimerKind::RekeyChild(spi) => {
                    outputs.extend(self.start_child_rekey(now, key.sa, spi));
                }
                TimerKind::ExpireChild(spi) => {
                    if let Some(mut sa) = self.sas.remove(&key.sa) {
                        if let Err(e) = self.uninstall_child(&mut sa, spi) {
                            warn!("expiring child: {e}");
                        }
                        self.sas.insert(key.sa, sa);
                    }
                }
                TimerKind::RekeyIke => {
                    outputs.extend(self.start_ike_rekey(now, key.sa));
                }
                TimerKind::ExpireIke | TimerKind::CloseGrace => {
                    if let Some(mut sa) = self.sas.remove(&key.sa) {
                        self.drop_sa(&mut sa);
                    }
                }
                TimerKind::FragSweep => {
                    if let Some(sa) = self.sas.get_mut(&key.sa) {
                        sa.reassembly.expire(now);
                    }
                }
            }
        }
        outputs
    }

    /// The CA process answered; resume the parked SA
    pub fn handle_ca_reply(&mut self, now: Instant, reply: CaReply) -> Vec<Output> {
        let (spi_i, spi_r) = match &reply {
            CaReply::CertVerdict { sa, .. }
            | CaReply::AuthVerdict { sa, .. }
            | CaReply::Signature { sa, .. } => *sa,
        };
        let Some((&local_spi, _)) = self
            .sas
            .iter()
            .find(|(_, sa)| sa.spi_pair() == (spi_i, spi_r))
        else {
            debug!("CA reply for a gone SA");
            return vec![];
        };
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let was_established = sa.state == SaState::Established;
        let mut outputs = match self.resume_from_ca(now, &mut sa, reply) {
            Ok(outputs) => outputs,
            Err(Error::Authentication(reason)) => {
                warn!(reason, "authentication failed after CA verdict");
                self.notify_and_close(now, &mut sa, NotifyError::AuthenticationFailed)
            }
            Err(Error::Internal(reason)) => {
                error!(%reason, "internal invariant broke");
                self.sas.insert(local_spi, sa);
                return vec![Output::Fatal { reason }];
            }
            Err(e) => {
                warn!("resuming from CA reply: {e}");
                vec![]
            }
        };
        if sa.state == SaState::Closed {
            self.drop_sa(&mut sa);
        } else {
            let newly_established = !was_established && sa.state == SaState::Established;
            self.sas.insert(local_spi, sa);
            if newly_established {
                outputs.extend(self.enforce_single_sa(now, local_spi));
            }
        }
        outputs
    }

    /// The local address set changed (MOBIKE trigger)
    pub fn handle_address_change(&mut self, now: Instant, new_local: IpAddr) -> Vec<Output> {
        let spis: Vec<u64> = self
            .sas
            .iter()
            .filter(|(_, sa)| sa.state == SaState::Established && sa.peer_mobike)
            .map(|(spi, _)| *spi)
            .collect();
        let mut outputs = vec![];
        for spi in spis {
            outputs.extend(self.mobike_update_addresses(now, spi, new_local));
        }
        outputs
    }

    /// Administrator command relayed by the control process
    pub fn control(&mut self, now: Instant, command: ControlCommand) -> Vec<ControlReply> {
        match command {
            ControlCommand::ShowSas => self
                .sas
                .values()
                .map(|sa| {
                    ControlReply::Sa(SaSummary {
                        spi_i: format!("{:#018x}", sa.spi_i),
                        spi_r: format!("{:#018x}", sa.spi_r),
                        state: format!("{:?}", sa.state),
                        peer: sa.peer.to_string(),
                        peer_id: sa.peer_id.as_ref().map(ToString::to_string),
                        children: sa.children.len(),
                        natt: sa.nat.active,
                    })
                })
                .collect(),
            ControlCommand::ShowPolicies => self
                .policies
                .iter()
                .map(|policy| {
                    ControlReply::Policy(PolicySummary {
                        name: policy.template.name.clone(),
                        mode: format!("{:?}", policy.template.mode),
                        peer: policy
                            .template
                            .peer
                            .map(|p| format!("{}/{}", p.addr, p.prefix_len)),
                        refs: self
                            .sas
                            .values()
                            .filter(|sa| sa.policy.index == policy.index)
                            .count(),
                    })
                })
                .collect(),
            ControlCommand::ShowFlows => self
                .sas
                .values()
                .flat_map(|sa| sa.flows.iter())
                .map(|flow| {
                    ControlReply::Flow(FlowSummary {
                        src: format!("{}/{}", flow.src.addr, flow.src.prefix_len),
                        dst: format!("{}/{}", flow.dst.addr, flow.dst.prefix_len),
                        direction: format!("{:?}", flow.direction),
                        rdomain: flow.rdomain,
                    })
                })
                .collect(),
            ControlCommand::Couple => match self.couple() {
                Ok(()) => vec![ControlReply::Ok],
                Err(e) => vec![ControlReply::Fail(e.to_string())],
            },
            ControlCommand::Decouple => match self.decouple() {
                Ok(()) => vec![ControlReply::Ok],
                Err(e) => vec![ControlReply::Fail(e.to_string())],
            },
            ControlCommand::Reset(scope) => {
                self.reset(now, scope);
                vec![ControlReply::Ok]
            }
            // reload and verbosity are handled by the parent process
            ControlCommand::Reload | ControlCommand::LogVerbose | ControlCommand::LogBrief => {
                vec![ControlReply::Ok]
            }
        }
    }

    /// Flush engine state of the requested scope
    pub fn reset(&mut self, _now: Instant, scope: ResetScope) {
        match scope {
            ResetScope::All | ResetScope::Sas => {
                let spis: Vec<u64> = self.sas.keys().copied().collect();
                for spi in spis {
                    if let Some(mut sa) = self.sas.remove(&spi) {
                        self.drop_sa(&mut sa);
                    }
                }
                if matches!(scope, ResetScope::All) {
                    let _ = self.kernel.flush();
                }
            }
            ResetScope::Policies => {
                self.policies = PolicyTable::compile(&[]);
            }
            ResetScope::Users | ResetScope::Ca => {
                // both stores live in other processes; nothing here
            }
        }
    }

    /// Install every loaded child and flow (active mode)
    pub fn couple(&mut self) -> Result<()> {
        if self.coupled {
            return Ok(());
        }
        self.coupled = true;
        let rdomain = self.config.rdomain;
        let spis: Vec<u64> = self.sas.keys().copied().collect();
        for spi in spis {
            let Some(mut sa) = self.sas.remove(&spi) else {
                continue;
            };
            for i in 0..sa.children.len() {
                if !sa.children[i].loaded {
                    continue;
                }
                let (inbound, outbound) = kernel_pair(&sa, &sa.children[i], rdomain)?;
                self.kernel.add(&inbound)?;
                self.kernel.add(&outbound)?;
            }
            for flow in &sa.flows {
                self.kernel.flow_add(flow)?;
            }
            self.sas.insert(spi, sa);
        }
        Ok(())
    }

    /// Remove every flow and SA from the kernel but keep the state
    /// (passive mode)
    pub fn decouple(&mut self) -> Result<()> {
        if !self.coupled {
            return Ok(());
        }
        self.coupled = false;
        let rdomain = self.config.rdomain;
        let spis: Vec<u64> = self.sas.keys().copied().collect();
        for spi in spis {
            let Some(mut sa) = self.sas.remove(&spi) else {
                continue;
            };
            for i in 0..sa.children.len() {
                if !sa.children[i].loaded {
                    continue;
                }
                let (inbound, outbound) = kernel_pair(&sa, &sa.children[i], rdomain)?;
                let _ = self.kernel.delete(&inbound);
                let _ = self.kernel.delete(&outbound);
            }
            for flow in &sa.flows {
                let _ = self.kernel.flow_delete(flow);
            }
            self.sas.insert(spi, sa);
        }
        Ok(())
    }

    /// Access the kernel backend, for the tests' assertions
    pub fn kernel(&self) -> &dyn SadbBackend {
        self.kernel.as_ref()
    }

    /// The running configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Install the trust anchor hints published by the CA process
    pub fn set_certreq_hints(&mut self, hints: Vec<u8>) {
        self.certreq_hints = hints;
    }

    /// Number of IKE SAs in a given state
    pub fn count_in_state(&self, state: SaState) -> usize {
        self.sas.values().filter(|sa| sa.state == state).count()
    }

    /// The established SA for a peer address, for tests and MOBIKE
    pub fn sa_for_peer(&self, peer: &SocketAddr) -> Option<&IkeSa> {
        self.sas.values().find(|sa| sa.peer == *peer)
    }

    // ---- shared plumbing used by the exchange modules ----

    /// Seal `inner` as the next request of the SA and hand back the
    /// datagrams; arms the retransmission timer
    pub(crate) fn send_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        exchange: ExchangeType,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        if sa.requests.len() >= sa.msgids.window as usize {
            // window full: park the request until a response frees a slot
            sa.outbox.push_back((exchange, inner));
            return Ok(vec![]);
        }
        let message_id = sa.msgids.next_send;
        sa.msgids.next_send = sa.msgids.next_send.wrapping_add(1);
        let meta = MessageMeta {
            spi_i: sa.spi_i,
            spi_r: sa.spi_r,
            exchange_type: exchange,
            initiator: sa.role == crate::sa::Role::Initiator,
            response: false,
            message_id,
        };
        let crypto = sa
            .ike_crypto
            .as_ref()
            .ok_or(Error::Internal("sending encrypted before keys".into()))?;
        let (sk_e, sk_a, _, _) = sa.send_recv_keys()?;
        let datagrams = if sa.peer_frag && self.config.fragmentation {
            envelope::seal_fragmented(crypto, sk_e, sk_a, &meta, &inner)?
        } else {
            vec![envelope::seal(crypto, sk_e, sk_a, &meta, &inner)?]
        };

        sa.requests.push(PendingRequest {
            message_id,
            datagrams: datagrams.clone(),
            exchange,
            attempts: 1,
        });
        let delay = crate::msg::RETRANSMIT_BASE;
        self.timers.arm(
            now,
            delay,
            TimerKey {
                sa: sa.local_spi(),
                kind: TimerKind::Retransmit(message_id),
            },
        );
        Ok(datagrams
            .into_iter()
            .map(|bytes| self.datagram_out(sa, bytes))
            .collect())
    }

    /// Seal `inner` as the response to request `message_id`, cache it
    /// for duplicate requests and hand back the datagrams
    pub(crate) fn send_response(
        &mut self,
        sa: &mut IkeSa,
        exchange: ExchangeType,
        message_id: u32,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        let meta = MessageMeta {
            spi_i: sa.spi_i,
            spi_r: sa.spi_r,
            exchange_type: exchange,
            initiator: sa.role == crate::sa::Role::Initiator,
            response: true,
            message_id,
        };
        let crypto = sa
            .ike_crypto
            .as_ref()
            .ok_or(Error::Internal("sending encrypted before keys".into()))?;
        let (sk_e, sk_a, _, _) = sa.send_recv_keys()?;
        let datagrams = if sa.peer_frag && self.config.fragmentation {
            envelope::seal_fragmented(crypto, sk_e, sk_a, &meta, &inner)?
        } else {
            vec![envelope::seal(crypto, sk_e, sk_a, &meta, &inner)?]
        };
        sa.responses.insert(message_id, datagrams.clone());
        sa.msgids.next_recv = sa.msgids.next_recv.wrapping_add(1);
        sa.responses
            .prune_below(sa.msgids.next_recv.saturating_sub(sa.msgids.window.max(8)));
        Ok(datagrams
            .into_iter()
            .map(|bytes| self.datagram_out(sa, bytes))
            .collect())
    }

    /// Open the SK/SKF body of a message; `Ok(None)` while fragments
    /// are still missing
    pub(crate) fn open_message(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        raw: &[u8],
    ) -> Result<Option<Vec<Payload>>> {
        let crypto = sa
            .ike_crypto
            .as_ref()
            .ok_or(Error::Crypto("encrypted message before keys"))?;
        let (_, _, sk_e, sk_a) = sa.send_recv_keys()?;
        for payload in &msg.payloads {
            match payload {
                Payload::Encrypted(enc) => {
                    let chain = envelope::open(crypto, sk_e, sk_a, raw, &enc.data)?;
                    return Ok(Some(Message::parse_inner(enc.next_payload, &chain)?));
                }
                Payload::EncryptedFragment(frag) => {
                    let piece = envelope::open(crypto, sk_e, sk_a, raw, &frag.data)?;
                    self.timers.arm(
                        now,
                        crate::frag::FRAGMENT_TIMEOUT,
                        TimerKey {
                            sa: sa.local_spi(),
                            kind: TimerKind::FragSweep,
                        },
                    );
                    if let Some((first, chain)) = sa.reassembly.insert(
                        now,
                        msg.message_id,
                        frag.fragment_number,
                        frag.total_fragments,
                        frag.next_payload,
                        piece,
                    ) {
                        return Ok(Some(Message::parse_inner(first, &chain)?));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
        Err(Error::Protocol("expected an encrypted payload"))
    }

    pub(crate) fn datagram_out(&self, sa: &IkeSa, bytes: Vec<u8>) -> Output {
        Output::Datagram {
            local: sa.local,
            peer: sa.peer,
            natt: sa.nat.active,
            bytes,
        }
    }

    /// Answer a failed request with a single error notify (or announce
    /// the error in an INFORMATIONAL of our own) and start closing
    pub(crate) fn refuse(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        error: NotifyError,
    ) -> Vec<Output> {
        let mut outputs = vec![];
        if sa.has_keys() {
            let notify = vec![Payload::Notify(Notification::error(error))];
            let sent = if msg.response {
                self.send_request(now, sa, ExchangeType::Informational, notify)
            } else {
                self.send_response(sa, msg.exchange_type, msg.message_id, notify)
            };
            if let Ok(out) = sent {
                outputs.extend(out);
            }
        }
        self.start_close(now, sa);
        outputs
    }

    /// Emit a single error notify inside an INFORMATIONAL request and
    /// start closing the SA
    pub(crate) fn notify_and_close(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        error: NotifyError,
    ) -> Vec<Output> {
        let mut outputs = vec![];
        if sa.has_keys() {
            if let Ok(out) = self.send_request(
                now,
                sa,
                ExchangeType::Informational,
                vec![Payload::Notify(Notification::error(error))],
            ) {
                outputs.extend(out);
            }
        }
        self.start_close(now, sa);
        outputs
    }

    /// Enter Closing: cancel retransmissions, flush queues, arm the
    /// grace timer
    pub(crate) fn start_close(&mut self, now: Instant, sa: &mut IkeSa) {
        if sa.state == SaState::Closing || sa.state == SaState::Closed {
            return;
        }
        let flushed = sa.requests.clear();
        sa.outbox.clear();
        if flushed > 0 {
            debug!(flushed, "cancelled pending retransmissions");
        }
        self.timers.cancel_sa(sa.local_spi());
        sa.state = SaState::Closing;
        self.timers.arm(
            now,
            Duration::from_secs(5),
            TimerKey {
                sa: sa.local_spi(),
                kind: TimerKind::CloseGrace,
            },
        );
    }

    /// Remove the SA's kernel state and forget it
    pub(crate) fn drop_sa(&mut self, sa: &mut IkeSa) {
        let spis: Vec<u32> = sa.children.iter().map(|c| c.spi_local).collect();
        for spi in spis {
            if let Err(e) = self.uninstall_child(sa, spi) {
                warn!("removing child on teardown: {e}");
            }
        }
        if let (Some(lease), Some(peer_id)) = (sa.pool_lease, sa.peer_id.as_ref()) {
            if let Some(pool) = self.pools.get_mut(&sa.policy.template.name) {
                pool.release(peer_id);
                debug!(%lease, "pool address released");
            }
        }
        self.timers.cancel_sa(sa.local_spi());
        sa.state = SaState::Closed;
        info!(sa = ?sa, "SA removed");
    }

    /// Install a child (both directions plus flows) and arm its
    /// lifetime timers
    pub(crate) fn install_child(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        child_index: usize,
    ) -> Result<()> {
        let rdomain = self.config.rdomain;
        let lifetime = sa.children[child_index].lifetime;
        let spi_local = sa.children[child_index].spi_local;
        if self.coupled {
            let (inbound, outbound) = kernel_pair(sa, &sa.children[child_index], rdomain)?;
            self.kernel.add(&inbound).map_err(|e| {
                Error::Kernel(format!("installing inbound child: {e}"))
            })?;
            if let Err(e) = self.kernel.add(&outbound) {
                let _ = self.kernel.delete(&inbound);
                return Err(Error::Kernel(format!("installing outbound child: {e}")));
            }
        }
        sa.children[child_index].loaded = true;

        // one flow pair per negotiated selector combination
        let mut flows = vec![];
        for flow_config in &sa.policy.template.flows {
            flows.push(crate::sa::Flow {
                src: flow_config.src,
                dst: flow_config.dst,
                proto: flow_config.proto,
                direction: crate::sa::FlowDirection::Out,
                rdomain,
            });
            flows.push(crate::sa::Flow {
                src: flow_config.dst,
                dst: flow_config.src,
                proto: flow_config.proto,
                direction: crate::sa::FlowDirection::In,
                rdomain,
            });
        }
        for flow in flows {
            if self.coupled {
                self.kernel.flow_add(&flow)?;
            }
            if !sa.flows.contains(&flow) {
                sa.flows.push(flow);
            }
        }

        self.timers.arm(
            now,
            Duration::from_secs(lifetime.soft_seconds),
            TimerKey {
                sa: sa.local_spi(),
                kind: TimerKind::RekeyChild(spi_local),
            },
        );
        self.timers.arm(
            now,
            Duration::from_secs(lifetime.hard_seconds),
            TimerKey {
                sa: sa.local_spi(),
                kind: TimerKind::ExpireChild(spi_local),
            },
        );
        Ok(())
    }

    /// Remove a child from the kernel and the SA
    pub(crate) fn uninstall_child(&mut self, sa: &mut IkeSa, spi_local: u32) -> Result<()> {
        let Some(index) = sa.children.iter().position(|c| c.spi_local == spi_local) else {
            return Ok(());
        };
        let rdomain = self.config.rdomain;
        if sa.children[index].loaded && self.coupled {
            let (inbound, outbound) = kernel_pair(sa, &sa.children[index], rdomain)?;
            let _ = self.kernel.delete(&inbound);
            let _ = self.kernel.delete(&outbound);
        }
        sa.children.remove(index);
        self.timers.cancel(&TimerKey {
            sa: sa.local_spi(),
            kind: TimerKind::RekeyChild(spi_local),
        });
        self.timers.cancel(&TimerKey {
            sa: sa.local_spi(),
            kind: TimerKind::ExpireChild(spi_local),
        });
        // the flows stay while a sibling child still uses them
        if sa.children.is_empty() {
            for flow in std::mem::take(&mut sa.flows) {
                let _ = self.kernel.flow_delete(&flow);
            }
        }
        Ok(())
    }

    /// Resend a request whose response is overdue
    fn retransmit(&mut self, now: Instant, local_spi: u64, message_id: u32) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let mut outputs = vec![];
        if let Some(request) = sa.requests.get_mut(message_id) {
            if request.exhausted() {
                info!(sa = ?sa, "peer stopped responding, closing");
                self.start_close(now, &mut sa);
            } else {
                request.attempts += 1;
                let delay = request.next_delay();
                let datagrams = request.datagrams.clone();
                debug!(message_id, attempts = request.attempts, "retransmitting");
                for bytes in datagrams {
                    outputs.push(self.datagram_out(&sa, bytes));
                }
                self.timers.arm(
                    now,
                    delay,
                    TimerKey {
                        sa: local_spi,
                        kind: TimerKind::Retransmit(message_id),
                    },
                );
            }
        }
        self.sas.insert(local_spi, sa);
        outputs
    }

    /// NAT-T keepalive tick
    fn send_keepalive(&mut self, now: Instant, local_spi: u64) -> Vec<Output> {
        let Some(sa) = self.sas.get(&local_spi) else {
            return vec![];
        };
        if !sa.nat.active || sa.state != SaState::Established {
            return vec![];
        }
        let out = Output::Datagram {
            local: sa.local,
            peer: sa.peer,
            natt: true,
            bytes: crate::nat::KEEPALIVE.to_vec(),
        };
        self.timers.arm(
            now,
            self.config.natt_keepalive,
            TimerKey {
                sa: local_spi,
                kind: TimerKind::Keepalive,
            },
        );
        vec![out]
    }

    /// Arm the recurring Established-state timers of an SA
    pub(crate) fn arm_established_timers(&mut self, now: Instant, sa: &IkeSa) {
        let spi = sa.local_spi();
        self.timers.arm(
            now,
            self.config.dpd_interval,
            TimerKey {
                sa: spi,
                kind: TimerKind::Dpd,
            },
        );
        if sa.nat.active {
            self.timers.arm(
                now,
                self.config.natt_keepalive,
                TimerKey {
                    sa: spi,
                    kind: TimerKind::Keepalive,
                },
            );
        }
        // the signaling SA outlives its children by a factor of four
        let lifetime = sa.policy.template.lifetime;
        self.timers.arm(
            now,
            Duration::from_secs(lifetime.soft_seconds.saturating_mul(4)),
            TimerKey {
                sa: spi,
                kind: TimerKind::RekeyIke,
            },
        );
        self.timers.arm(
            now,
            Duration::from_secs(lifetime.hard_seconds.saturating_mul(4)),
            TimerKey {
                sa: spi,
                kind: TimerKind::ExpireIke,
            },
        );
    }

    /// Enforce the single-IKE-SA option: a newly established SA evicts
    /// an older SA of the same peer identity
    pub(crate) fn enforce_single_sa(&mut self, now: Instant, new_local_spi: u64) -> Vec<Output> {
        if !self.config.enforce_single_ike_sa {
            return vec![];
        }
        let Some(peer_id) = self
            .sas
            .get(&new_local_spi)
            .and_then(|sa| sa.peer_id.clone())
        else {
            return vec![];
        };
        let stale: Vec<u64> = self
            .sas
            .iter()
            .filter(|(spi, sa)| {
                **spi != new_local_spi
                    && sa.peer_id.as_ref() == Some(&peer_id)
                    && sa.state == SaState::Established
            })
            .map(|(spi, _)| *spi)
            .collect();
        let mut outputs = vec![];
        for spi in stale {
            info!(%peer_id, "single-IKE-SA: deleting the predecessor SA");
            outputs.extend(self.send_delete(now, spi));
        }
        outputs
    }
}
