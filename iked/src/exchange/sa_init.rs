//! The IKE_SA_INIT exchange: proposal and key exchange negotiation,
//! cookie handling, NAT detection and the SK_ key derivation

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use ikewire::defs::params::{ExchangeType, KeyExchangeMethod, NotifyError, NotifyStatus};
use ikewire::defs::{
    KeyExchange, Message, Notification, NotifyType, Payload, SecurityAssociation,
};
use tracing::{debug, info, warn};

use crate::crypto::{self, DhExchange, Encr, Integrity, Prf};
use crate::engine::{Engine, Output};
use crate::kdf;
use crate::msg::PendingRequest;
use crate::sa::{IkeCrypto, IkeSa, MsgIds, NatState, Role, SaState};
use crate::timer::{TimerKey, TimerKind};
use crate::{Error, Result};

impl Engine {
    /// Start dialing the named policy's peer
    pub fn initiate(
        &mut self,
        now: Instant,
        policy_name: &str,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Vec<Output>> {
        let policy = self
            .policies
            .iter()
            .find(|p| p.template.name == policy_name)
            .cloned()
            .ok_or(Error::Config(format!("no policy named {policy_name}")))?;
        let transforms = policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let group = *transforms
            .ke
            .first()
            .ok_or(Error::Config("policy without key exchange methods".into()))?;

        let mut sa = new_ike_sa(
            Role::Initiator,
            crypto::random_ike_spi(),
            0,
            policy,
            local,
            peer,
        );
        sa.dh = Some(DhExchange::new(group)?);
        sa.nonce_i = crypto::random_nonce();

        let outputs = self.send_sa_init_request(now, &mut sa)?;
        info!(sa = ?sa, "initiating");
        self.sas.insert(sa.local_spi(), sa);
        Ok(outputs)
    }

    /// Build (or rebuild, after a cookie or INVALID_KE round) and send
    /// the IKE_SA_INIT request
    fn send_sa_init_request(&mut self, now: Instant, sa: &mut IkeSa) -> Result<Vec<Output>> {
        let transforms = sa
            .policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let dh = sa
            .dh
            .as_ref()
            .ok_or(Error::Internal("initiator without an exchange".into()))?;

        let mut payloads = vec![];
        if let Some(cookie) = &sa.cookie {
            payloads.push(Payload::Notify(Notification::status_with_data(
                NotifyStatus::Cookie,
                cookie.clone(),
            )));
        }
        payloads.push(Payload::SecurityAssociation(SecurityAssociation {
            proposals: vec![transforms.to_proposal(1, vec![])],
        }));
        payloads.push(Payload::KeyExchange(KeyExchange {
            group: dh.group(),
            data: dh.public().to_vec(),
        }));
        payloads.push(Payload::Nonce(sa.nonce_i.clone()));
        for notify in crate::nat::detection_notifies(sa.spi_i, 0, &sa.local, &sa.peer) {
            payloads.push(Payload::Notify(notify));
        }
        if self.config.fragmentation {
            payloads.push(Payload::Notify(Notification::status(
                NotifyStatus::FragmentationSupported,
            )));
        }
        payloads.push(Payload::Notify(Notification::status_with_data(
            NotifyStatus::SignatureHashAlgorithms,
            crate::ca::SIGNATURE_HASHES
                .iter()
                .flat_map(|h| h.to_be_bytes())
                .collect(),
        )));

        let message = Message {
            initiator_spi: sa.spi_i,
            responder_spi: 0,
            exchange_type: ExchangeType::IkeSaInit,
            initiator: true,
            response: false,
            message_id: 0,
            payloads,
        };
        let bytes = message.try_build()?;
        sa.our_init_message = bytes.clone();
        sa.state = SaState::SaInitSent;
        sa.msgids.next_send = 1;

        // message id 0 is re-used by the cookie and INVALID_KE retries
        sa.requests.acknowledge(0);
        sa.requests.push(PendingRequest {
            message_id: 0,
            datagrams: vec![bytes.clone()],
            exchange: ExchangeType::IkeSaInit,
            attempts: 1,
        });
        self.timers.arm(
            now,
            crate::msg::RETRANSMIT_BASE,
            TimerKey {
                sa: sa.local_spi(),
                kind: TimerKind::Retransmit(0),
            },
        );
        Ok(vec![self.datagram_out(sa, bytes)])
    }

    /// Dispatch an IKE_SA_INIT datagram
    pub(crate) fn handle_sa_init(
        &mut self,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        _natt: bool,
        msg: &Message,
        raw: &[u8],
    ) -> Vec<Output> {
        if msg.response {
            self.handle_sa_init_response(now, msg, raw)
        } else {
            self.handle_sa_init_request(now, local, peer, msg, raw)
        }
    }

    /// Responder side of IKE_SA_INIT
    fn handle_sa_init_request(
        &mut self,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        msg: &Message,
        raw: &[u8],
    ) -> Vec<Output> {
        // a retransmitted first message of a known half-open SA is
        // answered from the cache
        if let Some(sa) = self
            .sas
            .values()
            .find(|sa| sa.role == Role::Responder && sa.spi_i == msg.initiator_spi)
        {
            if let Some(cached) = sa.responses.get(0) {
                return cached
                    .clone()
                    .into_iter()
                    .map(|bytes| self.datagram_out(sa, bytes))
                    .collect();
            }
        }

        let Some(nonce_i) = msg.find(|p| match p {
            Payload::Nonce(n) => Some(n.as_slice()),
            _ => None,
        }) else {
            debug!(%peer, "IKE_SA_INIT without a nonce");
            return vec![];
        };
        let nonce_i = nonce_i.to_vec();

        // stateless cookie defense while under load
        if self.under_load() {
            let echoed = msg
                .status_notify(NotifyStatus::Cookie)
                .map(|n| n.data.clone());
            let valid = echoed
                .as_deref()
                .map(|cookie| self.cookies.verify(cookie, &nonce_i, &peer.ip(), msg.initiator_spi))
                .unwrap_or(false);
            if !valid {
                let cookie = self.cookies.mint(&nonce_i, &peer.ip(), msg.initiator_spi);
                debug!(%peer, "demanding a cookie");
                return vec![stateless_reply(
                    msg,
                    local,
                    peer,
                    vec![Payload::Notify(Notification::status_with_data(
                        NotifyStatus::Cookie,
                        cookie,
                    ))],
                )];
            }
        }

        let Some(policy) = self.policies.lookup(&local.ip(), &peer.ip(), None) else {
            debug!(%peer, "no policy for peer");
            return vec![];
        };
        let transforms = policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();

        let Some(offered) = msg.find(|p| match p {
            Payload::SecurityAssociation(sa) => Some(sa),
            _ => None,
        }) else {
            debug!(%peer, "IKE_SA_INIT without an SA payload");
            return vec![];
        };
        let Some(suite) = transforms.negotiate(&offered.proposals) else {
            debug!(%peer, "no proposal chosen");
            return vec![stateless_reply(
                msg,
                local,
                peer,
                vec![Payload::Notify(Notification::error(
                    NotifyError::NoProposalChosen,
                ))],
            )];
        };

        let Some(ke) = msg.find(|p| match p {
            Payload::KeyExchange(ke) => Some(ke),
            _ => None,
        }) else {
            debug!(%peer, "IKE_SA_INIT without a KE payload");
            return vec![];
        };
        // a key share for a group we scored lower than the one we chose
        // costs the initiator one retry with the chosen group
        if ke.group != suite.ke {
            debug!(%peer, offered = ?ke.group, want = ?suite.ke, "INVALID_KE_PAYLOAD");
            return vec![stateless_reply(
                msg,
                local,
                peer,
                vec![Payload::Notify(Notification::error_with_data(
                    NotifyError::InvalidKePayload,
                    (suite.ke as u16).to_be_bytes().to_vec(),
                ))],
            )];
        }
        if DhExchange::peer_len(ke.group, true)
            .map(|want| want != ke.data.len())
            .unwrap_or(true)
        {
            debug!(%peer, "malformed key exchange data");
            return vec![];
        }

        let (our_public, shared) = match DhExchange::respond(ke.group, &ke.data) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(%peer, "key exchange failed: {e}");
                return vec![];
            }
        };

        let mut sa = new_ike_sa(
            Role::Responder,
            msg.initiator_spi,
            crypto::random_ike_spi(),
            policy,
            local,
            peer,
        );
        sa.nonce_i = nonce_i;
        sa.nonce_r = crypto::random_nonce();
        sa.suite = Some(suite);
        sa.peer_init_message = raw.to_vec();
        sa.peer_frag = msg.status_notify(NotifyStatus::FragmentationSupported).is_some();
        sa.peer_sigsha2 = msg
            .status_notify(NotifyStatus::SignatureHashAlgorithms)
            .map(|n| n.data.chunks(2).any(|c| matches!(c, [0, 2] | [0, 3] | [0, 4])))
            .unwrap_or(false);
        let (peer_nat, local_nat) = crate::nat::evaluate(msg, &peer, &local);
        sa.nat = NatState {
            local_behind: local_nat,
            peer_behind: peer_nat,
            active: peer_nat || local_nat,
        };

        // our response payloads
        let mut payloads = vec![
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![suite.to_proposal(vec![])],
            }),
            Payload::KeyExchange(KeyExchange {
                group: suite.ke,
                data: our_public,
            }),
            Payload::Nonce(sa.nonce_r.clone()),
        ];
        for notify in crate::nat::detection_notifies(sa.spi_i, sa.spi_r, &sa.local, &sa.peer) {
            payloads.push(Payload::Notify(notify));
        }
        if self.config.fragmentation && sa.peer_frag {
            payloads.push(Payload::Notify(Notification::status(
                NotifyStatus::FragmentationSupported,
            )));
        }
        payloads.push(Payload::Notify(Notification::status_with_data(
            NotifyStatus::SignatureHashAlgorithms,
            crate::ca::SIGNATURE_HASHES
                .iter()
                .flat_map(|h| h.to_be_bytes())
                .collect(),
        )));
        // hint which anchors we can verify chains against
        if matches!(
            sa.policy.template.auth,
            crate::policy::AuthConfig::Signature
        ) && !self.certreq_hints.is_empty()
        {
            payloads.push(Payload::CertificateRequest(
                ikewire::defs::CertificateRequest {
                    encoding: ikewire::defs::params::CertificateEncoding::X509CertificateSignature,
                    hashes: self.certreq_hints.clone(),
                },
            ));
        }

        let response = Message {
            initiator_spi: sa.spi_i,
            responder_spi: sa.spi_r,
            exchange_type: ExchangeType::IkeSaInit,
            initiator: false,
            response: true,
            message_id: 0,
            payloads,
        };
        let bytes = match response.try_build() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("building IKE_SA_INIT response: {e}");
                return vec![];
            }
        };
        sa.our_init_message = bytes.clone();

        if let Err(e) = derive_ike_keys(&mut sa, &shared) {
            warn!("deriving keys: {e}");
            return vec![];
        }
        sa.state = SaState::SaInitDone;
        sa.msgids.next_recv = 1;
        sa.responses.insert(0, vec![bytes.clone()]);

        let out = self.datagram_out(&sa, bytes);
        self.half_open += 1;
        debug!(sa = ?sa, "responder keys derived");
        self.sas.insert(sa.local_spi(), sa);
        vec![out]
    }

    /// Initiator side: the responder answered our IKE_SA_INIT
    fn handle_sa_init_response(&mut self, now: Instant, msg: &Message, raw: &[u8]) -> Vec<Output> {
        let local_spi = msg.initiator_spi;
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        if sa.state != SaState::SaInitSent {
            self.sas.insert(local_spi, sa);
            return vec![];
        }

        let outputs = self.complete_sa_init(now, &mut sa, msg, raw);
        match outputs {
            Ok(outputs) => {
                if sa.state == SaState::Closed {
                    self.drop_sa(&mut sa);
                } else {
                    self.sas.insert(local_spi, sa);
                }
                outputs
            }
            Err(e) => {
                warn!(sa = ?sa, "IKE_SA_INIT failed: {e}");
                self.start_close(now, &mut sa);
                self.sas.insert(local_spi, sa);
                vec![]
            }
        }
    }

    fn complete_sa_init(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        raw: &[u8],
    ) -> Result<Vec<Output>> {
        // a cookie demand costs one stateless retry
        if let Some(cookie) = msg.status_notify(NotifyStatus::Cookie) {
            if sa.cookie.is_some() {
                return Err(Error::Protocol("responder demanded a second cookie"));
            }
            debug!(sa = ?sa, "echoing responder cookie");
            sa.cookie = Some(cookie.data.clone());
            return self.send_sa_init_request(now, sa);
        }
        // a group correction costs exactly one retry
        if let Some(invalid_ke) = msg.error_notify(NotifyError::InvalidKePayload) {
            let Some(dh) = sa.dh.take() else {
                return Err(Error::Protocol("INVALID_KE_PAYLOAD after key exchange"));
            };
            let group_id = u16::from_be_bytes(
                invalid_ke
                    .data
                    .get(..2)
                    .ok_or(Error::Protocol("INVALID_KE_PAYLOAD without a group"))?
                    .try_into()
                    .unwrap_or([0, 0]),
            );
            let group = KeyExchangeMethod::try_from(group_id)
                .map_err(|_| Error::Protocol("peer demanded an unknown group"))?;
            if group == dh.group() {
                return Err(Error::Protocol("peer demanded the group we offered"));
            }
            let transforms = sa
                .policy
                .template
                .ike_transforms
                .clone()
                .unwrap_or_default();
            if !transforms.ke.contains(&group) {
                return Err(Error::Protocol("peer demanded a group outside the policy"));
            }
            info!(sa = ?sa, ?group, "retrying with the responder's group");
            sa.dh = Some(DhExchange::new(group)?);
            return self.send_sa_init_request(now, sa);
        }
        for notification in msg.notifications() {
            if let NotifyType::Error(error) = notification.notify_type {
                return Err(match error {
                    NotifyError::NoProposalChosen => Error::Protocol("no proposal chosen"),
                    _ => Error::Protocol("responder refused IKE_SA_INIT"),
                });
            }
        }

        // the real response: fix the responder SPI, check the choice
        sa.requests.acknowledge(0);
        self.timers.cancel(&TimerKey {
            sa: sa.local_spi(),
            kind: TimerKind::Retransmit(0),
        });
        sa.spi_r = msg.responder_spi;
        if sa.spi_r == 0 {
            return Err(Error::Protocol("responder chose a zero SPI"));
        }

        let transforms = sa
            .policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let chosen = msg
            .find(|p| match p {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or(Error::Protocol("response without an SA payload"))?;
        let suite = transforms
            .negotiate(&chosen.proposals)
            .ok_or(Error::Protocol("responder chose an unacceptable proposal"))?;
        let ke = msg
            .find(|p| match p {
                Payload::KeyExchange(ke) => Some(ke),
                _ => None,
            })
            .ok_or(Error::Protocol("response without a KE payload"))?;
        let dh = sa
            .dh
            .take()
            .ok_or(Error::Internal("initiator without an exchange".into()))?;
        if ke.group != dh.group() {
            return Err(Error::Protocol("responder switched the group"));
        }
        let nonce_r = msg
            .find(|p| match p {
                Payload::Nonce(n) => Some(n.as_slice()),
                _ => None,
            })
            .ok_or(Error::Protocol("response without a nonce"))?;

        sa.suite = Some(suite);
        sa.nonce_r = nonce_r.to_vec();
        sa.peer_init_message = raw.to_vec();
        sa.peer_frag = msg.status_notify(NotifyStatus::FragmentationSupported).is_some();
        sa.peer_sigsha2 = msg
            .status_notify(NotifyStatus::SignatureHashAlgorithms)
            .map(|n| n.data.chunks(2).any(|c| matches!(c, [0, 2] | [0, 3] | [0, 4])))
            .unwrap_or(false);

        let (peer_nat, local_nat) = crate::nat::evaluate(msg, &sa.peer, &sa.local);
        if peer_nat || local_nat {
            // float to the NAT traversal port for everything that follows
            sa.nat = NatState {
                local_behind: local_nat,
                peer_behind: peer_nat,
                active: true,
            };
            sa.local.set_port(self.config.natt_port);
            sa.peer.set_port(self.config.natt_port);
            debug!(sa = ?sa, "NAT detected, floating to the NAT-T port");
        }

        let shared = dh.complete(&ke.data)?;
        derive_ike_keys(sa, &shared)?;
        sa.state = SaState::SaInitDone;
        debug!(sa = ?sa, "initiator keys derived");

        // straight on to IKE_AUTH
        self.send_ike_auth_request(now, sa)
    }
}

/// A stateless reply to a first message: no SA is allocated
fn stateless_reply(
    msg: &Message,
    local: SocketAddr,
    peer: SocketAddr,
    payloads: Vec<Payload>,
) -> Output {
    let response = Message {
        initiator_spi: msg.initiator_spi,
        responder_spi: 0,
        exchange_type: ExchangeType::IkeSaInit,
        initiator: false,
        response: true,
        message_id: 0,
        payloads,
    };
    Output::Datagram {
        local,
        peer,
        natt: false,
        bytes: response.try_build().unwrap_or_default(),
    }
}

/// Construct a fresh SA shell
pub(crate) fn new_ike_sa(
    role: Role,
    spi_i: u64,
    spi_r: u64,
    policy: std::sync::Arc<crate::policy::Policy>,
    local: SocketAddr,
    peer: SocketAddr,
) -> IkeSa {
    IkeSa {
        spi_i,
        spi_r,
        role,
        state: SaState::Init,
        policy,
        suite: None,
        ike_crypto: None,
        dh: None,
        nonce_i: vec![],
        nonce_r: vec![],
        keys: None,
        local_id: None,
        peer_id: None,
        peer_cert: None,
        local,
        peer,
        nat: NatState::default(),
        msgids: MsgIds::default(),
        requests: Default::default(),
        responses: Default::default(),
        our_init_message: vec![],
        peer_init_message: vec![],
        cookie: None,
        children: vec![],
        flows: vec![],
        reassembly: Default::default(),
        peer_mobike: false,
        peer_frag: false,
        peer_sigsha2: false,
        dpd_misses: 0,
        pool_lease: None,
        rekey: None,
        child_rekey: None,
        eap: None,
        eap_msk: None,
        mobike_pending: false,
        awaiting_ca: None,
        outbox: VecDeque::new(),
    }
}

/// Derive SKEYSEED and the seven SK_ keys from the negotiated suite
pub(crate) fn derive_ike_keys(sa: &mut IkeSa, shared: &[u8]) -> Result<()> {
    let suite = sa
        .suite
        .ok_or(Error::Internal("deriving keys without a suite".into()))?;
    let prf = Prf::new(suite.prf);
    let encr = Encr::new(suite.encr.0, suite.encr.1)?;
    let integ = suite.integ.map(Integrity::new).transpose()?;

    let seed = kdf::skeyseed(&prf, &sa.nonce_i, &sa.nonce_r, shared);
    let keys = kdf::sk_keys(
        &prf,
        &encr,
        integ.as_ref(),
        &seed,
        &sa.nonce_i,
        &sa.nonce_r,
        sa.spi_i,
        sa.spi_r,
    )?;
    sa.keys = Some(keys);
    sa.ike_crypto = Some(IkeCrypto { prf, encr, integ });
    Ok(())
}
