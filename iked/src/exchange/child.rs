//! The CREATE_CHILD_SA exchange: additional children, child rekeys with
//! their collision tie-break, and the IKE SA rekey

use std::time::Instant;

use ikewire::defs::params::{
    ExchangeType, NotifyError, NotifyStatus, SecurityProtocol,
};
use ikewire::defs::{
    KeyExchange, Message, Notification, NotifyType, Payload, SecurityAssociation,
    TrafficSelectors,
};
use tracing::{debug, info, warn};

use crate::crypto::{self, DhExchange};
use crate::engine::{Engine, Output};
use crate::exchange::{narrow_selectors, PendingChildRekey};
use crate::kdf;
use crate::msg::PendingRequest;
use crate::sa::{IkeSa, RekeyState, SaState};
use crate::{Error, Result};

impl Engine {
    /// Soft lifetime of a child ran out: start its rekey
    pub(crate) fn start_child_rekey(
        &mut self,
        now: Instant,
        local_spi: u64,
        child_spi: u32,
    ) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let outputs = match self.send_child_rekey(now, &mut sa, child_spi) {
            Ok(outputs) => outputs,
            Err(Error::Internal(reason)) => vec![Output::Fatal { reason }],
            Err(e) => {
                warn!("starting child rekey: {e}");
                vec![]
            }
        };
        self.sas.insert(local_spi, sa);
        outputs
    }

    pub(crate) fn send_child_rekey(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        child_spi: u32,
    ) -> Result<Vec<Output>> {
        if sa.state != SaState::Established || sa.child_rekey.is_some() {
            return Ok(vec![]);
        }
        let Some(child) = sa.children.iter().find(|c| c.spi_local == child_spi) else {
            return Ok(vec![]);
        };
        let (ts_local, ts_peer) = (child.ts_local.clone(), child.ts_peer.clone());

        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let new_spi_local = crypto::random_esp_spi();
        let nonce = crypto::random_nonce();
        let dh = if sa.policy.template.pfs {
            let group = sa
                .suite
                .ok_or(Error::Internal("rekey without a suite".into()))?
                .ke;
            Some(DhExchange::new(group)?)
        } else {
            None
        };

        let mut inner = vec![
            Payload::Notify(Notification {
                protocol: Some(SecurityProtocol::EncapsulatingSecurityPayload),
                spi: Some(child_spi.to_be_bytes().to_vec()),
                notify_type: NotifyType::Status(NotifyStatus::RekeySa),
                data: vec![],
            }),
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![esp.to_proposal(
                    1,
                    new_spi_local,
                    dh.as_ref().map(|d| d.group()),
                )],
            }),
            Payload::Nonce(nonce.clone()),
        ];
        if let Some(dh) = &dh {
            inner.push(Payload::KeyExchange(KeyExchange {
                group: dh.group(),
                data: dh.public().to_vec(),
            }));
        }
        inner.push(Payload::TsInitiator(TrafficSelectors {
            selectors: ts_local,
        }));
        inner.push(Payload::TsResponder(TrafficSelectors { selectors: ts_peer }));

        sa.child_rekey = Some(PendingChildRekey {
            old_spi_local: child_spi,
            message_id: sa.msgids.next_send,
            our_nonce: nonce,
            dh,
            new_spi_local,
            collision_peer_nonce: None,
        });
        info!(sa = ?sa, old = format_args!("{child_spi:#010x}"), "rekeying child");
        self.send_request(now, sa, ExchangeType::CreateChildSa, inner)
    }

    /// Soft lifetime of the IKE SA itself: rekey it
    pub(crate) fn start_ike_rekey(&mut self, now: Instant, local_spi: u64) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let outputs = match self.send_ike_rekey(now, &mut sa) {
            Ok(outputs) => outputs,
            Err(Error::Internal(reason)) => vec![Output::Fatal { reason }],
            Err(e) => {
                warn!("starting IKE rekey: {e}");
                vec![]
            }
        };
        self.sas.insert(local_spi, sa);
        outputs
    }

    fn send_ike_rekey(&mut self, now: Instant, sa: &mut IkeSa) -> Result<Vec<Output>> {
        if sa.state != SaState::Established || sa.rekey.is_some() {
            return Ok(vec![]);
        }
        let suite = sa.suite.ok_or(Error::Internal("rekey without a suite".into()))?;
        let new_spi_i = crypto::random_ike_spi();
        let nonce = crypto::random_nonce();
        let dh = DhExchange::new(suite.ke)?;

        let transforms = sa
            .policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let inner = vec![
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![transforms.to_proposal(1, new_spi_i.to_be_bytes().to_vec())],
            }),
            Payload::Nonce(nonce.clone()),
            Payload::KeyExchange(KeyExchange {
                group: dh.group(),
                data: dh.public().to_vec(),
            }),
        ];
        sa.rekey = Some(RekeyState {
            new_spi_i,
            new_spi_r: 0,
            our_nonce: nonce,
            peer_nonce: None,
        });
        sa.dh = Some(dh);
        info!(sa = ?sa, "rekeying IKE SA");
        self.send_request(now, sa, ExchangeType::CreateChildSa, inner)
    }

    /// A CREATE_CHILD_SA request from the peer
    pub(crate) fn handle_create_child_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        if sa.state != SaState::Established {
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error(
                    NotifyError::TemporaryFailure,
                ))],
            );
        }
        let offered = inner
            .iter()
            .find_map(|p| match p {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or(Error::Protocol("CREATE_CHILD_SA without an SA payload"))?;

        // an IKE proposal means the peer rekeys the IKE SA itself
        if offered
            .proposals
            .iter()
            .any(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
        {
            return self.handle_ike_rekey_request(now, sa, msg, &inner);
        }
        self.handle_child_request(now, sa, msg, &inner)
    }

    /// Peer creates an additional child or rekeys one of ours
    fn handle_child_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        inner: &[Payload],
    ) -> Result<Vec<Output>> {
        let rekeyed_spi = inner.iter().find_map(|p| match p {
            Payload::Notify(n)
                if n.notify_type == NotifyType::Status(NotifyStatus::RekeySa) =>
            {
                n.spi
                    .as_deref()
                    .and_then(|spi| <[u8; 4]>::try_from(spi).ok())
                    .map(u32::from_be_bytes)
            }
            _ => None,
        });
        // the REKEY_SA notify names the SPI the peer receives on, which
        // is the one we send with
        let old_child_spi = match rekeyed_spi {
            Some(peer_inbound) => {
                let Some(child) = sa.children.iter().find(|c| c.spi_peer == peer_inbound) else {
                    return self.send_response(
                        sa,
                        ExchangeType::CreateChildSa,
                        msg.message_id,
                        vec![Payload::Notify(Notification::error(
                            NotifyError::ChildSaNotFound,
                        ))],
                    );
                };
                Some(child.spi_local)
            }
            None => None,
        };

        // crossing rekeys of the same child: remember the peer's lowest
        // nonce for the tie-break that runs when our own answer arrives
        if let (Some(old), Some(pending)) = (old_child_spi, sa.child_rekey.as_mut()) {
            if pending.old_spi_local == old {
                debug!(sa = ?sa, "simultaneous child rekey detected");
            }
        }

        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let Some((mut suite, peer_spi)) = esp.negotiate(&offered_proposals(inner)) else {
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error(
                    NotifyError::NoProposalChosen,
                ))],
            );
        };

        let peer_nonce = inner
            .iter()
            .find_map(|p| match p {
                Payload::Nonce(n) => Some(n.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("CREATE_CHILD_SA without a nonce"))?;
        let our_nonce = crypto::random_nonce();

        // optional PFS
        let ke = inner.iter().find_map(|p| match p {
            Payload::KeyExchange(ke) => Some(ke),
            _ => None,
        });
        let (our_ke_payload, shared) = match (suite.ke, ke) {
            (Some(group), Some(ke)) if ke.group == group => {
                let (public, shared) = DhExchange::respond(group, &ke.data)?;
                (
                    Some(Payload::KeyExchange(KeyExchange {
                        group,
                        data: public,
                    })),
                    Some(shared),
                )
            }
            (None, None) => (None, None),
            _ => {
                return self.send_response(
                    sa,
                    ExchangeType::CreateChildSa,
                    msg.message_id,
                    vec![Payload::Notify(Notification::error(
                        NotifyError::InvalidKePayload,
                    ))],
                )
            }
        };
        if shared.is_none() {
            suite.ke = None;
        }

        let ts_i = inner.iter().find_map(|p| match p {
            Payload::TsInitiator(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let ts_r = inner.iter().find_map(|p| match p {
            Payload::TsResponder(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let (permitted_local, permitted_peer) =
            crate::exchange::selectors_for_flows(&sa.policy.template.flows);
        let (Some(ts_i), Some(ts_r)) = (ts_i, ts_r) else {
            return Err(Error::Protocol("CREATE_CHILD_SA without selectors"));
        };
        let (Some(narrowed_peer), Some(narrowed_local)) = (
            narrow_selectors(&ts_i, &permitted_peer),
            narrow_selectors(&ts_r, &permitted_local),
        ) else {
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error(
                    NotifyError::TsUnacceptable,
                ))],
            );
        };

        let spi_local = crypto::random_esp_spi();
        let child = self.make_child(
            sa,
            suite,
            spi_local,
            peer_spi,
            narrowed_local.clone(),
            narrowed_peer.clone(),
            false,
            shared.as_deref().map(|s| &s[..]),
            (&peer_nonce, &our_nonce),
        )?;
        sa.children.push(child);
        let index = sa.children.len() - 1;
        if let Err(e) = self.install_child(now, sa, index) {
            warn!("kernel refused the child: {e}");
            sa.children.pop();
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error(
                    NotifyError::TemporaryFailure,
                ))],
            );
        }

        // the crossing-rekey bookkeeping for the tie-break
        if let (Some(old), Some(pending)) = (old_child_spi, sa.child_rekey.as_mut()) {
            if pending.old_spi_local == old {
                let peer_lowest = peer_nonce.clone().min(our_nonce.clone());
                pending.collision_peer_nonce = Some(peer_lowest);
            }
        }

        let mut payloads = vec![
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![suite.to_proposal(spi_local)],
            }),
            Payload::Nonce(our_nonce),
        ];
        if let Some(ke) = our_ke_payload {
            payloads.push(ke);
        }
        payloads.push(Payload::TsInitiator(TrafficSelectors {
            selectors: narrowed_peer,
        }));
        payloads.push(Payload::TsResponder(TrafficSelectors {
            selectors: narrowed_local,
        }));
        info!(sa = ?sa, spi = format_args!("{spi_local:#010x}"), "child created by peer");
        self.send_response(sa, ExchangeType::CreateChildSa, msg.message_id, payloads)
    }

    /// Peer rekeys the whole IKE SA
    fn handle_ike_rekey_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        inner: &[Payload],
    ) -> Result<Vec<Output>> {
        let transforms = sa
            .policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let offered = offered_proposals(inner);
        let Some(suite) = transforms.negotiate(&offered) else {
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error(
                    NotifyError::NoProposalChosen,
                ))],
            );
        };
        let new_spi_i = offered
            .iter()
            .find(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
            .and_then(|p| <[u8; 8]>::try_from(p.spi.as_slice()).ok())
            .map(u64::from_be_bytes)
            .ok_or(Error::Protocol("IKE rekey without an 8-octet SPI"))?;
        let peer_nonce = inner
            .iter()
            .find_map(|p| match p {
                Payload::Nonce(n) => Some(n.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("IKE rekey without a nonce"))?;
        let ke = inner
            .iter()
            .find_map(|p| match p {
                Payload::KeyExchange(ke) => Some(ke),
                _ => None,
            })
            .ok_or(Error::Protocol("IKE rekey without a key exchange"))?;
        if ke.group != suite.ke {
            return self.send_response(
                sa,
                ExchangeType::CreateChildSa,
                msg.message_id,
                vec![Payload::Notify(Notification::error_with_data(
                    NotifyError::InvalidKePayload,
                    (suite.ke as u16).to_be_bytes().to_vec(),
                ))],
            );
        }
        let (our_public, shared) = DhExchange::respond(ke.group, &ke.data)?;
        let new_spi_r = crypto::random_ike_spi();
        let our_nonce = crypto::random_nonce();

        let successor = self.spawn_rekeyed_sa(
            now,
            sa,
            suite,
            new_spi_i,
            new_spi_r,
            &peer_nonce,
            &our_nonce,
            &shared,
        )?;
        info!(
            old = format_args!("{:#018x}", sa.local_spi()),
            new = format_args!("{successor:#018x}"),
            "IKE SA rekeyed by peer"
        );

        let payloads = vec![
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![suite.to_proposal(new_spi_r.to_be_bytes().to_vec())],
            }),
            Payload::Nonce(our_nonce.clone()),
            Payload::KeyExchange(KeyExchange {
                group: suite.ke,
                data: our_public,
            }),
        ];
        let outputs = self.send_response(sa, ExchangeType::CreateChildSa, msg.message_id, payloads)?;
        // the old SA lingers until the peer's delete arrives
        Ok(outputs)
    }

    /// Build the successor SA of an IKE rekey and move the children
    /// over; returns its registry key
    #[allow(clippy::too_many_arguments)]
    fn spawn_rekeyed_sa(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        suite: crate::proposal::IkeSuite,
        new_spi_i: u64,
        new_spi_r: u64,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared: &[u8],
    ) -> Result<u64> {
        let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;

        let mut successor = super::sa_init::new_ike_sa(
            sa.role,
            new_spi_i,
            new_spi_r,
            sa.policy.clone(),
            sa.local,
            sa.peer,
        );
        successor.suite = Some(suite);
        successor.nonce_i = nonce_i.to_vec();
        successor.nonce_r = nonce_r.to_vec();
        successor.peer_id = sa.peer_id.clone();
        successor.local_id = sa.local_id.clone();
        successor.nat = sa.nat;
        successor.peer_frag = sa.peer_frag;
        successor.peer_mobike = sa.peer_mobike;
        successor.peer_sigsha2 = sa.peer_sigsha2;

        // SKEYSEED' comes from the old SA's derivation key
        let prf = crate::crypto::Prf::new(suite.prf);
        let seed = kdf::skeyseed_rekey(&prf, &keys.sk_d, Some(shared), nonce_i, nonce_r);
        let encr = crate::crypto::Encr::new(suite.encr.0, suite.encr.1)?;
        let integ = suite.integ.map(crate::crypto::Integrity::new).transpose()?;
        successor.keys = Some(kdf::sk_keys(
            &prf,
            &encr,
            integ.as_ref(),
            &seed,
            nonce_i,
            nonce_r,
            new_spi_i,
            new_spi_r,
        )?);
        successor.ike_crypto = Some(crate::sa::IkeCrypto { prf, encr, integ });

        // children change parents only once the new SA is established
        successor.establish()?;
        let new_local = successor.local_spi();
        for mut child in sa.children.drain(..) {
            child.parent = successor.spi_pair();
            // re-arm the lifetime timers under the new owner
            let (soft, hard) = (
                child.lifetime.soft_seconds,
                child.lifetime.hard_seconds,
            );
            self.timers.arm(
                now,
                std::time::Duration::from_secs(soft),
                crate::timer::TimerKey {
                    sa: new_local,
                    kind: crate::timer::TimerKind::RekeyChild(child.spi_local),
                },
            );
            self.timers.arm(
                now,
                std::time::Duration::from_secs(hard),
                crate::timer::TimerKey {
                    sa: new_local,
                    kind: crate::timer::TimerKind::ExpireChild(child.spi_local),
                },
            );
            successor.children.push(child);
        }
        successor.flows = std::mem::take(&mut sa.flows);
        self.arm_established_timers(now, &successor);
        self.sas.insert(new_local, successor);
        Ok(new_local)
    }

    /// A CREATE_CHILD_SA response to one of our requests
    pub(crate) fn handle_create_child_response(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        _request: &PendingRequest,
        msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        for notification in inner.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        }) {
            if let NotifyType::Error(error) = notification.notify_type {
                debug!(?error, "peer refused CREATE_CHILD_SA");
                sa.child_rekey = None;
                sa.rekey = None;
                return Ok(vec![]);
            }
        }

        if sa.rekey.is_some() {
            return self.complete_ike_rekey(now, sa, &inner);
        }
        if sa.child_rekey.is_some() {
            return self.complete_child_rekey(now, sa, msg, &inner);
        }
        Err(Error::Protocol("CREATE_CHILD_SA response without a request"))
    }

    fn complete_ike_rekey(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        inner: &[Payload],
    ) -> Result<Vec<Output>> {
        let rekey = sa
            .rekey
            .take()
            .ok_or(Error::Internal("rekey response without state".into()))?;
        let transforms = sa
            .policy
            .template
            .ike_transforms
            .clone()
            .unwrap_or_default();
        let chosen = offered_proposals(inner);
        let suite = transforms
            .negotiate(&chosen)
            .ok_or(Error::Protocol("rekey response without a usable proposal"))?;
        let new_spi_r = chosen
            .iter()
            .find(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
            .and_then(|p| <[u8; 8]>::try_from(p.spi.as_slice()).ok())
            .map(u64::from_be_bytes)
            .ok_or(Error::Protocol("rekey response without an 8-octet SPI"))?;
        let peer_nonce = inner
            .iter()
            .find_map(|p| match p {
                Payload::Nonce(n) => Some(n.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("rekey response without a nonce"))?;
        let ke = inner
            .iter()
            .find_map(|p| match p {
                Payload::KeyExchange(ke) => Some(ke),
                _ => None,
            })
            .ok_or(Error::Protocol("rekey response without a key exchange"))?;
        let dh = sa
            .dh
            .take()
            .ok_or(Error::Internal("rekey without an exchange".into()))?;
        if ke.group != dh.group() {
            return Err(Error::Protocol("responder switched the group"));
        }
        let shared = dh.complete(&ke.data)?;

        let successor = self.spawn_rekeyed_sa(
            now,
            sa,
            suite,
            rekey.new_spi_i,
            new_spi_r,
            &rekey.our_nonce,
            &peer_nonce,
            &shared,
        )?;
        info!(
            old = format_args!("{:#018x}", sa.local_spi()),
            new = format_args!("{successor:#018x}"),
            "IKE SA rekeyed"
        );
        // the old SA says goodbye
        let outputs = self.send_request(
            now,
            sa,
            ExchangeType::Informational,
            vec![Payload::Delete(ikewire::defs::Delete {
                protocol: SecurityProtocol::InternetKeyExchange,
                spis: vec![],
            })],
        )?;
        self.start_close(now, sa);
        Ok(outputs)
    }

    fn complete_child_rekey(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        _msg: &Message,
        inner: &[Payload],
    ) -> Result<Vec<Output>> {
        let pending = sa
            .child_rekey
            .take()
            .ok_or(Error::Internal("child rekey response without state".into()))?;
        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let Some((mut suite, peer_spi)) = esp.negotiate(&offered_proposals(inner)) else {
            return Err(Error::Protocol("rekey response without a usable proposal"));
        };
        let peer_nonce = inner
            .iter()
            .find_map(|p| match p {
                Payload::Nonce(n) => Some(n.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("rekey response without a nonce"))?;

        let shared = match (pending.dh, inner.iter().find_map(|p| match p {
            Payload::KeyExchange(ke) => Some(ke),
            _ => None,
        })) {
            (Some(dh), Some(ke)) => {
                if ke.group != dh.group() {
                    return Err(Error::Protocol("responder switched the group"));
                }
                Some(dh.complete(&ke.data)?)
            }
            (None, _) => None,
            (Some(_), None) => return Err(Error::Protocol("PFS rekey response without KE")),
        };
        if shared.is_none() {
            suite.ke = None;
        }

        let (ts_local, ts_peer) = if pending.old_spi_local == 0 {
            // a plain creation takes the policy's selectors
            crate::exchange::selectors_for_flows(&sa.policy.template.flows)
        } else {
            sa.children
                .iter()
                .find(|c| c.spi_local == pending.old_spi_local)
                .map(|c| (c.ts_local.clone(), c.ts_peer.clone()))
                .unwrap_or_default()
        };

        let child = self.make_child(
            sa,
            suite,
            pending.new_spi_local,
            peer_spi,
            ts_local,
            ts_peer,
            true,
            shared.as_deref().map(|s| &s[..]),
            (&pending.our_nonce, &peer_nonce),
        )?;
        sa.children.push(child);
        let index = sa.children.len() - 1;
        self.install_child(now, sa, index)?;

        // crossing rekeys: the exchange with the lowest nonce wins and
        // keeps its SA, the loser withdraws its replacement
        let our_lowest = pending.our_nonce.clone().min(peer_nonce);
        if let Some(peer_lowest) = pending.collision_peer_nonce {
            if our_lowest > peer_lowest {
                info!(sa = ?sa, "lost the rekey collision, withdrawing our replacement");
                let withdraw_spi = pending.new_spi_local;
                self.uninstall_child(sa, withdraw_spi)?;
                let outputs = self.send_request(
                    now,
                    sa,
                    ExchangeType::Informational,
                    vec![Payload::Delete(ikewire::defs::Delete {
                        protocol: SecurityProtocol::EncapsulatingSecurityPayload,
                        spis: vec![withdraw_spi.to_be_bytes().to_vec()],
                    })],
                )?;
                return Ok(outputs);
            }
        }

        if pending.old_spi_local == 0 {
            info!(sa = ?sa, "additional child established");
            return Ok(vec![]);
        }

        // the rekey initiator retires the replaced child
        info!(sa = ?sa, old = format_args!("{:#010x}", pending.old_spi_local), "child rekeyed");
        let old_spi = pending.old_spi_local;
        self.uninstall_child(sa, old_spi)?;
        let outputs = self.send_request(
            now,
            sa,
            ExchangeType::Informational,
            vec![Payload::Delete(ikewire::defs::Delete {
                protocol: SecurityProtocol::EncapsulatingSecurityPayload,
                spis: vec![old_spi.to_be_bytes().to_vec()],
            })],
        )?;
        Ok(outputs)
    }
}

fn offered_proposals(inner: &[Payload]) -> Vec<ikewire::defs::Proposal> {
    inner
        .iter()
        .find_map(|p| match p {
            Payload::SecurityAssociation(sa) => Some(sa.proposals.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

impl Engine {
    /// Send an INFORMATIONAL delete for the whole IKE SA and start
    /// closing it
    pub(crate) fn send_delete(&mut self, now: Instant, local_spi: u64) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let outputs = self
            .send_request(
                now,
                &mut sa,
                ExchangeType::Informational,
                vec![Payload::Delete(ikewire::defs::Delete {
                    protocol: SecurityProtocol::InternetKeyExchange,
                    spis: vec![],
                })],
            )
            .unwrap_or_default();
        self.start_close(now, &mut sa);
        self.sas.insert(local_spi, sa);
        outputs
    }

    /// Negotiate an additional child SA on an established IKE SA
    pub fn initiate_child(&mut self, now: Instant, peer: std::net::SocketAddr) -> Vec<Output> {
        let Some((&local_spi, _)) = self
            .sas
            .iter()
            .find(|(_, sa)| sa.peer == peer && sa.state == SaState::Established)
        else {
            return vec![];
        };
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let outputs = match self.send_child_create(now, &mut sa) {
            Ok(outputs) => outputs,
            Err(Error::Internal(reason)) => vec![Output::Fatal { reason }],
            Err(e) => {
                warn!("creating an additional child: {e}");
                vec![]
            }
        };
        self.sas.insert(local_spi, sa);
        outputs
    }

    /// A plain child creation is a rekey without a predecessor: the
    /// pending state uses SPI zero for "nothing to replace"
    fn send_child_create(&mut self, now: Instant, sa: &mut IkeSa) -> Result<Vec<Output>> {
        if sa.child_rekey.is_some() {
            return Ok(vec![]);
        }
        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let new_spi_local = crypto::random_esp_spi();
        let nonce = crypto::random_nonce();
        let (ts_local, ts_peer) =
            crate::exchange::selectors_for_flows(&sa.policy.template.flows);

        let inner = vec![
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![esp.to_proposal(1, new_spi_local, None)],
            }),
            Payload::Nonce(nonce.clone()),
            Payload::TsInitiator(TrafficSelectors {
                selectors: ts_local,
            }),
            Payload::TsResponder(TrafficSelectors { selectors: ts_peer }),
        ];
        sa.child_rekey = Some(PendingChildRekey {
            old_spi_local: 0,
            message_id: sa.msgids.next_send,
            our_nonce: nonce,
            dh: None,
            new_spi_local,
            collision_peer_nonce: None,
        });
        self.send_request(now, sa, ExchangeType::CreateChildSa, inner)
    }

    /// Used by the tests to force a child rekey regardless of timers
    pub fn rekey_child_now(&mut self, now: Instant, peer: std::net::SocketAddr) -> Vec<Output> {
        let Some((&local_spi, sa)) = self.sas.iter().find(|(_, sa)| sa.peer == peer) else {
            return vec![];
        };
        let Some(child_spi) = sa.children.first().map(|c| c.spi_local) else {
            return vec![];
        };
        self.start_child_rekey(now, local_spi, child_spi)
    }
}
