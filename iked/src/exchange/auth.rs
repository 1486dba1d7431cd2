//! The IKE_AUTH exchange: identities, AUTH payloads, the optional EAP
//! conversation and the first child SA

use std::time::Instant;

use ikewire::defs::params::{
    AuthMethod, CertificateEncoding, ConfigType, ExchangeType, NotifyError, NotifyStatus,
};
use ikewire::defs::{
    Authentication, Certificate, ConfigAttribute, Configuration, Message, Notification, Payload,
    SecurityAssociation, TrafficSelectors,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::ca::CaRequest;
use crate::crypto::{self, Encr, Integrity};
use crate::eap::{EapState, EapStep};
use crate::engine::{Engine, Output};
use crate::exchange::{auth_octets, narrow_selectors, psk_auth, selectors_for_flows, AwaitingCa};
use crate::kdf;
use crate::policy::AuthConfig;
use crate::sa::{ChildSa, IkeId, IkeSa, Role, SaState};
use crate::{Error, Result};

impl Engine {
    /// Initiator: compose and send the IKE_AUTH request right after the
    /// SA_INIT keys are in place
    pub(crate) fn send_ike_auth_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
    ) -> Result<Vec<Output>> {
        let local_id = sa
            .policy
            .template
            .local_id
            .clone()
            .or(self.config.local_id.clone())
            .unwrap_or(IkeId::from_addr(sa.local.ip()));
        sa.local_id = Some(local_id.clone());

        // the first child rides along: fresh SPI, our selectors
        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let spi_local = crypto::random_esp_spi();
        let (ts_local, ts_peer) = selectors_for_flows(&sa.policy.template.flows);

        let mut inner = vec![Payload::IdInitiator(local_id.to_wire())];
        let (prf, octets) = {
            let crypto = sa
                .ike_crypto
                .as_ref()
                .ok_or(Error::Internal("IKE_AUTH before keys".into()))?;
            let keys = sa.keys.as_ref().ok_or(Error::Internal("no keys".into()))?;
            (
                crypto.prf,
                auth_octets(
                    &crypto.prf,
                    &sa.our_init_message,
                    &sa.nonce_r,
                    &keys.sk_pi,
                    &local_id,
                ),
            )
        };

        let mut tail = vec![Payload::Notify(Notification::status(
            NotifyStatus::InitialContact,
        ))];
        if self.config.mobike {
            tail.push(Payload::Notify(Notification::status(
                NotifyStatus::MobikeSupported,
            )));
        }
        if sa.policy.template.request_address {
            // an empty attribute asks the responder to assign one
            tail.push(Payload::Configuration(Configuration {
                cfg_type: ConfigType::Request,
                attributes: vec![ConfigAttribute {
                    attribute_type: 1,
                    value: vec![],
                }],
            }));
        }
        tail.extend([
            Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![esp.to_proposal(1, spi_local, None)],
            }),
            Payload::TsInitiator(TrafficSelectors {
                selectors: ts_local.clone(),
            }),
            Payload::TsResponder(TrafficSelectors {
                selectors: ts_peer.clone(),
            }),
        ]);

        // remember the larval child; the response completes it
        sa.children.push(ChildSa {
            spi_local,
            spi_peer: 0,
            protocol: ikewire::defs::params::SecurityProtocol::EncapsulatingSecurityPayload,
            suite: crate::proposal::EspSuite {
                proposal_number: 1,
                encr: *esp.encr.first().ok_or(Error::Config("empty ESP transforms".into()))?,
                integ: None,
                esn: ikewire::defs::params::ExtendedSequenceNumbers::None,
                ke: None,
            },
            keys: None,
            ts_local,
            ts_peer,
            parent: sa.spi_pair(),
            initiated_by_us: true,
            ipcomp_cpi: None,
            loaded: false,
            lifetime: sa.policy.template.lifetime,
            age: Default::default(),
        });

        let auth_config = sa.policy.template.auth.clone();
        match auth_config {
            AuthConfig::PreSharedKey(secret) => {
                let auth = psk_auth(&prf, &secret, &octets);
                inner.push(Payload::Authentication(Authentication {
                    method: AuthMethod::SharedKeyMessageIntegrityCode,
                    data: auth,
                }));
                inner.extend(tail);
                sa.state = SaState::AuthSent;
                self.send_request(now, sa, ExchangeType::IkeAuth, inner)
            }
            AuthConfig::Signature | AuthConfig::RawPublicKey => {
                // the private key lives in the CA process; park until
                // the signature comes back
                inner.extend(tail);
                sa.awaiting_ca = Some(AwaitingCa::Signature { inner });
                sa.state = SaState::AuthSent;
                Ok(vec![Output::CaRequest(CaRequest::Sign {
                    sa: sa.spi_pair(),
                    octets,
                    peer_sigsha2: sa.peer_sigsha2,
                })])
            }
            AuthConfig::EapMschapV2 { .. } => {
                Err(Error::Config("EAP policies cannot dial out".into()))
            }
        }
    }

    /// Responder: the peer's IKE_AUTH request (or a round of its EAP
    /// conversation) arrived
    pub(crate) fn handle_auth_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        if sa.role != Role::Responder {
            return Err(Error::Protocol("IKE_AUTH request at the initiator"));
        }
        match sa.state {
            SaState::SaInitDone => {}
            SaState::Eap | SaState::EapSuccess => {
                return self.continue_eap(now, sa, msg, inner);
            }
            _ => return Err(Error::Protocol("IKE_AUTH in the wrong state")),
        }

        let peer_wire_id = inner
            .iter()
            .find_map(|p| match p {
                Payload::IdInitiator(id) => Some(id),
                _ => None,
            })
            .ok_or(Error::Protocol("IKE_AUTH without IDi"))?;
        let peer_id = IkeId::from_wire(peer_wire_id)?;
        // the policy match is refined once the identity is on the table
        if let Some(better) = self
            .policies
            .lookup(&sa.local.ip(), &sa.peer.ip(), Some(&peer_id))
        {
            sa.policy = better;
        }
        if let Some(required) = &sa.policy.template.peer_id {
            if *required != peer_id {
                return Err(Error::Authentication("peer identity not permitted"));
            }
        }
        sa.peer_id = Some(peer_id.clone());
        sa.peer_cert = inner.iter().find_map(|p| match p {
            Payload::Certificate(Certificate {
                encoding: CertificateEncoding::X509CertificateSignature,
                data,
            }) => Some(data.clone()),
            _ => None,
        });

        let auth = inner.iter().find_map(|p| match p {
            Payload::Authentication(a) => Some(a.clone()),
            _ => None,
        });
        let policy_auth = sa.policy.template.auth.clone();
        match (auth, policy_auth) {
            (None, AuthConfig::EapMschapV2 { gateway_psk, .. }) => {
                // EAP: we authenticate now, the peer over the coming rounds
                let (eap, identity_request) = EapState::start();
                sa.eap = Some(eap);
                sa.state = SaState::Eap;
                let reply = self.responder_id_and_auth(sa, &gateway_psk)?;
                let mut payloads = reply;
                payloads.push(Payload::Eap(identity_request));
                self.send_response(sa, ExchangeType::IkeAuth, msg.message_id, payloads)
            }
            (None, _) => Err(Error::Authentication("peer sent no AUTH payload")),
            (Some(auth), AuthConfig::PreSharedKey(secret)) => {
                if auth.method != AuthMethod::SharedKeyMessageIntegrityCode {
                    return Err(Error::Authentication("unexpected auth method"));
                }
                let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
                let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
                let octets = auth_octets(
                    &crypto.prf,
                    &sa.peer_init_message,
                    &sa.nonce_r,
                    &keys.sk_pi,
                    &peer_id,
                );
                let expected = psk_auth(&crypto.prf, &secret, &octets);
                if !crypto::constant_time_eq(&expected, &auth.data) {
                    return Err(Error::Authentication("shared secret mismatch"));
                }
                info!(peer = %peer_id, "peer authenticated by shared secret");
                self.finish_responder_auth(now, sa, msg.message_id, &inner, &secret)
            }
            (Some(auth), AuthConfig::Signature | AuthConfig::RawPublicKey) => {
                // long-running verification belongs to the CA process;
                // park this SA and resume on its verdict
                let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
                let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
                let octets = auth_octets(
                    &crypto.prf,
                    &sa.peer_init_message,
                    &sa.nonce_r,
                    &keys.sk_pi,
                    &peer_id,
                );
                sa.awaiting_ca = Some(AwaitingCa::AuthVerdict {
                    inner,
                    response: false,
                });
                Ok(vec![Output::CaRequest(CaRequest::VerifyAuth {
                    sa: sa.spi_pair(),
                    cert: sa.peer_cert.clone(),
                    peer_id,
                    method: auth.method,
                    octets,
                    signature: auth.data,
                })])
            }
            (Some(_), AuthConfig::EapMschapV2 { .. }) => {
                Err(Error::Authentication("EAP policy but the peer sent AUTH"))
            }
        }
    }

    /// Responder: IDr plus our AUTH payload computed from the shared
    /// credential
    fn responder_id_and_auth(&self, sa: &mut IkeSa, secret: &[u8]) -> Result<Vec<Payload>> {
        let local_id = sa
            .policy
            .template
            .local_id
            .clone()
            .or(self.config.local_id.clone())
            .unwrap_or(IkeId::from_addr(sa.local.ip()));
        sa.local_id = Some(local_id.clone());
        let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
        let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
        let octets = auth_octets(
            &crypto.prf,
            &sa.our_init_message,
            &sa.nonce_i,
            &keys.sk_pr,
            &local_id,
        );
        let auth = psk_auth(&crypto.prf, secret, &octets);
        Ok(vec![
            Payload::IdResponder(local_id.to_wire()),
            Payload::Authentication(Authentication {
                method: AuthMethod::SharedKeyMessageIntegrityCode,
                data: auth,
            }),
        ])
    }

    /// Responder: the peer proved itself; negotiate the first child,
    /// answer with our own shared-credential AUTH and establish
    pub(crate) fn finish_responder_auth(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        message_id: u32,
        inner: &[Payload],
        our_secret: &[u8],
    ) -> Result<Vec<Output>> {
        let head = self.responder_id_and_auth(sa, our_secret)?;
        self.complete_responder(now, sa, message_id, inner, head)
    }

    /// Responder tail shared by the credential kinds: serve the
    /// configuration request, negotiate the child, respond, establish
    fn complete_responder(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        message_id: u32,
        inner: &[Payload],
        head: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        let mut payloads = head;
        sa.peer_mobike = inner.iter().any(|p| {
            matches!(
                p,
                Payload::Notify(n)
                    if n.notify_type
                        == ikewire::defs::NotifyType::Status(NotifyStatus::MobikeSupported)
            )
        }) && self.config.mobike;
        if self.config.mobike {
            payloads.push(Payload::Notify(Notification::status(
                NotifyStatus::MobikeSupported,
            )));
        }

        // a configuration request is served from the policy pool
        let wants_address = inner.iter().any(|p| {
            matches!(
                p,
                Payload::Configuration(Configuration {
                    cfg_type: ConfigType::Request,
                    ..
                })
            )
        });
        if wants_address {
            if let (Some(pool), Some(peer_id)) = (
                self.pools.get_mut(&sa.policy.template.name),
                sa.peer_id.clone(),
            ) {
                if let Some(address) = pool.allocate(&peer_id) {
                    sa.pool_lease = Some(address);
                    let value = match address {
                        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                        std::net::IpAddr::V6(v6) => {
                            let mut v = v6.octets().to_vec();
                            v.push(128);
                            v
                        }
                    };
                    payloads.push(Payload::Configuration(Configuration {
                        cfg_type: ConfigType::Reply,
                        attributes: vec![ConfigAttribute {
                            attribute_type: if address.is_ipv4() { 1 } else { 8 },
                            value,
                        }],
                    }));
                    info!(%address, "inner address leased");
                } else {
                    payloads.push(Payload::Notify(Notification::error(
                        NotifyError::InternalAddressFailure,
                    )));
                }
            }
        }

        // first child SA
        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let offered = inner
            .iter()
            .find_map(|p| match p {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or(Error::Protocol("IKE_AUTH without a child proposal"))?;
        let Some((suite, peer_spi)) = esp.negotiate(&offered.proposals) else {
            payloads.push(Payload::Notify(Notification::error(
                NotifyError::NoProposalChosen,
            )));
            let outputs = self.send_response(sa, ExchangeType::IkeAuth, message_id, payloads)?;
            sa.establish()?;
            self.after_establish(now, sa);
            return Ok(outputs);
        };

        let ts_i = inner.iter().find_map(|p| match p {
            Payload::TsInitiator(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let ts_r = inner.iter().find_map(|p| match p {
            Payload::TsResponder(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let (permitted_local, permitted_peer) = selectors_for_flows(&sa.policy.template.flows);
        // from our side the peer's TSi is their traffic, our TSr is ours
        let (Some(ts_i), Some(ts_r)) = (ts_i, ts_r) else {
            return Err(Error::Protocol("IKE_AUTH without traffic selectors"));
        };
        let (Some(narrowed_peer), Some(narrowed_local)) = (
            narrow_selectors(&ts_i, &permitted_peer),
            narrow_selectors(&ts_r, &permitted_local),
        ) else {
            payloads.push(Payload::Notify(Notification::error(
                NotifyError::TsUnacceptable,
            )));
            let outputs = self.send_response(sa, ExchangeType::IkeAuth, message_id, payloads)?;
            sa.establish()?;
            self.after_establish(now, sa);
            return Ok(outputs);
        };

        let spi_local = crypto::random_esp_spi();
        let nonces = (sa.nonce_i.clone(), sa.nonce_r.clone());
        let child = self.make_child(
            sa,
            suite,
            spi_local,
            peer_spi,
            narrowed_local.clone(),
            narrowed_peer.clone(),
            false,
            None,
            (&nonces.0, &nonces.1),
        )?;
        sa.children.push(child);
        let index = sa.children.len() - 1;
        if let Err(e) = self.install_child(now, sa, index) {
            // kernel refusal closes the child, never the parent
            warn!("kernel refused the child: {e}");
            sa.children.pop();
            payloads.push(Payload::Notify(Notification::error(
                NotifyError::TemporaryFailure,
            )));
        } else {
            payloads.push(Payload::SecurityAssociation(SecurityAssociation {
                proposals: vec![suite.to_proposal(spi_local)],
            }));
            payloads.push(Payload::TsInitiator(TrafficSelectors {
                selectors: narrowed_peer,
            }));
            payloads.push(Payload::TsResponder(TrafficSelectors {
                selectors: narrowed_local,
            }));
        }

        let outputs = self.send_response(sa, ExchangeType::IkeAuth, message_id, payloads)?;
        sa.establish()?;
        self.after_establish(now, sa);
        info!(sa = ?sa, "established");
        Ok(outputs)
    }

    /// Initiator: the responder's IKE_AUTH response arrived
    pub(crate) fn handle_auth_response(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        _msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        if sa.role != Role::Initiator {
            return Err(Error::Protocol("IKE_AUTH response at the responder"));
        }
        for notification in inner.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        }) {
            if let ikewire::defs::NotifyType::Error(error) = notification.notify_type {
                return Err(match error {
                    NotifyError::AuthenticationFailed => {
                        Error::Authentication("peer refused our credentials")
                    }
                    _ => Error::Protocol("peer refused IKE_AUTH"),
                });
            }
        }

        // the EAP client role is not offered by this daemon
        if inner.iter().any(|p| matches!(p, Payload::Eap(_))) {
            return Err(Error::Protocol("EAP client role not offered"));
        }

        let peer_wire_id = inner
            .iter()
            .find_map(|p| match p {
                Payload::IdResponder(id) => Some(id),
                _ => None,
            })
            .ok_or(Error::Protocol("IKE_AUTH response without IDr"))?;
        let peer_id = IkeId::from_wire(peer_wire_id)?;
        if let Some(required) = &sa.policy.template.peer_id {
            if *required != peer_id {
                return Err(Error::Authentication("responder identity not permitted"));
            }
        }
        sa.peer_id = Some(peer_id.clone());
        sa.peer_cert = inner.iter().find_map(|p| match p {
            Payload::Certificate(Certificate {
                encoding: CertificateEncoding::X509CertificateSignature,
                data,
            }) => Some(data.clone()),
            _ => None,
        });

        let auth = inner
            .iter()
            .find_map(|p| match p {
                Payload::Authentication(a) => Some(a.clone()),
                _ => None,
            })
            .ok_or(Error::Authentication("response without AUTH"))?;

        let (prf, octets) = {
            let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
            let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
            (
                crypto.prf,
                auth_octets(
                    &crypto.prf,
                    &sa.peer_init_message,
                    &sa.nonce_i,
                    &keys.sk_pr,
                    &peer_id,
                ),
            )
        };
        match sa.policy.template.auth.clone() {
            AuthConfig::PreSharedKey(secret) => {
                let expected = psk_auth(&prf, &secret, &octets);
                if !crypto::constant_time_eq(&expected, &auth.data) {
                    return Err(Error::Authentication("shared secret mismatch"));
                }
            }
            AuthConfig::Signature | AuthConfig::RawPublicKey => {
                sa.awaiting_ca = Some(AwaitingCa::AuthVerdict {
                    inner: inner.clone(),
                    response: true,
                });
                return Ok(vec![Output::CaRequest(CaRequest::VerifyAuth {
                    sa: sa.spi_pair(),
                    cert: sa.peer_cert.clone(),
                    peer_id,
                    method: auth.method,
                    octets,
                    signature: auth.data,
                })]);
            }
            AuthConfig::EapMschapV2 { .. } => {
                return Err(Error::Config("EAP policies cannot dial out".into()))
            }
        }
        info!(peer = %peer_id, "responder authenticated");
        self.finish_initiator_auth(now, sa, &inner)
    }

    /// Initiator: complete the first child from the response and
    /// establish
    pub(crate) fn finish_initiator_auth(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        inner: &[Payload],
    ) -> Result<Vec<Output>> {
        sa.peer_mobike = inner.iter().any(|p| {
            matches!(
                p,
                Payload::Notify(n)
                    if n.notify_type
                        == ikewire::defs::NotifyType::Status(NotifyStatus::MobikeSupported)
            )
        }) && self.config.mobike;
        // the lease the responder granted us, if we asked
        if let Some(config) = inner.iter().find_map(|p| match p {
            Payload::Configuration(c) if c.cfg_type == ConfigType::Reply => Some(c),
            _ => None,
        }) {
            for attribute in &config.attributes {
                if attribute.attribute_type == 1 && attribute.value.len() == 4 {
                    let octets: [u8; 4] = attribute.value.as_slice().try_into().unwrap_or([0; 4]);
                    sa.pool_lease = Some(std::net::IpAddr::from(octets));
                }
            }
        }

        let esp = sa
            .policy
            .template
            .esp_transforms
            .clone()
            .unwrap_or_default();
        let chosen = inner
            .iter()
            .find_map(|p| match p {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or(Error::Protocol("response without a child proposal"))?;
        let (suite, peer_spi) = esp
            .negotiate(&chosen.proposals)
            .ok_or(Error::Protocol("responder chose unacceptable child transforms"))?;

        let ts_local = inner
            .iter()
            .find_map(|p| match p {
                Payload::TsInitiator(ts) => Some(ts.selectors.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("response without traffic selectors"))?;
        let ts_peer = inner
            .iter()
            .find_map(|p| match p {
                Payload::TsResponder(ts) => Some(ts.selectors.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("response without traffic selectors"))?;

        // complete the larval child created with the request
        let larval = sa
            .children
            .iter()
            .position(|c| c.spi_peer == 0)
            .ok_or(Error::Internal("no larval child".into()))?;
        let spi_local = sa.children[larval].spi_local;
        let nonces = (sa.nonce_i.clone(), sa.nonce_r.clone());
        sa.children[larval] = self.make_child(
            sa,
            suite,
            spi_local,
            peer_spi,
            ts_local,
            ts_peer,
            true,
            None,
            (&nonces.0, &nonces.1),
        )?;
        if let Err(e) = self.install_child(now, sa, larval) {
            warn!("kernel refused the child: {e}");
            sa.children.remove(larval);
        }

        sa.establish()?;
        self.after_establish(now, sa);
        info!(sa = ?sa, "established");
        // a granted inner address goes to the virtual interface
        Ok(sa
            .pool_lease
            .map(|address| Output::Lease {
                address,
                peer: sa.peer.ip(),
            })
            .into_iter()
            .collect())
    }

    /// Responder: drive one EAP round trip
    fn continue_eap(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        let AuthConfig::EapMschapV2 { users, gateway_psk } = sa.policy.template.auth.clone() else {
            return Err(Error::Protocol("EAP round on a non-EAP policy"));
        };

        // the final request after EAP Success carries the MSK based AUTH
        if sa.state == SaState::EapSuccess {
            let auth = inner
                .iter()
                .find_map(|p| match p {
                    Payload::Authentication(a) => Some(a.clone()),
                    _ => None,
                })
                .ok_or(Error::Authentication("final EAP message without AUTH"))?;
            let msk = sa
                .eap_msk
                .clone()
                .ok_or(Error::Internal("EAP success without MSK".into()))?;
            let peer_id = sa
                .peer_id
                .clone()
                .ok_or(Error::Internal("EAP without a peer identity".into()))?;
            let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
            let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
            let octets = auth_octets(
                &crypto.prf,
                &sa.peer_init_message,
                &sa.nonce_r,
                &keys.sk_pi,
                &peer_id,
            );
            let expected = psk_auth(&crypto.prf, &msk, &octets);
            if !crypto::constant_time_eq(&expected, &auth.data) {
                return Err(Error::Authentication("EAP MSK AUTH mismatch"));
            }
            info!(peer = %peer_id, "EAP authentication complete");
            // our final AUTH re-derives from the MSK as well
            return self.finish_responder_auth(now, sa, msg.message_id, &inner, &msk);
        }

        let eap_msg = inner
            .iter()
            .find_map(|p| match p {
                Payload::Eap(e) => Some(e.clone()),
                _ => None,
            })
            .ok_or(Error::Protocol("EAP round without an EAP payload"))?;
        let eap = sa
            .eap
            .as_mut()
            .ok_or(Error::Internal("EAP round without state".into()))?;
        match eap.handle(&users, &eap_msg)? {
            EapStep::Reply(reply) => {
                self.send_response(sa, ExchangeType::IkeAuth, msg.message_id, vec![Payload::Eap(reply)])
            }
            EapStep::Success(success) => {
                sa.eap_msk = eap
                    .msk()
                    .map(|msk| Zeroizing::new(msk.to_vec()));
                sa.state = SaState::EapSuccess;
                self.send_response(sa, ExchangeType::IkeAuth, msg.message_id, vec![Payload::Eap(success)])
            }
            EapStep::Failure(failure) => {
                let outputs =
                    self.send_response(sa, ExchangeType::IkeAuth, msg.message_id, vec![Payload::Eap(failure)])?;
                self.start_close(now, sa);
                Ok(outputs)
            }
        }
    }

    /// The CA process answered for a parked SA
    pub(crate) fn resume_from_ca(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        reply: crate::ca::CaReply,
    ) -> Result<Vec<Output>> {
        let waiting = sa
            .awaiting_ca
            .take()
            .ok_or(Error::Internal("CA reply for an unparked SA".into()))?;
        match (waiting, reply) {
            (AwaitingCa::Cert, crate::ca::CaReply::CertVerdict { valid, .. }) => {
                if !valid {
                    return Err(Error::Authentication("certificate rejected"));
                }
                Ok(vec![])
            }
            (
                AwaitingCa::AuthVerdict { inner, response },
                crate::ca::CaReply::AuthVerdict { valid, .. },
            ) => {
                if !valid {
                    return Err(Error::Authentication("signature rejected"));
                }
                if response {
                    return self.finish_initiator_auth(now, sa, &inner);
                }
                // responder: the peer checks out, now our own AUTH needs
                // the CA before the response can go out
                let local_id = sa
                    .policy
                    .template
                    .local_id
                    .clone()
                    .or(self.config.local_id.clone())
                    .unwrap_or(IkeId::from_addr(sa.local.ip()));
                sa.local_id = Some(local_id.clone());
                let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
                let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
                let octets = auth_octets(
                    &crypto.prf,
                    &sa.our_init_message,
                    &sa.nonce_i,
                    &keys.sk_pr,
                    &local_id,
                );
                sa.awaiting_ca = Some(AwaitingCa::SignatureForResponse { peer_inner: inner });
                Ok(vec![Output::CaRequest(CaRequest::Sign {
                    sa: sa.spi_pair(),
                    octets,
                    peer_sigsha2: sa.peer_sigsha2,
                })])
            }
            (
                AwaitingCa::Signature { inner },
                crate::ca::CaReply::Signature {
                    method,
                    signature,
                    cert,
                    ..
                },
            ) => {
                let method = method.ok_or(Error::Authentication(
                    "no usable signature method for this peer",
                ))?;
                let mut payloads = vec![];
                let mut rest = inner.into_iter();
                // IDi leads, the certificate and AUTH follow it
                if let Some(id) = rest.next() {
                    payloads.push(id);
                }
                if let Some(cert) = cert {
                    payloads.push(Payload::Certificate(Certificate {
                        encoding: CertificateEncoding::X509CertificateSignature,
                        data: cert,
                    }));
                }
                payloads.push(Payload::Authentication(Authentication {
                    method,
                    data: signature,
                }));
                payloads.extend(rest);
                sa.state = SaState::AuthSent;
                self.send_request(now, sa, ExchangeType::IkeAuth, payloads)
            }
            (
                AwaitingCa::SignatureForResponse { peer_inner },
                crate::ca::CaReply::Signature {
                    method,
                    signature,
                    cert,
                    ..
                },
            ) => {
                let method = method.ok_or(Error::Authentication(
                    "no usable signature method for this peer",
                ))?;
                let local_id = sa
                    .local_id
                    .clone()
                    .ok_or(Error::Internal("signing without an identity".into()))?;
                let mut head = vec![Payload::IdResponder(local_id.to_wire())];
                if let Some(cert) = cert {
                    head.push(Payload::Certificate(Certificate {
                        encoding: CertificateEncoding::X509CertificateSignature,
                        data: cert,
                    }));
                }
                head.push(Payload::Authentication(Authentication {
                    method,
                    data: signature,
                }));
                let message_id = sa.msgids.next_recv;
                self.complete_responder(now, sa, message_id, &peer_inner, head)
            }
            _ => Err(Error::Internal("CA reply does not match the park state".into())),
        }
    }

    /// Common establishment bookkeeping
    pub(crate) fn after_establish(&mut self, now: Instant, sa: &mut IkeSa) {
        if sa.role == Role::Responder {
            self.half_open = self.half_open.saturating_sub(1);
        }
        self.arm_established_timers(now, sa);
        debug!(sa = ?sa, children = sa.children.len(), "established timers armed");
    }

    /// Build a complete child from negotiated parameters; `nonces` are
    /// the (initiator, responder) nonces of the creating exchange
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn make_child(
        &mut self,
        sa: &IkeSa,
        suite: crate::proposal::EspSuite,
        spi_local: u32,
        spi_peer: u32,
        ts_local: Vec<ikewire::defs::TrafficSelector>,
        ts_peer: Vec<ikewire::defs::TrafficSelector>,
        initiated_by_us: bool,
        shared: Option<&[u8]>,
        nonces: (&[u8], &[u8]),
    ) -> Result<ChildSa> {
        let crypto = sa.ike_crypto.as_ref().ok_or(Error::Crypto("no keys"))?;
        let keys = sa.keys.as_ref().ok_or(Error::Crypto("no keys"))?;
        let encr = Encr::new(suite.encr.0, suite.encr.1)?;
        let integ = suite.integ.map(Integrity::new).transpose()?;
        let child_keys = kdf::child_keys(
            &crypto.prf,
            &encr,
            integ.as_ref(),
            &keys.sk_d,
            shared,
            nonces.0,
            nonces.1,
        )?;
        Ok(ChildSa {
            spi_local,
            spi_peer,
            protocol: ikewire::defs::params::SecurityProtocol::EncapsulatingSecurityPayload,
            suite,
            keys: Some(child_keys),
            ts_local,
            ts_peer,
            parent: sa.spi_pair(),
            initiated_by_us,
            ipcomp_cpi: None,
            loaded: false,
            lifetime: sa.policy.template.lifetime,
            age: Default::default(),
        })
    }
}
