//! The INFORMATIONAL exchange: deletes, dead peer detection and MOBIKE
//! address updates

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use ikewire::defs::params::{ExchangeType, NotifyStatus, SecurityProtocol};
use ikewire::defs::{Delete, Message, Notification, NotifyType, Payload};
use tracing::{debug, info, warn};

use crate::engine::{Engine, Output};
use crate::kernel::kernel_pair;
use crate::msg::PendingRequest;
use crate::sa::{IkeSa, SaState};
use crate::timer::{TimerKey, TimerKind};
use crate::Result;

impl Engine {
    /// An INFORMATIONAL request from the peer
    pub(crate) fn handle_informational_request(
        &mut self,
        now: Instant,
        sa: &mut IkeSa,
        peer: SocketAddr,
        msg: &Message,
        inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        // an empty request is the liveness probe; the response is the
        // proof
        if inner.is_empty() {
            debug!(sa = ?sa, "answering liveness probe");
            return self.send_response(sa, ExchangeType::Informational, msg.message_id, vec![]);
        }

        let mut reply: Vec<Payload> = vec![];
        let mut close_after_reply = false;

        for payload in &inner {
            match payload {
                Payload::Delete(delete) => match delete.protocol {
                    SecurityProtocol::InternetKeyExchange => {
                        info!(sa = ?sa, "peer deleted the IKE SA");
                        close_after_reply = true;
                    }
                    _ => {
                        // the peer names its inbound SPIs, which we send
                        // with; answer with our corresponding inbound SPIs
                        let mut ours = vec![];
                        for spi in &delete.spis {
                            let Ok(spi) = <[u8; 4]>::try_from(spi.as_slice()) else {
                                continue;
                            };
                            let spi = u32::from_be_bytes(spi);
                            if let Some(child) = sa.child_by_peer_spi(spi) {
                                let local = child.spi_local;
                                ours.push(local.to_be_bytes().to_vec());
                                if let Err(e) = self.uninstall_child(sa, local) {
                                    // kernel trouble closes the child, not
                                    // the parent
                                    warn!("removing deleted child: {e}");
                                }
                                info!(
                                    spi = format_args!("{local:#010x}"),
                                    "child deleted by peer"
                                );
                            }
                        }
                        if !ours.is_empty() {
                            reply.push(Payload::Delete(Delete {
                                protocol: delete.protocol,
                                spis: ours,
                            }));
                        }
                    }
                },
                Payload::Notify(notification) => match notification.notify_type {
                    NotifyType::Status(NotifyStatus::UpdateSaAddresses) => {
                        if sa.peer_mobike {
                            let old = sa.peer;
                            sa.peer = peer;
                            info!(sa = ?sa, %old, new = %peer, "MOBIKE address update");
                            if let Err(e) = self.rebind_children(sa) {
                                warn!("rebinding children: {e}");
                            }
                        }
                    }
                    NotifyType::Status(NotifyStatus::Cookie2) => {
                        // COOKIE2 is echoed verbatim in the response
                        reply.push(Payload::Notify(Notification::status_with_data(
                            NotifyStatus::Cookie2,
                            notification.data.clone(),
                        )));
                    }
                    NotifyType::Status(NotifyStatus::SetWindowSize) => {
                        if let Ok(raw) = <[u8; 4]>::try_from(notification.data.as_slice()) {
                            let requested = u32::from_be_bytes(raw);
                            sa.msgids.window =
                                requested.clamp(1, self.config.max_window);
                            debug!(window = sa.msgids.window, "window size updated");
                        }
                    }
                    NotifyType::Error(error) => {
                        warn!(?error, "peer sent an error notification");
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        let outputs =
            self.send_response(sa, ExchangeType::Informational, msg.message_id, reply)?;
        if close_after_reply {
            self.drop_children_and_close(now, sa);
        }
        Ok(outputs)
    }

    /// An INFORMATIONAL response to one of our requests
    pub(crate) fn handle_informational_response(
        &mut self,
        _now: Instant,
        sa: &mut IkeSa,
        _request: &PendingRequest,
        _msg: &Message,
        _inner: Vec<Payload>,
    ) -> Result<Vec<Output>> {
        // any response proves liveness; the dispatcher already cleared
        // the miss counter
        if sa.mobike_pending {
            sa.mobike_pending = false;
            // the peer confirmed the new addresses: move the kernel state
            if let Err(e) = self.rebind_children(sa) {
                warn!("rebinding children after MOBIKE: {e}");
            }
        }
        if sa.state == SaState::Closing {
            // the delete we sent was answered; finish
            sa.state = SaState::Closed;
        }
        Ok(vec![])
    }

    /// Rewrite the outer addresses of every loaded child (MOBIKE)
    pub(crate) fn rebind_children(&mut self, sa: &mut IkeSa) -> Result<()> {
        let rdomain = self.config.rdomain;
        let udpencap = sa
            .nat
            .active
            .then(|| (sa.local.port(), sa.peer.port()));
        for index in 0..sa.children.len() {
            if !sa.children[index].loaded {
                continue;
            }
            let (inbound, outbound) = kernel_pair(sa, &sa.children[index], rdomain)?;
            self.kernel.update_addresses(
                &inbound,
                sa.peer.ip(),
                sa.local.ip(),
                udpencap.map(|(s, d)| (d, s)),
            )?;
            self.kernel
                .update_addresses(&outbound, sa.local.ip(), sa.peer.ip(), udpencap)?;
        }
        Ok(())
    }

    /// Our own address changed: tell the peer and rebind
    pub(crate) fn mobike_update_addresses(
        &mut self,
        now: Instant,
        local_spi: u64,
        new_local: IpAddr,
    ) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        let old = sa.local;
        sa.local = SocketAddr::new(new_local, old.port());
        sa.mobike_pending = true;
        info!(sa = ?sa, %old, new = %sa.local, "local address changed, notifying peer");
        let outputs = self
            .send_request(
                now,
                &mut sa,
                ExchangeType::Informational,
                vec![Payload::Notify(Notification::status(
                    NotifyStatus::UpdateSaAddresses,
                ))],
            )
            .unwrap_or_default();
        // our side of the kernel state moves right away
        if let Err(e) = self.rebind_children(&mut sa) {
            warn!("rebinding children: {e}");
        }
        self.sas.insert(local_spi, sa);
        outputs
    }

    /// The DPD timer fired: probe, or give up on the peer; the byte
    /// lifetime counters the kernel reports ride on the same cadence
    pub(crate) fn send_dpd(&mut self, now: Instant, local_spi: u64) -> Vec<Output> {
        let Some(mut sa) = self.sas.remove(&local_spi) else {
            return vec![];
        };
        if sa.state != SaState::Established {
            self.sas.insert(local_spi, sa);
            return vec![];
        }

        let rdomain = self.config.rdomain;
        let mut over_soft = vec![];
        for child in &sa.children {
            if !child.loaded || child.lifetime.soft_bytes == 0 {
                continue;
            }
            let Ok((inbound, _)) = kernel_pair(&sa, child, rdomain) else {
                continue;
            };
            if let Ok(lifetimes) = self.kernel.lifetimes(&inbound) {
                if lifetimes.current_bytes >= child.lifetime.soft_bytes {
                    over_soft.push(child.spi_local);
                }
            }
        }
        let mut outputs = vec![];
        for spi in over_soft {
            info!(spi = format_args!("{spi:#010x}"), "soft byte limit reached");
            outputs.extend(self.send_child_rekey(now, &mut sa, spi).unwrap_or_default());
        }

        let dpd_outputs = if sa.dpd_misses >= self.config.dpd_retries {
            info!(sa = ?sa, misses = sa.dpd_misses, "peer considered dead");
            self.start_close(now, &mut sa);
            vec![]
        } else {
            sa.dpd_misses += 1;
            let outputs = self
                .send_request(now, &mut sa, ExchangeType::Informational, vec![])
                .unwrap_or_default();
            self.timers.arm(
                now,
                self.config.dpd_interval,
                TimerKey {
                    sa: local_spi,
                    kind: TimerKind::Dpd,
                },
            );
            outputs
        };
        outputs.extend(dpd_outputs);
        self.sas.insert(local_spi, sa);
        outputs
    }

    /// Tear down every child and begin closing the IKE SA
    pub(crate) fn drop_children_and_close(&mut self, now: Instant, sa: &mut IkeSa) {
        let spis: Vec<u32> = sa.children.iter().map(|c| c.spi_local).collect();
        for spi in spis {
            if let Err(e) = self.uninstall_child(sa, spi) {
                warn!("removing child on close: {e}");
            }
        }
        self.start_close(now, sa);
    }
}
