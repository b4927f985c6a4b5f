use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::client::{Client, Phase};
use super::{Session, SessionError};
use crate::protocol::payload::{Passthrough, SyncAnimations};
use crate::protocol::{Envelope, Message, Payload, PayloadType};
use crate::rules::SynchronizationStage;

/// Brings one client from an empty scene to the session's current state.
///
/// Stages run in [`SynchronizationStage::SEQUENCE`] order. Each stage sends
/// its replay snapshot, waits until the client has answered every tracked
/// message, completes, and then drains whatever the completed stage made
/// eligible in the client's queue.
pub struct ClientSync {
    session: Session,
    client: Client,
}

impl ClientSync {
    pub fn new(session: Session, client: Client) -> Self {
        Self { session, client }
    }

    pub async fn run(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        self.client.begin_sync();
        self.send_queued_messages().await;

        for stage in SynchronizationStage::SEQUENCE {
            self.ensure_connected()?;
            let replayed = self.session.begin_client_stage(&self.client, stage)?;
            debug!(
                target = "beach_mirror::sync",
                session_id = %self.session.id(),
                client_id = %self.client.id(),
                stage = %stage,
                replayed,
                "stage started"
            );
            if stage == SynchronizationStage::SyncAnimations {
                self.sync_animations_from_authority().await;
            }
            self.client.driver().drain().await;
            self.ensure_connected()?;
            self.client.complete_stage(stage);
            self.send_queued_messages().await;
        }

        self.client
            .send_payload(Payload::SyncComplete(Passthrough::default()));
        self.client.enter_execution();
        self.client.driver().drain().await;
        self.ensure_connected()?;

        let elapsed = started.elapsed();
        info!(
            target = "beach_mirror::sync",
            session_id = %self.session.id(),
            client_id = %self.client.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "client synchronized"
        );
        counter!("beach_mirror_clients_joined_total", 1);
        histogram!(
            "beach_mirror_sync_duration_ms",
            elapsed.as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Drains the queue to a fixed point: every round waits for outstanding
    /// replies, then sends what became eligible.
    async fn send_queued_messages(&self) {
        loop {
            self.client.driver().drain().await;
            if self.client.is_closed() || self.client.flush_eligible() == 0 {
                break;
            }
        }
    }

    /// Animation playback state lives on the simulating peer, not in the
    /// session caches. Ask the authority for it and forward the answer.
    async fn sync_animations_from_authority(&self) {
        if !self.session.config().is_peer_authoritative() {
            return;
        }
        let Some(authority) = self.session.authoritative_client() else {
            return;
        };
        if authority.id() == self.client.id() || authority.phase() != Phase::Execution {
            return;
        }
        let timeout = self.session.rules().reply_timeout(PayloadType::SyncAnimations);
        let request = Message::new(Payload::SyncAnimations(SyncAnimations::default()));
        match authority.driver().request(request, timeout).await {
            Ok(reply) => match reply.payload {
                Payload::SyncAnimations(body) => {
                    if body.animation_states.as_ref().map_or(true, Vec::is_empty) {
                        return;
                    }
                    self.client
                        .driver()
                        .send_message(Envelope::new(Message::new(Payload::SyncAnimations(body))));
                }
                other => warn!(
                    target = "beach_mirror::sync",
                    client_id = %authority.id(),
                    payload_type = %other.payload_type(),
                    "unexpected reply to sync-animations"
                ),
            },
            Err(err) => {
                warn!(
                    target = "beach_mirror::sync",
                    session_id = %self.session.id(),
                    authority_id = %authority.id(),
                    error = %err,
                    "authority did not report animation state"
                );
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.client.is_closed() {
            Err(SessionError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}
