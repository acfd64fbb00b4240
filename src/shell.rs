use std::{collections::HashSet, sync::Arc};

use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
    time::{sleep_until, Instant, Interval},
};

use crate::{
    cluster::{
        association::ConnectionLoss,
        gossip::GossipEnvelope,
        handshake::{
            HandshakeAccept, HandshakeOffer, HandshakePromise, HandshakeReject, HandshakeState,
            OnIncomingHandshakeOfferDirective, Redial, RegisterHandshake, RejectReason,
        },
        membership::{Membership, MembershipChange},
        shell_state::ClusterShellState,
    },
    error::{HandshakeError, ProtocolViolation},
    node::{MemberStatus, NodeAddress, UniqueNodeAddress},
    transport::{Connection, DialId, Transport, TransportEvent},
    wire::WireMessage,
};

/// Notable changes of the cluster, as observed by the running node
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ClusterEvent {
    MemberChanged {
        node: UniqueNodeAddress,
        status: MemberStatus,
    },
    Associated(UniqueNodeAddress),
    Disassociated(UniqueNodeAddress),
    LeaderChanged(Option<UniqueNodeAddress>),
}

/// A copy of the cluster state at one point in time
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ClusterSnapshot {
    pub node: UniqueNodeAddress,
    pub membership: Membership,
    pub associated: HashSet<UniqueNodeAddress>,
    pub leader: Option<UniqueNodeAddress>,
    pub converged: bool,
}

/// Requests sent by the [Cluster](crate::Cluster) handle to its shell
pub(crate) enum Command {
    Join {
        address: NodeAddress,
        promise: HandshakePromise,
    },
    Down(NodeAddress),
    Leave(NodeAddress),
    MarkUp(NodeAddress),
    Remove(NodeAddress),
    Snapshot(oneshot::Sender<ClusterSnapshot>),
    Shutdown,
}

/// The task owning the [ClusterShellState]. Transport events, commands and gossip rounds are
/// handled one at a time, each one running to completion before the next.
pub(crate) struct ClusterShell {
    state: ClusterShellState,
    transport: Arc<dyn Transport>,
    transport_events: mpsc::Sender<TransportEvent>,
    cluster_events: broadcast::Sender<ClusterEvent>,
    leader: Option<UniqueNodeAddress>,
    /// Connection attempts of outgoing handshakes, waiting for their backoff delay
    redials: Vec<(Instant, Redial)>,
    /// Rounds of seed joins that did not lead to any association
    seed_rounds: u32,
    next_seed_round: Instant,
}

impl ClusterShell {
    pub(crate) fn new(
        state: ClusterShellState,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Sender<TransportEvent>,
        cluster_events: broadcast::Sender<ClusterEvent>,
    ) -> Self {
        Self {
            state,
            transport,
            transport_events,
            cluster_events,
            leader: None,
            redials: Vec::new(),
            seed_rounds: 0,
            next_seed_round: Instant::now(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut outgoing_gossip_interval: Interval,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        self.join_seed_nodes();
        loop {
            let next_redial = self.redials.iter().map(|(due, _)| *due).min();
            select! {
                Some(event) = transport_events.recv() => self.on_transport_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = outgoing_gossip_interval.tick() => self.on_gossip_tick(),
                _ = sleep_until(next_redial.unwrap_or_else(Instant::now)), if next_redial.is_some() => self.redial(),
            }
            self.publish_leader();
        }
        self.stop();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Join { address, promise } => self.join(address, promise),
            Command::Down(address) => {
                let change = self.state.down(&address);
                self.publish_changes(change);
            }
            Command::Leave(address) => {
                let change = self.state.leave(&address);
                self.publish_changes(change);
            }
            Command::MarkUp(address) => {
                let change = self.state.mark_up(&address);
                self.publish_changes(change);
            }
            Command::Remove(address) => {
                let change = self.state.remove(&address);
                self.publish_changes(change);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn join(&mut self, address: NodeAddress, promise: HandshakePromise) {
        if address == self.state.local().address {
            promise.resolve(Ok(self.state.local().clone()));
            return;
        }
        if let Some(association) = self.state.association(&address) {
            promise.resolve(Ok(association.remote().clone()));
            return;
        }
        match self.state.register_handshake(address, promise) {
            Ok(RegisterHandshake::Initiated { remote, dial }) => self.dial(remote, dial),
            Ok(RegisterHandshake::InFlight(_)) => {}
            Err(violation) => report_violation(violation),
        }
    }

    fn dial(&self, remote: NodeAddress, dial: DialId) {
        log::debug!("Dialing {} ({})", remote, dial);
        self.transport.connect(remote, dial, self.transport_events.clone());
    }

    fn schedule_redial(&mut self, redial: Redial) {
        self.redials.push((Instant::now() + redial.delay, redial));
    }

    /// Opens the connections whose backoff delay elapsed, for handshakes that still wait for them
    fn redial(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.redials)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.redials = pending;
        for (_, redial) in due {
            if self.state.awaits_dial(&redial.remote, redial.dial) {
                self.dial(redial.remote, redial.dial);
            }
        }
    }

    /// Joins the seed nodes, then waits for the handshake backoff before the next round
    fn join_seed_nodes(&mut self) {
        let seed_nodes = self.state.settings().seed_nodes.clone();
        if seed_nodes.is_empty() {
            return;
        }
        for seed in seed_nodes {
            if self.state.handshake_in_progress(&seed).is_none() {
                self.join(seed, HandshakePromise::detached());
            }
        }
        let delay = self.state.settings().handshake_backoff.delay(self.seed_rounds);
        self.next_seed_round = Instant::now() + delay;
        self.seed_rounds = self.seed_rounds.saturating_add(1);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionOpened {
                peer,
                dial,
                connection,
            } => self.on_connection_opened(peer, dial, connection),
            TransportEvent::ConnectionFailed { peer, dial, reason } => {
                if !self.state.awaits_dial(&peer, dial) {
                    log::debug!("Ignoring failure of {} to {}, which nothing waits for", dial, peer);
                    return;
                }
                if let Some(redial) = self.state.interrupt_handshake(&peer, HandshakeError::Transport(reason)) {
                    self.schedule_redial(redial);
                }
            }
            TransportEvent::Received {
                connection,
                message,
            } => match message {
                WireMessage::Offer(offer) => self.on_offer(connection, offer),
                WireMessage::Accept(accept) => self.on_accept(connection, accept),
                WireMessage::Reject(reject) => self.on_reject(connection, reject),
                WireMessage::Gossip(envelope) => self.on_gossip(connection, *envelope),
            },
            TransportEvent::ConnectionClosed { connection } => match self.state.on_connection_closed(connection) {
                Some(ConnectionLoss::Disassociated(remote)) => self.publish(ClusterEvent::Disassociated(remote)),
                Some(ConnectionLoss::HandshakeInterrupted(redial)) => self.schedule_redial(redial),
                Some(ConnectionLoss::HandshakeFailed(_)) | None => {}
            },
        }
    }

    fn on_connection_opened(&mut self, peer: NodeAddress, dial: DialId, connection: Connection) {
        // the handshake may have ended or moved on to another attempt while dialing,
        // e.g. the remote node won a tie-break or the node was downed and joined again
        if !self.state.awaits_dial(&peer, dial) {
            log::debug!(
                "No handshake with {} waits for {} anymore, closing {}",
                peer,
                dial,
                connection.id()
            );
            connection.close();
            return;
        }
        match self.state.on_handshake_channel_connected(&peer, connection.clone()) {
            Ok(()) => {
                let offer = HandshakeOffer {
                    from: self.state.local().clone(),
                    to: peer,
                    protocol_version: self.state.settings().protocol_version,
                };
                connection.send(WireMessage::Offer(offer));
            }
            Err(violation) => {
                log::warn!("Closing {}: {}", connection.id(), violation);
                connection.close();
            }
        }
    }

    fn on_offer(&mut self, connection: Connection, offer: HandshakeOffer) {
        match self.state.on_incoming_handshake_offer(offer.clone()) {
            Ok(OnIncomingHandshakeOfferDirective::Negotiate(offer)) => self.negotiate(connection, offer),
            Ok(OnIncomingHandshakeOfferDirective::AbortDueToConcurrentHandshake) => {
                self.state.abort_incoming_handshake(&offer, &connection)
            }
            Ok(OnIncomingHandshakeOfferDirective::AlreadyAssociated) => {
                let over_association = self
                    .state
                    .association(&offer.from.address)
                    .map_or(false, |association| association.connection() == &connection);
                if !over_association {
                    log::debug!("{} is already associated, closing {}", offer.from, connection.id());
                    connection.close();
                }
            }
            Err(violation) => {
                report_violation(violation);
                connection.close();
            }
        }
    }

    /// Accepts or rejects a stored offer, then replies on the connection it came from
    fn negotiate(&mut self, connection: Connection, offer: HandshakeOffer) {
        let local = self.state.local().clone();
        let protocol_version = self.state.settings().protocol_version;

        let rejection = if !protocol_version.is_compatible_with(&offer.protocol_version) {
            Some((
                RejectReason::IncompatibleProtocol,
                format!(
                    "protocol version {} is incompatible with {}",
                    offer.protocol_version, protocol_version
                ),
            ))
        } else if offer.to != local.address {
            Some((
                RejectReason::WrongDestination,
                format!("offer was meant for {}, but reached {}", offer.to, local.address),
            ))
        } else if offer.from.address == local.address {
            Some((
                RejectReason::WrongDestination,
                format!("offer from {} claims the address of this node", offer.from),
            ))
        } else if self.is_known_down(&offer.from) {
            Some((RejectReason::Other, format!("{} was marked down", offer.from)))
        } else {
            None
        };

        let remote = offer.from.address.clone();
        if let Some((reason, message)) = rejection {
            log::info!("Rejecting handshake offer from {}: {}", offer.from, message);
            connection.send(WireMessage::Reject(HandshakeReject {
                from: local,
                to: offer.from,
                reason,
                message: message.clone(),
            }));
            connection.close();
            self.state
                .fail_handshake(&remote, HandshakeError::Rejected { reason, message });
            return;
        }

        let associated = self
            .state
            .accept_offer(&remote)
            .and_then(|completed| self.state.associate(completed, connection.clone()));
        match associated {
            Ok(associated) => {
                connection.send(WireMessage::Accept(HandshakeAccept {
                    from: local,
                    to: associated.remote.clone(),
                }));
                self.publish(ClusterEvent::Associated(associated.remote));
            }
            Err(violation) => report_violation(violation),
        }
    }

    fn on_accept(&mut self, connection: Connection, accept: HandshakeAccept) {
        let remote = accept.from.address.clone();
        if accept.to != *self.state.local() {
            log::warn!("Ignoring accept from {} meant for {}", accept.from, accept.to);
            return;
        }
        // the handshake may have failed, been aborted or moved on to another connection while the accept was in flight
        let stale = match self.state.handshake_in_progress(&remote) {
            Some(HandshakeState::Initiated(initiated)) => initiated.connection() != Some(&connection),
            Some(_) => false,
            None => true,
        };
        if stale {
            log::debug!("Ignoring stale accept from {} on {}", accept.from, connection.id());
            return;
        }
        if self.is_known_down(&accept.from) {
            self.state.fail_handshake(&remote, HandshakeError::Downed);
            return;
        }

        match self.state.incoming_handshake_accept(&accept) {
            Ok(Some(completed)) => match self.state.associate(completed, connection) {
                Ok(associated) => self.publish(ClusterEvent::Associated(associated.remote)),
                Err(violation) => report_violation(violation),
            },
            Ok(None) => {}
            Err(violation) => report_violation(violation),
        }
    }

    fn on_reject(&mut self, connection: Connection, reject: HandshakeReject) {
        let remote = reject.from.address.clone();
        let dialing = matches!(
            self.state.handshake_in_progress(&remote),
            Some(HandshakeState::Initiated(initiated)) if initiated.connection() == Some(&connection)
        );
        if !dialing {
            log::debug!("Ignoring reject from {} on {}", reject.from, connection.id());
            connection.close();
            return;
        }
        self.state.fail_handshake(
            &remote,
            HandshakeError::Rejected {
                reason: reject.reason,
                message: reject.message,
            },
        );
    }

    fn on_gossip(&mut self, connection: Connection, envelope: GossipEnvelope) {
        let from_association = self
            .state
            .association(&envelope.owner.address)
            .map_or(false, |association| {
                association.remote() == &envelope.owner && association.connection() == &connection
            });
        if !from_association {
            log::debug!(
                "Ignoring gossip from {}, which is not associated over {}",
                envelope.owner,
                connection.id()
            );
            return;
        }

        let outcome = self.state.merge_gossip(&envelope);
        self.publish_changes(outcome.changes);
        for remote in outcome.disassociated {
            self.publish(ClusterEvent::Disassociated(remote));
        }
        if outcome.reply {
            connection.send(WireMessage::Gossip(Box::new(self.state.gossip_envelope())));
        }
    }

    fn on_gossip_tick(&mut self) {
        let changes = self.state.perform_leader_actions();
        self.publish_changes(changes);
        for pruned in self.state.prune_removed() {
            log::info!("Pruned removed member {}", pruned.node);
        }
        let now = Instant::now();
        self.state.expire_tombstones(now);

        if self.state.associations().next().is_some() {
            self.seed_rounds = 0;
        } else if now >= self.next_seed_round {
            self.join_seed_nodes();
        }

        let peers = self.state.select_gossip_peers();
        if peers.is_empty() {
            return;
        }
        let envelope = self.state.gossip_envelope();
        for peer in peers {
            log::trace!("Gossiping with {}", peer.remote);
            peer.connection
                .send(WireMessage::Gossip(Box::new(envelope.clone())));
        }
    }

    fn is_known_down(&self, node: &UniqueNodeAddress) -> bool {
        self.state.is_pruned(node)
            || self
                .state
                .membership()
                .get(node)
                .map_or(false, |member| !member.status.is_live())
    }

    fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            node: self.state.local().clone(),
            membership: self.state.membership().clone(),
            associated: self.state.associated_addresses(),
            leader: self.state.leader().cloned(),
            converged: self.state.converged(),
        }
    }

    fn publish(&self, event: ClusterEvent) {
        // nobody listening is fine
        let _ = self.cluster_events.send(event);
    }

    fn publish_changes(&self, changes: impl IntoIterator<Item = MembershipChange>) {
        for change in changes {
            self.publish(ClusterEvent::MemberChanged {
                node: change.node,
                status: change.to,
            });
        }
    }

    fn publish_leader(&mut self) {
        let leader = self.state.leader().cloned();
        if leader != self.leader {
            log::info!(
                "Leader is now {}",
                leader.as_ref().map_or("nobody".to_string(), ToString::to_string)
            );
            self.leader = leader.clone();
            self.publish(ClusterEvent::LeaderChanged(leader));
        }
    }

    fn stop(&mut self) {
        let addresses: Vec<NodeAddress> = self
            .state
            .associations()
            .map(|association| association.remote().address.clone())
            .collect();
        for address in addresses {
            self.state.disassociate(&address);
        }
        let handshakes: Vec<NodeAddress> = self
            .state
            .handshakes()
            .map(|handshake| handshake.remote_address().clone())
            .collect();
        for address in handshakes {
            self.state.fail_handshake(&address, HandshakeError::Abandoned);
        }
        self.redials.clear();
        log::info!("Cluster node {} stopped", self.state.local());
    }
}

/// Protocol violations are defects of this crate, never the consequence of network conditions
fn report_violation(violation: ProtocolViolation) {
    log::error!("Protocol violation: {}", violation);
    debug_assert!(false, "protocol violation: {}", violation);
}
