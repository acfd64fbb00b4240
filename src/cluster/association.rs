use super::{
    handshake::{CompletedHandshake, HandshakeState, Redial},
    shell_state::ClusterShellState,
};
use crate::{
    error::{HandshakeError, ProtocolViolation},
    node::{NodeAddress, UniqueNodeAddress},
    transport::{Connection, ConnectionId},
};

/// An established, bidirectional logical connection with another node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociatedState {
    pub remote: UniqueNodeAddress,
    pub connection: Connection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssociationState {
    Associated(AssociatedState),
}

impl AssociationState {
    pub fn remote(&self) -> &UniqueNodeAddress {
        match self {
            AssociationState::Associated(associated) => &associated.remote,
        }
    }

    pub fn connection(&self) -> &Connection {
        match self {
            AssociationState::Associated(associated) => &associated.connection,
        }
    }
}

/// What was lost when a connection closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionLoss {
    Disassociated(UniqueNodeAddress),
    HandshakeFailed(NodeAddress),
    /// The outgoing handshake that was using the connection waits for a new connection attempt
    HandshakeInterrupted(Redial),
}

impl ClusterShellState {
    /// Turns a completed handshake into an association over `connection`.
    ///
    /// The remote node joins the membership. If another instance was associated under the same address,
    /// it has been replaced: its connection is closed, and the membership marks it down.
    /// Everyone waiting on the handshake is then notified.
    pub fn associate(
        &mut self,
        completed: CompletedHandshake,
        connection: Connection,
    ) -> Result<AssociatedState, ProtocolViolation> {
        let address = completed.remote.address.clone();
        let promise = match self.handshakes.remove(&address) {
            Some(HandshakeState::Completed(state)) if state.remote == completed.remote => state.promise,
            Some(other) => {
                self.handshakes.insert(address, other);
                return Err(ProtocolViolation::AssociateWithoutCompletedHandshake(completed.remote));
            }
            None => return Err(ProtocolViolation::AssociateWithoutCompletedHandshake(completed.remote)),
        };

        if self.membership.join(completed.remote.clone()).is_some() {
            self.increment_own_version();
        }

        let associated = AssociatedState {
            remote: completed.remote,
            connection,
        };
        let previous = self
            .associations
            .insert(address, AssociationState::Associated(associated.clone()));
        if let Some(AssociationState::Associated(previous)) = previous {
            if previous.connection != associated.connection {
                log::info!(
                    "Association with {} replaces {}, closing {}",
                    associated.remote,
                    previous.remote,
                    previous.connection.id()
                );
                previous.connection.close();
            }
        }

        log::info!(
            "Associated with {} over {}",
            associated.remote,
            associated.connection.id()
        );
        promise.resolve(Ok(associated.remote.clone()));
        Ok(associated)
    }

    /// Drops the association with `address`, closing its connection
    pub fn disassociate(&mut self, address: &NodeAddress) -> Option<AssociationState> {
        let association = self.associations.remove(address)?;
        log::info!("Disassociated from {}", association.remote());
        association.connection().close();
        Some(association)
    }

    /// Forgets whatever was using the connection that just closed.
    ///
    /// An outgoing handshake dialing over it is [interrupted](ClusterShellState::interrupt_handshake): it fails
    /// with [HandshakeError::ConnectionClosed] once it ran out of connection attempts.
    pub fn on_connection_closed(&mut self, connection: ConnectionId) -> Option<ConnectionLoss> {
        let associated = self
            .associations
            .iter()
            .find(|(_, association)| association.connection().id() == connection)
            .map(|(address, _)| address.clone());
        if let Some(address) = associated {
            let association = self.associations.remove(&address)?;
            log::info!(
                "Connection {} with {} closed, disassociated",
                connection,
                association.remote()
            );
            return Some(ConnectionLoss::Disassociated(association.remote().clone()));
        }

        let handshaking = self
            .handshakes
            .iter()
            .find(|(_, handshake)| match handshake {
                HandshakeState::Initiated(initiated) => {
                    initiated.connection().map(Connection::id) == Some(connection)
                }
                _ => false,
            })
            .map(|(address, _)| address.clone());
        if let Some(address) = handshaking {
            return Some(match self.interrupt_handshake(&address, HandshakeError::ConnectionClosed) {
                Some(redial) => ConnectionLoss::HandshakeInterrupted(redial),
                None => ConnectionLoss::HandshakeFailed(address),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backoff::BackoffPolicy,
        cluster::{
            handshake::{
                HandshakeAccept, HandshakeOffer, HandshakePromise, OnIncomingHandshakeOfferDirective,
                ProtocolVersion,
            },
            shell_state::tests::{associate_incoming, node, shell_state, shell_state_with},
        },
        node::MemberStatus,
        transport::Outbound,
    };

    #[test]
    fn associate_requires_a_completed_handshake() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state(&local);
        let (connection, _outbound) = Connection::pair();
        let completed = CompletedHandshake { remote: remote.clone() };

        assert_eq!(
            state.associate(completed.clone(), connection.clone()),
            Err(ProtocolViolation::AssociateWithoutCompletedHandshake(remote.clone()))
        );

        state
            .register_handshake(remote.address.clone(), HandshakePromise::detached())
            .unwrap();
        assert_eq!(
            state.associate(completed, connection),
            Err(ProtocolViolation::AssociateWithoutCompletedHandshake(remote.clone()))
        );
        assert!(matches!(
            state.handshake_in_progress(&remote.address),
            Some(HandshakeState::Initiated(_))
        ));
    }

    #[test]
    fn associate_adds_a_joining_member() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state(&local);
        associate_incoming(&mut state, &remote);

        assert_eq!(
            state.membership().member(&remote.address).map(|m| m.status),
            Some(MemberStatus::Joining)
        );
        assert!(state.handshake_in_progress(&remote.address).is_none());
    }

    #[test]
    fn closed_association_connection_disassociates() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state(&local);
        let (connection, _outbound) = associate_incoming(&mut state, &remote);

        assert_eq!(
            state.on_connection_closed(connection.id()),
            Some(ConnectionLoss::Disassociated(remote.clone()))
        );
        assert!(state.association(&remote.address).is_none());
        // the member stays until it is downed
        assert!(state.membership().member(&remote.address).is_some());
        assert_eq!(state.on_connection_closed(connection.id()), None);
    }

    #[tokio::test]
    async fn closed_handshake_connection_fails_the_handshake_without_retries() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state_with(&local, |settings| {
            settings.handshake_backoff = BackoffPolicy::default().with_max_retries(0)
        });
        let (promise, future) = HandshakePromise::new();
        state.register_handshake(remote.address.clone(), promise).unwrap();
        let (connection, mut outbound) = Connection::pair();
        state
            .on_handshake_channel_connected(&remote.address, connection.clone())
            .unwrap();

        assert_eq!(
            state.on_connection_closed(connection.id()),
            Some(ConnectionLoss::HandshakeFailed(remote.address.clone()))
        );
        assert_eq!(future.await, Err(HandshakeError::ConnectionClosed));
        assert!(matches!(outbound.try_recv(), Ok(Outbound::Close)));
        assert_eq!(state.handshakes().count(), 0);
    }

    #[tokio::test]
    async fn closed_handshake_connection_waits_for_a_redial() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state(&local);
        let (promise, future) = HandshakePromise::new();
        state.register_handshake(remote.address.clone(), promise).unwrap();
        let first_dial = match state.handshake_in_progress(&remote.address) {
            Some(HandshakeState::Initiated(initiated)) => initiated.dial(),
            other => panic!("unexpected handshake {:?}", other),
        };
        let (connection, mut outbound) = Connection::pair();
        state
            .on_handshake_channel_connected(&remote.address, connection.clone())
            .unwrap();

        let redial = match state.on_connection_closed(connection.id()) {
            Some(ConnectionLoss::HandshakeInterrupted(redial)) => redial,
            other => panic!("unexpected loss {:?}", other),
        };
        assert_eq!(redial.remote, remote.address);
        assert_ne!(redial.dial, first_dial);
        assert!(redial.delay <= state.settings().handshake_backoff.max_delay);
        assert!(matches!(outbound.try_recv(), Ok(Outbound::Close)));
        assert!(!state.awaits_dial(&remote.address, first_dial));
        assert!(state.awaits_dial(&remote.address, redial.dial));

        // the peer dialed us in the meantime: its offer completes the handshake the caller waits on
        let offer = HandshakeOffer {
            from: remote.clone(),
            to: local.address.clone(),
            protocol_version: ProtocolVersion::CURRENT,
        };
        assert_eq!(
            state.on_incoming_handshake_offer(offer.clone()),
            Ok(OnIncomingHandshakeOfferDirective::Negotiate(offer))
        );
        let completed = state.accept_offer(&remote.address).unwrap();
        let (incoming, _incoming_outbound) = Connection::pair();
        state.associate(completed, incoming).unwrap();

        assert_eq!(future.await, Ok(remote.clone()));
        assert!(!state.awaits_dial(&remote.address, redial.dial));
    }

    #[tokio::test]
    async fn handshake_fails_once_retries_are_exhausted() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state_with(&local, |settings| {
            settings.handshake_backoff = BackoffPolicy::default().with_max_retries(2)
        });
        let (promise, future) = HandshakePromise::new();
        state.register_handshake(remote.address.clone(), promise).unwrap();

        for _ in 0..2 {
            let (connection, _outbound) = Connection::pair();
            state
                .on_handshake_channel_connected(&remote.address, connection.clone())
                .unwrap();
            assert!(matches!(
                state.on_connection_closed(connection.id()),
                Some(ConnectionLoss::HandshakeInterrupted(_))
            ));
        }
        assert!(state
            .interrupt_handshake(&remote.address, HandshakeError::Transport("refused".to_string()))
            .is_none());
        assert_eq!(future.await, Err(HandshakeError::Transport("refused".to_string())));
        assert_eq!(state.handshakes().count(), 0);
    }

    #[test]
    fn disassociate_closes_the_connection() {
        let local = node(1, 1);
        let remote = node(2, 2);
        let mut state = shell_state(&local);
        state
            .register_handshake(remote.address.clone(), HandshakePromise::detached())
            .unwrap();
        let accept = HandshakeAccept {
            from: remote.clone(),
            to: local,
        };
        let completed = state.incoming_handshake_accept(&accept).unwrap().unwrap();
        let (connection, mut outbound) = Connection::pair();
        state.associate(completed, connection).unwrap();

        assert!(state.disassociate(&remote.address).is_some());
        assert!(matches!(outbound.try_recv(), Ok(Outbound::Close)));
        assert!(state.disassociate(&remote.address).is_none());
    }
}
