use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::sync::oneshot;

use super::shell_state::ClusterShellState;
use crate::{
    error::{HandshakeError, ProtocolViolation},
    node::{NodeAddress, UniqueNodeAddress},
    transport::{Connection, DialId},
};

/// Version of the handshake and gossip protocol. Nodes can only associate when their major versions match.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: 0,
        minor: 1,
        patch: 0,
    };

    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HandshakeOffer {
    pub from: UniqueNodeAddress,
    pub to: NodeAddress,
    pub protocol_version: ProtocolVersion,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HandshakeAccept {
    pub from: UniqueNodeAddress,
    pub to: UniqueNodeAddress,
}

#[repr(u8)]
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
pub enum RejectReason {
    Other,
    IncompatibleProtocol,
    WrongDestination,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HandshakeReject {
    pub from: UniqueNodeAddress,
    pub to: UniqueNodeAddress,
    pub reason: RejectReason,
    pub message: String,
}

pub type HandshakeResult = Result<UniqueNodeAddress, HandshakeError>;

/// The completion handle of a handshake.
///
/// Several callers may wait on the same handshake: their promises are [chained](HandshakePromise::chain)
/// into the stored one, and the first resolution fans out to every waiter.
#[derive(Default)]
pub struct HandshakePromise {
    waiters: Vec<oneshot::Sender<HandshakeResult>>,
}

impl HandshakePromise {
    pub fn new() -> (Self, HandshakeFuture) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                waiters: vec![sender],
            },
            HandshakeFuture(receiver),
        )
    }

    /// A promise nobody waits on yet, e.g. for a handshake offered by a remote node
    pub fn detached() -> Self {
        Self::default()
    }

    /// Makes everyone waiting on `other` observe the result of this promise
    pub fn chain(&mut self, other: HandshakePromise) {
        self.waiters.extend(other.waiters);
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn resolve(self, result: HandshakeResult) {
        for waiter in self.waiters {
            // a waiter that went away is not interested in the result anymore
            let _ = waiter.send(result.clone());
        }
    }
}

impl Debug for HandshakePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakePromise")
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Resolves with the identity of the remote node once the handshake completes.
#[derive(Debug)]
pub struct HandshakeFuture(oneshot::Receiver<HandshakeResult>);

impl Future for HandshakeFuture {
    type Output = HandshakeResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(HandshakeError::Abandoned)))
    }
}

/// An outgoing handshake: we are dialing `remote`
#[derive(Debug)]
pub struct InitiatedState {
    pub remote: NodeAddress,
    pub local: UniqueNodeAddress,
    /// The connection attempt this handshake waits for
    pub(crate) dial: DialId,
    /// Connection attempts that failed so far
    pub(crate) retries: u32,
    pub(crate) promise: HandshakePromise,
    pub(crate) connection: Option<Connection>,
}

impl InitiatedState {
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn dial(&self) -> DialId {
        self.dial
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn close(&self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }
}

/// An incoming handshake: `offer.from` dialed us
#[derive(Debug)]
pub struct HandshakeReceivedState {
    pub offer: HandshakeOffer,
    pub(crate) promise: HandshakePromise,
}

/// A handshake that succeeded, waiting for the association to be stored
#[derive(Debug)]
pub struct CompletedState {
    pub remote: UniqueNodeAddress,
    pub(crate) promise: HandshakePromise,
}

/// A handshake as stored in the cluster shell state. At most one is stored per peer address.
#[derive(Debug)]
pub enum HandshakeState {
    Initiated(InitiatedState),
    WasOffered(HandshakeReceivedState),
    Completed(CompletedState),
}

impl HandshakeState {
    pub fn remote_address(&self) -> &NodeAddress {
        match self {
            HandshakeState::Initiated(initiated) => &initiated.remote,
            HandshakeState::WasOffered(offered) => &offered.offer.from.address,
            HandshakeState::Completed(completed) => &completed.remote.address,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Initiated(_) => "initiated",
            HandshakeState::WasOffered(_) => "offered",
            HandshakeState::Completed(_) => "completed",
        }
    }

    pub(crate) fn into_promise(self) -> HandshakePromise {
        match self {
            HandshakeState::Initiated(initiated) => initiated.promise,
            HandshakeState::WasOffered(offered) => offered.promise,
            HandshakeState::Completed(completed) => completed.promise,
        }
    }
}

/// Handed out when a handshake is already in progress: the caller's promise was chained to it.
/// This is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightState {
    pub remote: NodeAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterHandshake {
    /// A new outgoing handshake was stored, the caller should open a connection to `remote` tagged with `dial`
    Initiated { remote: NodeAddress, dial: DialId },
    InFlight(InFlightState),
}

/// The previous connection attempt of an outgoing handshake failed: open a new connection to `remote`,
/// tagged with `dial`, once `delay` elapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redial {
    pub remote: NodeAddress,
    pub dial: DialId,
    pub delay: Duration,
}

/// Token for a handshake that reached the completed state, to be handed to [ClusterShellState::associate]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedHandshake {
    pub remote: UniqueNodeAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnIncomingHandshakeOfferDirective {
    /// Decide whether to accept or reject the offer, and reply on the incoming connection
    Negotiate(HandshakeOffer),
    /// A concurrent handshake with the same peer is in progress, and this node lost the tie-break.
    /// Do not negotiate: the remote node will accept our own offer.
    AbortDueToConcurrentHandshake,
    /// The offering node is already associated
    AlreadyAssociated,
}

impl ClusterShellState {
    /// Entry point for a client initiating a handshake with `remote`.
    ///
    /// If a handshake with `remote` is already in progress, `promise` is chained to it and
    /// [InFlight](RegisterHandshake::InFlight) is returned: nothing else needs to happen.
    pub fn register_handshake(
        &mut self,
        remote: NodeAddress,
        promise: HandshakePromise,
    ) -> Result<RegisterHandshake, ProtocolViolation> {
        if let Some(in_progress) = self.handshakes.get_mut(&remote) {
            let stored = match in_progress {
                HandshakeState::Initiated(initiated) => &mut initiated.promise,
                HandshakeState::WasOffered(offered) => &mut offered.promise,
                HandshakeState::Completed(completed) => &mut completed.promise,
            };
            stored.chain(promise);
            log::debug!("Handshake with {} already in flight", remote);
            return Ok(RegisterHandshake::InFlight(InFlightState { remote }));
        }

        if self.associations.contains_key(&remote) {
            return Err(ProtocolViolation::HandshakeWithExistingAssociation(remote));
        }

        let dial = DialId::next();
        let initiated = InitiatedState {
            remote: remote.clone(),
            local: self.local.clone(),
            dial,
            retries: 0,
            promise,
            connection: None,
        };
        self.handshakes
            .insert(remote.clone(), HandshakeState::Initiated(initiated));
        log::debug!("Initiated handshake with {}", remote);
        Ok(RegisterHandshake::Initiated { remote, dial })
    }

    /// True if the outgoing handshake with `remote` waits for the connection attempt `dial` to open
    pub fn awaits_dial(&self, remote: &NodeAddress, dial: DialId) -> bool {
        matches!(
            self.handshakes.get(remote),
            Some(HandshakeState::Initiated(initiated)) if initiated.dial == dial && initiated.connection.is_none()
        )
    }

    /// Attaches the freshly opened outbound connection to the initiated handshake with `remote`
    pub fn on_handshake_channel_connected(
        &mut self,
        remote: &NodeAddress,
        connection: Connection,
    ) -> Result<(), ProtocolViolation> {
        match self.handshakes.get_mut(remote) {
            Some(HandshakeState::Initiated(initiated)) => {
                if initiated.connection.is_some() {
                    return Err(ProtocolViolation::ChannelAlreadyConnected(remote.clone()));
                }
                initiated.connection = Some(connection);
                Ok(())
            }
            _ => Err(ProtocolViolation::NoInitiatedHandshake(remote.clone())),
        }
    }

    /// Aborts the outgoing handshake with `remote`, closing its connection.
    ///
    /// Only initiated handshakes can be aborted this way; any other stored state is left untouched.
    pub fn abort_outgoing_handshake(
        &mut self,
        remote: &NodeAddress,
    ) -> Result<Option<HandshakeState>, ProtocolViolation> {
        match self.handshakes.get(remote) {
            None => Ok(None),
            Some(HandshakeState::Initiated(_)) => {
                let state = self.handshakes.remove(remote);
                if let Some(HandshakeState::Initiated(initiated)) = &state {
                    initiated.close();
                }
                Ok(state)
            }
            Some(other) => Err(ProtocolViolation::NotAbortable {
                remote: remote.clone(),
                state: other.name(),
            }),
        }
    }

    /// Closes an incoming connection that lost a tie-break.
    /// The stored handshake belongs to the outgoing side, so it is kept.
    pub fn abort_incoming_handshake(&mut self, offer: &HandshakeOffer, connection: &Connection) {
        log::debug!(
            "Closing incoming handshake connection {} from {}",
            connection.id(),
            offer.from
        );
        connection.close();
    }

    /// Entry point for a server receiving a handshake offer.
    ///
    /// When both nodes dialed each other, both store an initiated handshake and both receive the other's offer.
    /// The tie-break picks the lower address as the winner. The winner drops its outgoing connection and
    /// negotiates on the incoming one. The loser keeps its outgoing handshake and waits for the winner's reply.
    pub fn on_incoming_handshake_offer(
        &mut self,
        offer: HandshakeOffer,
    ) -> Result<OnIncomingHandshakeOfferDirective, ProtocolViolation> {
        let remote = offer.from.address.clone();

        if let Some(associated) = self.association(&remote) {
            if associated.remote() == &offer.from {
                return Ok(OnIncomingHandshakeOfferDirective::AlreadyAssociated);
            }
            log::info!(
                "Received offer from {}, a new instance of associated node {}",
                offer.from,
                associated.remote()
            );
        }

        match self.handshakes.get(&remote) {
            None => Ok(self.negotiate(offer, HandshakePromise::detached())),
            Some(HandshakeState::WasOffered(_)) => {
                // The remote may have resent its offer before our reply reached it
                log::debug!("Received offer from {} again, negotiating again", offer.from);
                let promise = match self.handshakes.remove(&remote) {
                    Some(state) => state.into_promise(),
                    None => HandshakePromise::detached(),
                };
                Ok(self.negotiate(offer, promise))
            }
            Some(HandshakeState::Initiated(initiated)) => {
                // the order on addresses is arbitrary, but it is total, which is all a tie-breaker needs
                let tie_break_winner = initiated.local < offer.from;
                log::warn!(
                    "Concurrently initiated handshakes from nodes [{}](local) and [{}](remote) detected! \
                     Resolving race by address ordering; this node {} tie-break.",
                    initiated.local,
                    offer.from,
                    if tie_break_winner {
                        "WON (will negotiate and reply)"
                    } else {
                        "LOST (will await reply)"
                    }
                );

                if !tie_break_winner {
                    return Ok(OnIncomingHandshakeOfferDirective::AbortDueToConcurrentHandshake);
                }

                let promise = match self.abort_outgoing_handshake(&remote)? {
                    Some(aborted) => {
                        log::info!("Aborted outgoing handshake with {}", remote);
                        aborted.into_promise()
                    }
                    None => HandshakePromise::detached(),
                };
                Ok(self.negotiate(offer, promise))
            }
            Some(HandshakeState::Completed(_)) => Err(ProtocolViolation::OfferWhileCompleted(remote)),
        }
    }

    fn negotiate(
        &mut self,
        offer: HandshakeOffer,
        promise: HandshakePromise,
    ) -> OnIncomingHandshakeOfferDirective {
        let state = HandshakeReceivedState {
            offer: offer.clone(),
            promise,
        };
        self.handshakes
            .insert(offer.from.address.clone(), HandshakeState::WasOffered(state));
        OnIncomingHandshakeOfferDirective::Negotiate(offer)
    }

    /// Server side: the offer from `remote` was found acceptable, the handshake is now completed
    pub fn accept_offer(&mut self, remote: &NodeAddress) -> Result<CompletedHandshake, ProtocolViolation> {
        match self.handshakes.remove(remote) {
            Some(HandshakeState::WasOffered(offered)) => {
                let completed = CompletedHandshake {
                    remote: offered.offer.from.clone(),
                };
                self.handshakes.insert(
                    remote.clone(),
                    HandshakeState::Completed(CompletedState {
                        remote: offered.offer.from,
                        promise: offered.promise,
                    }),
                );
                Ok(completed)
            }
            Some(other) => {
                self.handshakes.insert(remote.clone(), other);
                Err(ProtocolViolation::NoOfferToAccept(remote.clone()))
            }
            None => Err(ProtocolViolation::NoOfferToAccept(remote.clone())),
        }
    }

    /// Client side: the remote node accepted our offer.
    ///
    /// Returns `None` when the accept must be ignored: a duplicate accept for a completed handshake,
    /// or an accept while we were offered a handshake ourselves, which can stem from stale messages.
    pub fn incoming_handshake_accept(
        &mut self,
        accept: &HandshakeAccept,
    ) -> Result<Option<CompletedHandshake>, ProtocolViolation> {
        let remote = accept.from.address.clone();
        match self.handshakes.remove(&remote) {
            Some(HandshakeState::Initiated(initiated)) => {
                self.handshakes.insert(
                    remote,
                    HandshakeState::Completed(CompletedState {
                        remote: accept.from.clone(),
                        promise: initiated.promise,
                    }),
                );
                Ok(Some(CompletedHandshake {
                    remote: accept.from.clone(),
                }))
            }
            Some(offered @ HandshakeState::WasOffered(_)) => {
                log::warn!(
                    "Received accept from {} while in the offered state, ignoring it",
                    accept.from
                );
                self.handshakes.insert(remote, offered);
                Ok(None)
            }
            Some(completed @ HandshakeState::Completed(_)) => {
                log::warn!(
                    "Received accept from {} for an already completed handshake, ignoring it",
                    accept.from
                );
                self.handshakes.insert(remote, completed);
                Ok(None)
            }
            None => Err(ProtocolViolation::AcceptWithoutHandshake(remote)),
        }
    }

    /// Gives up on the current connection attempt of the outgoing handshake with `remote`.
    ///
    /// While the handshake backoff allows another attempt, the handshake stays initiated until the returned
    /// [Redial] is due, and an offer from `remote` in the meantime completes it as usual.
    /// Otherwise the handshake fails with `error`. Other handshake states are left untouched.
    pub fn interrupt_handshake(&mut self, remote: &NodeAddress, error: HandshakeError) -> Option<Redial> {
        let backoff = self.settings().handshake_backoff;
        let initiated = match self.handshakes.get_mut(remote) {
            Some(HandshakeState::Initiated(initiated)) => initiated,
            _ => return None,
        };
        if !backoff.allows_retry(initiated.retries) {
            self.fail_handshake(remote, error);
            return None;
        }

        initiated.close();
        initiated.connection = None;
        initiated.dial = DialId::next();
        let delay = backoff.delay(initiated.retries);
        initiated.retries += 1;
        log::info!(
            "Connection attempt {} with {} failed: {}, retrying in {:?}",
            initiated.retries,
            remote,
            error,
            delay
        );
        Some(Redial {
            remote: remote.clone(),
            dial: initiated.dial,
            delay,
        })
    }

    /// Fails the handshake with `remote` for a reason outside of our control (rejection, closed connection...).
    /// Its state is removed, its connection closed if it had one, and every waiter gets `error`.
    ///
    /// Returns false if no handshake was in progress.
    pub fn fail_handshake(&mut self, remote: &NodeAddress, error: HandshakeError) -> bool {
        match self.handshakes.remove(remote) {
            Some(state) => {
                log::info!("Handshake with {} failed: {}", remote, error);
                if let HandshakeState::Initiated(initiated) = &state {
                    initiated.close();
                }
                state.into_promise().resolve(Err(error));
                true
            }
            None => false,
        }
    }
}
