use thiserror::Error;
use url::Url;

use crate::{
    cluster::handshake::RejectReason,
    node::{NodeAddress, UniqueNodeAddress},
};

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("url {0} has no host")]
    MissingHost(Url),
    #[error("url {0} has no port, and its scheme has no default port")]
    MissingPort(Url),
    #[error(transparent)]
    Parse(#[from] url::ParseError),
}

/// Violations of the coordinator's own invariants.
///
/// These never stem from network conditions: they mean that the cluster shell called the
/// state machine in a sequence it should never produce. Callers must treat them as defects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("attempted to start a handshake with {0}, which is already associated")]
    HandshakeWithExistingAssociation(NodeAddress),
    #[error("no initiated handshake is in progress with {0}")]
    NoInitiatedHandshake(NodeAddress),
    #[error("the initiated handshake with {0} already has a connection")]
    ChannelAlreadyConnected(NodeAddress),
    #[error("a {state} handshake with {remote} cannot be aborted as an outgoing handshake")]
    NotAbortable {
        remote: NodeAddress,
        state: &'static str,
    },
    #[error("received an offer from {0} while a completed handshake was stored")]
    OfferWhileCompleted(NodeAddress),
    #[error("received an accept from {0} without any handshake in progress")]
    AcceptWithoutHandshake(NodeAddress),
    #[error("no offer from {0} is being negotiated")]
    NoOfferToAccept(NodeAddress),
    #[error("attempted to associate with {0} without a completed handshake")]
    AssociateWithoutCompletedHandshake(UniqueNodeAddress),
}

/// Failures delivered to everyone waiting on a handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake rejected by the remote node ({reason:?}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },
    #[error("connection closed during the handshake")]
    ConnectionClosed,
    #[error("could not connect: {0}")]
    Transport(String),
    #[error("node was marked down during the handshake")]
    Downed,
    #[error("the handshake was dropped before completing")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("unknown member status code {0}")]
    UnknownStatus(u32),
    #[error("unknown reject reason code {0}")]
    UnknownRejectReason(u32),
    #[error("port {0} is out of range")]
    InvalidPort(u32),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("the cluster shell has stopped")]
    ShellStopped,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
