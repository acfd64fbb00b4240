use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use crate::{node::NodeAddress, wire::WireMessage};

mod tcp;

pub use tcp::*;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_DIAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifies one attempt at opening a connection through [Transport::connect].
/// Outcomes of attempts the cluster shell no longer waits for are told apart by it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DialId(u64);

impl DialId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DIAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for DialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dial-{}", self.0)
    }
}

/// Frames queued for the writing side of a connection
#[derive(Debug)]
pub enum Outbound {
    Message(WireMessage),
    Close,
}

/// A handle to an open connection with another node.
///
/// Cloning the handle is cheap, and all clones refer to the same connection.
/// Messages are queued, and written in order by the transport.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Creates a connection handle, and the receiving end the transport should write from
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                outbound,
            },
            receiver,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `message`. Returns false if the connection is already gone.
    pub fn send(&self, message: WireMessage) -> bool {
        self.outbound.send(Outbound::Message(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Completes once the writing side of the connection has stopped
    pub async fn closed(&self) {
        self.outbound.closed().await
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

/// What a transport reports to the cluster shell. Events are processed one at a time, in the order they are received.
#[derive(Debug)]
pub enum TransportEvent {
    /// An outbound connection requested through [Transport::connect] is open
    ConnectionOpened {
        peer: NodeAddress,
        dial: DialId,
        connection: Connection,
    },
    /// An outbound connection requested through [Transport::connect] could not be opened
    ConnectionFailed {
        peer: NodeAddress,
        dial: DialId,
        reason: String,
    },
    /// A message arrived on `connection`, inbound or outbound
    Received {
        connection: Connection,
        message: WireMessage,
    },
    ConnectionClosed { connection: ConnectionId },
}

/// Describes types that can open connections to other nodes.
///
/// [TcpTransport] is the default implementation. By implementing this trait and using your implementation
/// in your [Cluster](crate::Cluster), you can use any other kind of transport, e.g. with TLS.
/// Inbound connections are not opened through this trait: whatever accepts them should forward their events
/// through [Cluster::transport_events](crate::Cluster::transport_events).
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection to `peer` in the background, then reports [TransportEvent::ConnectionOpened]
    /// or [TransportEvent::ConnectionFailed] tagged with `dial`, followed by the events of that connection, to `events`.
    fn connect(&self, peer: NodeAddress, dial: DialId, events: mpsc::Sender<TransportEvent>);
}
