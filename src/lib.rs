use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use url::Url;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

mod backoff;
mod builder;
mod shell;

pub mod cluster;
pub mod error;
pub mod node;
pub mod transport;
pub mod wire;

pub use self::backoff::BackoffPolicy;
pub use self::builder::*;
pub use self::shell::{ClusterEvent, ClusterSnapshot};

use self::{
    cluster::handshake::HandshakePromise,
    error::ClusterError,
    node::{NodeAddress, UniqueNodeAddress},
    shell::Command,
    transport::TransportEvent,
};

/// A handle to a running cluster node.
///
/// The node itself runs in a background task, which stops once [Cluster::shutdown] is called
/// or every handle is dropped.
pub struct Cluster {
    node: UniqueNodeAddress,
    commands: mpsc::Sender<Command>,
    transport_events: mpsc::Sender<TransportEvent>,
    cluster_events: broadcast::Sender<ClusterEvent>,
    shell: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl Cluster {
    pub fn builder(this_node_advertised_url: Url) -> ClusterBuilder {
        ClusterBuilder::new(this_node_advertised_url)
    }

    /// The identity of the running node
    pub fn node(&self) -> &UniqueNodeAddress {
        &self.node
    }

    /// Handshakes with the node at `address`, and resolves with its identity once both nodes are associated.
    ///
    /// Joining a node this node is already associated with resolves immediately. Concurrent joins
    /// of the same address share a single handshake.
    pub async fn join(&self, address: NodeAddress) -> Result<UniqueNodeAddress, ClusterError> {
        let (promise, future) = HandshakePromise::new();
        self.send(Command::Join { address, promise }).await?;
        Ok(future.await?)
    }

    /// Same as [Cluster::join], for a URL such as `conclave://127.0.0.1:7337`
    pub async fn join_url(&self, url: &Url) -> Result<UniqueNodeAddress, ClusterError> {
        self.join(NodeAddress::from_url(url)?).await
    }

    /// Marks the node at `address` down, e.g. when a failure detector suspects it.
    /// The decision spreads to other members through gossip.
    pub async fn down(&self, address: NodeAddress) -> Result<(), ClusterError> {
        self.send(Command::Down(address)).await
    }

    pub async fn leave(&self, address: NodeAddress) -> Result<(), ClusterError> {
        self.send(Command::Leave(address)).await
    }

    pub async fn mark_up(&self, address: NodeAddress) -> Result<(), ClusterError> {
        self.send(Command::MarkUp(address)).await
    }

    pub async fn remove(&self, address: NodeAddress) -> Result<(), ClusterError> {
        self.send(Command::Remove(address)).await
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        snapshot.await.map_err(|_| ClusterError::ShellStopped)
    }

    /// A stream of the changes observed from now on
    pub fn events(&self) -> BroadcastStream<ClusterEvent> {
        BroadcastStream::new(self.cluster_events.subscribe())
    }

    /// The sender through which connections accepted outside of this crate report their events.
    /// When the node was started with [ClusterBuilder::start], inbound TCP connections are already taken care of.
    pub fn transport_events(&self) -> mpsc::Sender<TransportEvent> {
        self.transport_events.clone()
    }

    /// Closes every connection and stops the node
    pub async fn shutdown(mut self) -> Result<(), ClusterError> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            // the listening socket is released once the task is gone
            let _ = listener.await;
        }
        self.send(Command::Shutdown).await?;
        self.shell.await.map_err(|_| ClusterError::ShellStopped)
    }

    async fn send(&self, command: Command) -> Result<(), ClusterError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClusterError::ShellStopped)
    }
}
