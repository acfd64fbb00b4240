use std::{sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use url::Url;

use crate::{
    backoff::BackoffPolicy,
    cluster::{handshake::ProtocolVersion, shell_state::ClusterShellState},
    error::ClusterError,
    node::{NodeAddress, NodeUid, UniqueNodeAddress},
    shell::ClusterShell,
    transport::{TcpTransport, Transport},
    Cluster,
};

const DEFAULT_GOSSIP_FANOUT: usize = 5;
const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings of a running node
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSettings {
    pub node: UniqueNodeAddress,
    /// Nodes to join on startup, joined again with backoff while this node is not associated with any node
    pub seed_nodes: Vec<NodeAddress>,
    pub gossip_interval: Duration,
    /// Maximum number of peers to gossip with on every round
    pub gossip_fanout: usize,
    pub protocol_version: ProtocolVersion,
    /// Delays between connection attempts of an outgoing handshake, and between rounds of seed joins
    pub handshake_backoff: BackoffPolicy,
    /// How long pruned nodes are remembered, so that gossip from lagging nodes does not bring them back
    pub tombstone_ttl: Duration,
}

impl ClusterSettings {
    pub fn new(node: UniqueNodeAddress) -> Self {
        Self {
            node,
            seed_nodes: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            protocol_version: ProtocolVersion::CURRENT,
            handshake_backoff: BackoffPolicy::default(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

pub struct ClusterBuilder {
    advertised_url: Url,
    uid: NodeUid,
    seed_nodes: Vec<Url>,
    gossip_interval: Duration,
    gossip_fanout: usize,
    protocol_version: ProtocolVersion,
    handshake_backoff: BackoffPolicy,
    tombstone_ttl: Duration,
    transport: Arc<dyn Transport>,
}

impl ClusterBuilder {
    pub fn new(advertised_url: Url) -> Self {
        Self {
            advertised_url,
            uid: NodeUid::random(),
            seed_nodes: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            protocol_version: ProtocolVersion::CURRENT,
            handshake_backoff: BackoffPolicy::default(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            transport: Arc::new(TcpTransport::new()),
        }
    }

    pub fn with_uid(mut self, uid: NodeUid) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_seed_nodes(mut self, seed_nodes: &[Url]) -> Self {
        self.seed_nodes.extend(seed_nodes.iter().cloned());
        self
    }

    pub fn with_gossip_interval(mut self, interval_duration: Duration) -> Self {
        self.gossip_interval = interval_duration;
        self
    }

    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn with_handshake_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.handshake_backoff = backoff;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Replaces the default [TcpTransport] used to dial other nodes
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn settings(&self) -> Result<ClusterSettings, ClusterError> {
        let node = UniqueNodeAddress::new(NodeAddress::from_url(&self.advertised_url)?, self.uid);
        let seed_nodes = self
            .seed_nodes
            .iter()
            .map(NodeAddress::from_url)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClusterSettings {
            node,
            seed_nodes,
            gossip_interval: self.gossip_interval,
            gossip_fanout: self.gossip_fanout,
            protocol_version: self.protocol_version,
            handshake_backoff: self.handshake_backoff,
            tombstone_ttl: self.tombstone_ttl,
        })
    }

    /// Spawns the cluster shell, without accepting inbound connections.
    ///
    /// Whatever accepts connections for this node must report their events through
    /// [Cluster::transport_events]. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Cluster, ClusterError> {
        let settings = self.settings()?;
        let (commands_sender, commands_receiver) = mpsc::channel(64);
        let (transport_events_sender, transport_events_receiver) = mpsc::channel(256);
        let (cluster_events_sender, _) = broadcast::channel(64);

        let outgoing_gossip_interval = tokio::time::interval(settings.gossip_interval);
        let node = settings.node.clone();
        let shell = ClusterShell::new(
            ClusterShellState::new(settings),
            self.transport,
            transport_events_sender.clone(),
            cluster_events_sender.clone(),
        );
        let shell = tokio::spawn(shell.run(
            outgoing_gossip_interval,
            transport_events_receiver,
            commands_receiver,
        ));

        log::info!("Started cluster node {}", node);
        Ok(Cluster {
            node,
            commands: commands_sender,
            transport_events: transport_events_sender,
            cluster_events: cluster_events_sender,
            shell,
            listener: None,
        })
    }

    /// Binds the advertised host and port, then starts the node over TCP
    pub async fn start(self) -> Result<Cluster, ClusterError> {
        let address = NodeAddress::from_url(&self.advertised_url)?;
        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        self.start_with_listener(listener)
    }

    /// Starts the node over TCP, accepting inbound connections on an already bound `listener`
    pub fn start_with_listener(self, listener: TcpListener) -> Result<Cluster, ClusterError> {
        let mut cluster = self.build()?;
        cluster.listener = Some(TcpTransport::serve(listener, cluster.transport_events()));
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_built_from_urls() {
        let settings = ClusterBuilder::new(Url::parse("conclave://127.0.0.1:7337").unwrap())
            .with_uid(NodeUid(42))
            .with_seed_nodes(&[Url::parse("conclave://127.0.0.1:7338").unwrap()])
            .with_gossip_fanout(3)
            .with_handshake_backoff(BackoffPolicy::default().with_max_retries(1))
            .settings()
            .unwrap();

        assert_eq!(
            settings.node,
            UniqueNodeAddress::new(NodeAddress::new("conclave", "127.0.0.1", 7337), NodeUid(42))
        );
        assert_eq!(settings.seed_nodes, vec![NodeAddress::new("conclave", "127.0.0.1", 7338)]);
        assert_eq!(settings.gossip_fanout, 3);
        assert_eq!(settings.gossip_interval, Duration::from_secs(1));
        assert_eq!(settings.protocol_version, ProtocolVersion::CURRENT);
        assert_eq!(settings.handshake_backoff.max_retries, 1);
        assert_eq!(settings.tombstone_ttl, DEFAULT_TOMBSTONE_TTL);
    }

    #[test]
    fn urls_without_port_are_rejected() {
        let builder = ClusterBuilder::new(Url::parse("conclave://127.0.0.1").unwrap());
        assert!(matches!(builder.settings(), Err(ClusterError::Address(_))));
    }
}
