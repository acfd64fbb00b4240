use std::sync::Arc;

use conclave::{
    error::{AddressError, ClusterError},
    node::NodeUid,
    Cluster, ClusterEvent,
};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use url::Url;

pub(crate) struct RunningNode {
    pub cluster: Cluster,
    last_event: Arc<Mutex<Option<ClusterEvent>>>,
}

impl RunningNode {
    pub async fn last_event_clone(&self) -> Option<ClusterEvent> {
        self.last_event.lock().await.clone()
    }

    async fn start(url: &Url, seed_nodes: &[Url]) -> Result<Self, ClusterError> {
        let cluster = Cluster::builder(url.clone())
            .with_uid(NodeUid::random())
            .with_seed_nodes(seed_nodes)
            .start()
            .await?;

        // Listen to events in a separate task
        let last_event = Arc::new(Mutex::new(None));
        let mut events = cluster.events();
        tokio::spawn({
            let last_event = Arc::clone(&last_event);
            async move {
                while let Some(event) = events.next().await {
                    // lagging behind only loses old events
                    if let Ok(event) = event {
                        *last_event.lock().await = Some(event);
                    }
                }
            }
        });

        Ok(RunningNode {
            cluster,
            last_event,
        })
    }
}

pub struct Application {
    pub(crate) nodes: Vec<RunningNode>,
}

impl Application {
    pub async fn start(size: u16) -> Result<Self, ClusterError> {
        let base_port = 7337;
        let urls: Vec<Url> = (0..size)
            .map(|i| Url::parse(&format!("conclave://127.0.0.1:{}", base_port + i)))
            .collect::<Result<_, _>>()
            .map_err(AddressError::from)?;

        let seed_nodes: Vec<Url> = urls
            .choose_multiple(&mut rand::thread_rng(), 2)
            .cloned()
            .collect();

        let mut nodes = Vec::with_capacity(urls.len());
        for url in &urls {
            nodes.push(RunningNode::start(url, &seed_nodes).await?);
        }
        Ok(Self { nodes })
    }

    /// Logs how every node sees the cluster
    pub async fn report(&self) {
        for node in &self.nodes {
            let snapshot = match node.cluster.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    log::warn!("{}: {}", node.cluster.node(), err);
                    continue;
                }
            };
            let members: Vec<String> = snapshot
                .membership
                .members()
                .map(|member| format!("{}={}", member.node.address.port, member.status))
                .collect();
            log::info!(
                "{} converged={} associations={} leader={} members=[{}] last event: {:?}",
                snapshot.node.address,
                snapshot.converged,
                snapshot.associated.len(),
                snapshot
                    .leader
                    .map_or("none".to_string(), |leader| leader.address.to_string()),
                members.join(", "),
                node.last_event_clone().await,
            );
        }
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            let address = node.cluster.node().clone();
            if let Err(err) = node.cluster.shutdown().await {
                log::warn!("{} did not stop cleanly: {}", address, err);
            }
        }
    }
}
