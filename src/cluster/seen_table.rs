use std::collections::HashMap;

#[cfg(test)]
use quickcheck::Arbitrary;

use super::{
    gossip::GossipEnvelope,
    version_vector::{CausalRelation, ReplicaId, VersionVector},
};
use crate::node::UniqueNodeAddress;

/// The [seen table](SeenTable) associates every known node with the most advanced
/// [version vector](VersionVector) that node is known to have observed.
///
/// The row of the running node is its own version of the cluster state. Rows of other nodes are
/// learned through gossip, either directly from that node or transitively from a node that heard about it.
///
/// Once the rows of all live members are identical, every member has observed the same cluster state,
/// and the cluster has converged.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SeenTable {
    #[cfg_attr(
        feature = "serde",
        serde(with = "serde_with::As::<Vec<(serde_with::Same, serde_with::Same)>>")
    )]
    table: HashMap<UniqueNodeAddress, VersionVector>,
}

impl SeenTable {
    /// A table with an empty row for `owner`
    pub fn new(owner: &UniqueNodeAddress) -> Self {
        let mut table = HashMap::new();
        table.insert(owner.clone(), VersionVector::new());
        Self { table }
    }

    pub fn version(&self, at: &UniqueNodeAddress) -> Option<&VersionVector> {
        self.table.get(at)
    }

    /// Increments the counter of `at` inside the row of `owner`, creating the row if needed.
    ///
    /// With `owner == at`, the node advances its own clock. Otherwise, `owner` records that it learned something about `at`.
    pub fn increment_version(&mut self, owner: &UniqueNodeAddress, at: &UniqueNodeAddress) -> u64 {
        self.table
            .entry(owner.clone())
            .or_default()
            .increment(ReplicaId::from(at))
    }

    /// Merges an incoming gossip into this table, as observed by `owner`.
    ///
    /// The owner's row absorbs the version of the node that sent the gossip, since we have now observed it.
    /// Every row of the incoming table is then merged into ours, which is how information about a third node
    /// reaches us even if that node never gossips with us directly.
    pub fn merge(&mut self, owner: &UniqueNodeAddress, incoming: &GossipEnvelope) {
        self.table
            .entry(owner.clone())
            .or_default()
            .merge(&incoming.owner_version);

        for (node, version) in &incoming.seen.table {
            self.table.entry(node.clone()).or_default().merge(version);
        }
    }

    /// Forgets `node` entirely: its row, and its counter in every other row
    pub fn prune(&mut self, node: &UniqueNodeAddress) {
        self.table.remove(node);
        let replica = ReplicaId::from(node);
        for version in self.table.values_mut() {
            version.prune(&replica);
        }
    }

    /// How `to` relates to the version observed on `observed_on`. An unknown node is treated as having observed nothing.
    pub fn compare_version(&self, observed_on: &UniqueNodeAddress, to: &VersionVector) -> CausalRelation {
        match self.version(observed_on) {
            Some(version) => version.compare(to),
            None => VersionVector::new().compare(to),
        }
    }

    /// True when all the given nodes have a row, and all those rows agree on the versions of the given nodes.
    ///
    /// Counters of other replicas, e.g. members that are down and about to be pruned, are not considered.
    pub fn converged<'a>(&self, nodes: impl IntoIterator<Item = &'a UniqueNodeAddress>) -> bool {
        let replicas: Vec<ReplicaId> = nodes.into_iter().map(ReplicaId::from).collect();
        let mut rows = replicas.iter().map(|replica| match replica {
            ReplicaId::UniqueNode(node) => self.table.get(node),
            ReplicaId::Uninitialized => None,
        });
        let first = match rows.next() {
            Some(Some(first)) => first,
            _ => return false,
        };
        rows.all(|row| {
            row.map_or(false, |row| {
                replicas
                    .iter()
                    .all(|replica| row.get(replica) == first.get(replica))
            })
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = (&UniqueNodeAddress, &VersionVector)> {
        self.table.iter()
    }

    pub(crate) fn insert_row(&mut self, node: UniqueNodeAddress, version: VersionVector) {
        self.table.entry(node).or_default().merge(&version);
    }
}

#[cfg(test)]
impl Arbitrary for SeenTable {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        SeenTable {
            table: HashMap::<UniqueNodeAddress, VersionVector>::arbitrary(g),
        }
    }
}
