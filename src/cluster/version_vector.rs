use std::collections::{HashMap, HashSet};

#[cfg(test)]
use quickcheck::Arbitrary;

use crate::node::UniqueNodeAddress;

/// Identifies the replica owning a counter in a [VersionVector].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReplicaId {
    /// Used before the running node has an identity, e.g. before it joined anything
    Uninitialized,
    UniqueNode(UniqueNodeAddress),
}

impl From<UniqueNodeAddress> for ReplicaId {
    fn from(node: UniqueNodeAddress) -> Self {
        ReplicaId::UniqueNode(node)
    }
}

impl From<&UniqueNodeAddress> for ReplicaId {
    fn from(node: &UniqueNodeAddress) -> Self {
        ReplicaId::UniqueNode(node.clone())
    }
}

/// How two [version vectors](VersionVector) relate causally.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum CausalRelation {
    Same,
    HappenedBefore,
    HappenedAfter,
    Concurrent,
}

/// A [VersionVector] associates [replicas](ReplicaId) with a monotonic counter.
///
/// Counters start at zero, which is also the value of any replica missing from the vector,
/// and are only ever incremented. Merging two vectors takes the component-wise maximum,
/// which makes version vectors a join-semilattice: merge is commutative, associative and idempotent.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct VersionVector {
    #[cfg_attr(
        feature = "serde",
        serde(with = "serde_with::As::<Vec<(serde_with::Same, serde_with::Same)>>")
    )]
    versions: HashMap<ReplicaId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector where `replica` is at version 1
    pub fn first(replica: impl Into<ReplicaId>) -> Self {
        let mut vv = Self::new();
        vv.increment(replica);
        vv
    }

    /// Bumps the counter of `replica` by one and returns its new value
    pub fn increment(&mut self, replica: impl Into<ReplicaId>) -> u64 {
        let version = self.versions.entry(replica.into()).or_insert(0);
        *version += 1;
        *version
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.versions.get(replica).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.versions.iter().map(|(replica, version)| (replica, *version))
    }

    /// Raises the counter of `replica` to `version`. Zero is the implicit value of every replica, so it is not stored.
    pub(crate) fn record_version(&mut self, replica: ReplicaId, version: u64) {
        if version == 0 {
            return;
        }
        if let Some(existing_version) = self.versions.get_mut(&replica) {
            *existing_version = std::cmp::max(*existing_version, version);
        } else {
            self.versions.insert(replica, version);
        }
    }

    /// Component-wise max over the union of both vectors' replicas
    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, version) in &other.versions {
            self.record_version(replica.clone(), *version);
        }
    }

    pub fn compare(&self, other: &VersionVector) -> CausalRelation {
        let mut behind = false;
        let mut ahead = false;
        let replicas = self.versions.keys().chain(other.versions.keys());
        for replica in replicas {
            let mine = self.get(replica);
            let theirs = other.get(replica);
            if mine < theirs {
                behind = true;
            } else if mine > theirs {
                ahead = true;
            }
            if behind && ahead {
                return CausalRelation::Concurrent;
            }
        }
        match (behind, ahead) {
            (false, false) => CausalRelation::Same,
            (true, false) => CausalRelation::HappenedBefore,
            (false, true) => CausalRelation::HappenedAfter,
            (true, true) => CausalRelation::Concurrent,
        }
    }

    /// Drops the counter of `replica`, used when a node is permanently removed from the cluster
    pub(crate) fn prune(&mut self, replica: &ReplicaId) {
        self.versions.remove(replica);
    }
}

impl FromIterator<(ReplicaId, u64)> for VersionVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut vv = VersionVector::new();
        for (replica, version) in iter {
            vv.record_version(replica, version);
        }
        vv
    }
}

/// A [VersionVectorOffset] lets us compare two [version vectors](VersionVector) and tells us
/// if the right-hand side version vector is lagging behing the left-hand side, and if so, which replicas
/// exactly have newer versions that have not yet been observed by the RHS vector.
///
/// Implementation-wise: the comparison function goes trough every replica/version pair
/// in the LHS vector and compares it with its RHS counterpart. If the RHS version for a replica is strictly inferior to
/// its LHS counterpart, or if it is absent altogether from the RHS, we mark it as "behind" the LHS
pub(crate) struct VersionVectorOffset {
    /// A set of replicas whose latest version has not yet been observed by the RHS
    /// A non-empty set indicates that the RHS version vector is lagging behind.
    pub(crate) behind_lhs: HashSet<ReplicaId>,
}

impl VersionVectorOffset {
    pub(crate) fn of(lhs: &VersionVector, rhs: &VersionVector) -> Self {
        let mut behind_lhs = HashSet::new();
        for (replica, lhs_version) in &lhs.versions {
            match rhs.versions.get(replica) {
                Some(rhs_version) if rhs_version < lhs_version => {
                    behind_lhs.insert(replica.clone());
                }
                None if *lhs_version > 0 => {
                    behind_lhs.insert(replica.clone());
                }
                _ => (),
            }
        }
        Self { behind_lhs }
    }
}

#[cfg(test)]
impl Arbitrary for VersionVector {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Vec::<(UniqueNodeAddress, u8)>::arbitrary(g)
            .into_iter()
            .filter(|(_, version)| *version > 0)
            .map(|(node, version)| (ReplicaId::UniqueNode(node), u64::from(version)))
            .collect()
    }
}
