use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use super::{
    association::AssociationState,
    handshake::HandshakeState,
    membership::{Member, Membership, MembershipChange},
    seen_table::SeenTable,
};
use crate::{
    builder::ClusterSettings,
    error::HandshakeError,
    node::{MemberStatus, NodeAddress, UniqueNodeAddress},
};

/// The state of the cluster, as seen by the running node.
///
/// It is owned by a single task, the cluster shell, which applies transport events and user commands
/// to it one at a time. Every mutation goes through `&mut self`, so nothing here needs to be shared.
///
/// Handshakes and associations are keyed by the peer's [NodeAddress]. Once an event has been fully
/// processed, an address never has both a handshake in progress and an association.
#[derive(Debug)]
pub struct ClusterShellState {
    pub(crate) local: UniqueNodeAddress,
    settings: ClusterSettings,
    pub(crate) handshakes: HashMap<NodeAddress, HandshakeState>,
    pub(crate) associations: HashMap<NodeAddress, AssociationState>,
    pub(crate) membership: Membership,
    pub(crate) seen: SeenTable,
    /// Pruned nodes and when they were pruned. Gossip from nodes that did not prune them yet must not bring them back.
    pub(crate) tombstones: HashMap<UniqueNodeAddress, Instant>,
}

impl ClusterShellState {
    pub fn new(settings: ClusterSettings) -> Self {
        let local = settings.node.clone();
        let mut membership = Membership::new();
        membership.join(local.clone());
        let mut state = Self {
            seen: SeenTable::new(&local),
            local,
            settings,
            handshakes: HashMap::new(),
            associations: HashMap::new(),
            membership,
            tombstones: HashMap::new(),
        };
        state.increment_own_version();
        state
    }

    pub fn local(&self) -> &UniqueNodeAddress {
        &self.local
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn association(&self, address: &NodeAddress) -> Option<&AssociationState> {
        self.associations.get(address)
    }

    pub fn associations(&self) -> impl Iterator<Item = &AssociationState> {
        self.associations.values()
    }

    pub fn associated_addresses(&self) -> HashSet<UniqueNodeAddress> {
        self.associations
            .values()
            .map(|association| association.remote().clone())
            .collect()
    }

    pub fn handshakes(&self) -> impl Iterator<Item = &HandshakeState> {
        self.handshakes.values()
    }

    pub fn handshake_in_progress(&self, address: &NodeAddress) -> Option<&HandshakeState> {
        self.handshakes.get(address)
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn seen_table(&self) -> &SeenTable {
        &self.seen
    }

    /// True if `node` was pruned less than the tombstone TTL ago. Until then, that node instance cannot join again.
    pub fn is_pruned(&self, node: &UniqueNodeAddress) -> bool {
        self.tombstones.contains_key(node)
    }

    /// Forgets the nodes pruned more than the tombstone TTL before `now`, returning how many were forgotten
    pub fn expire_tombstones(&mut self, now: Instant) -> usize {
        let ttl = self.settings.tombstone_ttl;
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, pruned_at| now.saturating_duration_since(*pruned_at) < ttl);
        let expired = before - self.tombstones.len();
        if expired > 0 {
            log::debug!("Forgot {} pruned nodes", expired);
        }
        expired
    }

    /// Advances the local clock, meaning that the local view of the cluster changed
    pub fn increment_own_version(&mut self) -> u64 {
        let local = self.local.clone();
        self.seen.increment_version(&local, &local)
    }

    /// Marks the live member at `address` down.
    ///
    /// A node that is down is never talked to again: its association is dropped, and a handshake
    /// in progress with it fails.
    pub fn down(&mut self, address: &NodeAddress) -> Option<MembershipChange> {
        if self.handshakes.contains_key(address) {
            self.fail_handshake(address, HandshakeError::Downed);
        }
        self.disassociate(address);

        let change = self.membership.down(address)?;
        log::info!("Marked {} down", change.node);
        self.increment_own_version();
        Some(change)
    }

    pub fn mark_up(&mut self, address: &NodeAddress) -> Option<MembershipChange> {
        self.mark_member(address, MemberStatus::Up)
    }

    /// Marks the member at `address` as leaving the cluster. The leader removes it once every member saw it.
    pub fn leave(&mut self, address: &NodeAddress) -> Option<MembershipChange> {
        self.mark_member(address, MemberStatus::Leaving)
    }

    /// Marks the member at `address` removed, and drops any association with it.
    /// The member is pruned once every remaining member saw the removal.
    pub fn remove(&mut self, address: &NodeAddress) -> Option<MembershipChange> {
        let node = self.membership.member(address)?.node.clone();
        self.disassociate(address);
        let change = self.membership.mark(&node, MemberStatus::Removed)?;
        log::info!("Marked {} removed", node);
        self.increment_own_version();
        Some(change)
    }

    /// Forgets `node` entirely, from the membership and from the seen table
    pub fn prune(&mut self, node: &UniqueNodeAddress) -> Option<Member> {
        let pruned = self.membership.prune(node);
        self.seen.prune(node);
        self.tombstones.entry(node.clone()).or_insert_with(Instant::now);
        if pruned.is_some() {
            log::debug!("Pruned {}", node);
            self.increment_own_version();
        }
        pruned
    }

    fn mark_member(&mut self, address: &NodeAddress, status: MemberStatus) -> Option<MembershipChange> {
        let node = self.membership.member(address)?.node.clone();
        let change = self.membership.mark(&node, status)?;
        log::info!("Member {} is now {}", node, status);
        self.increment_own_version();
        Some(change)
    }
}
