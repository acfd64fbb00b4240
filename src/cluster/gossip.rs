use std::borrow::Cow;

use rand::seq::SliceRandom;

use super::{
    association::{AssociatedState, AssociationState},
    membership::{Member, Membership, MembershipChange},
    seen_table::SeenTable,
    shell_state::ClusterShellState,
    version_vector::{CausalRelation, ReplicaId, VersionVector, VersionVectorOffset},
};
use crate::node::{MemberStatus, UniqueNodeAddress};

/// The state a node periodically sends to some of its peers: its membership, its seen table,
/// and its own version, i.e. its row of the seen table.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GossipEnvelope {
    pub owner: UniqueNodeAddress,
    pub owner_version: VersionVector,
    pub seen: SeenTable,
    pub membership: Membership,
}

impl GossipEnvelope {
    pub fn new(owner: UniqueNodeAddress, seen: SeenTable, membership: Membership) -> Self {
        let owner_version = seen.version(&owner).cloned().unwrap_or_default();
        Self {
            owner,
            owner_version,
            seen,
            membership,
        }
    }

    /// Advances the owner's clock, in its seen table row and in the owner version
    pub fn increment_owner_version(&mut self) -> u64 {
        let version = self.seen.increment_version(&self.owner, &self.owner);
        self.refresh_owner_version();
        version
    }

    /// Copies the owner's seen table row into the owner version
    pub(crate) fn refresh_owner_version(&mut self) {
        self.owner_version = self.seen.version(&self.owner).cloned().unwrap_or_default();
    }

    fn prune(&mut self, node: &UniqueNodeAddress) {
        self.membership.prune(node);
        self.seen.prune(node);
        self.owner_version.prune(&ReplicaId::from(node));
    }
}

/// What merging an incoming gossip did to the local state
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GossipMergeOutcome {
    /// How the local version related to the incoming one, before merging
    pub relation: CausalRelation,
    pub changes: Vec<MembershipChange>,
    /// Peers that were associated, and that the incoming gossip marked down or removed
    pub disassociated: Vec<UniqueNodeAddress>,
    /// True if the sender has not observed everything we know, and should get our gossip back
    pub reply: bool,
}

impl ClusterShellState {
    pub fn gossip_envelope(&self) -> GossipEnvelope {
        GossipEnvelope::new(self.local.clone(), self.seen.clone(), self.membership.clone())
    }

    /// Merges gossip received from another node.
    ///
    /// Merging the same envelope twice has no effect the second time. Merging does not advance
    /// the local version: our row absorbs the sender's version instead.
    pub fn merge_gossip(&mut self, incoming: &GossipEnvelope) -> GossipMergeOutcome {
        let local = self.local.clone();
        let relation = self.seen.compare_version(&local, &incoming.owner_version);

        if incoming.owner == local {
            log::debug!("Ignoring gossip that claims to come from this node");
            return GossipMergeOutcome {
                relation,
                changes: Vec::new(),
                disassociated: Vec::new(),
                reply: false,
            };
        }

        let incoming = if self.tombstones.is_empty() {
            Cow::Borrowed(incoming)
        } else {
            let mut filtered = incoming.clone();
            for node in self.tombstones.keys() {
                filtered.prune(node);
            }
            Cow::Owned(filtered)
        };

        self.seen.merge(&local, &incoming);
        let changes = self.membership.merge(&incoming.membership);

        let mut disassociated = Vec::new();
        for change in changes.iter().filter(|change| !change.to.is_live()) {
            if change.node == local {
                log::warn!("This node was marked {} by {}", change.to, incoming.owner);
                continue;
            }
            let associated = self
                .association(&change.node.address)
                .map_or(false, |association| association.remote() == &change.node);
            if associated {
                self.disassociate(&change.node.address);
                disassociated.push(change.node.clone());
            }
        }

        let reply = self
            .seen
            .version(&local)
            .map_or(false, |version| version.compare(&incoming.owner_version) != CausalRelation::Same);

        log::debug!(
            "Merged gossip from {} ({:?}), {} membership changes",
            incoming.owner,
            relation,
            changes.len()
        );
        GossipMergeOutcome {
            relation,
            changes,
            disassociated,
            reply,
        }
    }

    /// Picks up to `gossip_fanout` associated peers to gossip with.
    ///
    /// Peers that we know are lagging behind our version come first. The remaining slots are filled
    /// at random among the other peers.
    pub fn select_gossip_peers(&self) -> Vec<AssociatedState> {
        let fanout = self.settings().gossip_fanout;
        let local_version = self.seen.version(&self.local).cloned().unwrap_or_default();

        let mut lagging = Vec::new();
        let mut others = Vec::new();
        for association in self.associations.values() {
            let AssociationState::Associated(associated) = association;
            let behind = match self.seen.version(&associated.remote) {
                Some(version) => !VersionVectorOffset::of(&local_version, version)
                    .behind_lhs
                    .is_empty(),
                None => true,
            };
            if behind {
                lagging.push(associated);
            } else {
                others.push(associated);
            }
        }

        lagging.shuffle(&mut rand::thread_rng());
        lagging.truncate(fanout);
        let remaining = fanout - lagging.len();
        lagging
            .into_iter()
            .chain(others.choose_multiple(&mut rand::thread_rng(), remaining).copied())
            .cloned()
            .collect()
    }

    /// True when every live member observed the same version of the cluster state
    pub fn converged(&self) -> bool {
        let live: Vec<&UniqueNodeAddress> = self.membership.live_members().map(|member| &member.node).collect();
        self.seen.converged(live)
    }

    /// The leader is the lowest live member. It is the only node that moves members through their lifecycle.
    pub fn leader(&self) -> Option<&UniqueNodeAddress> {
        self.membership.live_members().map(|member| &member.node).min()
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(&self.local)
    }

    /// When this node is the leader and the cluster converged: joining members are marked up,
    /// and leaving or down members are marked removed.
    pub fn perform_leader_actions(&mut self) -> Vec<MembershipChange> {
        if !self.is_leader() || !self.converged() {
            return Vec::new();
        }

        let transitions: Vec<(UniqueNodeAddress, MemberStatus)> = self
            .membership
            .members()
            .filter_map(|member| match member.status {
                MemberStatus::Joining => Some((member.node.clone(), MemberStatus::Up)),
                MemberStatus::Leaving | MemberStatus::Down => Some((member.node.clone(), MemberStatus::Removed)),
                MemberStatus::Up | MemberStatus::Removed => None,
            })
            .collect();

        let mut changes = Vec::new();
        for (node, status) in transitions {
            if let Some(change) = self.membership.mark(&node, status) {
                log::info!("Leader moved {} from {:?} to {}", node, change.from, status);
                let associated = self
                    .association(&node.address)
                    .map_or(false, |association| association.remote() == &node);
                if status == MemberStatus::Removed && associated {
                    self.disassociate(&node.address);
                }
                changes.push(change);
            }
        }
        if !changes.is_empty() {
            self.increment_own_version();
        }
        changes
    }

    /// Once the cluster converged, every member saw the removals: removed members can be forgotten
    pub fn prune_removed(&mut self) -> Vec<Member> {
        if !self.converged() {
            return Vec::new();
        }
        let removed: Vec<UniqueNodeAddress> = self
            .membership
            .members()
            .filter(|member| member.status == MemberStatus::Removed && member.node != self.local)
            .map(|member| member.node.clone())
            .collect();
        removed.iter().filter_map(|node| self.prune(node)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::shell_state::tests::{associate_incoming, node, shell_state},
        transport::Outbound,
    };

    /// Runs a push-pull exchange from `from` to `to`, until neither side needs to reply
    fn exchange(from: &mut ClusterShellState, to: &mut ClusterShellState) {
        let mut outcome = to.merge_gossip(&from.gossip_envelope());
        let mut rounds = 0;
        while outcome.reply {
            outcome = from.merge_gossip(&to.gossip_envelope());
            if !outcome.reply {
                break;
            }
            outcome = to.merge_gossip(&from.gossip_envelope());
            rounds += 1;
            assert!(rounds < 10, "gossip exchange did not terminate");
        }
    }

    #[test]
    fn merging_gossip_from_a_lagging_node_does_not_reply() {
        let a = node(1, 1);
        let b = node(2, 2);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        associate_incoming(&mut b_state, &a);

        let outcome = b_state.merge_gossip(&a_state.gossip_envelope());
        assert_eq!(outcome.relation, CausalRelation::Concurrent);
        assert!(outcome.reply);

        let outcome = a_state.merge_gossip(&b_state.gossip_envelope());
        assert_eq!(outcome.relation, CausalRelation::HappenedBefore);
        assert!(!outcome.reply);
        assert_eq!(
            a_state.seen_table().version(&a),
            b_state.seen_table().version(&b)
        );
    }

    #[test]
    fn gossip_replay_is_idempotent() {
        let a = node(1, 1);
        let b = node(2, 2);
        let c = node(3, 3);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        associate_incoming(&mut a_state, &c);
        associate_incoming(&mut b_state, &a);

        let envelope = a_state.gossip_envelope();
        let first = b_state.merge_gossip(&envelope);
        assert!(!first.changes.is_empty());
        let seen = b_state.seen_table().clone();
        let membership = b_state.membership().clone();

        let replayed = b_state.merge_gossip(&envelope);
        assert!(replayed.changes.is_empty());
        assert!(replayed.disassociated.is_empty());
        assert_eq!(replayed.reply, first.reply);
        assert_eq!(b_state.seen_table(), &seen);
        assert_eq!(b_state.membership(), &membership);
    }

    #[test]
    fn third_party_information_spreads_transitively() {
        let m = node(1, 1);
        let s = node(2, 2);
        let t = node(3, 3);
        let mut m_state = shell_state(&m);
        let mut s_state = shell_state(&s);
        associate_incoming(&mut m_state, &s);
        associate_incoming(&mut s_state, &m);
        associate_incoming(&mut s_state, &t);

        // m never talked to t, but hears about it from s
        m_state.merge_gossip(&s_state.gossip_envelope());
        assert_eq!(
            m_state.membership().get(&t).map(|member| member.status),
            Some(MemberStatus::Joining)
        );
        assert_eq!(
            m_state.seen_table().version(&s),
            s_state.seen_table().version(&s)
        );
        assert!(m_state.seen_table().version(&t).is_none());
    }

    #[test]
    fn down_in_gossip_disassociates_the_peer() {
        let a = node(1, 1);
        let b = node(2, 2);
        let c = node(3, 3);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        associate_incoming(&mut a_state, &c);
        associate_incoming(&mut b_state, &a);
        let (_connection, mut c_outbound) = associate_incoming(&mut b_state, &c);

        a_state.down(&c.address);
        let outcome = b_state.merge_gossip(&a_state.gossip_envelope());
        assert_eq!(outcome.disassociated, vec![c.clone()]);
        assert!(b_state.association(&c.address).is_none());
        assert!(matches!(c_outbound.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn newer_instance_in_gossip_disassociates_the_superseded_one() {
        let a = node(1, 1);
        let b = node(2, 2);
        let old_c = node(3, 3);
        let new_c = node(3, 9);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        let (_connection, mut old_c_outbound) = associate_incoming(&mut a_state, &old_c);
        associate_incoming(&mut b_state, &a);
        associate_incoming(&mut b_state, &new_c);

        let outcome = a_state.merge_gossip(&b_state.gossip_envelope());
        assert_eq!(outcome.disassociated, vec![old_c.clone()]);
        assert!(a_state.association(&old_c.address).is_none());
        assert!(matches!(old_c_outbound.try_recv(), Ok(Outbound::Close)));
        assert_eq!(
            a_state.membership().member(&old_c.address).map(|member| &member.node),
            Some(&new_c)
        );
        assert_eq!(
            a_state.membership().get(&old_c).map(|member| member.status),
            Some(MemberStatus::Down)
        );
    }

    #[test]
    fn lagging_peers_are_selected_first() {
        let local = node(1, 1);
        let mut state = shell_state(&local);
        for port in 2..=8 {
            associate_incoming(&mut state, &node(port, port.into()));
        }
        // node 2 observed everything we know
        let own = state.seen_table().version(&local).cloned().unwrap();
        state.seen.insert_row(node(2, 2), own);

        let selected = state.select_gossip_peers();
        assert_eq!(selected.len(), 5);
        assert!(selected.iter().all(|peer| peer.remote != node(2, 2)));

        let mut state = shell_state(&local);
        associate_incoming(&mut state, &node(2, 2));
        let own = state.seen_table().version(&local).cloned().unwrap();
        state.seen.insert_row(node(2, 2), own);
        let selected = state.select_gossip_peers();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].remote, node(2, 2));
    }

    #[test]
    fn leader_marks_members_up_once_converged() {
        let a = node(1, 1);
        let b = node(2, 2);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        associate_incoming(&mut b_state, &a);
        assert_eq!(a_state.leader(), Some(&a));
        assert!(!b_state.is_leader());

        assert!(!a_state.converged());
        assert!(a_state.perform_leader_actions().is_empty());

        exchange(&mut a_state, &mut b_state);
        exchange(&mut b_state, &mut a_state);
        assert!(a_state.converged());

        let changes = a_state.perform_leader_actions();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.to == MemberStatus::Up));
        assert!(b_state.perform_leader_actions().is_empty());

        exchange(&mut a_state, &mut b_state);
        assert_eq!(
            b_state.membership().get(&b).map(|member| member.status),
            Some(MemberStatus::Up)
        );
    }

    #[test]
    fn removed_members_are_pruned_and_stay_pruned() {
        let a = node(1, 1);
        let b = node(2, 2);
        let c = node(3, 3);
        let mut a_state = shell_state(&a);
        let mut b_state = shell_state(&b);
        associate_incoming(&mut a_state, &b);
        associate_incoming(&mut a_state, &c);
        associate_incoming(&mut b_state, &a);

        a_state.down(&c.address);
        exchange(&mut a_state, &mut b_state);
        exchange(&mut b_state, &mut a_state);
        assert!(a_state.converged());
        assert!(a_state
            .perform_leader_actions()
            .iter()
            .any(|change| change.node == c && change.to == MemberStatus::Removed));

        exchange(&mut a_state, &mut b_state);
        exchange(&mut b_state, &mut a_state);
        assert_eq!(a_state.prune_removed().len(), 1);
        assert!(a_state.is_pruned(&c));

        // b did not prune c yet, but its gossip does not bring c back
        let envelope = b_state.gossip_envelope();
        assert!(envelope.membership.get(&c).is_some());
        a_state.merge_gossip(&envelope);
        assert!(a_state.membership().get(&c).is_none());
        assert!(a_state.seen_table().version(&c).is_none());
    }

    #[test]
    fn own_gossip_is_ignored() {
        let a = node(1, 1);
        let mut a_state = shell_state(&a);
        let mut envelope = a_state.gossip_envelope();
        envelope.increment_owner_version();
        let outcome = a_state.merge_gossip(&envelope);
        assert!(!outcome.reply);
        assert_ne!(a_state.seen_table().version(&a), Some(&envelope.owner_version));
    }
}
