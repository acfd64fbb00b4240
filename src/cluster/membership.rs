use std::collections::{BTreeMap, BTreeSet};

#[cfg(test)]
use quickcheck::Arbitrary;

use crate::node::{MemberStatus, NodeAddress, NodeUid, UniqueNodeAddress};

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    pub node: UniqueNodeAddress,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(node: UniqueNodeAddress, status: MemberStatus) -> Self {
        Self { node, status }
    }
}

/// Describes how a single member changed after an operation on the [Membership]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MembershipChange {
    pub node: UniqueNodeAddress,
    /// `None` when the member was not known before
    pub from: Option<MemberStatus>,
    pub to: MemberStatus,
    /// The live member that was superseded, when a new instance joined under an already-used address
    pub replaced: Option<Member>,
}

impl MembershipChange {
    pub fn is_new(&self) -> bool {
        self.from.is_none()
    }

    pub fn is_replacement(&self) -> bool {
        self.replaced.is_some()
    }
}

/// The roster of cluster members, ordered by [UniqueNodeAddress].
///
/// Members are recorded per node instance, and statuses of the same instance only move forward.
/// This makes [Membership::merge] a join-semilattice, like version vectors.
///
/// A [NodeAddress] has at most one *live* member: when a new instance joins under an address
/// that already has a live member, the old instance is superseded and marked down.
/// It stays in the roster, so that the down status can spread through gossip, until it is pruned.
/// When gossip brings together live instances that never saw each other, the highest ordered one stays live.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Membership {
    #[cfg_attr(
        feature = "serde",
        serde(with = "serde_with::As::<Vec<(serde_with::Same, serde_with::Same)>>")
    )]
    members: BTreeMap<UniqueNodeAddress, Member>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `node` as a joining member.
    ///
    /// Returns `None` if that exact instance is already known. If another live instance occupies
    /// the same address, it is marked down and reported as [replaced](MembershipChange::replaced).
    pub fn join(&mut self, node: UniqueNodeAddress) -> Option<MembershipChange> {
        if self.members.contains_key(&node) {
            return None;
        }

        let replaced = self.member(&node.address).cloned();
        if let Some(previous) = &replaced {
            log::info!(
                "Member {} replaces {} at the same address, marking the latter down",
                node,
                previous.node
            );
            self.mark(&previous.node, MemberStatus::Down);
        }

        self.members
            .insert(node.clone(), Member::new(node.clone(), MemberStatus::Joining));
        Some(MembershipChange {
            node,
            from: None,
            to: MemberStatus::Joining,
            replaced,
        })
    }

    /// Marks the live member at `address` as down. Down members are kept until they are pruned.
    pub fn down(&mut self, address: &NodeAddress) -> Option<MembershipChange> {
        let node = self.member(address)?.node.clone();
        self.mark(&node, MemberStatus::Down)
    }

    /// Moves `node` forward to `status`. Returns `None` for unknown nodes, or if the member
    /// is already at or past `status`.
    pub fn mark(&mut self, node: &UniqueNodeAddress, status: MemberStatus) -> Option<MembershipChange> {
        let member = self.members.get_mut(node)?;
        if member.status >= status {
            return None;
        }
        let from = member.status;
        member.status = status;
        Some(MembershipChange {
            node: node.clone(),
            from: Some(from),
            to: status,
            replaced: None,
        })
    }

    /// Forgets `node`. Unlike [Membership::down], this frees memory, and should only happen once
    /// the down or removed status had time to spread.
    pub fn prune(&mut self, node: &UniqueNodeAddress) -> Option<Member> {
        self.members.remove(node)
    }

    /// The live member at `address`
    pub fn member(&self, address: &NodeAddress) -> Option<&Member> {
        self.instances(address).find(|member| member.status.is_live())
    }

    pub fn get(&self, node: &UniqueNodeAddress) -> Option<&Member> {
        self.members.get(node)
    }

    /// Every known instance at `address`, live or not
    pub fn instances<'a>(&'a self, address: &NodeAddress) -> impl Iterator<Item = &'a Member> + 'a {
        let from = UniqueNodeAddress::new(address.clone(), NodeUid(u64::MIN));
        let to = UniqueNodeAddress::new(address.clone(), NodeUid(u64::MAX));
        self.members.range(from..=to).map(|(_, member)| member)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn live_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|member| member.status.is_live())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Merges an incoming membership into this one: the union of both rosters,
    /// where the status of each instance is the one taking precedence (down and removed dominate).
    /// Live instances sharing an address are then settled, so that only the highest ordered one stays live.
    ///
    /// Merging is commutative and idempotent. A down status is final, so views merged in different orders
    /// may differ in which superseded instances they marked down, but exchanging them settles on the same roster.
    ///
    /// Returns the changes this membership went through.
    pub fn merge(&mut self, incoming: &Membership) -> Vec<MembershipChange> {
        let addresses: BTreeSet<&NodeAddress> = incoming.members.keys().map(|node| &node.address).collect();
        let before: BTreeMap<UniqueNodeAddress, Option<MemberStatus>> = addresses
            .iter()
            .flat_map(|address| self.instances(address).chain(incoming.instances(address)))
            .map(|member| (member.node.clone(), self.get(&member.node).map(|known| known.status)))
            .collect();

        for (node, incoming_member) in &incoming.members {
            self.members
                .entry(node.clone())
                .and_modify(|member| {
                    member.status = MemberStatus::preceding_status(member.status, incoming_member.status)
                })
                .or_insert_with(|| incoming_member.clone());
        }
        for address in addresses {
            self.settle(address);
        }

        before
            .into_iter()
            .filter_map(|(node, from)| {
                let to = self.members.get(&node)?.status;
                (from != Some(to)).then(|| MembershipChange {
                    node,
                    from,
                    to,
                    replaced: None,
                })
            })
            .collect()
    }

    /// Marks down every live instance at `address` but the highest ordered one
    fn settle(&mut self, address: &NodeAddress) {
        let live: Vec<UniqueNodeAddress> = self
            .instances(address)
            .filter(|member| member.status.is_live())
            .map(|member| member.node.clone())
            .collect();
        if let Some((kept, superseded)) = live.split_last() {
            for node in superseded {
                log::info!("{} and {} are both live, marking the former down", node, kept);
                self.mark(node, MemberStatus::Down);
            }
        }
    }
}

impl FromIterator<Member> for Membership {
    fn from_iter<T: IntoIterator<Item = Member>>(iter: T) -> Self {
        let mut membership = Membership::new();
        for member in iter {
            membership
                .members
                .entry(member.node.clone())
                .and_modify(|known| known.status = MemberStatus::preceding_status(known.status, member.status))
                .or_insert(member);
        }
        let addresses: BTreeSet<NodeAddress> = membership.members.keys().map(|node| node.address.clone()).collect();
        for address in &addresses {
            membership.settle(address);
        }
        membership
    }
}

/// Generates a membership whose members may collide on addresses
#[cfg(test)]
impl Arbitrary for Membership {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Vec::<(UniqueNodeAddress, MemberStatus)>::arbitrary(g)
            .into_iter()
            .map(|(node, status)| Member::new(node, status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16, uid: u64) -> UniqueNodeAddress {
        UniqueNodeAddress::new(NodeAddress::new("conclave", "127.0.0.1", port), NodeUid(uid))
    }

    #[test]
    fn join_adds_a_joining_member() {
        let mut membership = Membership::new();
        let change = membership.join(node(1, 1)).unwrap();
        assert!(change.is_new());
        assert!(!change.is_replacement());
        assert_eq!(change.to, MemberStatus::Joining);
        assert_eq!(membership.join(node(1, 1)), None);
    }

    #[test]
    fn join_under_an_existing_address_is_a_replacement() {
        let mut membership = Membership::new();
        membership.join(node(1, 1));
        membership.mark(&node(1, 1), MemberStatus::Up);

        let change = membership.join(node(1, 2)).unwrap();
        assert!(change.is_replacement());
        assert_eq!(
            change.replaced,
            Some(Member::new(node(1, 1), MemberStatus::Up))
        );
        assert_eq!(membership.get(&node(1, 1)).unwrap().status, MemberStatus::Down);
        assert_eq!(membership.member(&node(1, 1).address).unwrap().node, node(1, 2));
        assert_eq!(
            membership
                .instances(&node(1, 1).address)
                .filter(|m| m.status.is_live())
                .count(),
            1
        );
    }

    #[test]
    fn down_keeps_the_member() {
        let mut membership = Membership::new();
        membership.join(node(1, 1));
        membership.join(node(2, 1));

        let change = membership.down(&node(1, 1).address).unwrap();
        assert_eq!(change.to, MemberStatus::Down);
        assert_eq!(membership.member(&node(1, 1).address), None);
        assert_eq!(membership.get(&node(1, 1)).unwrap().status, MemberStatus::Down);
        assert_eq!(membership.down(&node(1, 1).address), None);

        assert!(membership.prune(&node(1, 1)).is_some());
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn statuses_only_move_forward() {
        let mut membership = Membership::new();
        membership.join(node(1, 1));
        assert!(membership.mark(&node(1, 1), MemberStatus::Leaving).is_some());
        assert!(membership.mark(&node(1, 1), MemberStatus::Up).is_none());
        assert_eq!(membership.get(&node(1, 1)).unwrap().status, MemberStatus::Leaving);
    }

    #[test]
    fn merge_lets_down_dominate() {
        let mut a = Membership::new();
        a.join(node(1, 1));
        a.mark(&node(1, 1), MemberStatus::Up);

        let mut b = Membership::new();
        b.join(node(1, 1));
        b.down(&node(1, 1).address);
        b.join(node(2, 1));

        let changes = a.merge(&b);
        assert_eq!(changes.len(), 2);
        assert_eq!(a.get(&node(1, 1)).unwrap().status, MemberStatus::Down);
        assert_eq!(a.get(&node(2, 1)).unwrap().status, MemberStatus::Joining);
        assert!(a.merge(&b).is_empty());
    }

    #[test]
    fn merge_keeps_a_single_live_instance_per_address() {
        let mut a = Membership::new();
        a.join(node(1, 9));
        a.mark(&node(1, 9), MemberStatus::Up);
        let mut b = Membership::new();
        b.join(node(1, 2));

        let changes = a.merge(&b);
        assert_eq!(
            changes,
            vec![MembershipChange {
                node: node(1, 2),
                from: None,
                to: MemberStatus::Down,
                replaced: None,
            }]
        );
        assert_eq!(a.member(&node(1, 1).address).unwrap().node, node(1, 9));
        assert_eq!(a.live_members().count(), 1);

        // the other way around, the live instance of b is superseded
        let changes = b.merge(&a);
        assert_eq!(b, a);
        assert!(changes
            .iter()
            .any(|change| change.node == node(1, 2) && change.from == Some(MemberStatus::Joining)));
    }

    #[test]
    fn superseded_instances_stay_down() {
        let mut a = Membership::new();
        a.join(node(1, 2));
        let mut b = Membership::new();
        b.join(node(1, 9));
        a.merge(&b);
        assert_eq!(a.get(&node(1, 2)).unwrap().status, MemberStatus::Down);

        // learning that the winner went down does not bring the superseded instance back
        let mut c = Membership::new();
        c.join(node(1, 9));
        c.down(&node(1, 9).address);
        a.merge(&c);
        assert_eq!(a.member(&node(1, 1).address), None);
    }

    #[quickcheck]
    fn merged_memberships_have_one_live_member_per_address(mut a: Membership, b: Membership) -> bool {
        a.merge(&b);
        let live: Vec<&NodeAddress> = a.live_members().map(|member| &member.node.address).collect();
        let distinct: BTreeSet<&NodeAddress> = live.iter().copied().collect();
        live.len() == distinct.len()
    }

    /// Tests that for all memberships a, b and c, merging them in different orders yields views
    /// that agree once they are merged with each other
    #[quickcheck]
    fn merge_test_exchanged_views_agree(a: Membership, b: Membership, c: Membership) -> bool {
        let mut merged_a_and_b_first = a.clone();
        merged_a_and_b_first.merge(&b);
        merged_a_and_b_first.merge(&c);

        let mut b_and_c = b;
        b_and_c.merge(&c);
        let mut merged_b_and_c_first = a;
        merged_b_and_c_first.merge(&b_and_c);

        let snapshot = merged_a_and_b_first.clone();
        merged_a_and_b_first.merge(&merged_b_and_c_first);
        merged_b_and_c_first.merge(&snapshot);
        merged_a_and_b_first == merged_b_and_c_first
    }

    /// Tests that for all memberships a and b, merging a into b is equivalent to merging b into a
    #[quickcheck]
    fn merge_test_commutativity(a: Membership, mut b: Membership) -> bool {
        let merged_a_b = {
            let mut a = a.clone();
            a.merge(&b);
            a
        };
        let merged_b_a = {
            b.merge(&a);
            b
        };
        merged_a_b == merged_b_a
    }

    /// Tests that once b was merged into a, merging b again is a no-op
    #[quickcheck]
    fn merge_test_idempotence(mut a: Membership, b: Membership) -> bool {
        a.merge(&b);
        let merged_a_b = a.clone();
        a.merge(&b).is_empty() && a == merged_a_b
    }
}
