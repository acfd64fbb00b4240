//! The state machines of the cluster: handshakes, associations, membership and gossip.
//!
//! Everything here is driven by [ClusterShellState], which is only ever mutated by the task running
//! the cluster shell, one event at a time.

pub mod association;
pub mod gossip;
pub mod handshake;
pub mod membership;
pub mod seen_table;
pub mod shell_state;
pub mod version_vector;

pub use self::{
    association::{AssociatedState, AssociationState},
    gossip::GossipEnvelope,
    membership::{Member, Membership, MembershipChange},
    seen_table::SeenTable,
    shell_state::ClusterShellState,
    version_vector::{CausalRelation, ReplicaId, VersionVector},
};
