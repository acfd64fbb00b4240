#[cfg(test)]
use quickcheck::Arbitrary;

pub use self::address::{NodeAddress, NodeUid, UniqueNodeAddress};

pub mod address {
    use std::fmt::Display;

    #[cfg(test)]
    use quickcheck::Arbitrary;
    use url::Url;

    use crate::error::AddressError;

    /// A [NodeAddress] identifies a network endpoint.
    ///
    /// It is *not* unique across node restarts: a node that crashes and comes back on the same host
    /// and port will have the same [NodeAddress], but a different [UniqueNodeAddress].
    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct NodeAddress {
        pub protocol: String,
        pub host: String,
        pub port: u16,
    }

    impl NodeAddress {
        pub fn new(protocol: impl ToString, host: impl ToString, port: u16) -> Self {
            Self {
                protocol: protocol.to_string(),
                host: host.to_string(),
                port,
            }
        }

        /// Builds a [NodeAddress] from a URL such as `conclave://127.0.0.1:7337`.
        /// The URL must carry a host, and a port unless its scheme has a known default port.
        pub fn from_url(url: &Url) -> Result<Self, AddressError> {
            let host = url
                .host_str()
                .ok_or_else(|| AddressError::MissingHost(url.clone()))?;
            let port = url
                .port_or_known_default()
                .ok_or_else(|| AddressError::MissingPort(url.clone()))?;
            Ok(Self::new(url.scheme(), host, port))
        }

        pub fn to_url(&self) -> Result<Url, AddressError> {
            Ok(Url::parse(&self.to_string())?)
        }
    }

    impl Display for NodeAddress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
        }
    }

    /// A random number generated once per running node instance.
    #[repr(transparent)]
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct NodeUid(pub u64);

    impl NodeUid {
        pub fn random() -> Self {
            Self(rand::random())
        }
    }

    impl Display for NodeUid {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:016x}", self.0)
        }
    }

    /// The true identity of a running node: its [NodeAddress] plus the [NodeUid] it drew at startup.
    ///
    /// The ordering (by address, then uid) is total and deterministic. It carries no meaning
    /// and is only used to break ties, e.g. when two nodes dial each other at the same time.
    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct UniqueNodeAddress {
        pub address: NodeAddress,
        pub uid: NodeUid,
    }

    impl UniqueNodeAddress {
        pub fn new(address: NodeAddress, uid: NodeUid) -> Self {
            Self { address, uid }
        }

        pub fn random(address: NodeAddress) -> Self {
            Self::new(address, NodeUid::random())
        }
    }

    impl Display for UniqueNodeAddress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}#{}", self.address, self.uid)
        }
    }

    // Small domains on purpose, so that generated values collide on addresses
    #[cfg(test)]
    impl Arbitrary for NodeAddress {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let host = *g.choose(&["127.0.0.1", "10.0.0.1", "10.0.0.2"]).unwrap();
            let port = *g.choose(&[7337u16, 7338, 7339]).unwrap();
            NodeAddress::new("conclave", host, port)
        }
    }

    #[cfg(test)]
    impl Arbitrary for UniqueNodeAddress {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            UniqueNodeAddress {
                address: NodeAddress::arbitrary(g),
                uid: NodeUid(u64::from(u8::arbitrary(g) % 3)),
            }
        }
    }

}

/// Lifecycle of a cluster member. Statuses only ever move forward, in declaration order.
#[repr(u8)]
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Hash,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemberStatus {
    // A node completed a handshake with a member of the cluster
    Joining,
    // Upon convergence, a joining node was marked up by the cluster leader
    Up,
    // A node is about to leave gracefully
    Leaving,
    // Upon failure, the failure detector marked the node as down.
    // A down node can never be marked up again unless it is entirely restarted, under a new uid.
    Down,
    // The down status has propagated, the member can be pruned from memory
    Removed,
}

impl MemberStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Joining | Self::Up | Self::Leaving)
    }

    /// Given two statuses observed for the same node instance, returns the one that takes precedence.
    ///
    /// Down and Removed are final, so they always win over live statuses: if some node observed
    /// the instance as down, we trust it. Among live statuses, the most advanced one wins.
    pub(crate) fn preceding_status(a: MemberStatus, b: MemberStatus) -> MemberStatus {
        std::cmp::max(a, b)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Joining => "joining",
            Self::Up => "up",
            Self::Leaving => "leaving",
            Self::Down => "down",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
impl Arbitrary for MemberStatus {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        *g.choose(&[
            Self::Joining,
            Self::Up,
            Self::Leaving,
            Self::Down,
            Self::Removed,
        ])
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::MemberStatus;

    #[quickcheck]
    fn down_takes_precedence_over_live_statuses(status: MemberStatus) -> bool {
        let preceding = MemberStatus::preceding_status(status, MemberStatus::Down);
        if status == MemberStatus::Removed {
            preceding == MemberStatus::Removed
        } else {
            preceding == MemberStatus::Down
        }
    }

    #[test]
    fn status_wire_codes_are_stable() {
        assert_eq!(u8::from(MemberStatus::Joining), 0);
        assert_eq!(u8::from(MemberStatus::Removed), 4);
        assert_eq!(MemberStatus::try_from(3u8).unwrap(), MemberStatus::Down);
        assert!(MemberStatus::try_from(5u8).is_err());
    }
}
