use super::{protos, WireMessage};
use crate::{
    cluster::{
        gossip::GossipEnvelope,
        handshake::{HandshakeAccept, HandshakeOffer, HandshakeReject, ProtocolVersion, RejectReason},
        membership::{Member, Membership},
        seen_table::SeenTable,
        version_vector::{ReplicaId, VersionVector},
    },
    error::WireError,
    node::{MemberStatus, NodeAddress, NodeUid, UniqueNodeAddress},
};

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, WireError> {
    value.ok_or(WireError::MissingField(field))
}

impl TryFrom<protos::NodeAddress> for NodeAddress {
    type Error = WireError;

    fn try_from(value: protos::NodeAddress) -> Result<Self, Self::Error> {
        let port = u16::try_from(value.port).map_err(|_| WireError::InvalidPort(value.port))?;
        Ok(NodeAddress {
            protocol: value.protocol,
            host: value.host,
            port,
        })
    }
}

impl From<NodeAddress> for protos::NodeAddress {
    fn from(value: NodeAddress) -> Self {
        Self {
            protocol: value.protocol,
            host: value.host,
            port: u32::from(value.port),
        }
    }
}

impl TryFrom<protos::UniqueNodeAddress> for UniqueNodeAddress {
    type Error = WireError;

    fn try_from(value: protos::UniqueNodeAddress) -> Result<Self, Self::Error> {
        Ok(UniqueNodeAddress {
            address: required(value.address, "unique_node_address.address")?.try_into()?,
            uid: NodeUid(value.uid),
        })
    }
}

impl From<UniqueNodeAddress> for protos::UniqueNodeAddress {
    fn from(value: UniqueNodeAddress) -> Self {
        Self {
            address: Some(value.address.into()),
            uid: value.uid.0,
        }
    }
}

impl From<protos::ProtocolVersion> for ProtocolVersion {
    fn from(value: protos::ProtocolVersion) -> Self {
        ProtocolVersion {
            major: value.major,
            minor: value.minor,
            patch: value.patch,
        }
    }
}

impl From<ProtocolVersion> for protos::ProtocolVersion {
    fn from(value: ProtocolVersion) -> Self {
        Self {
            major: value.major,
            minor: value.minor,
            patch: value.patch,
        }
    }
}

impl TryFrom<protos::HandshakeOffer> for HandshakeOffer {
    type Error = WireError;

    fn try_from(value: protos::HandshakeOffer) -> Result<Self, Self::Error> {
        Ok(HandshakeOffer {
            from: required(value.from, "offer.from")?.try_into()?,
            to: required(value.to, "offer.to")?.try_into()?,
            protocol_version: required(value.protocol_version, "offer.protocol_version")?.into(),
        })
    }
}

impl From<HandshakeOffer> for protos::HandshakeOffer {
    fn from(value: HandshakeOffer) -> Self {
        Self {
            from: Some(value.from.into()),
            to: Some(value.to.into()),
            protocol_version: Some(value.protocol_version.into()),
        }
    }
}

impl TryFrom<protos::HandshakeAccept> for HandshakeAccept {
    type Error = WireError;

    fn try_from(value: protos::HandshakeAccept) -> Result<Self, Self::Error> {
        Ok(HandshakeAccept {
            from: required(value.from, "accept.from")?.try_into()?,
            to: required(value.to, "accept.to")?.try_into()?,
        })
    }
}

impl From<HandshakeAccept> for protos::HandshakeAccept {
    fn from(value: HandshakeAccept) -> Self {
        Self {
            from: Some(value.from.into()),
            to: Some(value.to.into()),
        }
    }
}

impl TryFrom<protos::HandshakeReject> for HandshakeReject {
    type Error = WireError;

    fn try_from(value: protos::HandshakeReject) -> Result<Self, Self::Error> {
        let reason = u8::try_from(value.reason)
            .ok()
            .and_then(|code| RejectReason::try_from(code).ok())
            .ok_or(WireError::UnknownRejectReason(value.reason))?;
        Ok(HandshakeReject {
            from: required(value.from, "reject.from")?.try_into()?,
            to: required(value.to, "reject.to")?.try_into()?,
            reason,
            message: value.message,
        })
    }
}

impl From<HandshakeReject> for protos::HandshakeReject {
    fn from(value: HandshakeReject) -> Self {
        Self {
            from: Some(value.from.into()),
            to: Some(value.to.into()),
            reason: u32::from(u8::from(value.reason)),
            message: value.message,
        }
    }
}

impl TryFrom<protos::VersionVector> for VersionVector {
    type Error = WireError;

    fn try_from(value: protos::VersionVector) -> Result<Self, Self::Error> {
        value
            .versions
            .into_iter()
            .map(|entry| -> Result<(ReplicaId, u64), WireError> {
                let replica = match entry.replica {
                    Some(node) => ReplicaId::UniqueNode(node.try_into()?),
                    None => ReplicaId::Uninitialized,
                };
                Ok((replica, entry.version))
            })
            .collect()
    }
}

impl From<&VersionVector> for protos::VersionVector {
    fn from(value: &VersionVector) -> Self {
        Self {
            versions: value
                .iter()
                .map(|(replica, version)| protos::ReplicaVersion {
                    replica: match replica {
                        ReplicaId::UniqueNode(node) => Some(node.clone().into()),
                        ReplicaId::Uninitialized => None,
                    },
                    version,
                })
                .collect(),
        }
    }
}

impl TryFrom<protos::Member> for Member {
    type Error = WireError;

    fn try_from(value: protos::Member) -> Result<Self, Self::Error> {
        let status = u8::try_from(value.status)
            .ok()
            .and_then(|code| MemberStatus::try_from(code).ok())
            .ok_or(WireError::UnknownStatus(value.status))?;
        Ok(Member {
            node: required(value.node, "member.node")?.try_into()?,
            status,
        })
    }
}

impl From<&Member> for protos::Member {
    fn from(value: &Member) -> Self {
        Self {
            node: Some(value.node.clone().into()),
            status: u32::from(u8::from(value.status)),
        }
    }
}

impl TryFrom<protos::GossipEnvelope> for GossipEnvelope {
    type Error = WireError;

    fn try_from(value: protos::GossipEnvelope) -> Result<Self, Self::Error> {
        let owner: UniqueNodeAddress = required(value.owner, "gossip.owner")?.try_into()?;

        let mut seen = SeenTable::default();
        for row in value.seen {
            seen.insert_row(
                required(row.node, "seen.node")?.try_into()?,
                required(row.version, "seen.version")?.try_into()?,
            );
        }

        let membership = value
            .members
            .into_iter()
            .map(Member::try_from)
            .collect::<Result<Membership, _>>()?;

        Ok(GossipEnvelope {
            owner,
            owner_version: required(value.owner_version, "gossip.owner_version")?.try_into()?,
            seen,
            membership,
        })
    }
}

impl From<&GossipEnvelope> for protos::GossipEnvelope {
    fn from(value: &GossipEnvelope) -> Self {
        Self {
            owner: Some(value.owner.clone().into()),
            owner_version: Some((&value.owner_version).into()),
            seen: value
                .seen
                .rows()
                .map(|(node, version)| protos::SeenTableRow {
                    node: Some(node.clone().into()),
                    version: Some(version.into()),
                })
                .collect(),
            members: value.membership.members().map(protos::Member::from).collect(),
        }
    }
}

impl TryFrom<protos::Envelope> for WireMessage {
    type Error = WireError;

    fn try_from(value: protos::Envelope) -> Result<Self, Self::Error> {
        use protos::envelope::Message;

        Ok(match required(value.message, "envelope.message")? {
            Message::Offer(offer) => WireMessage::Offer(offer.try_into()?),
            Message::Accept(accept) => WireMessage::Accept(accept.try_into()?),
            Message::Reject(reject) => WireMessage::Reject(reject.try_into()?),
            Message::Gossip(gossip) => WireMessage::Gossip(Box::new(gossip.try_into()?)),
        })
    }
}

impl From<&WireMessage> for protos::Envelope {
    fn from(value: &WireMessage) -> Self {
        use protos::envelope::Message;

        let message = match value {
            WireMessage::Offer(offer) => Message::Offer(offer.clone().into()),
            WireMessage::Accept(accept) => Message::Accept(accept.clone().into()),
            WireMessage::Reject(reject) => Message::Reject(reject.clone().into()),
            WireMessage::Gossip(gossip) => Message::Gossip(gossip.as_ref().into()),
        };
        Self {
            message: Some(message),
        }
    }
}
