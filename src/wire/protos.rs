//! Protobuf schema of the messages exchanged between nodes.

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeAddress {
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(uint32, tag = "3")]
    pub port: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UniqueNodeAddress {
    #[prost(message, optional, tag = "1")]
    pub address: Option<NodeAddress>,
    #[prost(uint64, tag = "2")]
    pub uid: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolVersion {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeOffer {
    #[prost(message, optional, tag = "1")]
    pub from: Option<UniqueNodeAddress>,
    #[prost(message, optional, tag = "2")]
    pub to: Option<NodeAddress>,
    #[prost(message, optional, tag = "3")]
    pub protocol_version: Option<ProtocolVersion>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeAccept {
    #[prost(message, optional, tag = "1")]
    pub from: Option<UniqueNodeAddress>,
    #[prost(message, optional, tag = "2")]
    pub to: Option<UniqueNodeAddress>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeReject {
    #[prost(message, optional, tag = "1")]
    pub from: Option<UniqueNodeAddress>,
    #[prost(message, optional, tag = "2")]
    pub to: Option<UniqueNodeAddress>,
    #[prost(uint32, tag = "3")]
    pub reason: u32,
    #[prost(string, tag = "4")]
    pub message: String,
}

/// A replica without node is the uninitialized replica
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplicaVersion {
    #[prost(message, optional, tag = "1")]
    pub replica: Option<UniqueNodeAddress>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionVector {
    #[prost(message, repeated, tag = "1")]
    pub versions: Vec<ReplicaVersion>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SeenTableRow {
    #[prost(message, optional, tag = "1")]
    pub node: Option<UniqueNodeAddress>,
    #[prost(message, optional, tag = "2")]
    pub version: Option<VersionVector>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Member {
    #[prost(message, optional, tag = "1")]
    pub node: Option<UniqueNodeAddress>,
    #[prost(uint32, tag = "2")]
    pub status: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GossipEnvelope {
    #[prost(message, optional, tag = "1")]
    pub owner: Option<UniqueNodeAddress>,
    #[prost(message, optional, tag = "2")]
    pub owner_version: Option<VersionVector>,
    #[prost(message, repeated, tag = "3")]
    pub seen: Vec<SeenTableRow>,
    #[prost(message, repeated, tag = "4")]
    pub members: Vec<Member>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Message", tags = "1, 2, 3, 4")]
    pub message: Option<envelope::Message>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Offer(super::HandshakeOffer),
        #[prost(message, tag = "2")]
        Accept(super::HandshakeAccept),
        #[prost(message, tag = "3")]
        Reject(super::HandshakeReject),
        #[prost(message, tag = "4")]
        Gossip(super::GossipEnvelope),
    }
}
