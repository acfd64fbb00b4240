//! Encoding of the messages exchanged between nodes.
//!
//! Every message is a protobuf [Envelope](protos::Envelope), framed on the byte stream
//! by its length as a big-endian `u32`.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    cluster::{
        gossip::GossipEnvelope,
        handshake::{HandshakeAccept, HandshakeOffer, HandshakeReject},
    },
    error::WireError,
};

pub(crate) mod conversions;
pub mod protos;

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Clone, PartialEq, Debug)]
pub enum WireMessage {
    Offer(HandshakeOffer),
    Accept(HandshakeAccept),
    Reject(HandshakeReject),
    Gossip(Box<GossipEnvelope>),
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        protos::Envelope::from(self).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        protos::Envelope::decode(bytes)?.try_into()
    }
}

pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode();
    if bytes.len() > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. Returns `None` when the stream ended cleanly, between two frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>, WireError>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if length > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge(length));
    }
    let mut bytes = vec![0; length];
    reader.read_exact(&mut bytes).await?;
    WireMessage::decode(&bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{
            handshake::{ProtocolVersion, RejectReason},
            membership::Membership,
            seen_table::SeenTable,
            version_vector::VersionVector,
        },
        node::{MemberStatus, NodeAddress, NodeUid, UniqueNodeAddress},
    };

    fn node(port: u16) -> UniqueNodeAddress {
        UniqueNodeAddress::new(NodeAddress::new("conclave", "127.0.0.1", port), NodeUid(port.into()))
    }

    fn gossip() -> GossipEnvelope {
        let (m, s, t) = (node(1), node(2), node(3));
        let mut seen = SeenTable::new(&m);
        seen.increment_version(&m, &m);
        seen.increment_version(&m, &s);
        seen.increment_version(&t, &t);
        let mut membership = Membership::new();
        membership.join(m.clone());
        membership.join(s.clone());
        membership.down(&s.address);
        GossipEnvelope::new(m, seen, membership)
    }

    #[tokio::test]
    async fn frames_carry_every_message_kind() {
        let messages = vec![
            WireMessage::Offer(HandshakeOffer {
                from: node(1),
                to: node(2).address,
                protocol_version: ProtocolVersion::CURRENT,
            }),
            WireMessage::Accept(HandshakeAccept {
                from: node(2),
                to: node(1),
            }),
            WireMessage::Reject(HandshakeReject {
                from: node(2),
                to: node(1),
                reason: RejectReason::IncompatibleProtocol,
                message: "major version mismatch".to_string(),
            }),
            WireMessage::Gossip(Box::new(gossip())),
        ];

        let mut buffer = Vec::new();
        for message in &messages {
            write_frame(&mut buffer, message).await.unwrap();
        }

        let mut reader = &buffer[..];
        for expected in &messages {
            assert_eq!(read_frame(&mut reader).await.unwrap().as_ref(), Some(expected));
        }
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn gossip_keeps_statuses() {
        let decoded = WireMessage::decode(&WireMessage::Gossip(Box::new(gossip())).encode()).unwrap();
        match decoded {
            WireMessage::Gossip(envelope) => {
                assert_eq!(
                    envelope.membership.get(&node(2)).map(|m| m.status),
                    Some(MemberStatus::Down)
                );
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let envelope = protos::Envelope {
            message: Some(protos::envelope::Message::Gossip(protos::GossipEnvelope {
                owner: Some(node(1).into()),
                owner_version: Some(protos::VersionVector::default()),
                seen: vec![],
                members: vec![protos::Member {
                    node: Some(node(1).into()),
                    status: 42,
                }],
            })),
        };
        assert!(matches!(
            WireMessage::decode(&envelope.encode_to_vec()),
            Err(WireError::UnknownStatus(42))
        ));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let envelope = protos::Envelope {
            message: Some(protos::envelope::Message::Accept(protos::HandshakeAccept {
                from: None,
                to: Some(node(1).into()),
            })),
        };
        assert!(matches!(
            WireMessage::decode(&envelope.encode_to_vec()),
            Err(WireError::MissingField("accept.from"))
        ));
    }

    #[test]
    fn zero_versions_are_dropped_when_decoding() {
        let envelope = protos::Envelope {
            message: Some(protos::envelope::Message::Gossip(protos::GossipEnvelope {
                owner: Some(node(1).into()),
                owner_version: Some(protos::VersionVector {
                    versions: vec![
                        protos::ReplicaVersion {
                            replica: Some(node(1).into()),
                            version: 1,
                        },
                        protos::ReplicaVersion {
                            replica: Some(node(2).into()),
                            version: 0,
                        },
                    ],
                }),
                seen: vec![],
                members: vec![],
            })),
        };
        match WireMessage::decode(&envelope.encode_to_vec()).unwrap() {
            WireMessage::Gossip(envelope) => {
                assert_eq!(envelope.owner_version, VersionVector::first(node(1)));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_LENGTH as u32 + 1).to_be_bytes());
        let mut reader = &buffer[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }
}
