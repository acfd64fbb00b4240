use std::io;

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::mpsc,
    task::JoinHandle,
};

use super::{Connection, DialId, Outbound, Transport, TransportEvent};
use crate::{
    node::NodeAddress,
    wire::{read_frame, write_frame},
};

/// A [Transport] over plain TCP, exchanging length-prefixed protobuf frames.
#[derive(Clone, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    /// Accepts connections on `listener` until the events receiver is dropped,
    /// reporting everything that happens on them to `events`.
    pub fn serve(listener: TcpListener, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = select! {
                    accepted = listener.accept() => accepted,
                    _ = events.closed() => break,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted connection from {}", remote);
                        let (connection, outbound) = Connection::pair();
                        spawn_connection(stream, connection, outbound, events.clone());
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                }
            }
            log::debug!("Stopped accepting connections");
        })
    }
}

impl Transport for TcpTransport {
    fn connect(&self, peer: NodeAddress, dial: DialId, events: mpsc::Sender<TransportEvent>) {
        tokio::spawn(async move {
            match TcpStream::connect((peer.host.as_str(), peer.port)).await {
                Ok(stream) => {
                    let (connection, outbound) = Connection::pair();
                    // the shell must learn about the connection before anything is read from it
                    let opened = TransportEvent::ConnectionOpened {
                        peer,
                        dial,
                        connection: connection.clone(),
                    };
                    if events.send(opened).await.is_ok() {
                        spawn_connection(stream, connection, outbound, events);
                    }
                }
                Err(e) => {
                    log::debug!("Failed to connect to {} ({}): {}", peer, dial, e);
                    let _ = events
                        .send(TransportEvent::ConnectionFailed {
                            peer,
                            dial,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });
    }
}

fn spawn_connection(
    stream: TcpStream,
    connection: Connection,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not disable Nagle's algorithm on {}: {}", connection.id(), e);
    }
    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, connection.clone(), outbound));
    tokio::spawn(read_loop(reader, connection, events));
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    connection: Connection,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(next) = outbound.recv().await {
        match next {
            Outbound::Message(message) => {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    log::warn!("Failed to write to {}: {}", connection.id(), e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    // dropping the receiver lets the read loop know it can stop
    drop(outbound);
    if let Err(e) = writer.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected {
            log::debug!("Failed to shut down {}: {}", connection.id(), e);
        }
    }
}

async fn read_loop(reader: OwnedReadHalf, connection: Connection, events: mpsc::Sender<TransportEvent>) {
    let mut reader = BufReader::new(reader);
    loop {
        let frame = select! {
            frame = read_frame(&mut reader) => frame,
            _ = connection.closed() => break,
        };
        match frame {
            Ok(Some(message)) => {
                let received = TransportEvent::Received {
                    connection: connection.clone(),
                    message,
                };
                if events.send(received).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Dropping {} after a read failure: {}", connection.id(), e);
                break;
            }
        }
    }
    connection.close();
    log::debug!("{} closed", connection.id());
    let _ = events
        .send(TransportEvent::ConnectionClosed {
            connection: connection.id(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        cluster::handshake::{HandshakeAccept, HandshakeOffer, ProtocolVersion},
        node::{NodeUid, UniqueNodeAddress},
        wire::WireMessage,
    };

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a transport event")
            .expect("transport events channel closed")
    }

    #[tokio::test]
    async fn exchanges_frames_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_address = UniqueNodeAddress::new(NodeAddress::new("conclave", "127.0.0.1", port), NodeUid(2));
        let client_address = UniqueNodeAddress::new(NodeAddress::new("conclave", "127.0.0.1", 1), NodeUid(1));

        let (server_events_sender, mut server_events) = mpsc::channel(16);
        let _server = TcpTransport::serve(listener, server_events_sender);

        let (client_events_sender, mut client_events) = mpsc::channel(16);
        let dial = DialId::next();
        TcpTransport::new().connect(server_address.address.clone(), dial, client_events_sender);

        let client_connection = match next_event(&mut client_events).await {
            TransportEvent::ConnectionOpened {
                peer,
                dial: opened,
                connection,
            } => {
                assert_eq!(peer, server_address.address);
                assert_eq!(opened, dial);
                connection
            }
            other => panic!("unexpected event {:?}", other),
        };

        let offer = WireMessage::Offer(HandshakeOffer {
            from: client_address.clone(),
            to: server_address.address.clone(),
            protocol_version: ProtocolVersion::CURRENT,
        });
        assert!(client_connection.send(offer.clone()));

        let server_connection = match next_event(&mut server_events).await {
            TransportEvent::Received { connection, message } => {
                assert_eq!(message, offer);
                connection
            }
            other => panic!("unexpected event {:?}", other),
        };

        let accept = WireMessage::Accept(HandshakeAccept {
            from: server_address,
            to: client_address,
        });
        assert!(server_connection.send(accept.clone()));
        match next_event(&mut client_events).await {
            TransportEvent::Received { connection, message } => {
                assert_eq!(connection, client_connection);
                assert_eq!(message, accept);
            }
            other => panic!("unexpected event {:?}", other),
        }

        client_connection.close();
        match next_event(&mut server_events).await {
            TransportEvent::ConnectionClosed { connection } => assert_eq!(connection, server_connection.id()),
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut client_events).await {
            TransportEvent::ConnectionClosed { connection } => assert_eq!(connection, client_connection.id()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn reports_failed_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (events_sender, mut events) = mpsc::channel(16);
        let peer = NodeAddress::new("conclave", "127.0.0.1", port);
        let dial = DialId::next();
        TcpTransport::new().connect(peer.clone(), dial, events_sender);

        match next_event(&mut events).await {
            TransportEvent::ConnectionFailed {
                peer: failed,
                dial: failed_dial,
                ..
            } => {
                assert_eq!(failed, peer);
                assert_eq!(failed_dial, dial);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
