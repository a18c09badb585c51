//! WebSocket client for the `flowcraft-signal` relay server.
//!
//! The socket runs on a background thread; the handle talks to it over
//! channels and does all document and presence work on the caller's thread
//! inside [`TransportHandle::poll`].

use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tungstenite::{Message, connect};
use url::Url;

use super::{SyncedCallback, Transport, TransportHandle, TransportOptions};
use crate::awareness::{Awareness, AwarenessUpdate};
use crate::crdt::{CrdtDocument, UpdateOrigin, VersionVector};
use crate::error::{TransportError, TransportResult};

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room
    Join {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        max_peers: usize,
    },
    /// Leave the current room
    Leave,
    /// CRDT update bytes, base64 encoded
    Sync { data: String },
    /// Presence message
    Awareness { update: serde_json::Value },
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room join confirmed; `peer_count` includes this connection
    Joined { room: String, peer_count: usize },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Another connection missed relayed messages and needs a snapshot
    Resync { peer_id: String },
    /// CRDT update relayed from another connection
    Sync { from: String, data: String },
    /// Presence message relayed from another connection
    Awareness {
        from: String,
        update: serde_json::Value,
    },
    Error { message: String },
}

/// Events from the socket thread.
#[derive(Debug)]
enum SocketEvent {
    Connected(String),
    Message(ServerMessage),
    Disconnected(String),
    Failed(TransportError),
}

enum SocketCommand {
    Send(String),
    Close,
}

/// Transport that relays through a `flowcraft-signal` server.
#[derive(Debug, Clone, Default)]
pub struct RelayTransport;

impl RelayTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Parse and check the endpoint list. At least one must be a `ws://` URL;
/// the socket is built without TLS, so `wss://` is refused here.
fn valid_endpoints(endpoints: &[String]) -> TransportResult<Vec<Url>> {
    let mut urls = Vec::new();
    for endpoint in endpoints {
        match Url::parse(endpoint) {
            Ok(url) if url.scheme() == "ws" => urls.push(url),
            Ok(url) if url.scheme() == "wss" => {
                log::warn!("Skipping {}: TLS endpoints are not supported", endpoint)
            }
            Ok(url) => log::warn!("Skipping endpoint with scheme {}: {}", url.scheme(), endpoint),
            Err(e) => log::warn!("Skipping invalid endpoint {}: {}", endpoint, e),
        }
    }
    if urls.is_empty() {
        return Err(TransportError::InvalidEndpoint(endpoints.join(", ")));
    }
    Ok(urls)
}

impl Transport for RelayTransport {
    fn connect(
        &self,
        topic: &str,
        doc: &CrdtDocument,
        awareness: &Awareness,
        options: &TransportOptions,
    ) -> TransportResult<Box<dyn TransportHandle>> {
        let endpoints = valid_endpoints(&options.signaling_endpoints)?;
        let (cmd_tx, cmd_rx) = channel::<SocketCommand>();
        let (event_tx, event_rx) = channel::<SocketEvent>();
        let thread = thread::spawn(move || run_socket(endpoints, cmd_rx, event_tx));

        let handle = RelayHandle {
            topic: topic.to_string(),
            doc: doc.clone(),
            awareness: awareness.clone(),
            cmd_tx: Some(cmd_tx),
            event_rx,
            _thread: Some(thread),
            sent_version: VersionVector::default(),
            peers: HashMap::new(),
            peer_count: 0,
            joined: false,
            synced: false,
            callback: None,
            destroyed: false,
        };
        handle.send(&ClientMessage::Join {
            room: topic.to_string(),
            password: options.password.clone(),
            max_peers: options.max_peers,
        })?;
        Ok(Box::new(handle))
    }
}

fn run_socket(endpoints: Vec<Url>, cmd_rx: Receiver<SocketCommand>, event_tx: Sender<SocketEvent>) {
    let mut failures = Vec::new();
    let mut connected = None;
    for endpoint in &endpoints {
        log::info!("Relay: connecting to {}", endpoint);
        match connect(endpoint.as_str()) {
            Ok((socket, response)) => {
                log::info!("Relay connected, status: {}", response.status());
                connected = Some((socket, endpoint.to_string()));
                break;
            }
            Err(e) => {
                log::warn!("Relay connection to {} failed: {}", endpoint, e);
                failures.push(format!("{}: {}", endpoint, e));
            }
        }
    }
    let Some((mut socket, endpoint)) = connected else {
        let _ = event_tx.send(SocketEvent::Failed(TransportError::Unreachable(
            failures.join("; "),
        )));
        return;
    };
    let _ = event_tx.send(SocketEvent::Connected(endpoint));

    // Short read timeout so the loop can also service outgoing commands.
    if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
        let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
        let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
    }

    let reason = loop {
        match cmd_rx.try_recv() {
            Ok(SocketCommand::Send(text)) => {
                if let Err(e) = socket.send(Message::Text(text)) {
                    break format!("send failed: {}", e);
                }
            }
            Ok(SocketCommand::Close) => {
                let _ = socket.close(None);
                let _ = socket.flush();
                break "closed".to_string();
            }
            Err(TryRecvError::Disconnected) => break "handle dropped".to_string(),
            Err(TryRecvError::Empty) => {}
        }

        match socket.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if event_tx.send(SocketEvent::Message(message)).is_err() {
                        break "handle dropped".to_string();
                    }
                }
                Err(e) => log::warn!("Failed to parse server message: {}", e),
            },
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break "server closed the connection".to_string(),
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => break format!("read failed: {}", e),
        }
    };
    log::info!("Relay socket thread exiting: {}", reason);
    let _ = event_tx.send(SocketEvent::Disconnected(reason));
}

struct RelayHandle {
    topic: String,
    doc: CrdtDocument,
    awareness: Awareness,
    cmd_tx: Option<Sender<SocketCommand>>,
    event_rx: Receiver<SocketEvent>,
    _thread: Option<JoinHandle<()>>,
    /// Document version already sent to the room.
    sent_version: VersionVector,
    /// Presence peer ids announced by each relay connection.
    peers: HashMap<String, BTreeSet<u64>>,
    peer_count: usize,
    joined: bool,
    synced: bool,
    callback: Option<SyncedCallback>,
    destroyed: bool,
}

impl RelayHandle {
    fn send(&self, message: &ClientMessage) -> TransportResult<()> {
        let text = serde_json::to_string(message)
            .map_err(|e| TransportError::Rejected(format!("unencodable message: {}", e)))?;
        match &self.cmd_tx {
            Some(tx) => tx
                .send(SocketCommand::Send(text))
                .map_err(|_| TransportError::Disconnected("socket thread stopped".to_string())),
            None => Err(TransportError::Disconnected("handle destroyed".to_string())),
        }
    }

    fn send_snapshot(&mut self) -> TransportResult<()> {
        let bytes = self
            .doc
            .export_snapshot()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.send(&ClientMessage::Sync {
            data: STANDARD.encode(bytes),
        })?;
        self.sent_version = self.doc.version();
        if let Some(update) = self.awareness.local_update() {
            self.send_presence(&update)?;
        }
        Ok(())
    }

    fn send_presence(&self, update: &AwarenessUpdate) -> TransportResult<()> {
        let update = serde_json::to_value(update)
            .map_err(|e| TransportError::Rejected(format!("unencodable presence: {}", e)))?;
        self.send(&ClientMessage::Awareness { update })
    }

    /// Send local changes made since the last poll.
    fn push_outgoing(&mut self) -> TransportResult<()> {
        if !self.joined || self.doc.is_destroyed() {
            return Ok(());
        }
        let version = self.doc.version();
        if version != self.sent_version {
            let bytes = self
                .doc
                .export_updates(&self.sent_version)
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            self.send(&ClientMessage::Sync {
                data: STANDARD.encode(bytes),
            })?;
            self.sent_version = version;
        }
        for update in self.awareness.take_outgoing() {
            self.send_presence(&update)?;
        }
        Ok(())
    }

    fn mark_synced(&mut self) {
        if self.synced {
            return;
        }
        self.synced = true;
        log::info!("Relay: synced with {}", self.topic);
        if let Some(callback) = self.callback.as_mut() {
            callback();
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> TransportResult<()> {
        match message {
            ServerMessage::Joined { room, peer_count } => {
                log::info!("Relay: joined {} with {} peer(s)", room, peer_count);
                self.joined = true;
                self.peer_count = peer_count.saturating_sub(1);
                self.send_snapshot()?;
                if self.peer_count == 0 {
                    self.mark_synced();
                }
            }
            ServerMessage::PeerJoined { peer_id } => {
                log::debug!("Relay: peer {} joined", peer_id);
                self.peer_count += 1;
                self.send_snapshot()?;
            }
            ServerMessage::Resync { peer_id } => {
                log::debug!("Relay: {} fell behind, resending snapshot", peer_id);
                if self.joined {
                    self.send_snapshot()?;
                }
            }
            ServerMessage::PeerLeft { peer_id } => {
                log::debug!("Relay: peer {} left", peer_id);
                self.peer_count = self.peer_count.saturating_sub(1);
                for presence_id in self.peers.remove(&peer_id).unwrap_or_default() {
                    self.awareness.remove_peer(presence_id);
                }
            }
            ServerMessage::Sync { from, data } => match STANDARD.decode(&data) {
                Ok(bytes) => {
                    if let Err(e) = self.doc.apply_update(&bytes, UpdateOrigin::Remote) {
                        log::warn!("Relay: dropping update from {}: {}", from, e);
                    }
                    self.mark_synced();
                }
                Err(e) => log::warn!("Relay: invalid base64 from {}: {}", from, e),
            },
            ServerMessage::Awareness { from, update } => {
                match serde_json::from_value::<AwarenessUpdate>(update) {
                    Ok(update) => {
                        self.peers.entry(from).or_default().insert(update.peer_id());
                        self.awareness.apply_remote(update);
                    }
                    Err(e) => log::warn!("Relay: invalid presence from {}: {}", from, e),
                }
            }
            ServerMessage::Error { message } => {
                log::error!("Relay error: {}", message);
                return Err(if message.contains("full") {
                    TransportError::RoomFull(self.peer_count + 1)
                } else {
                    TransportError::Rejected(message)
                });
            }
        }
        Ok(())
    }
}

impl TransportHandle for RelayHandle {
    fn on_synced(&mut self, callback: SyncedCallback) {
        self.callback = Some(callback);
    }

    fn is_synced(&self) -> bool {
        self.synced
    }

    fn poll(&mut self) -> TransportResult<()> {
        if self.destroyed {
            return Ok(());
        }
        loop {
            match self.event_rx.try_recv() {
                Ok(SocketEvent::Connected(endpoint)) => {
                    log::debug!("Relay: socket open on {}", endpoint);
                }
                Ok(SocketEvent::Message(message)) => self.handle_message(message)?,
                Ok(SocketEvent::Disconnected(reason)) => {
                    return Err(TransportError::Disconnected(reason));
                }
                Ok(SocketEvent::Failed(error)) => return Err(error),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(TransportError::Disconnected(
                        "socket thread stopped".to_string(),
                    ));
                }
            }
        }
        self.push_outgoing()
    }

    fn peer_count(&self) -> usize {
        self.peer_count
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(e) = self.push_outgoing() {
            log::debug!("Relay: final flush failed: {}", e);
        }
        let _ = self.send(&ClientMessage::Leave);
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(SocketCommand::Close);
        }
        self._thread = None;
        self.destroyed = true;
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialize() {
        let msg = ClientMessage::Join {
            room: "flowcraft-abc".to_string(),
            password: None,
            max_peers: 20,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"join","room":"flowcraft-abc","max_peers":20}"#
        );
    }

    #[test]
    fn test_server_message_deserialize() {
        let json = r#"{"type":"joined","room":"test","peer_count":2}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Joined {
                room: "test".to_string(),
                peer_count: 2
            }
        );

        let json = r#"{"type":"peer_left","peer_id":"c1"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ServerMessage::PeerLeft { .. }));
    }

    #[test]
    fn test_awareness_payload_is_structured() {
        let update = AwarenessUpdate::Remove {
            peer_id: 9,
            clock: 4,
        };
        let msg = ClientMessage::Awareness {
            update: serde_json::to_value(&update).unwrap(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "awareness");
        assert_eq!(json["update"]["type"], "remove");
        assert_eq!(json["update"]["peer_id"], 9);
    }

    #[test]
    fn test_endpoint_validation() {
        let endpoints = vec![
            "http://example.com".to_string(),
            "not a url".to_string(),
            "ws://localhost:4444/ws".to_string(),
        ];
        let urls = valid_endpoints(&endpoints).unwrap();
        assert_eq!(urls.len(), 1);
        assert!(matches!(
            valid_endpoints(&["ftp://x".to_string()]),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            valid_endpoints(&["wss://relay.example/ws".to_string()]),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    fn detached_handle(doc: &CrdtDocument) -> (RelayHandle, Receiver<SocketCommand>) {
        let (cmd_tx, cmd_rx) = channel();
        let (_, event_rx) = channel();
        let handle = RelayHandle {
            topic: "flowcraft-test".to_string(),
            doc: doc.clone(),
            awareness: Awareness::new(doc.peer_id(), Duration::from_millis(50)),
            cmd_tx: Some(cmd_tx),
            event_rx,
            _thread: None,
            sent_version: VersionVector::default(),
            peers: HashMap::new(),
            peer_count: 1,
            joined: true,
            synced: true,
            callback: None,
            destroyed: false,
        };
        (handle, cmd_rx)
    }

    fn sent_messages(rx: &Receiver<SocketCommand>) -> Vec<ClientMessage> {
        rx.try_iter()
            .filter_map(|command| match command {
                SocketCommand::Send(text) => serde_json::from_str(&text).ok(),
                SocketCommand::Close => None,
            })
            .collect()
    }

    #[test]
    fn test_resync_resends_full_snapshot() {
        use crate::crdt::{ContainerKey, write_node};
        use crate::model::DiagramNode;

        let doc = CrdtDocument::new();
        doc.transact(UpdateOrigin::Local, |txn| {
            write_node(
                &txn.map(ContainerKey::Nodes),
                &DiagramNode::new("n1", "shapeNode", kurbo::Point::ZERO),
            )
        })
        .unwrap();
        let (mut handle, rx) = detached_handle(&doc);
        handle.push_outgoing().unwrap();
        assert_eq!(sent_messages(&rx).len(), 1);

        handle
            .handle_message(ServerMessage::Resync {
                peer_id: "c2".to_string(),
            })
            .unwrap();
        let sent = sent_messages(&rx);
        assert_eq!(sent.len(), 1);
        let ClientMessage::Sync { data } = &sent[0] else {
            panic!("expected a sync message");
        };
        let fresh = CrdtDocument::new();
        fresh
            .apply_update(&STANDARD.decode(data).unwrap(), UpdateOrigin::Remote)
            .unwrap();
        assert_eq!(fresh.len(ContainerKey::Nodes), 1);
    }
}
