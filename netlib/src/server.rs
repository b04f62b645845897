use hashbrown::HashMap;
use log::{info, warn};

use crate::address::Address;
use crate::channel::ChannelKind;
use crate::config::NetConfig;
use crate::error::{DisconnectReason, NetError, Result};
use crate::message::{MessageKind, MessagePayload};
use crate::peer::{CallbackList, PeerCore};
use crate::remote_peer::ConnectionState;
use crate::remote_peer::RemotePeer;
use crate::remote_peer::RemotePeersHandler;
use crate::replication::ReplicationMessage;

struct PendingConnection {
    client_salt: u64,
    server_salt: u64,
}

/// Application-facing payloads pulled off the wire during a tick. Connection
/// lifecycle events are delivered separately through the subscribable
/// callback lists, matching the original's delegate-based connect/disconnect
/// notifications.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    InGame { peer_id: u32, bytes: Vec<u8> },
    Replication { peer_id: u32, message: ReplicationMessage },
    TimeRequest { peer_id: u32, client_time: f32 },
}

/// Authoritative endpoint: accepts connections, times out silent peers, and
/// exchanges in-game/replication traffic with every connected remote.
///
/// Grounded on `original_source/NetworkLibrary/src/Core/Peer.h`'s server-side
/// `RemoteClient` table plus the handshake flow
/// `network_peer_global_component.h` drives (request -> challenge ->
/// challenge-response -> accepted/denied).
pub struct Server {
    core: PeerCore,
    remotes: RemotePeersHandler,
    pending: HashMap<Address, PendingConnection>,
    pending_disconnect: Vec<(u32, DisconnectReason)>,
    next_peer_id: u32,
    clock: f32,
    on_connected: CallbackList<(u32, Address)>,
    on_disconnected: CallbackList<(u32, DisconnectReason)>,
    on_local_disconnect: CallbackList<DisconnectReason>,
}

impl Server {
    pub fn bind(address: Address, config: NetConfig) -> Result<Self> {
        let core = PeerCore::bind(address, config)?;
        let remotes = RemotePeersHandler::new(&config);
        Ok(Server {
            core,
            remotes,
            pending: HashMap::new(),
            pending_disconnect: Vec::new(),
            next_peer_id: 0,
            clock: 0.0,
            on_connected: CallbackList::new(),
            on_disconnected: CallbackList::new(),
            on_local_disconnect: CallbackList::new(),
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.core.local_addr()
    }

    pub fn on_connected(&mut self, callback: impl FnMut(&(u32, Address)) + 'static) -> u64 {
        self.on_connected.subscribe(callback)
    }

    pub fn on_disconnected(&mut self, callback: impl FnMut(&(u32, DisconnectReason)) + 'static) -> u64 {
        self.on_disconnected.subscribe(callback)
    }

    /// Fires once when the local server itself shuts down via `stop`,
    /// distinct from the per-remote `on_disconnected` (spec.md §6's
    /// `on_local_disconnect` vs `on_remote_disconnect(id)`).
    pub fn on_local_disconnect(&mut self, callback: impl FnMut(&DisconnectReason) + 'static) -> u64 {
        self.on_local_disconnect.subscribe(callback)
    }

    pub fn connected_peer_ids(&self) -> Vec<u32> {
        self.remotes.iter().map(|p| p.id).collect()
    }

    fn next_network_peer_id(&mut self) -> u32 {
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        if self.next_peer_id == 0 {
            self.next_peer_id = self.next_peer_id.wrapping_add(1);
        }
        self.next_peer_id
    }

    pub fn send_in_game(&mut self, peer_id: u32, bytes: Vec<u8>, reliable: bool, ordered: bool) -> Result<()> {
        let kind = if reliable {
            ChannelKind::ReliableOrdered
        } else {
            ChannelKind::UnreliableUnordered
        };
        let remote = self.remotes.find_by_id_mut(peer_id).ok_or(NetError::UnknownPeer)?;
        let mut message = self.core.factory.lend(MessageKind::InGame, reliable, ordered);
        message.payload = MessagePayload::InGame { bytes };
        remote.channel_mut(kind).enqueue(message);
        Ok(())
    }

    pub fn send_replication(&mut self, peer_id: u32, replication: ReplicationMessage) -> Result<()> {
        let remote = self.remotes.find_by_id_mut(peer_id).ok_or(NetError::UnknownPeer)?;
        enqueue_replication(&mut self.core, remote, replication);
        Ok(())
    }

    pub fn broadcast_replication(&mut self, replication: ReplicationMessage) {
        for remote in self.remotes.iter_mut() {
            enqueue_replication(&mut self.core, remote, replication.clone());
        }
    }

    fn deny(&mut self, address: Address, reason: DisconnectReason) {
        let mut message = self.core.factory.lend(MessageKind::ConnectionDenied, false, false);
        message.payload = MessagePayload::ConnectionDenied { reason };
        let _ = self.core.send_immediate(message.clone(), address, 0);
        self.core.factory.release(message);
    }

    fn handle_handshake(&mut self, from: Address, kind: MessageKind, payload: &MessagePayload) {
        match (kind, payload) {
            (MessageKind::ConnectionRequest, MessagePayload::ConnectionRequest { client_salt }) => {
                if let Some(pending) = self.pending.get(&from) {
                    let server_salt = pending.server_salt;
                    let mut message = self.core.factory.lend(MessageKind::ConnectionChallenge, false, false);
                    message.payload = MessagePayload::ConnectionChallenge {
                        client_salt: *client_salt,
                        server_salt,
                    };
                    let _ = self.core.send_immediate(message.clone(), from, 0);
                    self.core.factory.release(message);
                    return;
                }
                if self.remotes.len() >= self.core.config.max_connections {
                    self.deny(from, DisconnectReason::ServerFull);
                    return;
                }
                let server_salt: u64 = rand::random();
                self.pending.insert(
                    from,
                    PendingConnection {
                        client_salt: *client_salt,
                        server_salt,
                    },
                );
                let mut message = self.core.factory.lend(MessageKind::ConnectionChallenge, false, false);
                message.payload = MessagePayload::ConnectionChallenge {
                    client_salt: *client_salt,
                    server_salt,
                };
                let _ = self.core.send_immediate(message.clone(), from, 0);
                self.core.factory.release(message);
            }
            (MessageKind::ConnectionChallengeResponse, MessagePayload::ConnectionChallengeResponse { xored_salt }) => {
                let pending = match self.pending.get(&from) {
                    Some(p) => p,
                    None => return,
                };
                if pending.client_salt ^ pending.server_salt != *xored_salt {
                    warn!("connection challenge mismatch from {}", from);
                    return;
                }
                if self.remotes.len() >= self.core.config.max_connections {
                    self.pending.remove(&from);
                    self.deny(from, DisconnectReason::ServerFull);
                    return;
                }
                let client_salt = pending.client_salt;
                let server_salt = pending.server_salt;
                self.pending.remove(&from);

                let peer_id = self.next_network_peer_id();
                let mut remote = RemotePeer::new(peer_id, from, client_salt, server_salt, self.core.config.rto_initial);
                remote.state = ConnectionState::Connected;
                if self.remotes.add(remote).is_err() {
                    self.deny(from, DisconnectReason::ServerFull);
                    return;
                }

                let mut message = self.core.factory.lend(MessageKind::ConnectionAccepted, false, false);
                message.payload = MessagePayload::ConnectionAccepted { assigned_peer_id: peer_id };
                let _ = self.core.send_immediate(message.clone(), from, client_salt ^ server_salt);
                self.core.factory.release(message);

                info!("peer {} connected from {}", peer_id, from);
                self.on_connected.notify(&(peer_id, from));
            }
            _ => {}
        }
    }

    /// Marks a remote for disconnection without removing it immediately:
    /// spec.md §3 defers the actual removal to "end of tick", so a peer
    /// whose `Disconnection` message or inactivity timeout is observed mid
    /// tick is still routable (e.g. for any message already pulled off its
    /// channels this same tick) until `finalize_pending_disconnections` runs.
    fn disconnect_peer(&mut self, peer_id: u32, reason: DisconnectReason) {
        if self.pending_disconnect.iter().any(|(id, _)| *id == peer_id) {
            return;
        }
        if let Some(remote) = self.remotes.find_by_id_mut(peer_id) {
            remote.state = ConnectionState::Disconnecting;
            self.pending_disconnect.push((peer_id, reason));
        }
    }

    fn finalize_pending_disconnections(&mut self) {
        for (peer_id, reason) in std::mem::take(&mut self.pending_disconnect) {
            if let Some(mut remote) = self.remotes.remove_by_id(peer_id) {
                for message in remote.drain_outstanding_messages() {
                    self.core.factory.release(message);
                }
                self.on_disconnected.notify(&(peer_id, reason));
            }
        }
    }

    /// One simulation step: drains the socket, advances handshakes, retires
    /// silent peers, and flushes every connected remote's outgoing queues.
    pub fn tick(&mut self, dt: f32) -> Vec<ServerEvent> {
        self.clock += dt;
        let mut events = Vec::new();
        let datagrams = self.core.poll_datagrams();
        for (from, packet) in datagrams {
            if let Some(remote) = self.remotes.find_by_address_mut(from) {
                remote.note_packet_received();
                let peer_id = remote.id;
                let messages = self.core.route_incoming(remote, packet);
                for message in messages {
                    match message.payload {
                        MessagePayload::InGame { bytes } => events.push(ServerEvent::InGame { peer_id, bytes }),
                        MessagePayload::Replication(replication) => {
                            events.push(ServerEvent::Replication { peer_id, message: replication })
                        }
                        MessagePayload::TimeRequest { client_time } => {
                            let server_time = self.clock;
                            let mut response = self.core.factory.lend(MessageKind::TimeResponse, false, false);
                            response.payload = MessagePayload::TimeResponse { client_time, server_time };
                            remote.channel_mut(ChannelKind::UnreliableUnordered).enqueue(response);
                            events.push(ServerEvent::TimeRequest { peer_id, client_time })
                        }
                        MessagePayload::Disconnection { reason } => {
                            self.disconnect_peer(peer_id, reason);
                        }
                        _ => {}
                    }
                }
            } else {
                for message in &packet.messages {
                    self.handle_handshake(from, message.header.kind, &message.payload);
                }
            }
        }

        let timed_out = self.remotes.tick(dt, self.core.config.inactivity_timeout);
        for peer_id in timed_out {
            self.disconnect_peer(peer_id, DisconnectReason::Timeout);
        }

        self.finalize_pending_disconnections();

        let ids: Vec<u32> = self.remotes.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(remote) = self.remotes.find_by_id_mut(id) {
                let address = remote.address;
                let _ = self.core.flush_channel(remote, ChannelKind::UnreliableUnordered, address);
                let _ = self.core.flush_channel(remote, ChannelKind::ReliableOrdered, address);
            }
        }

        events
    }

    /// Sends a best-effort `Disconnection` to every connected remote, tears
    /// down the peer set, and fires `on_local_disconnect` exactly once
    /// (spec.md §4.7's shared `stop(reason)` operation).
    pub fn stop(&mut self, reason: DisconnectReason) {
        let ids: Vec<u32> = self.remotes.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(remote) = self.remotes.find_by_id_mut(id) {
                let address = remote.address;
                let session_salt = remote.xored_salt();
                let mut message = self.core.factory.lend(MessageKind::Disconnection, false, false);
                message.payload = MessagePayload::Disconnection { reason };
                let _ = self.core.send_immediate(message.clone(), address, session_salt);
                self.core.factory.release(message);
                for outstanding in remote.drain_outstanding_messages() {
                    self.core.factory.release(outstanding);
                }
            }
        }
        self.remotes = RemotePeersHandler::new(&self.core.config);
        self.pending.clear();
        self.pending_disconnect.clear();
        self.on_local_disconnect.notify(&reason);
    }

    pub fn shutdown(mut self) {
        self.core.factory.assert_balanced();
    }
}

fn enqueue_replication(core: &mut PeerCore, remote: &mut RemotePeer, replication: ReplicationMessage) {
    let (reliable, ordered, kind) = match replication {
        ReplicationMessage::Create { .. } | ReplicationMessage::Destroy { .. } => {
            (true, true, ChannelKind::ReliableOrdered)
        }
        ReplicationMessage::Update { .. } => (false, true, ChannelKind::UnreliableUnordered),
    };
    let mut message = core.factory.lend(MessageKind::Replication, reliable, ordered);
    message.payload = MessagePayload::Replication(replication);
    remote.channel_mut(kind).enqueue(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rejects_connection_requests_once_full() {
        let mut config = NetConfig::default();
        config.max_connections = 0;
        let mut server = Server::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();
        let from = Address::new(Ipv4Addr::new(127, 0, 0, 1), 40000);
        server.handle_handshake(
            from,
            MessageKind::ConnectionRequest,
            &MessagePayload::ConnectionRequest { client_salt: 42 },
        );
        assert!(server.pending.is_empty());
    }

    #[test]
    fn full_handshake_adds_remote_and_fires_callback() {
        let config = NetConfig::default();
        let mut server = Server::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();
        let from = Address::new(Ipv4Addr::new(127, 0, 0, 1), 40001);

        server.handle_handshake(
            from,
            MessageKind::ConnectionRequest,
            &MessagePayload::ConnectionRequest { client_salt: 7 },
        );
        let server_salt = server.pending.get(&from).unwrap().server_salt;

        server.handle_handshake(
            from,
            MessageKind::ConnectionChallengeResponse,
            &MessagePayload::ConnectionChallengeResponse { xored_salt: 7 ^ server_salt },
        );

        assert_eq!(server.remotes.len(), 1);
        server.core.factory.assert_balanced();
    }
}
