use log::{info, warn};

use crate::address::Address;
use crate::channel::ChannelKind;
use crate::config::NetConfig;
use crate::error::{DisconnectReason, NetError, Result};
use crate::message::{MessageKind, MessagePayload};
use crate::peer::{CallbackList, PeerCore};
use crate::remote_peer::{ConnectionState, RemotePeer};
use crate::replication::ReplicationMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    InGame { bytes: Vec<u8> },
    /// `sequence` is the replication channel's wire sequence for this
    /// message, forwarded so `ReplicationManager::client_process` can drop a
    /// `RAT_UPDATE` that arrives after a newer one for the same entity
    /// (spec.md §4.9/§5: updates are ordered but unreliable).
    Replication { sequence: u16, message: ReplicationMessage },
    TimeResponse { client_time: f32, server_time: f32 },
}

/// The other half of the handshake: drives connection retries against a
/// `Server`, then exchanges in-game/replication traffic with it.
///
/// Grounded on `original_source/NetworkLibrary/src/Core/Peer.h`'s
/// client-side connection state machine.
pub struct Client {
    core: PeerCore,
    state: ClientState,
    server_address: Option<Address>,
    client_salt: u64,
    server_salt: Option<u64>,
    remote: Option<RemotePeer>,
    connect_elapsed: f32,
    retry_elapsed: f32,
    retries: u32,
    on_connected: CallbackList<u32>,
    on_disconnected: CallbackList<DisconnectReason>,
    on_connection_failed: CallbackList<DisconnectReason>,
    on_local_disconnect: CallbackList<DisconnectReason>,
}

impl Client {
    pub fn bind(address: Address, config: NetConfig) -> Result<Self> {
        let core = PeerCore::bind(address, config)?;
        Ok(Client {
            core,
            state: ClientState::Disconnected,
            server_address: None,
            client_salt: 0,
            server_salt: None,
            remote: None,
            connect_elapsed: 0.0,
            retry_elapsed: 0.0,
            retries: 0,
            on_connected: CallbackList::new(),
            on_disconnected: CallbackList::new(),
            on_connection_failed: CallbackList::new(),
            on_local_disconnect: CallbackList::new(),
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.core.local_addr()
    }

    pub fn on_connected(&mut self, callback: impl FnMut(&u32) + 'static) -> u64 {
        self.on_connected.subscribe(callback)
    }

    pub fn on_disconnected(&mut self, callback: impl FnMut(&DisconnectReason) + 'static) -> u64 {
        self.on_disconnected.subscribe(callback)
    }

    /// Fires once when `disconnect`/`stop` tears the connection down
    /// locally, distinct from `on_disconnected` (remote-initiated: a
    /// received `Disconnection` message or an inactivity timeout). Mirrors
    /// `Server::on_local_disconnect` (spec.md §6).
    pub fn on_local_disconnect(&mut self, callback: impl FnMut(&DisconnectReason) + 'static) -> u64 {
        self.on_local_disconnect.subscribe(callback)
    }

    /// Fires only for failures of an in-flight connection attempt
    /// (`ConnectionDenied`, handshake timeout); once `Connected`, later
    /// disconnects go through `on_disconnected` instead. Mirrors the
    /// original's separate `on_local_connection_failed` delegate (spec.md §6).
    pub fn on_connection_failed(&mut self, callback: impl FnMut(&DisconnectReason) + 'static) -> u64 {
        self.on_connection_failed.subscribe(callback)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn assigned_peer_id(&self) -> Option<u32> {
        self.remote.as_ref().map(|r| r.id)
    }

    pub fn connect(&mut self, server_address: Address) -> Result<()> {
        if self.state != ClientState::Disconnected {
            return Err(NetError::AlreadyConnected);
        }
        self.server_address = Some(server_address);
        self.client_salt = rand::random();
        self.server_salt = None;
        self.state = ClientState::Connecting;
        self.connect_elapsed = 0.0;
        self.retry_elapsed = 0.0;
        self.retries = 0;
        self.send_connection_request()
    }

    fn send_connection_request(&mut self) -> Result<()> {
        let address = self.server_address.expect("connect() sets server_address before this is called");
        let mut message = self.core.factory.lend(MessageKind::ConnectionRequest, false, false);
        message.payload = MessagePayload::ConnectionRequest {
            client_salt: self.client_salt,
        };
        let result = self.core.send_immediate(message.clone(), address, 0);
        self.core.factory.release(message);
        result
    }

    fn send_challenge_response(&mut self) -> Result<()> {
        let address = self.server_address.expect("connect() sets server_address before this is called");
        let server_salt = self.server_salt.expect("only called after a challenge is recorded");
        let mut message = self.core.factory.lend(MessageKind::ConnectionChallengeResponse, false, false);
        message.payload = MessagePayload::ConnectionChallengeResponse {
            xored_salt: self.client_salt ^ server_salt,
        };
        let result = self.core.send_immediate(message.clone(), address, 0);
        self.core.factory.release(message);
        result
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.stop(DisconnectReason::PeerShutDown)
    }

    /// Shared `stop(reason)` operation (spec.md §4.7): best-effort notifies
    /// the server, tears the connection down locally, and fires
    /// `on_local_disconnect` exactly once. A no-op once already
    /// disconnected.
    pub fn stop(&mut self, reason: DisconnectReason) -> Result<()> {
        if self.state != ClientState::Connected {
            return Ok(());
        }
        let address = self.server_address.expect("Connected implies a server address");
        let session_salt = self.remote.as_ref().expect("Connected implies a remote").xored_salt();
        let mut message = self.core.factory.lend(MessageKind::Disconnection, false, false);
        message.payload = MessagePayload::Disconnection { reason };
        let result = self.core.send_immediate(message.clone(), address, session_salt);
        self.core.factory.release(message);
        self.reset_to_disconnected();
        self.on_local_disconnect.notify(&reason);
        result
    }

    fn reset_to_disconnected(&mut self) {
        self.state = ClientState::Disconnected;
        if let Some(mut remote) = self.remote.take() {
            for message in remote.drain_outstanding_messages() {
                self.core.factory.release(message);
            }
        }
        self.server_salt = None;
    }

    pub fn send_in_game(&mut self, bytes: Vec<u8>, reliable: bool, ordered: bool) -> Result<()> {
        let remote = self.remote.as_mut().ok_or(NetError::PeerShutDown)?;
        let kind = if reliable {
            ChannelKind::ReliableOrdered
        } else {
            ChannelKind::UnreliableUnordered
        };
        let mut message = self.core.factory.lend(MessageKind::InGame, reliable, ordered);
        message.payload = MessagePayload::InGame { bytes };
        remote.channel_mut(kind).enqueue(message);
        Ok(())
    }

    pub fn send_time_request(&mut self, client_time: f32) -> Result<()> {
        let remote = self.remote.as_mut().ok_or(NetError::PeerShutDown)?;
        let mut message = self.core.factory.lend(MessageKind::TimeRequest, false, false);
        message.payload = MessagePayload::TimeRequest { client_time };
        remote.channel_mut(ChannelKind::UnreliableUnordered).enqueue(message);
        Ok(())
    }

    fn handle_handshake_message(&mut self, kind: MessageKind, payload: &MessagePayload) {
        match (self.state, kind, payload) {
            (
                ClientState::Connecting,
                MessageKind::ConnectionChallenge,
                MessagePayload::ConnectionChallenge { client_salt, server_salt },
            ) => {
                if *client_salt != self.client_salt {
                    return;
                }
                self.server_salt = Some(*server_salt);
                self.retry_elapsed = 0.0;
                self.retries = 0;
                let _ = self.send_challenge_response();
            }
            (
                ClientState::Connecting,
                MessageKind::ConnectionAccepted,
                MessagePayload::ConnectionAccepted { assigned_peer_id },
            ) => {
                let address = self.server_address.expect("Connecting implies a server address");
                let server_salt = self.server_salt.unwrap_or(0);
                let mut remote = RemotePeer::new(
                    *assigned_peer_id,
                    address,
                    self.client_salt,
                    server_salt,
                    self.core.config.rto_initial,
                );
                remote.state = ConnectionState::Connected;
                self.remote = Some(remote);
                self.state = ClientState::Connected;
                info!("connected to {} as peer {}", address, assigned_peer_id);
                self.on_connected.notify(assigned_peer_id);
            }
            (ClientState::Connecting, MessageKind::ConnectionDenied, MessagePayload::ConnectionDenied { reason }) => {
                warn!("connection denied: {:?}", reason);
                self.reset_to_disconnected();
                self.on_connection_failed.notify(reason);
            }
            _ => {}
        }
    }

    fn tick_handshake(&mut self, dt: f32) {
        self.connect_elapsed += dt;
        let config = self.core.config;
        if self.connect_elapsed >= config.connect_overall_timeout {
            self.reset_to_disconnected();
            self.on_connection_failed.notify(&DisconnectReason::ConnectionTimeout);
            return;
        }
        self.retry_elapsed += dt;
        if self.retry_elapsed < config.connect_retry_interval {
            return;
        }
        self.retry_elapsed = 0.0;
        if self.retries >= config.connect_max_retries {
            self.reset_to_disconnected();
            self.on_connection_failed.notify(&DisconnectReason::ConnectionTimeout);
            return;
        }
        self.retries += 1;
        let _ = if self.server_salt.is_some() {
            self.send_challenge_response()
        } else {
            self.send_connection_request()
        };
    }

    /// One simulation step: drains the socket, drives the handshake retry
    /// timer while connecting, detects server silence once connected, and
    /// flushes outgoing traffic.
    pub fn tick(&mut self, dt: f32) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        let datagrams = self.core.poll_datagrams();
        for (from, packet) in datagrams {
            let from_server = self.server_address == Some(from);
            if !from_server {
                continue;
            }
            if self.state == ClientState::Connected {
                if let Some(remote) = self.remote.as_mut() {
                    remote.note_packet_received();
                    let messages = self.core.route_incoming(remote, packet);
                    for message in messages {
                        let sequence = message.header.sequence;
                        match message.payload {
                            MessagePayload::InGame { bytes } => events.push(ClientEvent::InGame { bytes }),
                            MessagePayload::Replication(replication) => {
                                events.push(ClientEvent::Replication { sequence, message: replication })
                            }
                            MessagePayload::TimeResponse { client_time, server_time } => {
                                events.push(ClientEvent::TimeResponse { client_time, server_time })
                            }
                            MessagePayload::Disconnection { reason } => {
                                self.reset_to_disconnected();
                                self.on_disconnected.notify(&reason);
                            }
                            _ => {}
                        }
                    }
                }
            } else {
                for message in &packet.messages {
                    self.handle_handshake_message(message.header.kind, &message.payload);
                }
            }
        }

        match self.state {
            ClientState::Connecting => self.tick_handshake(dt),
            ClientState::Connected => {
                let timed_out = {
                    let remote = self.remote.as_mut().expect("Connected implies a remote");
                    remote.tick(dt);
                    remote.is_inactive(self.core.config.inactivity_timeout)
                };
                if timed_out {
                    self.reset_to_disconnected();
                    self.on_disconnected.notify(&DisconnectReason::Timeout);
                } else {
                    let address = self.server_address.expect("Connected implies a server address");
                    let mut remote = self.remote.take().expect("checked above");
                    let _ = self.core.flush_channel(&mut remote, ChannelKind::UnreliableUnordered, address);
                    let _ = self.core.flush_channel(&mut remote, ChannelKind::ReliableOrdered, address);
                    self.remote = Some(remote);
                }
            }
            ClientState::Disconnected => {}
        }

        events
    }

    pub fn shutdown(mut self) {
        self.core.factory.assert_balanced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn connect_before_any_reply_leaves_state_connecting() {
        let config = NetConfig::default();
        let mut client = Client::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();
        client
            .connect(Address::new(Ipv4Addr::new(127, 0, 0, 1), 9001))
            .unwrap();
        assert_eq!(client.state, ClientState::Connecting);
        assert!(!client.is_connected());
    }

    #[test]
    fn full_handshake_reaches_connected_state() {
        let config = NetConfig::default();
        let mut client = Client::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();
        let server_addr = Address::new(Ipv4Addr::new(127, 0, 0, 1), 9002);
        client.connect(server_addr).unwrap();

        let client_salt = client.client_salt;
        let server_salt = 0xABCDu64;
        client.handle_handshake_message(
            MessageKind::ConnectionChallenge,
            &MessagePayload::ConnectionChallenge { client_salt, server_salt },
        );
        client.handle_handshake_message(
            MessageKind::ConnectionAccepted,
            &MessagePayload::ConnectionAccepted { assigned_peer_id: 3 },
        );

        assert!(client.is_connected());
        assert_eq!(client.assigned_peer_id(), Some(3));
    }

    #[test]
    fn overall_timeout_gives_up_connecting() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut config = NetConfig::default();
        config.connect_overall_timeout = 1.0;
        let mut client = Client::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();

        let failed_reason = Rc::new(RefCell::new(None));
        let failed_reason_clone = failed_reason.clone();
        client.on_connection_failed(move |reason| *failed_reason_clone.borrow_mut() = Some(*reason));

        client
            .connect(Address::new(Ipv4Addr::new(127, 0, 0, 1), 9003))
            .unwrap();
        client.tick(2.0);
        assert_eq!(client.state, ClientState::Disconnected);
        assert_eq!(*failed_reason.borrow(), Some(DisconnectReason::ConnectionTimeout));
    }

    #[test]
    fn connection_denied_fires_on_connection_failed_not_on_disconnected() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let config = NetConfig::default();
        let mut client = Client::bind(Address::new(Ipv4Addr::new(127, 0, 0, 1), 0), config).unwrap();
        client
            .connect(Address::new(Ipv4Addr::new(127, 0, 0, 1), 9004))
            .unwrap();

        let failed = Rc::new(RefCell::new(false));
        let failed_clone = failed.clone();
        client.on_connection_failed(move |_| *failed_clone.borrow_mut() = true);
        let disconnected = Rc::new(RefCell::new(false));
        let disconnected_clone = disconnected.clone();
        client.on_disconnected(move |_| *disconnected_clone.borrow_mut() = true);

        client.handle_handshake_message(
            MessageKind::ConnectionDenied,
            &MessagePayload::ConnectionDenied { reason: DisconnectReason::ServerFull },
        );

        assert!(*failed.borrow());
        assert!(!*disconnected.borrow());
    }
}
