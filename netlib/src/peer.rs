use crate::address::Address;
use crate::buffer::Buffer;
use crate::channel::ChannelKind;
use crate::config::NetConfig;
use crate::error::Result;
use crate::message::{Message, MessageFactory};
use crate::packet::NetworkPacket;
use crate::remote_peer::RemotePeer;
use crate::socket::Socket;

/// Subscriber list with monotonic subscription ids, so a caller can
/// unsubscribe a specific closure later without holding on to it directly.
///
/// Grounded on the original's delegate-subscription pattern (every
/// `network_peer_global_component.h` callback list hands back an id from
/// `Subscribe` for later `Unsubscribe`).
pub struct CallbackList<T> {
    next_id: u64,
    callbacks: Vec<(u64, Box<dyn FnMut(&T)>)>,
}

impl<T> CallbackList<T> {
    pub fn new() -> Self {
        CallbackList {
            next_id: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&T) + 'static) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.callbacks.retain(|(existing, _)| *existing != id);
    }

    pub fn notify(&mut self, event: &T) {
        for (_, callback) in self.callbacks.iter_mut() {
            callback(event);
        }
    }
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket, message pool, and scratch buffers common to both `Server` and
/// `Client`.
pub struct PeerCore {
    pub socket: Socket,
    pub config: NetConfig,
    pub factory: MessageFactory,
    recv_scratch: Vec<u8>,
    send_scratch: Buffer,
}

impl PeerCore {
    pub fn bind(address: Address, config: NetConfig) -> Result<Self> {
        let socket = Socket::bind(address)?;
        let recv_scratch = vec![0u8; config.receive_buffer_size];
        let send_scratch = Buffer::with_capacity(config.send_buffer_size.max(config.max_packet_size));
        Ok(PeerCore {
            socket,
            config,
            factory: MessageFactory::new(),
            recv_scratch,
            send_scratch,
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.socket.local_addr()
    }

    /// Reads at most `recv_budget_per_tick` datagrams, returning each as a
    /// parsed `(sender_address, packet)` pair; datagrams that fail to parse
    /// (wrong `protocol_id`, truncated) are dropped silently.
    pub fn poll_datagrams(&mut self) -> Vec<(Address, NetworkPacket)> {
        let mut out = Vec::new();
        for _ in 0..self.config.recv_budget_per_tick {
            let received = match self.socket.recv(&mut self.recv_scratch) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(_) => break,
            };
            let (n, from) = received;
            let mut buffer = Buffer::wrap(self.recv_scratch[..n].to_vec());
            if let Ok(packet) = NetworkPacket::deserialize(&mut buffer, self.config.protocol_id) {
                out.push((from, packet));
            }
        }
        out
    }

    /// Drains a remote's channel of everything currently ready to send,
    /// packs it into as many datagrams as needed to respect
    /// `max_packet_size`, patches each one's ack fields, and sends.
    ///
    /// `UnreliableUnordered` messages have no further use once serialized
    /// onto the wire, so they're released back to the factory right after
    /// the send; `ReliableOrdered` messages stay tracked in the channel's
    /// in-flight map for retransmission and are released later, when
    /// `route_incoming` observes their ack (or when the channel is drained
    /// on disconnect) — see spec.md §5's recycle contract.
    pub fn flush_channel(&mut self, remote: &mut RemotePeer, kind: ChannelKind, address: Address) -> Result<()> {
        loop {
            let session_salt = remote.xored_salt();
            let channel = remote.channel_mut(kind);
            let (last_acked, ack_bitfield) = channel.ack_info();
            let needs_ack_flush = channel.needs_ack_flush();
            let mut packet = NetworkPacket::new(self.config.protocol_id, kind as u8);
            packet.header.last_acked_sequence = last_acked;
            packet.header.ack_bitfield = ack_bitfield;
            packet.header.session_salt = session_salt;

            let mut appended_any = false;
            loop {
                let remaining = self.config.max_packet_size.saturating_sub(packet.serialized_size());
                match channel.next_to_send_if_fits(remaining) {
                    Some(message) => {
                        packet
                            .try_append(message, self.config.max_packet_size)
                            .expect("next_to_send_if_fits already checked the budget");
                        appended_any = true;
                    }
                    None => {
                        if let Some(message) = channel.drop_oversized_head(self.config.max_packet_size) {
                            log::warn!(
                                "dropping message that can never fit a single datagram ({} bytes)",
                                message.serialized_size()
                            );
                            self.factory.release(message);
                            continue;
                        }
                        break;
                    }
                }
            }

            if !appended_any && !needs_ack_flush {
                return Ok(());
            }
            packet.header.packet_sequence = remote.next_packet_sequence(kind);

            self.send_scratch.reset_write();
            packet.serialize(&mut self.send_scratch)?;
            self.socket.send(self.send_scratch.as_written_slice(), address)?;
            remote.channel_mut(kind).mark_ack_reported();

            if kind == ChannelKind::UnreliableUnordered {
                for message in packet.messages.drain(..) {
                    self.factory.release(message);
                }
            }

            if !appended_any {
                return Ok(());
            }
        }
    }

    /// Sends a single ad hoc message (handshake traffic, or a `Disconnection`
    /// notice) immediately, outside of any channel's queue/ack bookkeeping.
    ///
    /// `session_salt` must be `0` for pre-handshake traffic (no session
    /// exists yet) and `remote.xored_salt()` for anything sent to an already
    /// connected remote — `route_incoming` drops non-zero-salt traffic that
    /// doesn't match, so a `Disconnection` sent with the wrong salt would
    /// never be seen by the receiver.
    pub fn send_immediate(&mut self, message: Message, address: Address, session_salt: u64) -> Result<()> {
        let mut packet = NetworkPacket::new(self.config.protocol_id, ChannelKind::UnreliableUnordered as u8);
        packet.header.session_salt = session_salt;
        packet.try_append(message, self.config.max_packet_size)?;
        self.send_scratch.reset_write();
        packet.serialize(&mut self.send_scratch)?;
        self.socket.send(self.send_scratch.as_written_slice(), address)
    }

    /// Feeds every message in a received packet through the matching
    /// channel's dedup/ordering logic and applies the packet's ack info,
    /// returning messages ready for dispatch. Acked reliable sends are
    /// released back to the factory here, the one point where the channel
    /// considers them fully retired.
    pub fn route_incoming(&mut self, remote: &mut RemotePeer, packet: NetworkPacket) -> Vec<Message> {
        let kind = match ChannelKind::from_u8(packet.header.channel_id) {
            Some(k) => k,
            None => return Vec::new(),
        };
        if packet.header.session_salt != remote.xored_salt() {
            log::warn!(
                "dropping packet from {:?} with wrong session salt (possible spoofed source address)",
                remote.address
            );
            return Vec::new();
        }
        let acked = remote
            .channel_mut(kind)
            .on_ack(packet.header.last_acked_sequence, packet.header.ack_bitfield);
        for message in acked {
            self.factory.release(message);
        }

        let mut ready = Vec::new();
        for message in packet.messages {
            let sequence = message.header.sequence;
            ready.extend(remote.channel_mut(kind).receive(sequence, message));
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::message::{MessageKind, MessagePayload};
    use std::net::Ipv4Addr;

    fn local(port: u16) -> Address {
        Address::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    /// A reliable send with nothing coming back the other way must still
    /// get acked, and must stop retransmitting once it has been.
    #[test]
    fn flush_channel_sends_a_standalone_ack_with_nothing_else_queued() {
        let config = NetConfig::default();
        let mut server_core = PeerCore::bind(local(0), config).unwrap();
        let server_addr = server_core.local_addr().unwrap();
        let mut client_core = PeerCore::bind(local(0), config).unwrap();
        let client_addr = client_core.local_addr().unwrap();

        let mut server_remote = RemotePeer::new(1, client_addr, 11, 22, config.rto_initial);
        server_remote.state = crate::remote_peer::ConnectionState::Connected;
        let mut client_remote = RemotePeer::new(1, server_addr, 11, 22, config.rto_initial);
        client_remote.state = crate::remote_peer::ConnectionState::Connected;

        let mut message = server_core.factory.lend(MessageKind::InGame, true, true);
        message.payload = MessagePayload::InGame { bytes: vec![1, 2, 3] };
        server_remote
            .channel_mut(ChannelKind::ReliableOrdered)
            .enqueue(message);

        server_core
            .flush_channel(&mut server_remote, ChannelKind::ReliableOrdered, client_addr)
            .unwrap();

        let datagrams = client_core.poll_datagrams();
        assert_eq!(datagrams.len(), 1);
        for (from, packet) in datagrams {
            for message in client_core.route_incoming(&mut client_remote, packet) {
                client_core.factory.release(message);
            }
            let _ = from;
        }

        // Nothing queued on the client's side, but it owes the server an ack.
        client_core
            .flush_channel(&mut client_remote, ChannelKind::ReliableOrdered, server_addr)
            .unwrap();
        let ack_datagrams = server_core.poll_datagrams();
        assert_eq!(ack_datagrams.len(), 1);
        for (_, packet) in ack_datagrams {
            assert!(packet.messages.is_empty());
            let delivered = server_core.route_incoming(&mut server_remote, packet);
            assert!(delivered.is_empty());
        }

        // The in-flight send was acked; letting the RTO elapse must not
        // produce a retransmit.
        server_remote.tick(1.0);
        server_core
            .flush_channel(&mut server_remote, ChannelKind::ReliableOrdered, client_addr)
            .unwrap();
        assert!(client_core.poll_datagrams().is_empty());

        // And the client has nothing new to ack either, so it stays quiet.
        client_core
            .flush_channel(&mut client_remote, ChannelKind::ReliableOrdered, server_addr)
            .unwrap();
        assert!(server_core.poll_datagrams().is_empty());
    }

    #[test]
    fn callback_list_notifies_subscribers_and_honors_unsubscribe() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut list: CallbackList<u32> = CallbackList::new();

        let seen_a = seen.clone();
        let id_a = list.subscribe(move |v| seen_a.borrow_mut().push(*v));
        let seen_b = seen.clone();
        list.subscribe(move |v| seen_b.borrow_mut().push(*v * 10));

        list.notify(&5);
        assert_eq!(*seen.borrow(), vec![5, 50]);

        list.unsubscribe(id_a);
        seen.borrow_mut().clear();
        list.notify(&5);
        assert_eq!(*seen.borrow(), vec![50]);
    }
}
