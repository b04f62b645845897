use hashbrown::HashMap;

use crate::buffer::Buffer;
use crate::error::{DisconnectReason, NetError, Result};
use crate::replication::ReplicationMessage;

/// Tagged message variants, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ConnectionRequest = 0,
    ConnectionChallenge = 1,
    ConnectionChallengeResponse = 2,
    ConnectionAccepted = 3,
    ConnectionDenied = 4,
    Disconnection = 5,
    InGame = 6,
    InGameResponse = 7,
    Replication = 8,
    TimeRequest = 9,
    TimeResponse = 10,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match v {
            0 => ConnectionRequest,
            1 => ConnectionChallenge,
            2 => ConnectionChallengeResponse,
            3 => ConnectionAccepted,
            4 => ConnectionDenied,
            5 => Disconnection,
            6 => InGame,
            7 => InGameResponse,
            8 => Replication,
            9 => TimeRequest,
            10 => TimeResponse,
            _ => return None,
        })
    }
}

const FLAG_RELIABLE: u8 = 0b0000_0001;
const FLAG_ORDERED: u8 = 0b0000_0010;

/// Fixed message header: kind, flags, sequence. The sequence is assigned by
/// the owning channel, not at construction time.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub reliable: bool,
    pub ordered: bool,
    pub sequence: u16,
}

impl MessageHeader {
    pub const SIZE: usize = 4;

    fn serialize(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.write_u8(self.kind as u8)?;
        let mut flags = 0u8;
        if self.reliable {
            flags |= FLAG_RELIABLE;
        }
        if self.ordered {
            flags |= FLAG_ORDERED;
        }
        buffer.write_u8(flags)?;
        buffer.write_u16(self.sequence)?;
        Ok(())
    }

    fn deserialize(buffer: &mut Buffer) -> Result<Self> {
        let kind_byte = buffer.read_u8();
        let kind = MessageKind::from_u8(kind_byte).ok_or(NetError::MalformedPacket)?;
        let flags = buffer.read_u8();
        let sequence = buffer.read_u16();
        Ok(MessageHeader {
            kind,
            reliable: flags & FLAG_RELIABLE != 0,
            ordered: flags & FLAG_ORDERED != 0,
            sequence,
        })
    }
}

/// Per-kind payload. Handshake kinds carry salts inline; `InGame` carries an
/// opaque byte blob the host supplies; `Replication` wraps a
/// `ReplicationMessage`.
#[derive(Debug, Clone)]
pub enum MessagePayload {
    Empty,
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionChallenge {
        client_salt: u64,
        server_salt: u64,
    },
    ConnectionChallengeResponse {
        xored_salt: u64,
    },
    ConnectionAccepted {
        assigned_peer_id: u32,
    },
    ConnectionDenied {
        reason: DisconnectReason,
    },
    Disconnection {
        reason: DisconnectReason,
    },
    InGame {
        bytes: Vec<u8>,
    },
    Replication(ReplicationMessage),
    TimeRequest {
        client_time: f32,
    },
    TimeResponse {
        client_time: f32,
        server_time: f32,
    },
}

fn reason_to_u8(reason: DisconnectReason) -> u8 {
    match reason {
        DisconnectReason::Unknown => 0,
        DisconnectReason::Timeout => 1,
        DisconnectReason::ServerFull => 2,
        DisconnectReason::PeerShutDown => 3,
        DisconnectReason::ConnectionTimeout => 4,
    }
}

fn reason_from_u8(v: u8) -> DisconnectReason {
    match v {
        1 => DisconnectReason::Timeout,
        2 => DisconnectReason::ServerFull,
        3 => DisconnectReason::PeerShutDown,
        4 => DisconnectReason::ConnectionTimeout,
        _ => DisconnectReason::Unknown,
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(kind: MessageKind, reliable: bool, ordered: bool) -> Self {
        Message {
            header: MessageHeader {
                kind,
                reliable,
                ordered,
                sequence: 0,
            },
            payload: MessagePayload::Empty,
        }
    }

    pub fn serialize(&self, buffer: &mut Buffer) -> Result<()> {
        self.header.serialize(buffer)?;
        match &self.payload {
            MessagePayload::Empty => {}
            MessagePayload::ConnectionRequest { client_salt } => {
                buffer.write_u64(*client_salt)?;
            }
            MessagePayload::ConnectionChallenge {
                client_salt,
                server_salt,
            } => {
                buffer.write_u64(*client_salt)?;
                buffer.write_u64(*server_salt)?;
            }
            MessagePayload::ConnectionChallengeResponse { xored_salt } => {
                buffer.write_u64(*xored_salt)?;
            }
            MessagePayload::ConnectionAccepted { assigned_peer_id } => {
                buffer.write_u32(*assigned_peer_id)?;
            }
            MessagePayload::ConnectionDenied { reason } => {
                buffer.write_u8(reason_to_u8(*reason))?;
            }
            MessagePayload::Disconnection { reason } => {
                buffer.write_u8(reason_to_u8(*reason))?;
            }
            MessagePayload::InGame { bytes } => {
                buffer.write_u16(bytes.len() as u16)?;
                buffer.write_bytes(bytes)?;
            }
            MessagePayload::Replication(replication) => {
                replication.serialize(buffer)?;
            }
            MessagePayload::TimeRequest { client_time } => {
                buffer.write_f32(*client_time)?;
            }
            MessagePayload::TimeResponse {
                client_time,
                server_time,
            } => {
                buffer.write_f32(*client_time)?;
                buffer.write_f32(*server_time)?;
            }
        }
        Ok(())
    }

    /// `InGameResponse` shares `InGame`'s wire shape; the distinction only
    /// matters for channel routing, so both tags serialize/deserialize the
    /// same byte blob.
    pub fn deserialize(buffer: &mut Buffer) -> Result<Self> {
        let header = MessageHeader::deserialize(buffer)?;
        let payload = match header.kind {
            MessageKind::ConnectionRequest => MessagePayload::ConnectionRequest {
                client_salt: buffer.read_u64(),
            },
            MessageKind::ConnectionChallenge => MessagePayload::ConnectionChallenge {
                client_salt: buffer.read_u64(),
                server_salt: buffer.read_u64(),
            },
            MessageKind::ConnectionChallengeResponse => MessagePayload::ConnectionChallengeResponse {
                xored_salt: buffer.read_u64(),
            },
            MessageKind::ConnectionAccepted => MessagePayload::ConnectionAccepted {
                assigned_peer_id: buffer.read_u32(),
            },
            MessageKind::ConnectionDenied => MessagePayload::ConnectionDenied {
                reason: reason_from_u8(buffer.read_u8()),
            },
            MessageKind::Disconnection => MessagePayload::Disconnection {
                reason: reason_from_u8(buffer.read_u8()),
            },
            MessageKind::InGame | MessageKind::InGameResponse => {
                let len = buffer.read_u16() as usize;
                MessagePayload::InGame {
                    bytes: buffer.read_bytes(len),
                }
            }
            MessageKind::Replication => {
                MessagePayload::Replication(ReplicationMessage::deserialize(buffer)?)
            }
            MessageKind::TimeRequest => MessagePayload::TimeRequest {
                client_time: buffer.read_f32(),
            },
            MessageKind::TimeResponse => MessagePayload::TimeResponse {
                client_time: buffer.read_f32(),
                server_time: buffer.read_f32(),
            },
        };
        if buffer.has_overrun() {
            return Err(NetError::MalformedPacket);
        }
        Ok(Message { header, payload })
    }

    /// Serialized size in bytes, used to decide whether a message still fits
    /// in the packet currently being assembled.
    pub fn serialized_size(&self) -> usize {
        MessageHeader::SIZE
            + match &self.payload {
                MessagePayload::Empty => 0,
                MessagePayload::ConnectionRequest { .. } => 8,
                MessagePayload::ConnectionChallenge { .. } => 16,
                MessagePayload::ConnectionChallengeResponse { .. } => 8,
                MessagePayload::ConnectionAccepted { .. } => 4,
                MessagePayload::ConnectionDenied { .. } => 1,
                MessagePayload::Disconnection { .. } => 1,
                MessagePayload::InGame { bytes } => 2 + bytes.len(),
                MessagePayload::Replication(replication) => replication.serialized_size(),
                MessagePayload::TimeRequest { .. } => 4,
                MessagePayload::TimeResponse { .. } => 8,
            }
    }
}

/// Tick-local pool keyed by `MessageKind`; `lend` recycles a released message
/// if one is available for that kind, else allocates. Not thread-safe, per
/// spec.md §5 ("process-wide but tick-local in use").
///
/// Grounded on `networking::chunkpool::ChunkPool`'s "reuse before allocate"
/// shape, applied to `Message` instead of `Chunk`.
pub struct MessageFactory {
    pools: HashMap<MessageKind, Vec<Message>>,
    lent_count: usize,
}

impl MessageFactory {
    pub fn new() -> Self {
        MessageFactory {
            pools: HashMap::new(),
            lent_count: 0,
        }
    }

    pub fn lend(&mut self, kind: MessageKind, reliable: bool, ordered: bool) -> Message {
        self.lent_count += 1;
        let mut message = self
            .pools
            .get_mut(&kind)
            .and_then(Vec::pop)
            .unwrap_or_else(|| Message::new(kind, reliable, ordered));
        message.header.reliable = reliable;
        message.header.ordered = ordered;
        message.header.sequence = 0;
        message.payload = MessagePayload::Empty;
        message
    }

    pub fn release(&mut self, mut message: Message) {
        message.payload = MessagePayload::Empty;
        self.lent_count = self.lent_count.saturating_sub(1);
        self.pools.entry(message.header.kind).or_default().push(message);
    }

    /// Pool-balance assertion run at peer shutdown (spec.md §5: "leak
    /// detection by the factory on shutdown is required").
    pub fn assert_balanced(&self) {
        assert_eq!(
            self.lent_count, 0,
            "message pool leak: {} message(s) never released",
            self.lent_count
        );
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}
