use std::fmt;
use std::io;

/// Error conditions surfaced by the transport and replication layers.
///
/// Mirrors the teacher's `net::result::Error` / `net::error::Error` split: a
/// plain closed enum plus a `From<io::Error>` impl and a crate-local
/// `Result` alias, rather than a derive-macro error type.
#[derive(Debug)]
pub enum NetError {
    BindFailed(io::Error),
    SendFailed(io::Error),
    RecvFailed(io::Error),
    BufferOverrun,
    MalformedPacket,
    PacketFull,
    UnknownPeer,
    CapacityExceeded,
    AlreadyConnected,
    ConnectionTimeout,
    Timeout,
    ServerFull,
    PeerShutDown,
    Io(io::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::BindFailed(e) => write!(f, "failed to bind socket: {}", e),
            NetError::SendFailed(e) => write!(f, "failed to send datagram: {}", e),
            NetError::RecvFailed(e) => write!(f, "failed to receive datagram: {}", e),
            NetError::BufferOverrun => write!(f, "buffer overrun"),
            NetError::MalformedPacket => write!(f, "malformed packet"),
            NetError::PacketFull => write!(f, "packet is full"),
            NetError::UnknownPeer => write!(f, "unknown peer"),
            NetError::CapacityExceeded => write!(f, "connection capacity exceeded"),
            NetError::AlreadyConnected => write!(f, "address already connected"),
            NetError::ConnectionTimeout => write!(f, "connection attempt timed out"),
            NetError::Timeout => write!(f, "peer timed out"),
            NetError::ServerFull => write!(f, "server is full"),
            NetError::PeerShutDown => write!(f, "peer shut down"),
            NetError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(io_error: io::Error) -> Self {
        NetError::Io(io_error)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Reasons a remote peer may be disconnected, or a local connection attempt
/// may fail. Corresponds 1:1 to `ConnectionFailedReasonType` in the original
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unknown,
    Timeout,
    ServerFull,
    PeerShutDown,
    ConnectionTimeout,
}
