//! Authoritative server/client UDP transport and entity replication.
//!
//! A `Server` accepts connections and replicates world state out to every
//! connected `Client`; both sides exchange ad hoc in-game messages over
//! either an unreliable-unordered or a reliable-ordered channel. See
//! [`server::Server`], [`client::Client`], and [`replication::ReplicationManager`].

pub mod address;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod packet;
pub mod peer;
pub mod remote_peer;
pub mod replication;
pub mod server;
pub mod socket;
pub mod variable;

pub use address::Address;
pub use client::{Client, ClientEvent};
pub use config::NetConfig;
pub use error::{DisconnectReason, NetError, Result};
pub use replication::{NetworkHost, ReplicationManager, ReplicationMessage};
pub use server::{Server, ServerEvent};
