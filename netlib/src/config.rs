/// Every knob spec.md calls out as overridable, collected into one struct.
///
/// Grounded on `engine_shared::config::EngineConfig` (a plain struct with a
/// `Default` impl and named tunables) generalized to the transport's knobs:
/// the teacher's own `Peer` constructor just takes three bare integers
/// (`maxConnections`, `receiveBufferSize`, `sendBufferSize`), so this is where
/// the ambient-stack rule pulls in a real config type the teacher didn't
/// bother with for this module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetConfig {
    /// Hard cap on a single UDP datagram's serialized size, in bytes.
    pub max_packet_size: usize,
    /// Constant used to filter foreign traffic out at packet parse time.
    pub protocol_id: u16,
    /// Seconds of silence from a remote peer before it is disconnected with `Timeout`.
    pub inactivity_timeout: f32,
    /// Initial retransmit timeout for reliable-ordered messages, in seconds.
    pub rto_initial: f32,
    /// Seconds between connection-handshake retries.
    pub connect_retry_interval: f32,
    /// Maximum number of handshake retries before giving up.
    pub connect_max_retries: u32,
    /// Overall seconds budget for a connection attempt before it is abandoned.
    pub connect_overall_timeout: f32,
    /// Maximum datagrams drained from the socket in a single tick.
    pub recv_budget_per_tick: u32,
    /// Maximum simultaneous remote peers a `Server` will accept.
    pub max_connections: usize,
    /// Byte size of the scratch buffer used to drain incoming datagrams.
    pub receive_buffer_size: usize,
    /// Byte size of the scratch buffer used to assemble outgoing datagrams.
    pub send_buffer_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_packet_size: 1200,
            protocol_id: 0x5417,
            inactivity_timeout: 5.0,
            rto_initial: 0.2,
            connect_retry_interval: 0.2,
            connect_max_retries: 10,
            connect_overall_timeout: 5.0,
            recv_budget_per_tick: 256,
            max_connections: 32,
            receive_buffer_size: 4096,
            send_buffer_size: 4096,
        }
    }
}
