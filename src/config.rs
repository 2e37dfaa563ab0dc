//! Client configuration.
//!
//! All tunables of the engine live in one explicit record so behaviour is
//! never decided by scattered constants. The defaults are the RFC 7252
//! transmission parameters plus the block-wise and observe lifetimes.

use std::time::Duration;

/// Configuration shared by every endpoint of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port used when a URI carries no explicit port and an insecure scheme.
    pub default_port: u16,
    /// Port used when a URI carries no explicit port and a secure scheme.
    pub default_secure_port: u16,
    /// Base ACK timeout for confirmable messages.
    pub ack_timeout: Duration,
    /// Upper jitter bound factor for the initial retransmit delay.
    pub ack_random_factor: f64,
    /// Back-off factor applied to the delay after each retransmission.
    pub ack_timeout_scale: f64,
    /// Number of retransmissions before a confirmable exchange times out.
    pub max_retransmit: u32,
    /// Upper bound on an encoded message.
    pub max_message_size: usize,
    /// Preferred block size for block-wise transfers, clamped to a power of
    /// two between 16 and 1024.
    pub default_block_size: usize,
    /// How long a stalled block-wise transfer keeps its partial state.
    pub blockwise_status_lifetime: Duration,
    /// Seed the message-id generator with a random value.
    pub use_random_id_start: bool,
    /// Seed the token generator with a random value.
    pub use_random_token_start: bool,
    /// How long an observe notification stays authoritative.
    pub notification_max_age: Duration,
    /// Reregister an observation after this long without a notification.
    pub notification_check_interval_time: Duration,
    /// Reregister an observation after this many notifications.
    pub notification_check_interval_count: u32,
    /// Delay before a reregistration attempt.
    pub notification_reregistration_backoff: Duration,
    /// Lifetime of an exchange; also bounds deduplication and multicast
    /// fan-in windows.
    pub exchange_lifetime: Duration,
    /// Period of the deduplicator sweep.
    pub mark_and_sweep_interval: Duration,
    /// Receive buffer size handed to the transport.
    pub channel_receive_packet_size: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            default_port: 5683,
            default_secure_port: 5684,
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            ack_timeout_scale: 2.0,
            max_retransmit: 4,
            max_message_size: 1024,
            default_block_size: 1024,
            blockwise_status_lifetime: Duration::from_millis(600_000),
            use_random_id_start: true,
            use_random_token_start: true,
            notification_max_age: Duration::from_millis(128_000),
            notification_check_interval_time: Duration::from_millis(86_400_000),
            notification_check_interval_count: 100,
            notification_reregistration_backoff: Duration::from_millis(2000),
            exchange_lifetime: Duration::from_millis(247_000),
            mark_and_sweep_interval: Duration::from_millis(10_000),
            channel_receive_packet_size: 2048,
        }
    }
}
