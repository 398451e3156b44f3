//! Configuration for the `Router` and its streaming connections.

use std::time::Duration;

/// Options governing dispatch behaviour. Constructed with `Default` and
/// adjusted field-by-field before being handed to
/// [`build_router`](crate::router::builder::build_router).
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// When a request path misses only because of a surplus or missing
    /// trailing `/`, respond `301` to the canonical form. Enabled by default.
    pub trailing_slash_redirect: bool,

    /// When a request path misses case-sensitively but a unique fully-static
    /// route matches case-insensitively, respond `301` to the canonical-case
    /// path. Disabled by default.
    pub fixed_path_redirect: bool,

    /// Tuning for duplex and push connections.
    pub stream: StreamConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            trailing_slash_redirect: true,
            fixed_path_redirect: false,
            stream: StreamConfig::default(),
        }
    }
}

/// Tuning knobs shared by duplex and push connections.
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// How long a duplex connection may go without any inbound frame
    /// (including pongs) before it is closed with code `1011`.
    pub read_deadline: Duration,

    /// The deadline applied to each individual frame write.
    pub write_deadline: Duration,

    /// How often a ping (duplex) or `: ping` comment (push) is emitted.
    pub ping_interval: Duration,

    /// The bound of each connection's write queue. Enqueueing onto a full
    /// queue fails with `SlowConsumer` and closes the connection.
    pub write_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            write_queue_depth: 256,
        }
    }
}
