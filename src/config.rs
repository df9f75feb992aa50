//! Traversal timing.

use std::time::Duration;

/// Spacing between receive attempts while waiting on a socket.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a registered client waits for the coordinator to pair it.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_PUNCH_COUNT: usize = 10;

pub const DEFAULT_PUNCH_INTERVAL: Duration = Duration::from_millis(50);

/// Pause after the last punch so both NATs have installed their mappings.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default coordinator port.
pub const DEFAULT_PORT: u16 = 8080;

/// Client side traversal settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub poll_interval: Duration,
    pub register_timeout: Duration,
    pub peer_timeout: Duration,
    pub punch_count: usize,
    pub punch_interval: Duration,
    pub settle_delay: Duration,
    /// Running out of this is not an error, the client carries on optimistically.
    pub confirm_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            punch_count: DEFAULT_PUNCH_COUNT,
            punch_interval: DEFAULT_PUNCH_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}
