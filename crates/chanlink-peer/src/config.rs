use std::time::Duration;

/// Configuration for a [`NetworkContext`](crate::NetworkContext).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How long an outgoing connection may stay Pending before it times out.
    pub activation_timeout: Duration,
    /// Sleep between I/O polls when nothing happened, for [`IoThread`](crate::IoThread).
    pub io_poll_interval: Duration,
    /// Largest encoded packet a channel will send, header included.
    pub max_packet_size: usize,
    /// Maximum number of live connections, outgoing and incoming together.
    pub max_connections: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(5),
            io_poll_interval: Duration::from_millis(1),
            max_packet_size: 16 * 1024 * 1024,
            max_connections: 128,
        }
    }
}

impl ContextConfig {
    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    pub fn with_io_poll_interval(mut self, interval: Duration) -> Self {
        self.io_poll_interval = interval;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
