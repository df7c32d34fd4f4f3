use std::time::Duration;

/// Poll ceiling for one demultiplexer wait. The wakeup fd preempts this.
pub(crate) const POLL_TIMEOUT_MS: i32 = 10_000;

/// Initial connector retry delay.
pub(crate) const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connector retry delay cap.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Stack-side overflow area for the scatter read in `Buffer::read_fd`.
pub(crate) const EXTRA_READ_BUF: usize = 64 * 1024;

/// Configuration for a `TcpServer`.
#[derive(Clone, Debug)]
pub struct Config {
    /// TCP listen backlog.
    pub backlog: i32,
    /// Set SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Enable SO_KEEPALIVE on accepted connections.
    pub keep_alive: bool,
    /// Output-buffer threshold for the high-watermark callback, in bytes.
    pub high_water_mark: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: 1024,
            reuse_port: false,
            tcp_nodelay: false,
            keep_alive: true,
            high_water_mark: 64 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.backlog, 1024);
        assert!(!config.reuse_port);
        assert!(!config.tcp_nodelay);
        assert!(config.keep_alive);
        assert_eq!(config.high_water_mark, 64 * 1024 * 1024);
    }
}
