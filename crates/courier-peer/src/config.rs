use std::time::Duration;

use courier_frame::FrameConfig;
use courier_transport::UnixDomainSocket;

use crate::handshake::HandshakeConfig;

/// Bounded exponential backoff for re-establishing a lost connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts before the session gives up and closes. `0` disables reconnects.
    pub max_retries: u32,
    /// Delay before the first attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: u32,
}

impl ReconnectPolicy {
    /// Never reconnect; a lost connection closes the session.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Delay before attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout used by calls that do not pass one explicitly.
    pub default_timeout: Duration,
    /// How often the reaper scans for expired calls.
    pub expiry_scan_interval: Duration,
    /// Calls that may wait for a reconnect before new ones get `Overloaded`.
    pub max_queued_calls: usize,
    /// Requests waiting for the writer thread before new ones get `Overloaded`.
    pub outbound_queue_depth: usize,
    pub reconnect: ReconnectPolicy,
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
    /// Fetch the daemon's operation list on connect and reject unknown
    /// operations locally.
    pub validate_operations: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            expiry_scan_interval: Duration::from_millis(10),
            max_queued_calls: 64,
            outbound_queue_depth: 1024,
            reconnect: ReconnectPolicy::default(),
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
            validate_operations: false,
        }
    }
}

/// What to do when an operation id is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail with `DuplicateOperation`.
    #[default]
    Reject,
    /// Keep the newest handler.
    Replace,
    /// Keep the first handler.
    Ignore,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Threads executing handlers.
    pub worker_threads: usize,
    /// Requests waiting for a worker before readers block.
    pub job_queue_depth: usize,
    /// Replies waiting for a connection's writer thread. A client that lets
    /// this fill up is not reading and gets disconnected.
    pub outbound_queue_depth: usize,
    /// Upper bound on a whole shutdown: in-flight handlers, queued replies
    /// and idle workers share one deadline.
    pub drain_timeout: Duration,
    /// Permission bits for the socket file.
    pub socket_mode: u32,
    pub duplicate_policy: DuplicatePolicy,
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            job_queue_depth: 256,
            outbound_queue_depth: 1024,
            drain_timeout: Duration::from_secs(5),
            socket_mode: UnixDomainSocket::DEFAULT_SOCKET_MODE,
            duplicate_policy: DuplicatePolicy::default(),
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(7), Duration::from_secs(2));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn disabled_policy() {
        assert!(!ReconnectPolicy::disabled().is_enabled());
        assert!(ReconnectPolicy::default().is_enabled());
    }

    #[test]
    fn defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.max_queued_calls, 64);
        assert_eq!(session.outbound_queue_depth, 1024);
        assert!(!session.validate_operations);

        let server = ServerConfig::default();
        assert_eq!(server.socket_mode, 0o600);
        assert_eq!(server.duplicate_policy, DuplicatePolicy::Reject);
    }
}
