//! Timing and size constants for plugin discovery.
//!
//! Constants are grouped by concern. Anything a deployment may want to tune
//! also has a [`Config`](crate::config::Config) field; the values here are
//! the defaults.

use std::time::Duration;

// ============================================================================
// Probing
// ============================================================================

/// Budget for a single connect probe against one socket file.
///
/// A listener that is alive accepts the kernel-level connect immediately, so
/// this only bounds hung or overloaded peers. A probe that runs out of budget
/// classifies the entry as unusable rather than stalling a scan.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Back-off between connect attempts while a listener's backlog is full.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_millis(5);

// ============================================================================
// Polling
// ============================================================================

/// Interval between rescans when waiting for a plugin to appear or vanish.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for `plugdir wait`.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay after a failed `accept()` before the accept loop retries.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Sockets
// ============================================================================

/// Longest socket path accepted by every supported kernel.
///
/// `sun_path` is 104 bytes on macOS and 108 on Linux; the smaller value
/// (including the trailing NUL) keeps paths portable.
pub const MAX_SOCKET_PATH: usize = 104;

/// Longest file name a plugin lookup may use (`NAME_MAX` on Linux and macOS).
pub const MAX_NAME_LEN: usize = 255;

/// File mode applied to freshly bound plugin sockets (owner read/write).
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
