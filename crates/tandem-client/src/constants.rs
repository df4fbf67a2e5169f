//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Sync loop tick while the watch stream is connected.
pub const DEFAULT_SYNC_LOOP_DURATION: Duration = Duration::from_millis(50);

/// Watch stream reconnect backoff. Doubles as the sync loop tick while the
/// stream is down: without a remote-dirty signal the client must not flood
/// the agent.
pub const DEFAULT_RECONNECT_STREAM_DELAY: Duration = Duration::from_millis(1000);

/// Event bus capacity. A subscriber that falls further behind observes a
/// lag error and resumes from the oldest retained event.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
