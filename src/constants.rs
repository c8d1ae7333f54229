//! Constants and default values for the notifyg daemon.
//!
//! This module centralizes the magic numbers and strings used throughout
//! the daemon to improve maintainability and clarity.

use std::time::Duration;

// ============================================================================
// Queue Directory Layout
// ============================================================================

/// Name of the lock symlink inside the queue directory. Its target text is
/// the decimal pid of the daemon holding the queue.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Suffix marking a queue file that is still being written. Entries with
/// this suffix are invisible to the delivery loop.
pub const TMP_SUFFIX: &str = ".tmp";

// ============================================================================
// Retry Policy
// ============================================================================

/// Reserved retry token that drops an entry instead of delivering it.
/// Also implied by a step index beyond the end of the policy.
pub const GIVEUP_TOKEN: &str = "GIVEUP";

// ============================================================================
// Delivery Loop and Watcher Timing
// ============================================================================

/// Upper bound on a single directory-watcher wait. The loop re-inspects
/// the queue at least this often even without events or signals.
pub const MAX_WATCH_WAIT: Duration = Duration::from_secs(3600);

// ============================================================================
// Transport Defaults
// ============================================================================

/// Default truncation length for SMS transports.
pub const DEFAULT_MAX_SMS_LENGTH: usize = 160;

/// Default artificial delivery duration of the mock transport.
pub const DEFAULT_MOCK_DURATION: Duration = Duration::from_secs(3);

/// Default subject of mail transport messages.
pub const DEFAULT_MAIL_SUBJECT: &str = "notifyg message";

/// Placeholder replaced with the message text in mail body templates.
pub const MAIL_BODY_PLACEHOLDER: &str = "MESSAGE";

// ============================================================================
// XMPP Session Management
// ============================================================================

/// How long to wait for an answer to an application-layer ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum age of a ping result that may be reused instead of pinging
/// again. Zero means every send verifies the connection.
pub const DEFAULT_PING_MAX_AGE: Duration = Duration::from_secs(0);

/// Debounce window for reconnect triggers: while the connection is down,
/// at most one reconnect is initiated per window.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on the backoff between reconnect attempts.
pub const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(120);

/// Idle timeout of the session loop; housekeeping runs on this cadence
/// when no stanza or command arrives.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Presence states considered deliverable when a contact does not
/// configure `jabber_include_states`.
pub const DEFAULT_INCLUDE_STATES: &[&str] = &["online", "chat"];

/// Help text sent to a known resource that messages the daemon `help`.
pub const JABBER_HELP_TEXT: &str = "Valid commands:
- \"ignore\": Further messages are pretended to be delivered without being delivered.
- \"disable\": This resource will not receive further messages. Other ways of contacting the user are tried.
- \"normal\": Reset configuration to normal delivery.
- \"help\": Print this help text.
";
