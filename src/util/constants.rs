//! Centralized constants for gateway runtime configuration
//!
//! All timeout and limit values in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Tool-Server Timeouts
// ═══════════════════════════════════════════════════════════════

/// Timeout for the initialize handshake with a local (stdio) tool server
pub const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the initialize handshake with a remote (http-stream) tool server
pub const REMOTE_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single tool call
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing HTTP connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════
// Workflow Limits
// ═══════════════════════════════════════════════════════════════

/// Timeout for a code sandbox invocation
pub const SANDBOX_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a paused workflow waits for an approval decision
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Workflow state TTL, refreshed on each command
pub const WORKFLOW_TTL: Duration = Duration::from_secs(3600);

// ═══════════════════════════════════════════════════════════════
// Event Bus Limits
// ═══════════════════════════════════════════════════════════════

/// Bounded queue capacity per event-bus subscription
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

// ═══════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════

/// Minimum similarity score for an intent-only execute to replay a capability
pub const CAPABILITY_MATCH_THRESHOLD: f32 = 0.85;
