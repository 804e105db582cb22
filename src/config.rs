//! Configuration constants for the ingestion job
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application. Values that operators are expected to change per run are
//! exposed as CLI flags and only default to the constants below.

use std::time::Duration;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections are recycled after an hour so long runs survive server-side
/// idle limits and credential rotation.
pub const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// One stream is open at a time; a second slot covers the catalog queries
/// that run between tables while a previous connection is being returned.
pub const POOL_MAX_SIZE: u32 = 2;

// ============================================================================
// Source Acquisition
// ============================================================================

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Timeout for catalog queries (table existence, column listing)
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180); // 3 minutes

/// Maximum wait for the next row of a table stream
///
/// Full-table scans on large tables can take a while to produce their first
/// row, so this is more generous than the catalog timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

// ============================================================================
// Output Configuration
// ============================================================================

/// Records encoded and appended to the artifact per write
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

pub const DEFAULT_OUTPUT_DIR: &str = "/app/out";

/// Run stamp format shared by every file a run produces
pub const RUN_STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Rejections kept per table in the run manifest; the rest are only logged
pub const MAX_RECORDED_REJECTIONS: usize = 100;

pub const DEFAULT_MAX_REJECT_RATIO: f64 = 0.5;
