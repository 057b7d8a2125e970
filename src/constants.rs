//! Global constants used throughout the lookout codebase.
//!
//! This module contains timeout durations, retry parameters, and other
//! numeric constants that are used across multiple modules. Defining
//! them centrally improves maintainability and makes magic numbers
//! more discoverable.

use std::time::Duration;

/// Base delay for the view fetch-retry backoff (250ms).
///
/// The delay doubles on each consecutive failed fetch, starting here.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Maximum delay for the view fetch-retry backoff (1 minute).
///
/// Backoff delays are capped at this value so a recovering backend is
/// rediscovered within a bounded window.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default wait time handed to blocking (long-poll) queries (1 minute).
///
/// A blocking query returns early when the server's index advances past
/// the caller-supplied one, or after this duration as a spurious wake.
pub const DEFAULT_QUERY_WAIT: Duration = Duration::from_secs(60);

/// Fallback lease duration for secrets that report none (5 minutes).
///
/// Used to schedule re-reads of non-blocking dependencies whose backend
/// did not attach an explicit lease.
pub const DEFAULT_VAULT_LEASE: Duration = Duration::from_secs(5 * 60);

/// Permission bits applied to rendered files that do not exist yet.
///
/// Existing destination files keep their current permission bits instead.
pub const DEFAULT_FILE_PERMS: u32 = 0o644;

/// Number of recalls of a still-missing dependency after which the
/// resolver logs a warning that the template may never settle.
pub const STALE_RECALL_THRESHOLD: u64 = 12;
