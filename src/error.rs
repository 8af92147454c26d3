//! Error types for manuscript-dl
//!
//! This module provides the error taxonomy for the download pipeline:
//! - Transient server failures (retryable with backoff)
//! - Fatal server rejections and malformed responses
//! - Stall timeouts raised by the escalating timeout monitor
//! - Plan invariant violations (programmer errors that abort the whole job)
//! - Cache errors, which downstream code degrades to cache misses

use thiserror::Error;

/// Result type alias for manuscript-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for manuscript-dl
///
/// Retryability is classified separately in [`crate::retry`]: transient errors
/// are retried with backoff, stall timeouts get one extra attempt, and
/// everything else is fatal for the page that produced it.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "safety_margin")
        key: Option<String>,
    },

    /// Transport-level network error (DNS, TLS, connect, read)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server answered with a transient status (throttling or 5xx)
    #[error("server busy ({status}) for {url}")]
    ServerBusy {
        /// HTTP status code (429 or 5xx)
        status: u16,
        /// The URL that produced the status
        url: String,
    },

    /// Server rejected the request permanently (4xx other than throttling)
    #[error("server rejected ({status}) {url}")]
    ServerRejected {
        /// HTTP status code
        status: u16,
        /// The URL that was rejected
        url: String,
    },

    /// The escalating timeout monitor gave up on a transfer
    #[error("transfer stalled after {elapsed_ms}ms ({bytes_received} bytes received) for {url}")]
    TimeoutStalled {
        /// The URL of the stalled transfer
        url: String,
        /// Milliseconds elapsed when the monitor gave up
        elapsed_ms: u64,
        /// Bytes received before the stall (0 means no byte ever arrived)
        bytes_received: u64,
    },

    /// The response body could not be interpreted
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The URL that produced the response
        url: String,
        /// Why the response could not be used
        reason: String,
    },

    /// Tile reconstruction failed for one page
    #[error("tile assembly failed for page {page}: {reason}")]
    TileAssembly {
        /// 1-based page number being assembled
        page: u32,
        /// Why assembly failed
        reason: String,
    },

    /// A download plan violated the exact-partition invariant
    ///
    /// This indicates a bug in the planner and aborts the whole job rather
    /// than risk silently skipped or duplicated pages.
    #[error("plan invariant violation: {0}")]
    PlanInvariant(String),

    /// A manifest resolved to zero pages
    #[error("manifest for {url} contains no pages")]
    EmptyManifest {
        /// Source URL of the empty manifest
        url: String,
    },

    /// Manifest resolution failed at the external resolver boundary
    #[error("manifest resolution failed: {0}")]
    Resolver(String),

    /// Manifest cache operation failed
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// SQLx database error
    #[error("cache error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify an HTTP status code into the transient/fatal taxonomy.
    ///
    /// 429 and all 5xx statuses map to [`Error::ServerBusy`] (transient);
    /// every other non-success status is a permanent rejection.
    pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Error::ServerBusy {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            Error::ServerRejected {
                status: status.as_u16(),
                url: url.to_string(),
            }
        }
    }
}

/// Manifest cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to open the cache database
    #[error("failed to open cache database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}
