//! Core types for manuscript-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identifier for a download job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tile pyramid flavor, which determines the tile URL scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileKind {
    /// Deep Zoom Image: `{base}_files/{level}/{col}_{row}.{format}`
    Dzi,
    /// ZIF served through its Zoomify endpoint:
    /// `{base}/TileGroup0/{level}-{col}-{row}.{format}`
    Zif,
    /// Generic level/column/row scheme: `{base}/{level}/{col}_{row}.{format}`
    Generic,
}

/// A tiled image pyramid for one page
///
/// `full_width` and `full_height` are known at descriptor-construction time;
/// resolvers extract them from the source's metadata (DZI XML, IIIF info,
/// ZIF header) before any pixel data is fetched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledPyramid {
    /// Which tile URL scheme this source uses
    pub kind: TileKind,
    /// Base URL of the pyramid, without the per-tile suffix
    pub base_url: String,
    /// Tile edge length in pixels (tiles on the right/bottom edge may be smaller)
    pub tile_size: u32,
    /// Overlap border in pixels shared between adjacent tiles
    pub overlap: u32,
    /// Number of levels in the pyramid; 0 means unknown and the full-resolution
    /// level is derived from the image dimensions
    pub levels: u32,
    /// Full image width in pixels
    pub full_width: u32,
    /// Full image height in pixels
    pub full_height: u32,
    /// Tile file extension (e.g. "jpg", "png")
    pub format: String,
}

impl TiledPyramid {
    /// The pyramid level that covers the full resolution.
    ///
    /// When the level count is known it is the top level; otherwise it is
    /// derived as `ceil(log2(max(width, height)))`, the Deep Zoom convention
    /// where level N has dimensions `ceil(full / 2^(maxLevel - N))`.
    pub fn full_resolution_level(&self) -> u32 {
        if self.levels > 0 {
            return self.levels - 1;
        }
        let max_dim = self.full_width.max(self.full_height).max(1);
        // ceil(log2(max_dim)): number of halvings to reach a 1px level
        (u32::BITS - (max_dim - 1).leading_zeros()).min(31)
    }
}

/// How to retrieve one page image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageDescriptor {
    /// The page is a single image at a known URL
    DirectImage {
        /// Image URL
        url: String,
        /// Referer header required by some archives
        referer: Option<String>,
        /// Additional headers (name, value) required by the source
        headers: Vec<(String, String)>,
    },
    /// The page must be reconstructed from a tile pyramid
    Tiled(TiledPyramid),
}

impl PageDescriptor {
    /// URL used for logging and error reporting
    pub fn display_url(&self) -> &str {
        match self {
            PageDescriptor::DirectImage { url, .. } => url,
            PageDescriptor::Tiled(pyramid) => &pyramid.base_url,
        }
    }
}

/// A resolved manuscript: an ordered list of page descriptors
///
/// Manifests are immutable once constructed. A manifest with zero pages is a
/// resolution failure, never a valid value; construction enforces this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// The source URL this manifest was resolved from
    pub source_url: String,
    /// Human-readable title for logs and events
    pub display_name: String,
    /// Page descriptors in reading order
    pub pages: Vec<PageDescriptor>,
    /// When the manifest was resolved
    pub resolved_at: DateTime<Utc>,
}

impl Manifest {
    /// Construct a manifest, rejecting zero-page resolutions
    pub fn new(
        source_url: impl Into<String>,
        display_name: impl Into<String>,
        pages: Vec<PageDescriptor>,
    ) -> Result<Self> {
        let source_url = source_url.into();
        if pages.is_empty() {
            return Err(Error::EmptyManifest { url: source_url });
        }
        Ok(Self {
            source_url,
            display_name: display_name.into(),
            pages,
            resolved_at: Utc::now(),
        })
    }

    /// Total number of pages
    pub fn total_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Look up a page by its 1-based page number
    pub fn page(&self, number: u32) -> Option<&PageDescriptor> {
        if number == 0 {
            return None;
        }
        self.pages.get((number - 1) as usize)
    }
}

/// Fine-grained status carried by a [`ProgressEvent`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageEventStatus {
    /// A worker picked the page up
    Started,
    /// Bytes arrived for the page; `bytes_transferred` is the chunk delta
    Bytes,
    /// An attempt failed with a transient error and will be retried
    Retrying,
    /// The page reached a terminal success state
    Succeeded,
    /// The page failed permanently after exhausting its retry budget
    FailedFatal,
}

/// One event on a job's progress channel
///
/// Byte accounting flows exclusively through `Bytes` events (chunk deltas);
/// terminal events carry `bytes_transferred = 0` so bytes are never counted
/// twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 1-based index of the part the page belongs to
    pub part_index: u32,
    /// 1-based page number
    pub page_number: u32,
    /// Bytes transferred since the previous event for this page
    pub bytes_transferred: u64,
    /// What happened
    pub status: PageEventStatus,
}

/// A successfully downloaded page image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page number
    pub page_number: u32,
    /// Encoded image bytes (JPEG for tiled pages, server bytes for direct pages)
    pub bytes: Vec<u8>,
}

/// A page that failed permanently within a part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    /// 1-based page number
    pub page_number: u32,
    /// Rendered error message of the final attempt
    pub error: String,
}

/// Outcome of one part
#[derive(Clone, Debug)]
pub struct PartResult {
    /// 1-based part index
    pub part_index: u32,
    /// Number of pages that reached the Succeeded state
    pub succeeded_pages: u32,
    /// Pages that failed permanently, in page order
    pub fatal_failures: Vec<PageFailure>,
    /// Successful page images, ordered by page number
    pub pages: Vec<PageImage>,
}

/// Outcome of a whole job
#[derive(Clone, Debug)]
pub struct JobResult {
    /// Identifier of the job
    pub job_id: JobId,
    /// Total pages that succeeded across all parts
    pub succeeded_pages: u32,
    /// Total pages that failed permanently across all parts
    pub fatal_failures: u32,
    /// Per-part results in part order
    pub parts: Vec<PartResult>,
    /// True if the job was cancelled before all parts completed
    pub cancelled: bool,
}

/// Coarse lifecycle events broadcast to all subscribers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job was accepted and planned
    JobQueued {
        /// Identifier of the job
        job_id: JobId,
        /// Manifest display name
        display_name: String,
        /// Total pages across the whole job
        total_pages: u32,
        /// Number of parts the job was split into
        parts: u32,
    },
    /// A part started downloading
    PartStarted {
        /// Identifier of the job
        job_id: JobId,
        /// 1-based part index
        part_index: u32,
        /// First page of the part (inclusive)
        start_page: u32,
        /// Last page of the part (inclusive)
        end_page: u32,
    },
    /// Periodic progress snapshot
    Progress {
        /// Identifier of the job
        job_id: JobId,
        /// Pages in a terminal state (succeeded or failed fatally)
        completed_pages: u32,
        /// Total pages across the whole job
        total_pages: u32,
        /// Completion percentage, monotonically non-decreasing
        percentage: f32,
        /// Bytes transferred so far, including in-flight pages
        bytes_transferred: u64,
        /// Estimated seconds to completion, when computable
        eta_seconds: Option<u64>,
    },
    /// No progress event has arrived for the stall window while work remains
    Stalled {
        /// Identifier of the job
        job_id: JobId,
        /// Milliseconds since the last progress event
        quiet_ms: u64,
    },
    /// A part finished (all of its pages are terminal)
    PartComplete {
        /// Identifier of the job
        job_id: JobId,
        /// 1-based part index
        part_index: u32,
        /// Pages that succeeded in this part
        succeeded_pages: u32,
        /// Pages that failed permanently in this part
        fatal_failures: u32,
    },
    /// All parts finished
    JobComplete {
        /// Identifier of the job
        job_id: JobId,
        /// Pages that succeeded across the job
        succeeded_pages: u32,
        /// Pages that failed permanently across the job
        fatal_failures: u32,
    },
    /// The job was cancelled; completed pages are preserved in the result
    JobCancelled {
        /// Identifier of the job
        job_id: JobId,
    },
}
