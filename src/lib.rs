//! # manuscript-dl
//!
//! Backend library for downloading digitized manuscripts from online
//! archives.
//!
//! A manuscript is resolved into a [`Manifest`] of page descriptors — plain
//! image URLs or tiled image pyramids (DZI, Zoomify) that have to be fetched
//! tile by tile and stitched back into full pages. Large jobs are split into
//! size-bounded parts, downloaded one part at a time with bounded
//! concurrency inside each part.
//!
//! ## Design Philosophy
//!
//! manuscript-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Resilient** - Escalating timeouts, per-page retry budgets, and fatal
//!   failures that never take down the rest of a job
//!
//! ## Quick Start
//!
//! ```no_run
//! use manuscript_dl::{Config, JobControl, ManuscriptDownloader};
//!
//! # async fn example(resolver: &dyn manuscript_dl::ManifestResolver) -> manuscript_dl::Result<()> {
//! let downloader = ManuscriptDownloader::new(Config::default()).await?;
//!
//! // Subscribe to events
//! let mut events = downloader.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let manifest = downloader
//!     .resolve_manifest(resolver, "https://archive.example/ms/42")
//!     .await?;
//! let result = downloader.run_job(manifest, &JobControl::new()).await?;
//! println!("{} pages downloaded", result.succeeded_pages);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Manifest cache persistence layer
pub mod db;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// HTTP fetching with escalating timeouts
pub mod fetch;
/// Size-aware part planning
pub mod planner;
/// Progress aggregation and stall detection
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// Concurrent per-part scheduling
pub mod scheduler;
/// Tile pyramid reconstruction
pub mod tile;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, ResolvedTuning, SourceTuning};
pub use db::Database;
pub use downloader::{JobControl, ManifestResolver, ManuscriptDownloader};
pub use error::{CacheError, Error, Result};
pub use planner::{DownloadPart, DownloadPlan};
pub use progress::{ProgressAggregator, ProgressSnapshot};
pub use tile::TileAssemblyEngine;
pub use types::{
    Event, JobId, JobResult, Manifest, PageDescriptor, PageFailure, PageImage, PartResult,
    TileKind, TiledPyramid,
};
