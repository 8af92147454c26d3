//! Core downloader: manifest resolution, job orchestration, events.
//!
//! [`ManuscriptDownloader`] owns the shared pieces every job uses — the HTTP
//! fetcher with its global request cap, the tile assembly engine, the SQLite
//! manifest cache, and the event broadcast channel. Jobs themselves run
//! through [`ManuscriptDownloader::run_job`] in [`job`].

mod job;

pub use job::JobControl;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::tile::TileAssemblyEngine;
use crate::types::{Event, JobId, Manifest};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Capacity of the event broadcast channel; slow subscribers lag, they never
/// block downloads
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Resolves a source URL into a [`Manifest`].
///
/// Each supported archive supplies its own resolver; the downloader only
/// cares that a URL turns into an ordered list of page descriptors. Resolvers
/// are consulted on cache misses and their results are cached.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Resolve `url` into a manifest with at least one page
    async fn resolve(&self, url: &str) -> Result<Manifest>;
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone, Debug)]
pub struct ManuscriptDownloader {
    /// Manifest cache, public so callers can inspect or prune it
    pub db: Arc<Database>,
    pub(crate) config: Arc<Config>,
    pub(crate) fetcher: Fetcher,
    pub(crate) tiles: TileAssemblyEngine,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) next_job_id: Arc<AtomicU64>,
}

impl ManuscriptDownloader {
    /// Create a downloader from a validated configuration.
    ///
    /// Opens (or creates) the manifest cache database and builds the shared
    /// HTTP client. Fails if the configuration is invalid or the database
    /// cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;

        // No client-wide timeout: the escalating monitor in `fetch` owns all
        // timeout decisions per request
        let client = reqwest::Client::builder()
            .user_agent(config.download.user_agent.clone())
            .build()
            .map_err(Error::Network)?;
        let fetcher = Fetcher::new(client, config.download.global_request_limit);

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            tiles: TileAssemblyEngine::new(fetcher.clone()),
            fetcher,
            event_tx,
            next_job_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Subscribe to job lifecycle and progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Resolve a manifest, consulting the cache first.
    ///
    /// On a cache hit the resolver is not called. On a miss the resolver's
    /// manifest is cached before being returned; a resolver that produces
    /// zero pages is an error and nothing is cached.
    pub async fn resolve_manifest(
        &self,
        resolver: &dyn ManifestResolver,
        url: &str,
    ) -> Result<Manifest> {
        if let Some(cached) = self.db.get_manifest(url).await? {
            tracing::debug!(url, pages = cached.total_pages(), "manifest cache hit");
            return Ok(cached);
        }

        let manifest = resolver.resolve(url).await?;
        if manifest.pages.is_empty() {
            return Err(Error::EmptyManifest {
                url: url.to_string(),
            });
        }

        self.db.put_manifest(&manifest).await?;
        tracing::info!(
            url,
            pages = manifest.total_pages(),
            display_name = %manifest.display_name,
            "manifest resolved and cached"
        );
        Ok(manifest)
    }

    /// Mark a cached manifest stale so the next resolve hits the source again.
    ///
    /// Returns true if an entry was invalidated. Only the named entry is
    /// touched; sibling entries and the cache schema are unaffected.
    pub async fn invalidate_manifest(&self, url: &str) -> Result<bool> {
        self.db.invalidate_manifest(url).await
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // Ignore send errors: no subscribers is a valid state
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn allocate_job_id(&self) -> JobId {
        JobId::new(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }
}
