//! Tile-based page reconstruction
//!
//! The [`TileAssemblyEngine`] turns a [`TiledPyramid`] descriptor into one
//! encoded page image: it resolves which pyramid level the server actually
//! serves (probed once per source, cached), fetches the level's tiles with
//! bounded concurrency and the standard retry discipline, stitches them onto
//! an RGB canvas one decode at a time, and encodes the canvas as JPEG.
//!
//! A page is all-or-nothing: any tile that fails permanently fails the whole
//! page, so no partial rasters ever reach the caller.

pub mod grid;

use crate::config::ResolvedTuning;
use crate::error::{Error, Result};
use crate::fetch::{FetchOptions, Fetcher, ignore_bytes};
use crate::retry::fetch_with_retry;
use crate::types::TiledPyramid;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

pub use grid::{TileGrid, grid_for, level_dimensions, tile_url};

/// Reconstructs pages from tile pyramids
///
/// Cheap to clone; the level cache and HTTP client are shared.
#[derive(Clone, Debug)]
pub struct TileAssemblyEngine {
    fetcher: Fetcher,
    // Per-source level offset: 0 if the source serves its top level,
    // 1 if it only serves the level below. Keyed by host.
    level_offsets: Arc<Mutex<HashMap<String, u32>>>,
}

impl TileAssemblyEngine {
    /// Create an engine on top of a shared [`Fetcher`]
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            level_offsets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Download and stitch one page, returning encoded JPEG bytes.
    ///
    /// `on_bytes` receives chunk sizes from every tile transfer, so byte
    /// progress is visible while the page is still in flight.
    pub async fn assemble(
        &self,
        page_number: u32,
        pyramid: &TiledPyramid,
        tuning: &ResolvedTuning,
        cancel: &CancellationToken,
        on_bytes: Arc<dyn Fn(u64) + Send + Sync>,
    ) -> Result<Vec<u8>> {
        if pyramid.tile_size == 0 || pyramid.full_width == 0 || pyramid.full_height == 0 {
            return Err(Error::TileAssembly {
                page: page_number,
                reason: format!(
                    "descriptor has degenerate geometry ({}x{}, tile {})",
                    pyramid.full_width, pyramid.full_height, pyramid.tile_size
                ),
            });
        }

        let level = self.resolve_level(pyramid, tuning, cancel).await?;
        let grid = grid::grid_for(pyramid, level);
        let (canvas_w, canvas_h) = grid::level_dimensions(pyramid, level);

        tracing::debug!(
            page = page_number,
            level,
            columns = grid.columns,
            rows = grid.rows,
            "assembling tiled page"
        );

        // Tiles are fetched concurrently but decoded and blitted one at a
        // time, so at most one decoded tile is held alongside the canvas.
        let page_cancel = cancel.child_token();
        let permits = Arc::new(Semaphore::new(tuning.tile_concurrency.max(1)));
        let (tile_tx, mut tile_rx) =
            mpsc::channel::<(u32, u32, Result<Vec<u8>>)>(tuning.tile_concurrency.max(1));

        let mut handles = Vec::with_capacity(grid.tile_count() as usize);
        for row in 0..grid.rows {
            for col in 0..grid.columns {
                let url = grid::tile_url(pyramid, level, col, row);
                let fetcher = self.fetcher.clone();
                let retry = tuning.retry.clone();
                let monitor = tuning.monitor.clone();
                let token = page_cancel.clone();
                let on_bytes = on_bytes.clone();
                let permits = permits.clone();
                let tx = tile_tx.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let options = FetchOptions::default();
                    let result = fetch_with_retry(&retry, || {
                        fetcher.fetch_bytes(&url, &options, &monitor, &token, on_bytes.as_ref())
                    })
                    .await;
                    let _ = tx.send((col, row, result)).await;
                }));
            }
        }
        drop(tile_tx);

        let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, Rgb([255, 255, 255]));
        let mut placed = 0u32;
        let mut first_error: Option<Error> = None;

        while let Some((col, row, result)) = tile_rx.recv().await {
            if first_error.is_some() {
                continue;
            }
            match result {
                Ok(bytes) => {
                    let decoded = match image::load_from_memory(&bytes) {
                        Ok(img) => img,
                        Err(e) => {
                            first_error = Some(Error::TileAssembly {
                                page: page_number,
                                reason: format!("tile ({col}, {row}) failed to decode: {e}"),
                            });
                            page_cancel.cancel();
                            continue;
                        }
                    };
                    if let Err(reason) = grid::blit_tile(&mut canvas, &decoded, pyramid, col, row)
                    {
                        first_error = Some(Error::TileAssembly {
                            page: page_number,
                            reason,
                        });
                        page_cancel.cancel();
                        continue;
                    }
                    placed += 1;
                }
                Err(e) => {
                    first_error = Some(e);
                    page_cancel.cancel();
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        if let Some(e) = first_error {
            // A tile cancelled by the job token reports as a plain cancel
            return Err(if cancel.is_cancelled() { Error::Cancelled } else { e });
        }
        if placed != grid.tile_count() {
            return Err(Error::TileAssembly {
                page: page_number,
                reason: format!("placed {placed} of {} tiles", grid.tile_count()),
            });
        }

        let quality = tuning.jpeg_quality;
        let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::new();
            let encoder = JpegEncoder::new_with_quality(&mut out, quality);
            canvas.write_with_encoder(encoder)?;
            Ok(out)
        })
        .await
        .map_err(|e| Error::Other(format!("JPEG encode task failed: {e}")))??;

        Ok(encoded)
    }

    /// Resolve which level the source serves, probing at most once per host.
    ///
    /// The probe fetches tile (0, 0) of the full-resolution level; a
    /// permanent rejection there falls back to the next-lower level, which
    /// must answer for the source to be usable at all.
    async fn resolve_level(
        &self,
        pyramid: &TiledPyramid,
        tuning: &ResolvedTuning,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let key = host_key(&pyramid.base_url);
        let top = pyramid.full_resolution_level();

        if let Some(&offset) = self.level_offsets.lock().await.get(&key) {
            return Ok(top.saturating_sub(offset));
        }

        let options = FetchOptions::default();
        let probe_url = grid::tile_url(pyramid, top, 0, 0);
        let offset = match fetch_with_retry(&tuning.retry, || {
            self.fetcher
                .fetch_bytes(&probe_url, &options, &tuning.monitor, cancel, &ignore_bytes)
        })
        .await
        {
            Ok(_) => 0,
            Err(Error::ServerRejected { .. }) if top > 0 => {
                let fallback_url = grid::tile_url(pyramid, top - 1, 0, 0);
                fetch_with_retry(&tuning.retry, || {
                    self.fetcher.fetch_bytes(
                        &fallback_url,
                        &options,
                        &tuning.monitor,
                        cancel,
                        &ignore_bytes,
                    )
                })
                .await?;
                tracing::warn!(
                    host = %key,
                    top_level = top,
                    "source does not serve its top pyramid level, using the level below"
                );
                1
            }
            Err(e) => return Err(e),
        };

        self.level_offsets.lock().await.insert(key, offset);
        Ok(top - offset)
    }
}

fn host_key(base_url: &str) -> String {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| base_url.to_string())
}
