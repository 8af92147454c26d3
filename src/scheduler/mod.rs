//! Concurrent per-part download scheduling
//!
//! [`run_part`] drives one [`DownloadPart`] to completion: a fixed pool of
//! workers pulls page numbers from a shared queue seeded strictly with the
//! part's range, downloads each page (direct fetch or tile assembly), and
//! applies the retry policy with exponential backoff per page. Fatal page
//! failures are recorded and do not block the rest of the part; the part is
//! complete when every page is terminal.
//!
//! Cancellation aborts in-flight requests and stops dequeuing. Pausing only
//! stops dequeuing: attempts already in flight finish, and resuming picks up
//! the remaining pages.

mod state;

pub use state::TaskState;
use state::PartState;

use crate::config::ResolvedTuning;
use crate::error::{Error, Result};
use crate::fetch::{FetchOptions, Fetcher};
use crate::planner::DownloadPart;
use crate::retry::{self, RetryDisposition, Retryable};
use crate::tile::TileAssemblyEngine;
use crate::types::{
    Manifest, PageDescriptor, PageEventStatus, PageImage, PartResult, ProgressEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Everything a part's worker pool needs, bundled for one job
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    /// Shared HTTP fetcher (carries the global request cap)
    pub fetcher: Fetcher,
    /// Shared tile assembly engine (carries the level probe cache)
    pub tiles: TileAssemblyEngine,
    /// Effective per-source tuning for this job
    pub tuning: ResolvedTuning,
    /// The job's progress event channel
    pub events: mpsc::UnboundedSender<ProgressEvent>,
    /// Cancellation for the whole job
    pub cancel: CancellationToken,
    /// Pause gate: `true` stops dequeuing until it flips back
    pub paused: watch::Receiver<bool>,
}

/// Download every page of one part.
///
/// Returns the part's result once every page is terminal, or a partial
/// result if the job was cancelled (completed pages are preserved, pending
/// pages are left untouched). A part range that falls outside the manifest
/// is a plan invariant violation and aborts the job.
pub async fn run_part(
    ctx: &SchedulerContext,
    part: DownloadPart,
    manifest: Arc<Manifest>,
) -> Result<PartResult> {
    if part.start_page == 0
        || part.start_page > part.end_page
        || part.end_page > manifest.total_pages()
    {
        return Err(Error::PlanInvariant(format!(
            "part {} range {}..={} is outside the manifest's {} pages",
            part.index,
            part.start_page,
            part.end_page,
            manifest.total_pages()
        )));
    }

    let state = Arc::new(Mutex::new(PartState::new(&part)));
    let results: Arc<Mutex<BTreeMap<u32, Vec<u8>>>> = Arc::new(Mutex::new(BTreeMap::new()));

    let worker_count = ctx.tuning.concurrency.clamp(1, part.page_count() as usize);
    tracing::debug!(
        part = part.index,
        start = part.start_page,
        end = part.end_page,
        workers = worker_count,
        "starting part"
    );

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..worker_count {
        let fetcher = ctx.fetcher.clone();
        let tiles = ctx.tiles.clone();
        let tuning = ctx.tuning.clone();
        let events = ctx.events.clone();
        let cancel = ctx.cancel.clone();
        let mut paused = ctx.paused.clone();
        let manifest = manifest.clone();
        let state = state.clone();
        let results = results.clone();
        let part_index = part.index;

        workers.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if !wait_while_paused(&mut paused, &cancel).await {
                    break;
                }
                let next = { state.lock().await.next_pending() };
                let Some(page) = next else { break };
                let Some(descriptor) = manifest.page(page) else {
                    // Unreachable given the range check above
                    state
                        .lock()
                        .await
                        .mark_failed(page, "page missing from manifest".to_string());
                    continue;
                };

                match download_page(
                    &fetcher, &tiles, &tuning, &events, &cancel, part_index, page, descriptor,
                    &state,
                )
                .await
                {
                    Ok(bytes) => {
                        emit(&events, part_index, page, PageEventStatus::Succeeded);
                        results.lock().await.insert(page, bytes);
                        state.lock().await.mark_succeeded(page);
                    }
                    Err(Error::Cancelled) => {
                        state.lock().await.release(page);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            part = part_index,
                            page,
                            error = %e,
                            "page failed permanently"
                        );
                        emit(&events, part_index, page, PageEventStatus::FailedFatal);
                        state.lock().await.mark_failed(page, e.to_string());
                    }
                }
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        joined.map_err(|e| Error::Other(format!("download worker panicked: {e}")))?;
    }

    let state = state.lock().await;
    let mut results = results.lock().await;
    let pages = std::mem::take(&mut *results)
        .into_iter()
        .map(|(page_number, bytes)| PageImage { page_number, bytes })
        .collect();

    Ok(PartResult {
        part_index: part.index,
        succeeded_pages: state.succeeded_count(),
        fatal_failures: state.failures(),
        pages,
    })
}

/// One page, driven through the retry policy.
///
/// Emits a progress event for every attempt and every transient failure;
/// byte chunks stream through `Bytes` events while a transfer is in flight.
/// Stall retries get their own one-shot budget so a single slow response
/// never eats the transient budget.
#[allow(clippy::too_many_arguments)]
async fn download_page(
    fetcher: &Fetcher,
    tiles: &TileAssemblyEngine,
    tuning: &ResolvedTuning,
    events: &mpsc::UnboundedSender<ProgressEvent>,
    cancel: &CancellationToken,
    part_index: u32,
    page: u32,
    descriptor: &PageDescriptor,
    state: &Arc<Mutex<PartState>>,
) -> Result<Vec<u8>> {
    let sink: Arc<dyn Fn(u64) + Send + Sync> = {
        let events = events.clone();
        Arc::new(move |n| {
            let _ = events.send(ProgressEvent {
                part_index,
                page_number: page,
                bytes_transferred: n,
                status: PageEventStatus::Bytes,
            });
        })
    };

    let mut transient_retries = 0u32;
    let mut stall_retry_used = false;
    let mut total_retries = 0u32;

    loop {
        emit(events, part_index, page, PageEventStatus::Started);
        state.lock().await.note_attempt(page);

        let attempt = match descriptor {
            PageDescriptor::DirectImage {
                url,
                referer,
                headers,
            } => {
                let options = FetchOptions {
                    referer: referer.clone(),
                    headers: headers.clone(),
                };
                fetcher
                    .fetch_bytes(url, &options, &tuning.monitor, cancel, sink.as_ref())
                    .await
            }
            PageDescriptor::Tiled(pyramid) => {
                tiles
                    .assemble(page, pyramid, tuning, cancel, sink.clone())
                    .await
            }
        };

        let err = match attempt {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        let disposition = err.retry_disposition();
        let may_retry = match disposition {
            RetryDisposition::Retry => transient_retries < tuning.retry.max_attempts,
            RetryDisposition::RetryOnce => !stall_retry_used,
            RetryDisposition::Fatal => false,
        };
        if !may_retry {
            return Err(err);
        }
        match disposition {
            RetryDisposition::RetryOnce => stall_retry_used = true,
            _ => transient_retries += 1,
        }

        emit(events, part_index, page, PageEventStatus::Retrying);
        state.lock().await.note_retry(page, total_retries + 1);

        tracing::warn!(
            part = part_index,
            page,
            error = %err,
            retry = total_retries + 1,
            "page attempt failed, backing off"
        );

        let delay = retry::backoff_delay(&tuning.retry, total_retries);
        let delay = if tuning.retry.jitter {
            retry::add_jitter(delay)
        } else {
            delay
        };
        total_retries += 1;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn emit(
    events: &mpsc::UnboundedSender<ProgressEvent>,
    part_index: u32,
    page_number: u32,
    status: PageEventStatus,
) {
    let _ = events.send(ProgressEvent {
        part_index,
        page_number,
        bytes_transferred: 0,
        status,
    });
}

/// Block while the pause gate is up. Returns false if cancelled meanwhile.
async fn wait_while_paused(paused: &mut watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    while *paused.borrow() {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() {
                    // Control handle dropped while paused: nothing can
                    // resume us, so stop gating
                    return true;
                }
            }
        }
    }
    true
}
