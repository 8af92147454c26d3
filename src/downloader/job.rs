//! Job orchestration: planning, sequential parts, progress pumping.

use super::ManuscriptDownloader;
use crate::error::{Error, Result};
use crate::planner;
use crate::progress::ProgressAggregator;
use crate::scheduler::{self, SchedulerContext};
use crate::types::{Event, JobId, JobResult, Manifest, ProgressEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How often the progress pump publishes a snapshot
const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// Handle for pausing, resuming, and cancelling one running job.
///
/// Cloneable; clones control the same job. Pause stops new pages from being
/// dequeued while in-flight transfers finish. Cancel aborts in-flight
/// transfers and makes the job return its partial result.
#[derive(Clone, Debug)]
pub struct JobControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl JobControl {
    /// Create a control handle in the running (unpaused) state
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause,
        }
    }

    /// Stop dequeuing new pages; in-flight transfers finish
    pub fn pause(&self) {
        // send_replace updates the value even with no live receivers, so
        // pausing before the job subscribes still takes effect
        self.pause.send_replace(true);
    }

    /// Resume dequeuing after a pause
    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    /// Cancel the job; completed pages survive in the result
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the job has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ManuscriptDownloader {
    /// Run a full download job for a resolved manifest.
    ///
    /// Plans the part split, then downloads the parts strictly one after
    /// another; pages only run concurrently within the active part. Lifecycle
    /// and progress events stream through [`subscribe`](Self::subscribe) for
    /// the duration of the job.
    ///
    /// Fatal page failures do not abort the job; they are reported in the
    /// result. The job ends early only on cancellation (returning everything
    /// downloaded so far) or on an internal invariant violation.
    pub async fn run_job(&self, manifest: Manifest, control: &JobControl) -> Result<JobResult> {
        let job_id = self.allocate_job_id();
        let tuning = self.config.tuning_for(&manifest.source_url);
        let total_pages = manifest.total_pages();

        let plan = planner::plan(
            total_pages,
            tuning.bytes_per_page,
            self.config.download.size_threshold_bytes,
            self.config.planner.safety_margin,
        )?;
        tracing::info!(
            %job_id,
            display_name = %manifest.display_name,
            total_pages,
            parts = plan.parts.len(),
            estimated_bytes = plan.estimated_total_bytes(),
            "job planned"
        );

        self.emit_event(Event::JobQueued {
            job_id,
            display_name: manifest.display_name.clone(),
            total_pages,
            parts: plan.parts.len() as u32,
        });

        let (progress_tx, progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let pump = tokio::spawn(pump_progress(
            job_id,
            total_pages,
            tuning.monitor.stall_window,
            progress_rx,
            self.event_tx.clone(),
        ));

        let ctx = SchedulerContext {
            fetcher: self.fetcher.clone(),
            tiles: self.tiles.clone(),
            tuning,
            events: progress_tx,
            cancel: control.cancel_token(),
            paused: control.pause_rx(),
        };

        let manifest = Arc::new(manifest);
        let mut parts = Vec::with_capacity(plan.parts.len());
        for part in &plan.parts {
            if control.is_cancelled() {
                break;
            }
            self.emit_event(Event::PartStarted {
                job_id,
                part_index: part.index,
                start_page: part.start_page,
                end_page: part.end_page,
            });

            let result = scheduler::run_part(&ctx, *part, manifest.clone()).await?;

            self.emit_event(Event::PartComplete {
                job_id,
                part_index: result.part_index,
                succeeded_pages: result.succeeded_pages,
                fatal_failures: result.fatal_failures.len() as u32,
            });
            parts.push(result);
        }

        // Close the progress channel so the pump drains and exits
        drop(ctx);
        pump.await
            .map_err(|e| Error::Other(format!("progress pump panicked: {e}")))?;

        let succeeded_pages = parts.iter().map(|p| p.succeeded_pages).sum();
        let fatal_failures = parts.iter().map(|p| p.fatal_failures.len() as u32).sum();
        let cancelled = control.is_cancelled();

        if cancelled {
            tracing::warn!(%job_id, succeeded_pages, "job cancelled");
            self.emit_event(Event::JobCancelled { job_id });
        } else {
            tracing::info!(%job_id, succeeded_pages, fatal_failures, "job complete");
            self.emit_event(Event::JobComplete {
                job_id,
                succeeded_pages,
                fatal_failures,
            });
        }

        Ok(JobResult {
            job_id,
            succeeded_pages,
            fatal_failures,
            parts,
            cancelled,
        })
    }
}

/// Fold page-level progress events into periodic job-level snapshots.
///
/// Runs until the job drops its event sender, then publishes one final
/// snapshot so subscribers always see the finished state. Stall detection
/// announces once per quiet episode and re-arms when bytes flow again.
async fn pump_progress(
    job_id: JobId,
    total_pages: u32,
    stall_window: Duration,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    broadcast_tx: broadcast::Sender<Event>,
) {
    let mut aggregator = ProgressAggregator::new(total_pages, stall_window);
    let mut interval = tokio::time::interval(PROGRESS_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stall_announced = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => aggregator.observe(&event),
                None => break,
            },
            _ = interval.tick() => {
                let snapshot = aggregator.snapshot();
                let _ = broadcast_tx.send(Event::Progress {
                    job_id,
                    completed_pages: snapshot.completed_pages,
                    total_pages: snapshot.total_pages,
                    percentage: snapshot.percentage,
                    bytes_transferred: snapshot.bytes_transferred,
                    eta_seconds: snapshot.eta.map(|d| d.as_secs()),
                });
                match snapshot.stalled_for {
                    Some(quiet) if !stall_announced => {
                        stall_announced = true;
                        let _ = broadcast_tx.send(Event::Stalled {
                            job_id,
                            quiet_ms: quiet.as_millis() as u64,
                        });
                    }
                    Some(_) => {}
                    None => stall_announced = false,
                }
            }
        }
    }

    let snapshot = aggregator.snapshot();
    let _ = broadcast_tx.send(Event::Progress {
        job_id,
        completed_pages: snapshot.completed_pages,
        total_pages: snapshot.total_pages,
        percentage: snapshot.percentage,
        bytes_transferred: snapshot.bytes_transferred,
        eta_seconds: None,
    });
}
