//! Progress aggregation for one job
//!
//! A [`ProgressAggregator`] folds a job's stream of [`ProgressEvent`]s into a
//! completion snapshot. Only terminal outcomes (succeeded or failed-fatal)
//! count toward completion, so the percentage never moves backwards when an
//! in-flight page is retried. Byte counts are tracked separately and do
//! include in-flight transfers.
//!
//! One aggregator exists per job; it consumes that job's event channel and
//! holds no global state.

use crate::types::{PageEventStatus, ProgressEvent};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Point-in-time view of a job's progress
#[derive(Clone, Copy, Debug)]
pub struct ProgressSnapshot {
    /// Pages in a terminal state (succeeded or failed fatally)
    pub completed_pages: u32,
    /// Total pages across the whole job
    pub total_pages: u32,
    /// Completion percentage in `[0, 100]`, monotonically non-decreasing
    pub percentage: f32,
    /// Bytes transferred so far, including in-flight pages
    pub bytes_transferred: u64,
    /// Estimated time to completion, once at least one page is terminal
    pub eta: Option<Duration>,
    /// How long the job has been quiet, if past the stall window with work
    /// remaining
    pub stalled_for: Option<Duration>,
}

/// Folds progress events into completion, byte, ETA, and stall state
#[derive(Debug)]
pub struct ProgressAggregator {
    total_pages: u32,
    terminal: HashSet<u32>,
    bytes_transferred: u64,
    started_at: Instant,
    last_activity: Instant,
    stall_window: Duration,
}

impl ProgressAggregator {
    /// Create an aggregator for a job of `total_pages` pages
    pub fn new(total_pages: u32, stall_window: Duration) -> Self {
        let now = Instant::now();
        Self {
            total_pages,
            terminal: HashSet::new(),
            bytes_transferred: 0,
            started_at: now,
            last_activity: now,
            stall_window,
        }
    }

    /// Fold one event into the aggregate
    pub fn observe(&mut self, event: &ProgressEvent) {
        self.observe_at(event, Instant::now());
    }

    /// Fold one event, with an explicit clock reading
    pub fn observe_at(&mut self, event: &ProgressEvent, now: Instant) {
        self.last_activity = now;
        self.bytes_transferred += event.bytes_transferred;
        match event.status {
            PageEventStatus::Succeeded | PageEventStatus::FailedFatal => {
                // Duplicate terminal events for a page are idempotent
                self.terminal.insert(event.page_number);
            }
            PageEventStatus::Started | PageEventStatus::Bytes | PageEventStatus::Retrying => {}
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Snapshot with an explicit clock reading
    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let completed = self.terminal.len() as u32;
        let percentage = if self.total_pages == 0 {
            100.0
        } else {
            completed as f32 / self.total_pages as f32 * 100.0
        };

        let eta = if completed > 0 && completed < self.total_pages {
            let elapsed = now.saturating_duration_since(self.started_at);
            let per_page = elapsed.as_secs_f64() / f64::from(completed);
            let remaining = f64::from(self.total_pages - completed);
            Some(Duration::from_secs_f64(per_page * remaining))
        } else {
            None
        };

        let quiet = now.saturating_duration_since(self.last_activity);
        let stalled_for =
            (completed < self.total_pages && quiet >= self.stall_window).then_some(quiet);

        ProgressSnapshot {
            completed_pages: completed,
            total_pages: self.total_pages,
            percentage,
            bytes_transferred: self.bytes_transferred,
            eta,
            stalled_for,
        }
    }

    /// Whether every page is terminal
    pub fn is_complete(&self) -> bool {
        self.terminal.len() as u32 >= self.total_pages
    }
}
