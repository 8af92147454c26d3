//! Per-part page bookkeeping
//!
//! [`PartState`] holds the shared pending queue workers pull from and the
//! per-page state machine: `Pending → InFlight → Succeeded`, with transient
//! failures looping back through `FailedRetryable` until the retry budget is
//! spent and the page lands in `FailedFatal`. The queue is seeded exclusively
//! from the part's page range, so a worker can never pick up a page that
//! belongs to a different part.

use crate::planner::DownloadPart;
use crate::types::PageFailure;
use std::collections::{BTreeMap, VecDeque};

/// Lifecycle of one page within a part
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the part's queue
    Pending,
    /// A worker is downloading the page
    InFlight,
    /// The last attempt failed with a transient error; a retry is scheduled
    FailedRetryable {
        /// Attempts made so far
        attempts: u32,
    },
    /// Terminal: the page downloaded and assembled successfully
    Succeeded,
    /// Terminal: the retry budget is exhausted or the error was permanent
    FailedFatal {
        /// Rendered error of the final attempt
        error: String,
    },
}

impl TaskState {
    /// Whether the page has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedFatal { .. })
    }
}

/// Shared bookkeeping for one part's worker pool
#[derive(Debug)]
pub(crate) struct PartState {
    pending: VecDeque<u32>,
    states: BTreeMap<u32, TaskState>,
}

impl PartState {
    pub(crate) fn new(part: &DownloadPart) -> Self {
        let pending: VecDeque<u32> = (part.start_page..=part.end_page).collect();
        let states = pending
            .iter()
            .map(|&page| (page, TaskState::Pending))
            .collect();
        Self { pending, states }
    }

    /// Pop the next pending page and mark it in flight
    pub(crate) fn next_pending(&mut self) -> Option<u32> {
        let page = self.pending.pop_front()?;
        self.states.insert(page, TaskState::InFlight);
        Some(page)
    }

    /// Record a transient failure; the owning worker retries the page itself,
    /// so it does not return to the queue
    pub(crate) fn note_retry(&mut self, page: u32, attempts: u32) {
        self.states
            .insert(page, TaskState::FailedRetryable { attempts });
    }

    /// The owning worker is starting another attempt
    pub(crate) fn note_attempt(&mut self, page: u32) {
        self.states.insert(page, TaskState::InFlight);
    }

    pub(crate) fn mark_succeeded(&mut self, page: u32) {
        self.states.insert(page, TaskState::Succeeded);
    }

    pub(crate) fn mark_failed(&mut self, page: u32, error: String) {
        self.states.insert(page, TaskState::FailedFatal { error });
    }

    /// Return an in-flight page to pending (cancellation path)
    pub(crate) fn release(&mut self, page: u32) {
        self.states.insert(page, TaskState::Pending);
        self.pending.push_back(page);
    }

    pub(crate) fn succeeded_count(&self) -> u32 {
        self.states
            .values()
            .filter(|s| matches!(s, TaskState::Succeeded))
            .count() as u32
    }

    /// Fatal failures in page order
    pub(crate) fn failures(&self) -> Vec<PageFailure> {
        self.states
            .iter()
            .filter_map(|(&page, state)| match state {
                TaskState::FailedFatal { error } => Some(PageFailure {
                    page_number: page,
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Whether every page of the part is terminal
    pub(crate) fn is_complete(&self) -> bool {
        self.states.values().all(TaskState::is_terminal)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn part(start: u32, end: u32) -> DownloadPart {
        DownloadPart {
            index: 1,
            start_page: start,
            end_page: end,
        }
    }

    #[test]
    fn queue_is_seeded_with_exactly_the_part_range() {
        let mut state = PartState::new(&part(21, 40));
        let mut seen = Vec::new();
        while let Some(page) = state.next_pending() {
            seen.push(page);
        }
        assert_eq!(seen, (21..=40).collect::<Vec<_>>());
    }

    #[test]
    fn lifecycle_reaches_completion() {
        let mut state = PartState::new(&part(1, 3));
        assert!(!state.is_complete());

        let p1 = state.next_pending().unwrap();
        state.note_retry(p1, 1);
        state.note_attempt(p1);
        state.mark_succeeded(p1);

        let p2 = state.next_pending().unwrap();
        state.mark_failed(p2, "server rejected (404)".to_string());

        let p3 = state.next_pending().unwrap();
        state.mark_succeeded(p3);

        assert!(state.is_complete(), "terminal on every page means complete");
        assert_eq!(state.succeeded_count(), 2);
        let failures = state.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].page_number, p2);
    }

    #[test]
    fn released_pages_come_back_pending() {
        let mut state = PartState::new(&part(5, 6));
        let page = state.next_pending().unwrap();
        state.release(page);

        assert!(!state.is_complete());
        let again = state.next_pending().unwrap();
        let other = state.next_pending().unwrap();
        assert_eq!(
            {
                let mut v = vec![again, other];
                v.sort_unstable();
                v
            },
            vec![5, 6],
            "a released page must be handed out again"
        );
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(
            TaskState::FailedFatal {
                error: "x".to_string()
            }
            .is_terminal()
        );
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::InFlight.is_terminal());
        assert!(!TaskState::FailedRetryable { attempts: 2 }.is_terminal());
    }
}
