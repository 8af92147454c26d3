//! Size-aware download planning
//!
//! Splits a manuscript's page range into contiguous parts whose estimated
//! size stays under the configured threshold. The partition is exact: parts
//! cover `[1, total_pages]` with no gaps and no overlaps, which a validation
//! pass enforces before any plan is handed to the scheduler.

use crate::error::{Error, Result};

/// One contiguous slice of a manuscript's page range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadPart {
    /// 1-based part index
    pub index: u32,
    /// First page of the part (inclusive, 1-based)
    pub start_page: u32,
    /// Last page of the part (inclusive)
    pub end_page: u32,
}

impl DownloadPart {
    /// Number of pages in this part
    pub fn page_count(&self) -> u32 {
        self.end_page - self.start_page + 1
    }

    /// Whether a page number falls inside this part
    pub fn contains(&self, page: u32) -> bool {
        (self.start_page..=self.end_page).contains(&page)
    }
}

/// A validated split of a manuscript into download parts
#[derive(Clone, Debug)]
pub struct DownloadPlan {
    /// Total pages across the whole job
    pub total_pages: u32,
    /// Per-page size estimate the plan was computed from
    pub estimated_bytes_per_page: u64,
    /// Size threshold the plan was computed against
    pub size_threshold_bytes: u64,
    /// Parts in page order; always at least one
    pub parts: Vec<DownloadPart>,
}

impl DownloadPlan {
    /// Estimated total size of the job in bytes
    pub fn estimated_total_bytes(&self) -> u64 {
        u64::from(self.total_pages) * self.estimated_bytes_per_page
    }
}

/// Split `[1, total_pages]` into parts whose estimated size stays under
/// `size_threshold_bytes * safety_margin`.
///
/// Jobs that fit under the effective threshold produce a single part. Larger
/// jobs are split into `ceil(estimated_total / effective_threshold)` parts of
/// `ceil(total_pages / parts)` pages each; the final part absorbs the
/// remainder and may be smaller.
///
/// The returned plan has been checked against the exact-partition invariant;
/// a violation is a bug in this module and surfaces as
/// [`Error::PlanInvariant`], which aborts the job.
pub fn plan(
    total_pages: u32,
    bytes_per_page: u64,
    size_threshold_bytes: u64,
    safety_margin: f64,
) -> Result<DownloadPlan> {
    if total_pages == 0 {
        return Err(Error::PlanInvariant(
            "cannot plan a job with zero pages".to_string(),
        ));
    }
    if bytes_per_page == 0 || size_threshold_bytes == 0 {
        return Err(Error::PlanInvariant(format!(
            "size estimates must be positive (bytes_per_page={bytes_per_page}, \
             threshold={size_threshold_bytes})"
        )));
    }
    if !(safety_margin > 0.0 && safety_margin <= 1.0) {
        return Err(Error::PlanInvariant(format!(
            "safety_margin must be in (0, 1], got {safety_margin}"
        )));
    }

    let estimated_total = u64::from(total_pages) * bytes_per_page;
    let effective_threshold =
        ((size_threshold_bytes as f64 * safety_margin) as u64).max(1);

    let number_of_parts = if estimated_total <= effective_threshold {
        1
    } else {
        estimated_total.div_ceil(effective_threshold)
    };
    // More parts than pages would leave empty tails; one page per part is the floor
    let number_of_parts = (number_of_parts.min(u64::from(total_pages))) as u32;
    let pages_per_part = total_pages.div_ceil(number_of_parts);

    let mut parts = Vec::with_capacity(number_of_parts as usize);
    for i in 0..number_of_parts {
        let start_page = i * pages_per_part + 1;
        if start_page > total_pages {
            break;
        }
        let end_page = ((i + 1) * pages_per_part).min(total_pages);
        parts.push(DownloadPart {
            index: parts.len() as u32 + 1,
            start_page,
            end_page,
        });
    }

    let plan = DownloadPlan {
        total_pages,
        estimated_bytes_per_page: bytes_per_page,
        size_threshold_bytes,
        parts,
    };
    validate(&plan)?;

    tracing::debug!(
        total_pages,
        parts = plan.parts.len(),
        estimated_mb = estimated_total / (1024 * 1024),
        "planned download"
    );

    Ok(plan)
}

/// Check the exact-partition invariant: parts cover `[1, total_pages]`
/// contiguously with 1-based indices in order.
pub fn validate(plan: &DownloadPlan) -> Result<()> {
    let Some(first) = plan.parts.first() else {
        return Err(Error::PlanInvariant("plan has no parts".to_string()));
    };
    if first.start_page != 1 {
        return Err(Error::PlanInvariant(format!(
            "first part starts at page {}, expected 1",
            first.start_page
        )));
    }

    let mut expected_start = 1;
    for (i, part) in plan.parts.iter().enumerate() {
        let expected_index = i as u32 + 1;
        if part.index != expected_index {
            return Err(Error::PlanInvariant(format!(
                "part at position {i} has index {}, expected {expected_index}",
                part.index
            )));
        }
        if part.start_page != expected_start {
            return Err(Error::PlanInvariant(format!(
                "part {} starts at page {}, expected {expected_start} (gap or overlap)",
                part.index, part.start_page
            )));
        }
        if part.end_page < part.start_page {
            return Err(Error::PlanInvariant(format!(
                "part {} has empty range {}..={}",
                part.index, part.start_page, part.end_page
            )));
        }
        expected_start = part.end_page + 1;
    }

    let last_end = expected_start - 1;
    if last_end != plan.total_pages {
        return Err(Error::PlanInvariant(format!(
            "parts end at page {last_end}, expected {}",
            plan.total_pages
        )));
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn small_job_is_a_single_part() {
        let plan = plan(10, 5 * MB, 300 * MB, 1.0).unwrap();
        assert_eq!(plan.parts.len(), 1);
        assert_eq!(
            plan.parts[0],
            DownloadPart {
                index: 1,
                start_page: 1,
                end_page: 10
            }
        );
    }

    #[test]
    fn job_exactly_at_threshold_is_a_single_part() {
        // 60 pages x 5 MB = 300 MB, exactly the threshold
        let plan = plan(60, 5 * MB, 300 * MB, 1.0).unwrap();
        assert_eq!(plan.parts.len(), 1, "at-threshold jobs must not split");
    }

    #[test]
    fn large_manuscript_splits_as_expected() {
        // 278 pages x 15 MB = 4170 MB at a 300 MB threshold -> 14 parts of
        // up to 20 pages, final part absorbing the 18-page remainder
        let plan = plan(278, 15 * MB, 300 * MB, 1.0).unwrap();
        assert_eq!(plan.parts.len(), 14);
        assert_eq!(
            plan.parts[0],
            DownloadPart {
                index: 1,
                start_page: 1,
                end_page: 20
            }
        );
        assert_eq!(
            plan.parts[13],
            DownloadPart {
                index: 14,
                start_page: 261,
                end_page: 278
            }
        );
    }

    #[test]
    fn lower_safety_margin_produces_more_parts() {
        let full = plan(278, 15 * MB, 300 * MB, 1.0).unwrap();
        let margined = plan(278, 15 * MB, 300 * MB, 0.9).unwrap();
        assert!(
            margined.parts.len() > full.parts.len(),
            "a margin below 1 under-fills parts ({} vs {})",
            margined.parts.len(),
            full.parts.len()
        );
    }

    #[test]
    fn partition_invariant_holds_across_combinations() {
        let totals = [1_u32, 2, 7, 20, 99, 100, 101, 278, 1000, 4321];
        let page_sizes = [64 * 1024, MB, 8 * MB, 15 * MB, 500 * MB];
        let thresholds = [MB, 30 * MB, 300 * MB, 2048 * MB];
        let margins = [0.5, 0.9, 1.0];

        for &total in &totals {
            for &per_page in &page_sizes {
                for &threshold in &thresholds {
                    for &margin in &margins {
                        let plan = plan(total, per_page, threshold, margin)
                            .unwrap_or_else(|e| {
                                panic!("plan({total}, {per_page}, {threshold}, {margin}): {e}")
                            });

                        // Every page appears in exactly one part, in order
                        let mut expected = 1;
                        for part in &plan.parts {
                            assert_eq!(part.start_page, expected);
                            assert!(part.end_page >= part.start_page);
                            expected = part.end_page + 1;
                        }
                        assert_eq!(
                            expected - 1,
                            total,
                            "parts must cover exactly [1, {total}]"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn oversized_pages_never_produce_empty_parts() {
        // Each page is larger than the threshold: one page per part
        let plan = plan(5, 400 * MB, 300 * MB, 1.0).unwrap();
        assert_eq!(plan.parts.len(), 5);
        for part in &plan.parts {
            assert_eq!(part.page_count(), 1);
        }
    }

    #[test]
    fn zero_pages_is_an_invariant_error() {
        let err = plan(0, MB, 300 * MB, 1.0).unwrap_err();
        assert!(matches!(err, Error::PlanInvariant(_)));
    }

    #[test]
    fn zero_estimates_are_invariant_errors() {
        assert!(plan(10, 0, 300 * MB, 1.0).is_err());
        assert!(plan(10, MB, 0, 1.0).is_err());
        assert!(plan(10, MB, 300 * MB, 0.0).is_err());
        assert!(plan(10, MB, 300 * MB, 1.5).is_err());
    }

    #[test]
    fn validate_rejects_gap() {
        let bad = DownloadPlan {
            total_pages: 40,
            estimated_bytes_per_page: MB,
            size_threshold_bytes: 10 * MB,
            parts: vec![
                DownloadPart {
                    index: 1,
                    start_page: 1,
                    end_page: 20,
                },
                DownloadPart {
                    index: 2,
                    start_page: 22,
                    end_page: 40,
                },
            ],
        };
        let err = validate(&bad).unwrap_err();
        assert!(
            matches!(err, Error::PlanInvariant(_)),
            "a gap (page 21 missing) must be caught: {err:?}"
        );
    }

    #[test]
    fn validate_rejects_overlap() {
        let bad = DownloadPlan {
            total_pages: 40,
            estimated_bytes_per_page: MB,
            size_threshold_bytes: 10 * MB,
            parts: vec![
                DownloadPart {
                    index: 1,
                    start_page: 1,
                    end_page: 20,
                },
                DownloadPart {
                    index: 2,
                    start_page: 20,
                    end_page: 40,
                },
            ],
        };
        assert!(validate(&bad).is_err(), "page 20 in two parts must be caught");
    }

    #[test]
    fn validate_rejects_short_coverage() {
        let bad = DownloadPlan {
            total_pages: 40,
            estimated_bytes_per_page: MB,
            size_threshold_bytes: 10 * MB,
            parts: vec![DownloadPart {
                index: 1,
                start_page: 1,
                end_page: 39,
            }],
        };
        assert!(validate(&bad).is_err(), "missing final page must be caught");
    }

    #[test]
    fn part_contains_is_inclusive() {
        let part = DownloadPart {
            index: 2,
            start_page: 21,
            end_page: 40,
        };
        assert!(part.contains(21));
        assert!(part.contains(40));
        assert!(!part.contains(20));
        assert!(!part.contains(41));
        assert_eq!(part.page_count(), 20);
    }
}
