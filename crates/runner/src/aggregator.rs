//! Result aggregation
//!
//! The engine reports every test case as it finishes. Publishing each one
//! on its own would flood the process boundary, so results are queued and
//! folded into the run record in batches, at most once per flush interval.
//! The end of a run forces a final flush so nothing is left in the queue.

use crate::engine::EngineReporter;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use storyrun_common::config::CoverageConfig;
use storyrun_common::{
    now_ms, AuxReport, CoverageStatus, CoverageSummary, EntryId, ErrorLike, RunEndReport, Status,
    StatusValue, Stores, StoryrunConfig, TestCaseReport, TestState,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const COMPONENT_TEST_TITLE: &str = "Component tests";
const A11Y_TITLE: &str = "Accessibility tests";

/// One queued test case result
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResult {
    pub entry_id: EntryId,
    pub state: TestState,
    pub errors: Vec<ErrorLike>,
    pub reports: Vec<AuxReport>,
}

/// Trailing-edge batching of results
///
/// At most one flush is scheduled at a time, never earlier than one
/// interval after the previous flush.
#[derive(Debug)]
pub struct ResultBatcher {
    interval: Duration,
    pending: Vec<PendingResult>,
    last_flush: Option<Instant>,
    scheduled: Option<Instant>,
}

impl ResultBatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Vec::new(),
            last_flush: None,
            scheduled: None,
        }
    }

    /// Queue a result; returns the flush deadline if this push scheduled one
    pub fn push(&mut self, result: PendingResult, now: Instant) -> Option<Instant> {
        self.pending.push(result);
        if self.scheduled.is_some() {
            return None;
        }
        let deadline = self
            .last_flush
            .map_or(now, |last| last + self.interval)
            .max(now);
        self.scheduled = Some(deadline);
        Some(deadline)
    }

    /// Drain the queue if the scheduled flush is due
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<PendingResult>> {
        match self.scheduled {
            Some(deadline) if deadline <= now => Some(self.take_all(now)),
            _ => None,
        }
    }

    /// Drain the queue unconditionally
    pub fn take_all(&mut self, now: Instant) -> Vec<PendingResult> {
        self.scheduled = None;
        self.last_flush = Some(now);
        std::mem::take(&mut self.pending)
    }

    /// Forget queued results and any scheduled flush
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scheduled = None;
    }

    pub fn scheduled(&self) -> Option<Instant> {
        self.scheduled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Classify a statements coverage percentage against the watermarks
pub fn classify_coverage(statements_pct: f64, watermarks: &CoverageConfig) -> CoverageSummary {
    let percentage = statements_pct.round().clamp(0.0, 100.0) as u8;
    let status = if percentage < watermarks.low_watermark {
        CoverageStatus::Negative
    } else if percentage < watermarks.high_watermark {
        CoverageStatus::Warning
    } else {
        CoverageStatus::Positive
    };
    CoverageSummary { percentage, status }
}

/// Folds engine results into the run-state and status channels
pub struct ResultAggregator {
    stores: Stores,
    watermarks: CoverageConfig,
    batcher: Mutex<ResultBatcher>,
    this: Weak<ResultAggregator>,
}

impl ResultAggregator {
    pub fn new(stores: Stores, config: &StoryrunConfig) -> Arc<Self> {
        let watermarks = config.coverage;
        let interval = config.flush_interval();
        Arc::new_cyclic(|this| Self {
            stores,
            watermarks,
            batcher: Mutex::new(ResultBatcher::new(interval)),
            this: this.clone(),
        })
    }

    /// Drop results still queued from a previous run
    pub fn reset(&self) {
        self.batcher.lock().reset();
    }

    /// Publish everything queued right away
    pub fn flush(&self) {
        let mut batcher = self.batcher.lock();
        let batch = batcher.take_all(Instant::now());
        self.publish(batch);
    }

    fn schedule(&self, deadline: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to schedule a result flush on, flushing now");
            self.flush();
            return;
        };
        let this = self.this.clone();
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(aggregator) = this.upgrade() {
                aggregator.flush_due();
            }
        });
    }

    fn flush_due(&self) {
        // A forced flush may already have drained the queue
        let mut batcher = self.batcher.lock();
        if let Some(batch) = batcher.take_due(Instant::now()) {
            self.publish(batch);
        }
    }

    /// Callers hold the batcher lock so batches land in drain order
    fn publish(&self, batch: Vec<PendingResult>) {
        if batch.is_empty() {
            return;
        }
        trace!("Flushing {} result(s)", batch.len());

        let state = self.stores.run_state.set_state(|state| {
            let run = &mut state.current_run;
            for result in &batch {
                match result.state {
                    TestState::Passed => run.component_test_count.success += 1,
                    TestState::Failed => run.component_test_count.error += 1,
                    _ => {}
                }
                for report in result.reports.iter().filter(|r| r.is_a11y()) {
                    match report.status {
                        TestState::Passed => run.a11y_count.success += 1,
                        TestState::Warning => run.a11y_count.warning += 1,
                        TestState::Failed => run.a11y_count.error += 1,
                        _ => {}
                    }
                }
            }
            let finished = run.component_test_count.finished();
            run.total_test_count = Some(run.total_test_count.map_or(finished, |t| t.max(finished)));
        });
        debug!(
            "Results: {} passed, {} failed of {:?}",
            state.current_run.component_test_count.success,
            state.current_run.component_test_count.error,
            state.current_run.total_test_count
        );

        let mut component = Vec::with_capacity(batch.len());
        let mut a11y = Vec::new();
        for result in batch {
            for report in result.reports.iter().filter(|r| r.is_a11y()) {
                a11y.push(Status {
                    entry_id: result.entry_id.clone(),
                    type_id: String::new(),
                    value: StatusValue::from(report.status),
                    title: A11Y_TITLE.to_string(),
                    description: String::new(),
                });
            }
            component.push(Status {
                description: describe_errors(&result.errors),
                entry_id: result.entry_id,
                type_id: String::new(),
                value: StatusValue::from(result.state),
                title: COMPONENT_TEST_TITLE.to_string(),
            });
        }
        self.stores.component_status().set(component);
        self.stores.a11y_status().set(a11y);
    }
}

fn describe_errors(errors: &[ErrorLike]) -> String {
    errors
        .iter()
        .map(|e| e.stack.clone().unwrap_or_else(|| e.to_string()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl EngineReporter for ResultAggregator {
    fn on_test_case_result(&self, report: TestCaseReport) {
        let Some(entry_id) = report.entry_id else {
            trace!("Ignoring test result without an entry id");
            return;
        };
        let result = PendingResult {
            entry_id,
            state: report.state,
            errors: report.errors,
            reports: report.reports,
        };
        let deadline = self.batcher.lock().push(result, Instant::now());
        if let Some(deadline) = deadline {
            self.schedule(deadline);
        }
    }

    fn on_run_end(&self, report: RunEndReport) {
        // Held until the record is final so a timer flush cannot land after it
        let mut batcher = self.batcher.lock();
        let batch = batcher.take_all(Instant::now());
        self.publish(batch);
        self.stores.run_state.set_state(|state| {
            let run = &mut state.current_run;
            run.total_test_count = Some(report.total_test_count);
            run.unhandled_errors = report.unhandled_errors;
            run.finished_at = Some(now_ms());
        });
    }

    fn on_coverage(&self, statements_pct: f64) {
        let focused = self.stores.run_state.state().current_run.entry_ids.is_some();
        if focused {
            debug!("Ignoring coverage of a focused run");
            return;
        }
        let summary = classify_coverage(statements_pct, &self.watermarks);
        self.stores
            .run_state
            .set_state(|state| state.current_run.coverage_summary = Some(summary));
    }
}
