use chrono::{DateTime, Utc};
use ledgerflow_core::{datetime_to_ns, ns_to_iso8601, PipelineTarget, TimeWindow};
use tracing::info;

use crate::error::EtlError;
use crate::joblog::JobLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub window: TimeWindow,
    /// No prior success exists: snapshot, restore and validation are skipped.
    pub is_initial: bool,
}

/// Continues exactly where the last success ended, or starts at `initial_start_ns`.
/// The end is capped at `now_ns` and never precedes the start.
pub fn plan_window(
    last_success_end_ns: Option<u64>,
    initial_start_ns: u64,
    window_size_ns: u64,
    now_ns: u64,
) -> WindowPlan {
    let start = last_success_end_ns.unwrap_or(initial_start_ns);
    let end = start.saturating_add(window_size_ns).min(now_ns);
    WindowPlan {
        window: TimeWindow::clamped(start, end),
        is_initial: last_success_end_ns.is_none(),
    }
}

pub struct WindowTracker {
    job_log: JobLog,
    initial_start_ns: u64,
    window_size_ns: u64,
}

impl WindowTracker {
    pub fn new(job_log: JobLog, initial_start_ns: u64, window_size_ns: u64) -> Self {
        Self {
            job_log,
            initial_start_ns,
            window_size_ns,
        }
    }

    pub async fn compute_window(&self, target: PipelineTarget) -> Result<WindowPlan, EtlError> {
        self.compute_window_at(target, Utc::now()).await
    }

    pub async fn compute_window_at(
        &self,
        target: PipelineTarget,
        now: DateTime<Utc>,
    ) -> Result<WindowPlan, EtlError> {
        let last = self
            .job_log
            .last_success(target)
            .await
            .map_err(EtlError::ResumeState)?;
        let last_end = last.map(|entry| entry.window.end_ns());
        let now_ns = datetime_to_ns(now);
        let plan = plan_window(last_end, self.initial_start_ns, self.window_size_ns, now_ns);

        match last_end {
            Some(end) => info!(pipeline = %target, resume_ns = end, "resuming from last successful window"),
            None => info!(pipeline = %target, start_ns = plan.window.start_ns(), "no previous job found; using initial start"),
        }
        if plan.window.start_ns().saturating_add(self.window_size_ns) > now_ns {
            info!(now = %ns_to_iso8601(now_ns), "capping window end to current time");
        }
        Ok(plan)
    }
}
