use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub commands_executed: u64,
    pub approvals_granted: u64,
    pub approvals_rejected: u64,
    pub stage_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    /// Accumulates across resumed runs.
    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|snapshot| snapshot.total_duration_ms += duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_command(&self) {
        self.update(|snapshot| snapshot.commands_executed += 1);
    }

    pub fn record_approval(&self, granted: bool) {
        self.update(|snapshot| {
            if granted {
                snapshot.approvals_granted += 1;
            } else {
                snapshot.approvals_rejected += 1;
            }
        });
    }

    pub fn record_stage_failure(&self) {
        self.update(|snapshot| snapshot.stage_failures += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|snapshot| *snapshot = MetricsSnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        commands = snapshot.commands_executed,
        approvals_granted = snapshot.approvals_granted,
        approvals_rejected = snapshot.approvals_rejected,
        stage_failures = snapshot.stage_failures,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            (
                "devsecops_commands_executed_total",
                "Job commands executed",
                self.commands_executed,
            ),
            (
                "devsecops_approvals_granted_total",
                "Manual approvals granted",
                self.approvals_granted,
            ),
            (
                "devsecops_approvals_rejected_total",
                "Manual approvals rejected",
                self.approvals_rejected,
            ),
            (
                "devsecops_stage_failures_total",
                "Pipeline stages that failed",
                self.stage_failures,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }

        output.push_str("# HELP devsecops_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE devsecops_stage_calls_total counter\n");
        output.push_str(
            "# HELP devsecops_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE devsecops_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP devsecops_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE devsecops_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "devsecops_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "devsecops_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "devsecops_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP devsecops_pipeline_duration_seconds Total pipeline run duration\n");
        output.push_str("# TYPE devsecops_pipeline_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "devsecops_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_record_on_drop() {
        let metrics = MetricsCollector::new();
        {
            let _timer = metrics.start_stage("Source");
        }
        {
            let _timer = metrics.start_stage("Source");
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages["Source"].calls, 2);
    }

    #[test]
    fn prometheus_text_includes_counters_and_stages() {
        let metrics = MetricsCollector::new();
        metrics.record_command();
        metrics.record_approval(true);
        metrics.record_approval(false);
        drop(metrics.start_stage("Deploy"));

        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("devsecops_commands_executed_total 1"));
        assert!(text.contains("devsecops_approvals_granted_total 1"));
        assert!(text.contains("devsecops_approvals_rejected_total 1"));
        assert!(text.contains("devsecops_stage_calls_total{stage=\"Deploy\"} 1"));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
