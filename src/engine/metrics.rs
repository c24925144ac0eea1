use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::models::Verdict;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    started_total: AtomicU64,
    enqueue_failures_total: AtomicU64,
    verdicts: [AtomicU64; Verdict::ALL.len()],
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue_failed(&self) {
        self.enqueue_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self, verdict: Verdict) {
        self.verdicts[verdict.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed_count(&self, verdict: Verdict) -> u64 {
        self.verdicts[verdict.index()].load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = format!(
            concat!(
                "# TYPE judge_submitted_total counter\n",
                "judge_submitted_total {}\n",
                "# TYPE judge_started_total counter\n",
                "judge_started_total {}\n",
                "# TYPE judge_enqueue_failures_total counter\n",
                "judge_enqueue_failures_total {}\n",
                "# TYPE judge_completed_total counter\n",
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.enqueue_failures_total.load(Ordering::Relaxed),
        );
        for verdict in Verdict::ALL {
            out.push_str(&format!(
                "judge_completed_total{{verdict=\"{}\"}} {}\n",
                verdict.code(),
                self.completed_count(verdict)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_series_per_verdict() {
        let metrics = MetricsRegistry::new();
        metrics.submitted();
        metrics.completed(Verdict::Accepted);
        metrics.completed(Verdict::Accepted);
        metrics.completed(Verdict::TimeLimitExceeded);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_submitted_total 1\n"));
        assert!(rendered.contains("judge_completed_total{verdict=\"AC\"} 2\n"));
        assert!(rendered.contains("judge_completed_total{verdict=\"TLE\"} 1\n"));
        assert!(rendered.contains("judge_completed_total{verdict=\"IE\"} 0\n"));
    }
}
