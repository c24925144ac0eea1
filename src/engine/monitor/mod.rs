mod sample;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::engine::config::{MonitorConfig, MonitorThresholds};

pub use sample::{ResourceSnapshot, Sampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityViolation {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub severity: Severity,
    pub description: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub running: bool,
    pub snapshot: Option<ResourceSnapshot>,
    pub violations: Vec<SecurityViolation>,
}

/// A metric that breaches its threshold by this many points is critical.
const CRITICAL_PERCENT_MARGIN: f64 = 10.0;
/// Same, relative, for counts and ratios.
const CRITICAL_RELATIVE_MARGIN: f64 = 1.2;

struct MonitorState {
    sampler: Sampler,
    thresholds: MonitorThresholds,
    max_violations: usize,
    latest: RwLock<Option<ResourceSnapshot>>,
    violations: Mutex<VecDeque<SecurityViolation>>,
}

impl MonitorState {
    async fn tick(&self) -> std::io::Result<ResourceSnapshot> {
        let snapshot = self.sampler.sample().await?;
        let found = evaluate(&snapshot, &self.thresholds);
        if !found.is_empty() {
            let mut history = self.violations.lock().await;
            for violation in found {
                match violation.severity {
                    Severity::Critical => error!(
                        kind = violation.kind,
                        value = violation.value,
                        threshold = violation.threshold,
                        "{}",
                        violation.description
                    ),
                    Severity::Warning => warn!(
                        kind = violation.kind,
                        value = violation.value,
                        threshold = violation.threshold,
                        "{}",
                        violation.description
                    ),
                }
                if history.len() == self.max_violations {
                    history.pop_front();
                }
                history.push_back(violation);
            }
        }
        *self.latest.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Host-wide sampler running on its own ticker, independent of any submission.
pub struct ResourceMonitor {
    enabled: bool,
    interval: Duration,
    state: Arc<MonitorState>,
    running: Mutex<Option<RunningLoop>>,
}

impl ResourceMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            state: Arc::new(MonitorState {
                sampler: Sampler::new(config.proc_root.clone(), config.disk_path.clone()),
                thresholds: config.thresholds.clone(),
                max_violations: config.max_violations.max(1),
                latest: RwLock::new(None),
                violations: Mutex::new(VecDeque::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the loop. Calling it while running, or when disabled, does nothing.
    pub async fn start(&self) {
        if !self.enabled {
            info!("resource monitor disabled");
            return;
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (shutdown, mut stop) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = state.tick().await {
                            warn!(error = %err, "resource sample failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("resource monitor loop exited");
        });

        info!(interval_ms = interval.as_millis() as u64, "resource monitor started");
        *running = Some(RunningLoop { shutdown, handle });
    }

    /// Signals the loop and waits for it to exit. A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(err) = running.handle.await {
            warn!(error = %err, "resource monitor task ended abnormally");
        }
        info!("resource monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Takes one sample outside the ticker and records it like a regular tick.
    pub async fn sample_once(&self) -> std::io::Result<ResourceSnapshot> {
        self.state.tick().await
    }

    pub async fn snapshot(&self) -> Option<ResourceSnapshot> {
        self.state.latest.read().await.clone()
    }

    pub async fn violations(&self) -> Vec<SecurityViolation> {
        self.state.violations.lock().await.iter().cloned().collect()
    }

    pub async fn report(&self) -> MonitorReport {
        MonitorReport {
            running: self.is_running().await,
            snapshot: self.snapshot().await,
            violations: self.violations().await,
        }
    }
}

pub fn evaluate(snapshot: &ResourceSnapshot, thresholds: &MonitorThresholds) -> Vec<SecurityViolation> {
    let mut found = Vec::new();
    let mut percent = |kind: &'static str, label: &str, value: f64, limit: f64| {
        if value > limit {
            let severity = if value > limit + CRITICAL_PERCENT_MARGIN {
                Severity::Critical
            } else {
                Severity::Warning
            };
            found.push(violation(kind, severity, format!("{label} at {value:.1}% (threshold {limit:.1}%)"), value, limit));
        }
    };

    percent("memory_usage", "memory usage", snapshot.memory.used_percent, thresholds.memory_percent);
    if let Some(cpu) = snapshot.cpu.usage_percent {
        percent("cpu_usage", "cpu usage", cpu, thresholds.cpu_percent);
    }
    if let Some(disk) = &snapshot.disk {
        percent("disk_usage", "disk usage", disk.used_percent, thresholds.disk_percent);
        percent("inode_usage", "inode usage", disk.inode_percent, thresholds.inode_percent);
    }

    let load_per_core = snapshot.cpu.load1 / snapshot.cpu.cores.max(1) as f64;
    let counts = [
        ("load_average", "1-minute load per core", load_per_core, thresholds.load_per_core),
        (
            "process_count",
            "process count",
            snapshot.processes.count as f64,
            thresholds.max_processes as f64,
        ),
        (
            "open_files",
            "open file descriptors",
            snapshot.processes.open_files as f64,
            thresholds.max_open_files as f64,
        ),
    ];
    for (kind, label, value, limit) in counts {
        if value > limit {
            let severity = if value > limit * CRITICAL_RELATIVE_MARGIN {
                Severity::Critical
            } else {
                Severity::Warning
            };
            found.push(violation(kind, severity, format!("{label} is {value:.2} (threshold {limit:.2})"), value, limit));
        }
    }
    found
}

fn violation(
    kind: &'static str,
    severity: Severity,
    description: String,
    value: f64,
    threshold: f64,
) -> SecurityViolation {
    SecurityViolation {
        timestamp: Utc::now(),
        kind,
        severity,
        description,
        value,
        threshold,
    }
}
