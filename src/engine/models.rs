use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock slack granted on top of the declared CPU time limit.
pub const WALL_TIME_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompilationError,
    #[serde(rename = "PE")]
    Pending,
    #[serde(rename = "IE")]
    InternalError,
}

impl Verdict {
    pub const ALL: [Verdict; 8] = [
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::TimeLimitExceeded,
        Verdict::MemoryLimitExceeded,
        Verdict::RuntimeError,
        Verdict::CompilationError,
        Verdict::Pending,
        Verdict::InternalError,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::RuntimeError => "RE",
            Verdict::CompilationError => "CE",
            Verdict::Pending => "PE",
            Verdict::InternalError => "IE",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Verdict::Accepted => 0,
            Verdict::WrongAnswer => 1,
            Verdict::TimeLimitExceeded => 2,
            Verdict::MemoryLimitExceeded => 3,
            Verdict::RuntimeError => 4,
            Verdict::CompilationError => 5,
            Verdict::Pending => 6,
            Verdict::InternalError => 7,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle of a submission record. `Judged` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    InProgress,
    Judged(Verdict),
}

impl SubmissionStatus {
    pub fn verdict(&self) -> Verdict {
        match self {
            SubmissionStatus::Pending | SubmissionStatus::InProgress => Verdict::Pending,
            SubmissionStatus::Judged(verdict) => *verdict,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Judged(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: i64,
    pub problem_id: i64,
    pub language: String,
    pub source_code: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub status: SubmissionStatus,
    pub execution_time_ms: Option<u64>,
    pub memory_usage_kb: Option<u64>,
    pub test_cases_run: u32,
    pub total_test_cases: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn report(&self) -> VerdictReport {
        VerdictReport {
            submission_id: self.id,
            verdict: self.status.verdict(),
            execution_time_ms: self.execution_time_ms,
            memory_usage_kb: self.memory_usage_kb,
            test_cases_run: self.test_cases_run,
            total_test_cases: self.total_test_cases,
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub sample: bool,
}

/// Coarse classification of one sandboxed process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Ok,
    Timeout,
    Signaled,
    RuntimeError,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,
    pub exit_code: i32,
    pub time_ms: u64,
    /// `None` when the sandbox variant cannot measure memory.
    pub memory_kb: Option<u64>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecStatus::Ok && self.exit_code == 0
    }
}

/// Per-process limits handed to the sandbox for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
    pub max_file_size_kb: u64,
}

impl RunLimits {
    pub fn normalized(mut self) -> Self {
        self.time_limit_ms = self.time_limit_ms.clamp(50, 120_000);
        self.memory_limit_mb = self.memory_limit_mb.clamp(4, 8192);
        self.max_processes = self.max_processes.clamp(1, 256);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 64 * 1024 * 1024);
        self.max_file_size_kb = self.max_file_size_kb.clamp(1, 1024 * 1024);
        self
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms.saturating_mul(WALL_TIME_FACTOR))
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024)
    }

    /// Hard ceiling handed to the kernel. It sits above the declared limit so a breach is
    /// observed as measured usage instead of an anonymous kill.
    pub fn enforced_memory_kb(&self) -> u64 {
        let declared = self.memory_limit_kb();
        declared.saturating_add(declared / 4)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Default,
    Low,
}

impl Priority {
    /// Drain order: highest class first.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Default, Priority::Low];

    pub fn queue_name(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::Default => 1,
            Priority::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown priority class: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgePayload {
    pub submission_id: Uuid,
    pub user_id: i64,
    pub problem_id: i64,
    pub language: String,
    pub source_code: String,
    /// Milliseconds.
    pub time_limit: u64,
    /// Megabytes.
    pub memory_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

/// Envelope for everything that travels through the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobMessage {
    #[serde(rename = "submission:judge")]
    Judge(JudgePayload),
    #[serde(rename = "system:ping")]
    Ping(PingPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub submission_id: Option<Uuid>,
    pub user_id: i64,
    pub problem_id: i64,
    pub language: String,
    pub source_code: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub priority: Priority,
}

/// One program against one input, answered synchronously and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub input: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

/// `verdict` is set only when the run failed; a clean run leaves comparison to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictReport {
    pub submission_id: Uuid,
    pub verdict: Verdict,
    pub execution_time_ms: Option<u64>,
    pub memory_usage_kb: Option<u64>,
    pub test_cases_run: u32,
    pub total_test_cases: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Terminal outcome of judging one submission, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub execution_time_ms: Option<u64>,
    pub memory_usage_kb: Option<u64>,
    pub test_cases_run: u32,
    pub total_test_cases: u32,
    pub error_message: Option<String>,
}

impl JudgeOutcome {
    pub fn failed(verdict: Verdict, message: impl Into<String>) -> Self {
        Self {
            verdict,
            execution_time_ms: None,
            memory_usage_kb: None,
            test_cases_run: 0,
            total_test_cases: 0,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_limits_to_safe_bounds() {
        let normalized = RunLimits {
            time_limit_ms: 1,
            memory_limit_mb: 1,
            max_processes: 999,
            max_output_bytes: 99,
            max_file_size_kb: 0,
        }
        .normalized();

        assert_eq!(normalized.time_limit_ms, 50);
        assert_eq!(normalized.memory_limit_mb, 4);
        assert_eq!(normalized.max_processes, 256);
        assert_eq!(normalized.max_output_bytes, 1024);
        assert_eq!(normalized.max_file_size_kb, 1);
    }

    #[test]
    fn wall_time_is_twice_the_cpu_limit() {
        let limits = RunLimits {
            time_limit_ms: 500,
            memory_limit_mb: 64,
            max_processes: 1,
            max_output_bytes: 4096,
            max_file_size_kb: 1024,
        };
        assert_eq!(limits.wall_time(), Duration::from_millis(1000));
        assert_eq!(limits.memory_limit_kb(), 64 * 1024);
    }

    #[test]
    fn verdicts_serialize_as_short_codes() {
        for verdict in Verdict::ALL {
            let encoded = serde_json::to_string(&verdict).unwrap();
            assert_eq!(encoded, format!("\"{}\"", verdict.code()));
        }
    }

    #[test]
    fn job_message_uses_typed_envelope() {
        let id = Uuid::new_v4();
        let message = JobMessage::Judge(JudgePayload {
            submission_id: id,
            user_id: 7,
            problem_id: 42,
            language: "python".to_string(),
            source_code: "print(1)".to_string(),
            time_limit: 1000,
            memory_limit: 256,
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "submission:judge");
        assert_eq!(value["payload"]["submission_id"], id.to_string());
        assert_eq!(value["payload"]["time_limit"], 1000);
        assert_eq!(value["payload"]["memory_limit"], 256);
    }

    #[test]
    fn status_maps_to_readback_verdict() {
        assert_eq!(SubmissionStatus::InProgress.verdict(), Verdict::Pending);
        assert_eq!(
            SubmissionStatus::Judged(Verdict::WrongAnswer).verdict(),
            Verdict::WrongAnswer
        );
        assert!(!SubmissionStatus::Pending.is_terminal());
        assert!(SubmissionStatus::Judged(Verdict::Accepted).is_terminal());
    }

    #[test]
    fn parses_priority_names() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Default);
    }
}
