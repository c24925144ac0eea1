use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{
    config::{JudgeConfig, SandboxConfig},
    error::JudgeError,
    evaluator::TestCaseManager,
    metrics::MetricsRegistry,
    models::{
        JobMessage, JudgeOutcome, JudgePayload, PingPayload, Priority, RunLimits, RunReport,
        RunRequest, SubmitRequest, SubmitResponse, Submission, SubmissionStatus, TestCase, Verdict,
        VerdictReport, WALL_TIME_FACTOR,
    },
    notify::VerdictNotifier,
    queue::{JobQueue, QueueDepths},
    sandbox::{self, LanguageProfile, LanguageTable, Sandbox, SandboxSession, SingleRun},
    security::{SecurityManager, SecurityStatus},
    store::{SubmissionStore, pending_record},
    testcases::TestCaseProvider,
};

/// Collaborators the service is wired with. Constructed once at start-up.
#[derive(Clone)]
pub struct ServiceDeps {
    pub store: Arc<dyn SubmissionStore>,
    pub queue: JobQueue,
    pub sandbox: Arc<dyn Sandbox>,
    pub security: Arc<SecurityManager>,
    pub languages: Arc<LanguageTable>,
    pub testcases: Arc<dyn TestCaseProvider>,
    pub notifier: Arc<dyn VerdictNotifier>,
    pub metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub backend: &'static str,
    pub depths: QueueDepths,
    pub workers: usize,
    pub per_job_ceiling_ms: u64,
    /// Upper bound on how long the last queued job waits for its verdict.
    pub max_time_to_verdict_ms: u64,
}

/// A failed pipeline stage, surfaced as InternalError.
struct StageFailure {
    stage: &'static str,
    message: String,
}

impl StageFailure {
    fn new(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

pub struct JudgingService {
    deps: ServiceDeps,
    evaluator: TestCaseManager,
    sandbox_config: SandboxConfig,
    workers: usize,
    max_source_bytes: usize,
    max_time_limit_ms: u64,
    max_memory_limit_mb: u64,
    verdict_bound_cases: u64,
    scratch_slot: u32,
    /// Single runs share one slot, so they go one at a time.
    scratch: Mutex<()>,
}

impl JudgingService {
    pub fn new(deps: ServiceDeps, config: &JudgeConfig) -> Self {
        Self {
            evaluator: TestCaseManager::new(deps.sandbox.clone(), &config.sandbox),
            deps,
            sandbox_config: config.sandbox.clone(),
            workers: config.workers.count.max(1),
            max_source_bytes: config.max_source_bytes,
            max_time_limit_ms: config.max_time_limit_ms,
            max_memory_limit_mb: config.max_memory_limit_mb,
            verdict_bound_cases: config.verdict_bound_cases.max(1),
            scratch_slot: config.workers.scratch_slot,
            scratch: Mutex::new(()),
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.deps.languages
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.deps.metrics
    }

    pub fn security_status(&self) -> SecurityStatus {
        self.deps.security.status()
    }

    fn validate(&self, request: &SubmitRequest) -> Result<(), JudgeError> {
        if !self.deps.languages.contains(&request.language) {
            return Err(JudgeError::UnsupportedLanguage(request.language.clone()));
        }
        self.validate_program(&request.source_code, request.time_limit_ms, request.memory_limit_mb)
    }

    fn validate_program(
        &self,
        source_code: &str,
        time_limit_ms: u64,
        memory_limit_mb: u64,
    ) -> Result<(), JudgeError> {
        if source_code.trim().is_empty() {
            return Err(JudgeError::InvalidRequest("source code is empty".to_string()));
        }
        if source_code.len() > self.max_source_bytes {
            return Err(JudgeError::InvalidRequest(format!(
                "source code exceeds {} bytes",
                self.max_source_bytes
            )));
        }
        if time_limit_ms == 0 || time_limit_ms > self.max_time_limit_ms {
            return Err(JudgeError::InvalidRequest(format!(
                "time_limit_ms must be between 1 and {}",
                self.max_time_limit_ms
            )));
        }
        if memory_limit_mb == 0 || memory_limit_mb > self.max_memory_limit_mb {
            return Err(JudgeError::InvalidRequest(format!(
                "memory_limit_mb must be between 1 and {}",
                self.max_memory_limit_mb
            )));
        }
        Ok(())
    }

    /// Persists (when needed) and enqueues a submission. Returns once the job is queued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, JudgeError> {
        self.validate(&request)?;

        let payload = JudgePayload {
            submission_id: request.submission_id.unwrap_or_else(Uuid::new_v4),
            user_id: request.user_id,
            problem_id: request.problem_id,
            language: request.language,
            source_code: request.source_code,
            time_limit: request.time_limit_ms,
            memory_limit: request.memory_limit_mb,
        };
        let id = payload.submission_id;
        if self.deps.store.get(id).await?.is_none() {
            self.deps.store.insert(pending_record(&payload)).await?;
        }
        self.deps.metrics.submitted();

        if let Err(err) = self
            .deps
            .queue
            .enqueue(request.priority, &JobMessage::Judge(payload))
            .await
        {
            self.deps.metrics.enqueue_failed();
            error!(submission_id = %id, stage = "enqueue", error = %err, "enqueue failed, marking submission");
            let outcome = JudgeOutcome::failed(Verdict::InternalError, format!("enqueue failed: {err}"));
            if let Err(store_err) = self.deps.store.finish(id, &outcome).await {
                error!(submission_id = %id, error = %store_err, "could not record enqueue failure");
            }
            return Err(err.into());
        }

        info!(submission_id = %id, queue = request.priority.queue_name(), "submission queued");
        Ok(SubmitResponse {
            submission_id: id,
            status: SubmissionStatus::Pending,
        })
    }

    /// Compiles and runs one program against one input on the scratch slot and answers
    /// directly. An unknown language comes back as a compilation error, not a rejection.
    pub async fn run_single(&self, request: RunRequest) -> Result<RunReport, JudgeError> {
        self.validate_program(&request.source_code, request.time_limit_ms, request.memory_limit_mb)?;
        if request.input.len() > self.max_source_bytes {
            return Err(JudgeError::InvalidRequest(format!(
                "input exceeds {} bytes",
                self.max_source_bytes
            )));
        }
        let run = SingleRun {
            slot: self.scratch_slot,
            limits: self.limits_for(request.time_limit_ms, request.memory_limit_mb),
            language: request.language,
            source_code: request.source_code,
            input: request.input,
        };

        let _turn = self.scratch.lock().await;
        let outcome = sandbox::compile_and_execute(
            self.deps.sandbox.as_ref(),
            &self.deps.security,
            &self.deps.languages,
            &self.sandbox_config,
            &run,
        )
        .await
        .map_err(|err| {
            error!(slot = run.slot, language = %run.language, error = %err, "single run failed");
            JudgeError::Internal(err.to_string())
        })?;
        let report = RunReport::from(outcome);
        info!(
            slot = run.slot,
            language = %run.language,
            verdict = report.verdict.map(|v| v.code()).unwrap_or("ok"),
            time_ms = ?report.time_ms,
            "single run finished"
        );
        Ok(report)
    }

    pub async fn ping(&self, priority: Priority) -> Result<Uuid, JudgeError> {
        let nonce = Uuid::new_v4();
        let message = JobMessage::Ping(PingPayload {
            nonce,
            enqueued_at: Utc::now(),
        });
        self.deps.queue.enqueue(priority, &message).await?;
        Ok(nonce)
    }

    pub async fn report(&self, id: Uuid) -> Result<VerdictReport, JudgeError> {
        let record = self.deps.store.get(id).await?.ok_or(JudgeError::NotFound)?;
        Ok(record.report())
    }

    /// Dispatches one dequeued job. `Ok` means the job may be acknowledged.
    pub async fn handle(&self, message: JobMessage, slot: u32) -> Result<(), JudgeError> {
        match message {
            JobMessage::Judge(payload) => self.handle_judge(payload, slot).await.map(|_| ()),
            JobMessage::Ping(ping) => {
                let latency_ms = (Utc::now() - ping.enqueued_at).num_milliseconds();
                info!(nonce = %ping.nonce, latency_ms, slot, "ping job handled");
                Ok(())
            }
        }
    }

    /// Runs the full pipeline for one submission and durably records the verdict.
    /// Safe to repeat for a redelivered job: the last terminal write wins.
    pub async fn handle_judge(&self, payload: JudgePayload, slot: u32) -> Result<Submission, JudgeError> {
        let id = payload.submission_id;
        match self.deps.store.get(id).await? {
            None => self.deps.store.insert(pending_record(&payload)).await?,
            Some(existing) if existing.status.is_terminal() => {
                info!(submission_id = %id, previous = %existing.status.verdict(), "judging a redelivered submission again");
            }
            Some(_) => {}
        }
        self.deps.store.mark_in_progress(id).await?;
        self.deps.metrics.started();
        info!(submission_id = %id, slot, language = %payload.language, "judging started");

        let outcome = match self.judge(&payload, slot).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                error!(
                    submission_id = %id,
                    stage = failure.stage,
                    slot,
                    error = %failure.message,
                    "judging failed"
                );
                JudgeOutcome::failed(
                    Verdict::InternalError,
                    format!("{}: {}", failure.stage, failure.message),
                )
            }
        };

        let record = self.deps.store.finish(id, &outcome).await?;
        self.deps.metrics.completed(outcome.verdict);
        info!(
            submission_id = %id,
            verdict = %outcome.verdict,
            test_cases_run = outcome.test_cases_run,
            total_test_cases = outcome.total_test_cases,
            time_ms = ?outcome.execution_time_ms,
            memory_kb = ?outcome.memory_usage_kb,
            "verdict persisted"
        );
        self.deps.notifier.notify(&record.report()).await;
        Ok(record)
    }

    async fn judge(&self, payload: &JudgePayload, slot: u32) -> Result<JudgeOutcome, StageFailure> {
        let Some(profile) = self.deps.languages.get(&payload.language) else {
            return Ok(JudgeOutcome::failed(
                Verdict::CompilationError,
                format!("unsupported language: {}", payload.language),
            ));
        };

        let cases = self
            .deps
            .testcases
            .load(payload.problem_id)
            .await
            .map_err(|e| StageFailure::new("testcases", e))?;
        if cases.is_empty() {
            return Err(StageFailure::new(
                "testcases",
                format!("problem {} has no test cases", payload.problem_id),
            ));
        }

        let limits = self.run_limits(payload);
        let session = self
            .deps
            .sandbox
            .initialize(slot)
            .await
            .map_err(|e| StageFailure::new("sandbox_init", e))?;

        let result = self
            .judge_in_session(&session, profile, payload, &cases, &limits)
            .await;

        if let Err(err) = self.deps.sandbox.cleanup(&session).await {
            warn!(submission_id = %payload.submission_id, slot, error = %err, "sandbox cleanup failed");
        }
        result
    }

    async fn judge_in_session(
        &self,
        session: &SandboxSession,
        profile: &LanguageProfile,
        payload: &JudgePayload,
        cases: &[TestCase],
        limits: &RunLimits,
    ) -> Result<JudgeOutcome, StageFailure> {
        let security = self
            .deps
            .security
            .initialize(session.slot, &session.root, limits)
            .await
            .map_err(|e| StageFailure::new("security_init", e))?;
        let confinement = sandbox::child_confinement(self.deps.sandbox.as_ref(), &security);

        let result = self
            .evaluator
            .evaluate(session, profile, &payload.source_code, cases, limits, &confinement)
            .await
            .map_err(|e| StageFailure::new("execute", e));

        if let Err(err) = self.deps.security.cleanup(session.slot).await {
            warn!(submission_id = %payload.submission_id, slot = session.slot, error = %err, "security cleanup failed");
        }
        result
    }

    fn run_limits(&self, payload: &JudgePayload) -> RunLimits {
        self.limits_for(payload.time_limit, payload.memory_limit)
    }

    fn limits_for(&self, time_limit_ms: u64, memory_limit_mb: u64) -> RunLimits {
        RunLimits {
            time_limit_ms,
            memory_limit_mb,
            max_processes: self.sandbox_config.max_processes,
            max_output_bytes: self.sandbox_config.max_output_bytes,
            max_file_size_kb: self.sandbox_config.max_file_size_kb,
        }
        .normalized()
    }

    /// Worst-case wall time of one job: compile plus every case at the largest accepted limit.
    pub fn per_job_ceiling_ms(&self) -> u64 {
        let compile_wall = sandbox::compile_limits(&self.sandbox_config).wall_time().as_millis() as u64;
        let per_case = self.max_time_limit_ms.saturating_mul(WALL_TIME_FACTOR);
        compile_wall.saturating_add(self.verdict_bound_cases.saturating_mul(per_case))
    }

    pub fn max_time_to_verdict_ms(&self, depths: &QueueDepths) -> u64 {
        let rounds = depths.total().div_ceil(self.workers as u64);
        rounds.saturating_mul(self.per_job_ceiling_ms())
    }

    pub async fn queue_overview(&self) -> Result<QueueOverview, JudgeError> {
        let depths = self.deps.queue.depths().await?;
        Ok(QueueOverview {
            backend: self.deps.queue.backend_name(),
            depths,
            workers: self.workers,
            per_job_ceiling_ms: self.per_job_ceiling_ms(),
            max_time_to_verdict_ms: self.max_time_to_verdict_ms(&depths),
        })
    }
}
