pub mod memory;
pub mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{
    config::StoreConfig,
    models::{JudgeOutcome, JudgePayload, Submission, SubmissionStatus},
};

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission {0} not found")]
    NotFound(Uuid),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Durable home of submission records. Only the judging service mutates them.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn insert(&self, submission: Submission) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError>;

    async fn mark_in_progress(&self, id: Uuid) -> Result<(), StoreError>;

    /// Writes the terminal outcome; a re-judged submission is overwritten.
    async fn finish(&self, id: Uuid, outcome: &JudgeOutcome) -> Result<Submission, StoreError>;
}

pub async fn from_config(config: &StoreConfig) -> Result<Arc<dyn SubmissionStore>, StoreError> {
    Ok(match config {
        StoreConfig::InMemory { journal_path } => Arc::new(MemoryStore::new(journal_path.clone())),
        StoreConfig::Redis { url, key_prefix } => {
            Arc::new(RedisStore::connect(url.clone(), key_prefix.clone()).await?)
        }
    })
}

pub fn pending_record(payload: &JudgePayload) -> Submission {
    Submission {
        id: payload.submission_id,
        user_id: payload.user_id,
        problem_id: payload.problem_id,
        language: payload.language.clone(),
        source_code: payload.source_code.clone(),
        time_limit_ms: payload.time_limit,
        memory_limit_mb: payload.memory_limit,
        status: SubmissionStatus::Pending,
        execution_time_ms: None,
        memory_usage_kb: None,
        test_cases_run: 0,
        total_test_cases: 0,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    }
}

fn begin(record: &mut Submission) {
    record.status = SubmissionStatus::InProgress;
    record.started_at = Some(Utc::now());
    record.finished_at = None;
}

fn apply_outcome(record: &mut Submission, outcome: &JudgeOutcome) {
    record.status = SubmissionStatus::Judged(outcome.verdict);
    record.execution_time_ms = outcome.execution_time_ms;
    record.memory_usage_kb = outcome.memory_usage_kb;
    record.test_cases_run = outcome.test_cases_run;
    record.total_test_cases = outcome.total_test_cases;
    record.error_message = outcome.error_message.clone();
    record.finished_at = Some(Utc::now());
}
