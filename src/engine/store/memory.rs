use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::engine::{
    models::{JudgeOutcome, Submission},
    store::{StoreError, SubmissionStore, apply_outcome, begin},
};

/// In-process records with an optional append-only JSON-lines journal.
#[derive(Clone)]
pub struct MemoryStore {
    records: Arc<DashMap<Uuid, Submission>>,
    journal_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new(journal_path: Option<PathBuf>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            journal_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn journal(&self, record: &Submission) -> Result<(), StoreError> {
        let Some(path) = &self.journal_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        let mut file = options.open(path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, submission: Submission) -> Result<(), StoreError> {
        self.journal(&submission).await?;
        self.records.insert(submission.id, submission);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        Ok(self.records.get(&id).map(|e| e.value().clone()))
    }

    async fn mark_in_progress(&self, id: Uuid) -> Result<(), StoreError> {
        let snapshot = {
            let mut entry = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            begin(&mut entry);
            entry.clone()
        };
        self.journal(&snapshot).await
    }

    async fn finish(&self, id: Uuid, outcome: &JudgeOutcome) -> Result<Submission, StoreError> {
        let snapshot = {
            let mut entry = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            apply_outcome(&mut entry, outcome);
            entry.clone()
        };
        self.journal(&snapshot).await?;
        Ok(snapshot)
    }
}
