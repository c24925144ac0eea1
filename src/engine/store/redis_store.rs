use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::engine::{
    models::{JudgeOutcome, Submission},
    store::{StoreError, SubmissionStore, apply_outcome, begin},
};

/// One JSON document per submission, shared by API and worker processes.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn connect(url: String, key_prefix: String) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn key(&self, id: Uuid) -> String {
        format!("{}:submission:{}", self.key_prefix, id)
    }

    async fn write(&self, record: &Submission) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let body = serde_json::to_string(record)?;
        let _: () = redis::cmd("SET")
            .arg(self.key(record.id))
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Submission, StoreError> {
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, submission: Submission) -> Result<(), StoreError> {
        self.write(&submission).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.manager.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await?;
        body.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn mark_in_progress(&self, id: Uuid) -> Result<(), StoreError> {
        let mut record = self.load(id).await?;
        begin(&mut record);
        self.write(&record).await
    }

    async fn finish(&self, id: Uuid, outcome: &JudgeOutcome) -> Result<Submission, StoreError> {
        let mut record = self.load(id).await?;
        apply_outcome(&mut record, outcome);
        self.write(&record).await?;
        Ok(record)
    }
}
