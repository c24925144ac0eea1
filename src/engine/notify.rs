use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::models::VerdictReport;

/// Told about every verdict after it has been persisted. Failures never touch the verdict.
#[async_trait]
pub trait VerdictNotifier: Send + Sync {
    async fn notify(&self, report: &VerdictReport);
}

pub struct LogNotifier;

#[async_trait]
impl VerdictNotifier for LogNotifier {
    async fn notify(&self, report: &VerdictReport) {
        info!(
            submission_id = %report.submission_id,
            verdict = %report.verdict,
            test_cases_run = report.test_cases_run,
            total_test_cases = report.total_test_cases,
            "verdict available"
        );
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout_ms: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            client,
            url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[async_trait]
impl VerdictNotifier for WebhookNotifier {
    async fn notify(&self, report: &VerdictReport) {
        let sent = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(report)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match sent {
            Ok(_) => info!(submission_id = %report.submission_id, verdict = %report.verdict, "verdict delivered"),
            Err(err) => warn!(
                submission_id = %report.submission_id,
                url = %self.url,
                error = %err,
                "verdict webhook failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::engine::models::Verdict;

    fn report() -> VerdictReport {
        VerdictReport {
            submission_id: Uuid::new_v4(),
            verdict: Verdict::Accepted,
            execution_time_ms: Some(12),
            memory_usage_kb: None,
            test_cases_run: 3,
            total_test_cases: 3,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn webhook_posts_the_readback_body() {
        let received: Arc<Mutex<Vec<VerdictReport>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Arc<Mutex<Vec<VerdictReport>>>>, Json(body): Json<VerdictReport>| async move {
                        seen.lock().await.push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let notifier = WebhookNotifier::new(format!("http://{addr}/hook"), 2_000).unwrap();
        let sent = report();
        notifier.notify(&sent).await;

        let seen = received.lock().await;
        assert_eq!(seen.as_slice(), &[sent]);
    }

    #[tokio::test]
    async fn unreachable_webhook_is_only_logged() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook".to_string(), 200).unwrap();
        notifier.notify(&report()).await;
        LogNotifier.notify(&report()).await;
    }
}
