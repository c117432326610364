use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{LogAttempt, LogQuery, NotificationLog};
use crate::store::Store;
use crate::tenant::TenantContext;

/// What triggered a delivery. Part of the dedup key, so the same user and
/// token can receive one message per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    Campaign(Uuid),
    Scheduled(Uuid),
    Direct(Uuid),
    Topic(Uuid),
}

impl fmt::Display for DeliverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliverySource::Campaign(id) => write!(f, "campaign:{}", id),
            DeliverySource::Scheduled(id) => write!(f, "scheduled:{}", id),
            DeliverySource::Direct(id) => write!(f, "direct:{}", id),
            DeliverySource::Topic(id) => write!(f, "topic:{}", id),
        }
    }
}

// SHA-256 over the whole triple keeps raw tokens out of the log table
pub fn dedup_key(source: DeliverySource, user_id: Uuid, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", source, user_id, token).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct DeliveryLog<S> {
    store: Arc<S>,
}

impl<S> DeliveryLog<S>
where
    S: Store + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn record(&self, attempt: &LogAttempt) -> Result<NotificationLog> {
        let row = self.store.upsert_log(attempt).await?;
        debug!(
            log_id = %row.id,
            user_id = %row.user_id,
            status = ?row.status,
            attempts = row.attempts,
            "Delivery recorded"
        );
        Ok(row)
    }

    /// True when a previous run already got this message onto this device.
    pub async fn already_delivered(&self, dedup_key: &str) -> Result<bool> {
        Ok(self
            .store
            .find_log(dedup_key)
            .await?
            .map_or(false, |row| row.status.is_delivered()))
    }

    pub async fn query(&self, ctx: TenantContext, query: &LogQuery) -> Result<Vec<NotificationLog>> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(DispatchError::Validation(
                    "'from' must not be after 'to'".to_string(),
                ));
            }
        }
        self.store.query_logs(ctx, query).await
    }

    pub async fn mark_opened(&self, ctx: TenantContext, log_id: Uuid) -> Result<NotificationLog> {
        self.store
            .mark_log_opened(ctx, log_id)
            .await?
            .ok_or(DispatchError::NotFound("notification log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::models::{LogStatus, PUSH_CHANNEL};
    use time::Duration;

    fn attempt(key: &str, user_id: Uuid, status: LogStatus) -> LogAttempt {
        LogAttempt {
            dedup_key: key.to_string(),
            user_id,
            tenant_id: None,
            channel: PUSH_CHANNEL.to_string(),
            title: "Hello".to_string(),
            body: "World".to_string(),
            payload: serde_json::json!({}),
            status,
            attempts: 1,
        }
    }

    #[test]
    fn dedup_key_separates_sources_and_tokens() {
        let user = Uuid::new_v4();
        let campaign = DeliverySource::Campaign(Uuid::new_v4());
        let key = dedup_key(campaign, user, "token-a");

        assert_eq!(key.len(), 64);
        assert_eq!(key, dedup_key(campaign, user, "token-a"));
        assert_ne!(key, dedup_key(campaign, user, "token-b"));
        assert_ne!(key, dedup_key(DeliverySource::Campaign(Uuid::new_v4()), user, "token-a"));
        assert!(!key.contains("token"));
    }

    #[tokio::test]
    async fn retries_accumulate_on_one_row() {
        let store = Arc::new(MemoryStore::new());
        let log = DeliveryLog::new(store.clone());
        let user = Uuid::new_v4();

        log.record(&attempt("k1", user, LogStatus::Failed)).await.unwrap();
        assert!(!log.already_delivered("k1").await.unwrap());

        let row = log.record(&attempt("k1", user, LogStatus::Sent)).await.unwrap();
        assert_eq!(row.attempts, 2);
        assert!(row.sent_at.is_some());
        assert!(log.already_delivered("k1").await.unwrap());
        assert_eq!(store.log_count().await, 1);
    }

    #[tokio::test]
    async fn opened_marker_only_applies_to_sent_rows() {
        let store = Arc::new(MemoryStore::new());
        let log = DeliveryLog::new(store);
        let user = Uuid::new_v4();
        let sent = log.record(&attempt("k1", user, LogStatus::Sent)).await.unwrap();
        let failed = log.record(&attempt("k2", user, LogStatus::Failed)).await.unwrap();

        let opened = log.mark_opened(TenantContext::Global, sent.id).await.unwrap();
        assert_eq!(opened.status, LogStatus::Opened);
        assert!(opened.opened_at.is_some());

        let untouched = log.mark_opened(TenantContext::Global, failed.id).await.unwrap();
        assert_eq!(untouched.status, LogStatus::Failed);

        assert!(matches!(
            log.mark_opened(TenantContext::Global, Uuid::new_v4()).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_status_and_rejects_inverted_range() {
        let store = Arc::new(MemoryStore::new());
        let log = DeliveryLog::new(store);
        let user = Uuid::new_v4();
        log.record(&attempt("k1", user, LogStatus::Sent)).await.unwrap();
        log.record(&attempt("k2", user, LogStatus::Failed)).await.unwrap();

        let failed = log
            .query(
                TenantContext::Global,
                &LogQuery {
                    status: Some(LogStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].dedup_key, "k2");

        let now = time::OffsetDateTime::now_utc();
        let inverted = LogQuery {
            from: Some(now),
            to: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(
            log.query(TenantContext::Global, &inverted).await,
            Err(DispatchError::Validation(_))
        ));
    }
}
