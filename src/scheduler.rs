use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::dispatch::{CampaignOutcome, Dispatcher, ScheduledOutcome};
use crate::error::{DispatchError, Result};
use crate::gateway::PushGateway;
use crate::metrics::DUE_ITEMS_DISPATCHED;
use crate::registry::Registry;
use crate::store::Store;
use crate::tenant::TenantContext;

pub const DEFAULT_DUE_LIMIT: i64 = 100;
pub const DEFAULT_TOLERANCE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DueReport {
    pub campaigns: usize,
    pub notifications: usize,
    pub already_claimed: usize,
    pub errors: usize,
}

impl DueReport {
    pub fn dispatched(&self) -> usize {
        self.campaigns + self.notifications
    }
}

pub struct Scheduler<S, G> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S, G>>,
    registry: Arc<Registry<S, G>>,
}

impl<S, G> Scheduler<S, G>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, dispatcher: Arc<Dispatcher<S, G>>, registry: Arc<Registry<S, G>>) -> Self {
        Self {
            store,
            dispatcher,
            registry,
        }
    }

    /// Sends every campaign and scheduled notification whose time falls in
    /// `[now - tolerance, now]`. Older items are left untouched.
    pub async fn dispatch_due(&self, limit: i64, tolerance_hours: i64) -> Result<DueReport> {
        if limit <= 0 {
            return Err(DispatchError::Validation("limit must be positive".to_string()));
        }
        if tolerance_hours < 0 {
            return Err(DispatchError::Validation(
                "tolerance_hours must not be negative".to_string(),
            ));
        }
        let now = OffsetDateTime::now_utc();
        let window_start = now - time::Duration::hours(tolerance_hours);
        let mut report = DueReport::default();

        for campaign in self.store.due_campaigns(window_start, now, limit).await? {
            let ctx = TenantContext::for_row(campaign.tenant_id);
            match self.dispatcher.send_campaign(ctx, campaign.id).await {
                Ok(CampaignOutcome::AlreadyClaimed) => report.already_claimed += 1,
                Ok(_) => report.campaigns += 1,
                Err(e) => {
                    error!(campaign_id = %campaign.id, error = %e, "Due campaign failed");
                    report.errors += 1;
                }
            }
        }

        for notification in self.store.due_scheduled(window_start, now, limit).await? {
            match self.dispatcher.send_scheduled(&notification).await {
                Ok(ScheduledOutcome::AlreadyClaimed) => report.already_claimed += 1,
                Ok(_) => report.notifications += 1,
                Err(e) => {
                    error!(notification_id = %notification.id, error = %e, "Scheduled notification failed");
                    report.errors += 1;
                }
            }
        }

        DUE_ITEMS_DISPATCHED.inc_by(report.dispatched() as f64);
        info!(
            campaigns = report.campaigns,
            notifications = report.notifications,
            already_claimed = report.already_claimed,
            errors = report.errors,
            "Due dispatch finished"
        );
        Ok(report)
    }

    /// Polls for due work until `shutdown` fires. Unsynced topic
    /// subscriptions are retried on the same tick.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        limit: i64,
        tolerance_hours: i64,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!(interval = ?interval, limit, tolerance_hours, "Scheduler started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_due(limit, tolerance_hours).await {
                        error!(error = %e, "Due dispatch failed");
                    }
                    if let Err(e) = self.registry.reconcile_unsynced(limit).await {
                        error!(error = %e, "Subscription reconciliation failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping scheduler");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::fixture;
    use crate::models::{CampaignStatus, NewScheduledNotification, NotificationPayload, ScheduledStatus};

    fn scheduler(fx: &crate::dispatch::tests::Fixture) -> Scheduler<crate::memory_store::MemoryStore, crate::gateway::mock::MockGateway> {
        let registry = Arc::new(Registry::new(fx.store.clone(), fx.gateway.clone()));
        Scheduler::new(fx.store.clone(), fx.dispatcher.clone(), registry)
    }

    async fn schedule_notification(
        fx: &crate::dispatch::tests::Fixture,
        user: uuid::Uuid,
        at: OffsetDateTime,
    ) -> uuid::Uuid {
        fx.store
            .insert_scheduled(
                TenantContext::Global,
                &NewScheduledNotification {
                    recipient_ref: user,
                    payload: NotificationPayload {
                        title: "Reminder".to_string(),
                        body: "Soon".to_string(),
                        ..Default::default()
                    },
                    scheduled_at: at,
                },
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn items_older_than_tolerance_stay_pending() {
        let fx = fixture();
        let user = fx.user("pro", "Ada", &["a1"]).await;
        let now = OffsetDateTime::now_utc();
        let stale = schedule_notification(&fx, user, now - time::Duration::hours(30)).await;
        let fresh = schedule_notification(&fx, user, now - time::Duration::minutes(5)).await;

        let report = scheduler(&fx).dispatch_due(100, 24).await.unwrap();

        assert_eq!(report.notifications, 1);
        let stale = fx
            .store
            .get_scheduled(TenantContext::Global, stale)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status, ScheduledStatus::Pending);
        let fresh = fx
            .store
            .get_scheduled(TenantContext::Global, fresh)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, ScheduledStatus::Sent);
    }

    #[tokio::test]
    async fn due_campaigns_are_sent_and_future_ones_wait() {
        let fx = fixture();
        fx.user("pro", "Ada", &["a1"]).await;
        let due = fx.campaign("pro").await;
        let later = fx.campaign("pro").await;
        let now = OffsetDateTime::now_utc();
        fx.dispatcher
            .schedule_campaign(TenantContext::Global, due.id, now - time::Duration::minutes(1))
            .await
            .unwrap();
        fx.dispatcher
            .schedule_campaign(TenantContext::Global, later.id, now + time::Duration::hours(1))
            .await
            .unwrap();

        let report = scheduler(&fx).dispatch_due(100, 24).await.unwrap();

        assert_eq!(report.campaigns, 1);
        assert_eq!(fx.campaign_status(due.id).await.status, CampaignStatus::Sent);
        assert_eq!(fx.campaign_status(later.id).await.status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn empty_run_succeeds() {
        let fx = fixture();
        let report = scheduler(&fx).dispatch_due(100, 24).await.unwrap();
        assert_eq!(report, DueReport::default());
    }

    #[tokio::test]
    async fn two_schedulers_send_a_due_campaign_once() {
        let fx = fixture();
        fx.user("pro", "Ada", &["a1"]).await;
        let campaign = fx.campaign("pro").await;
        fx.dispatcher
            .schedule_campaign(
                TenantContext::Global,
                campaign.id,
                OffsetDateTime::now_utc() - time::Duration::minutes(1),
            )
            .await
            .unwrap();
        let first = scheduler(&fx);
        let second = scheduler(&fx);

        let (a, b) = tokio::join!(first.dispatch_due(100, 24), second.dispatch_due(100, 24));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.campaigns + b.campaigns, 1);
        assert_eq!(fx.campaign_status(campaign.id).await.sent_count, 1);
        assert_eq!(fx.gateway.sent().len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_positive_limit_and_negative_tolerance() {
        let fx = fixture();
        let scheduler = scheduler(&fx);

        for (limit, tolerance) in [(0, 24), (-5, 24), (10, -1)] {
            let err = scheduler.dispatch_due(limit, tolerance).await.unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)), "{:?}", err);
        }
        assert!(scheduler.dispatch_due(1, 0).await.is_ok());
    }
}
