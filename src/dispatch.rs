use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delivery_log::{dedup_key, DeliveryLog, DeliverySource};
use crate::error::{DispatchError, Result};
use crate::gateway::PushGateway;
use crate::metrics::{
    CAMPAIGNS_CLAIMED, CAMPAIGN_DISPATCH_TIME, CLAIM_CONFLICTS, DELIVERIES_FAILED,
    DELIVERIES_SENT, DELIVERIES_SKIPPED, GATEWAY_SEND_TIME, INVALID_TOKENS_REMOVED,
};
use crate::models::{
    Campaign, CampaignStatus, LogAttempt, LogStatus, NewCampaign, NotificationPayload,
    ScheduledNotification, ScheduledStatus, Template, PUSH_CHANNEL,
};
use crate::segment::SegmentEngine;
use crate::store::Store;
use crate::template::{render_payload, render_template, TemplateCache};
use crate::tenant::TenantContext;

/// Exponential backoff for transient gateway failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total gateway calls per delivery, first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(retry as i32);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    /// How long a claimed scheduled notification stays locked to one worker.
    pub claim_lease: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 32,
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(10),
            claim_lease: Duration::from_secs(600),
        }
    }
}

/// Per-run delivery tallies. `sent` and `failed` count (recipient, token)
/// pairs; `no_device` counts recipients without any token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub no_device: u64,
}

impl Add for DeliveryStats {
    type Output = DeliveryStats;

    fn add(self, other: DeliveryStats) -> DeliveryStats {
        DeliveryStats {
            sent: self.sent + other.sent,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
            cancelled: self.cancelled + other.cancelled,
            no_device: self.no_device + other.no_device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CampaignOutcome {
    Completed { recipients: u64, stats: DeliveryStats },
    Cancelled { recipients: u64, stats: DeliveryStats },
    /// Another worker moved the campaign into `sending` first.
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduledOutcome {
    Finished { status: ScheduledStatus, stats: DeliveryStats },
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Sent,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Clone, Copy)]
enum Content<'a> {
    Template(&'a Template),
    Payload(&'a NotificationPayload),
}

impl Content<'_> {
    fn render(&self, attributes: &Value) -> NotificationPayload {
        match self {
            Content::Template(template) => render_template(template, attributes),
            Content::Payload(payload) => render_payload(payload, attributes),
        }
    }
}

pub struct Dispatcher<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    segments: Arc<SegmentEngine<S>>,
    templates: TemplateCache<S>,
    log: DeliveryLog<S>,
    settings: DispatchSettings,
}

impl<S, G> Dispatcher<S, G>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        segments: Arc<SegmentEngine<S>>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            templates: TemplateCache::new(store.clone()),
            log: DeliveryLog::new(store.clone()),
            store,
            gateway,
            segments,
            settings,
        }
    }

    pub async fn create_campaign(&self, ctx: TenantContext, campaign: &NewCampaign) -> Result<Campaign> {
        if let Some(template_id) = campaign.template_id {
            self.templates.get(ctx, template_id).await?;
        }
        if let Some(segment_id) = campaign.segment_id {
            self.store
                .get_segment(ctx, segment_id)
                .await?
                .ok_or(DispatchError::NotFound("segment"))?;
        }
        let row = self.store.insert_campaign(ctx, campaign).await?;
        info!(campaign_id = %row.id, name = %row.name, "Campaign created");
        Ok(row)
    }

    pub async fn get_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<Campaign> {
        self.store
            .get_campaign(ctx, campaign_id)
            .await?
            .ok_or(DispatchError::NotFound("campaign"))
    }

    pub async fn schedule_campaign(
        &self,
        ctx: TenantContext,
        campaign_id: Uuid,
        at: OffsetDateTime,
    ) -> Result<Campaign> {
        let campaign = self.get_campaign(ctx, campaign_id).await?;
        if !self.store.schedule_campaign(ctx, campaign_id, at).await? {
            return Err(transition_error(campaign_id, campaign.status, CampaignStatus::Scheduled));
        }
        info!(campaign_id = %campaign_id, scheduled_at = %at, "Campaign scheduled");
        self.get_campaign(ctx, campaign_id).await
    }

    /// Cancels a campaign that has not finished. A campaign in `sending`
    /// stops before its next unstarted delivery.
    pub async fn cancel_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<Campaign> {
        let campaign = self.get_campaign(ctx, campaign_id).await?;
        let cancelled = self
            .store
            .transition_campaign(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Sending,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;
        if !cancelled {
            return Err(transition_error(campaign_id, campaign.status, CampaignStatus::Cancelled));
        }
        info!(campaign_id = %campaign_id, from = %campaign.status, "Campaign cancelled");
        self.get_campaign(ctx, campaign_id).await
    }

    /// Claims the campaign and delivers it to every matching user.
    ///
    /// Only the caller whose compare-and-swap moves the campaign into
    /// `sending` runs the send loop; everyone else gets `AlreadyClaimed`.
    pub async fn send_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<CampaignOutcome> {
        let campaign = self.get_campaign(ctx, campaign_id).await?;

        let claimed = self
            .store
            .transition_campaign(
                campaign_id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Sending,
            )
            .await?;
        if !claimed {
            let current = self.get_campaign(ctx, campaign_id).await?;
            return match current.status {
                CampaignStatus::Sending | CampaignStatus::Sent => {
                    CLAIM_CONFLICTS.inc();
                    info!(campaign_id = %campaign_id, status = %current.status, "Campaign already claimed by another worker");
                    Ok(CampaignOutcome::AlreadyClaimed)
                }
                status => Err(transition_error(campaign_id, status, CampaignStatus::Sending)),
            };
        }
        CAMPAIGNS_CLAIMED.inc();
        info!(campaign_id = %campaign_id, name = %campaign.name, "Campaign claimed for sending");

        let timer = CAMPAIGN_DISPATCH_TIME.start_timer();
        let result = self.run_campaign(ctx, &campaign).await;
        timer.observe_duration();

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Campaign failed before delivery");
                self.store
                    .transition_campaign(campaign_id, &[CampaignStatus::Sending], CampaignStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_campaign(&self, ctx: TenantContext, campaign: &Campaign) -> Result<CampaignOutcome> {
        let template_id = campaign
            .template_id
            .ok_or_else(|| DispatchError::Validation("campaign has no template".to_string()))?;
        let segment_id = campaign
            .segment_id
            .ok_or_else(|| DispatchError::Validation("campaign has no segment".to_string()))?;

        let template = self.templates.get(ctx, template_id).await?;
        let segment = self
            .store
            .get_segment(ctx, segment_id)
            .await?
            .ok_or(DispatchError::NotFound("segment"))?;

        // Frozen before the first send; users added later are not picked up
        let recipients: Vec<Uuid> = self.segments.matching_user_ids(&segment).try_collect().await?;
        let recipient_count = recipients.len() as u64;
        info!(campaign_id = %campaign.id, recipients = recipient_count, "Resolved campaign recipients");

        let stats = self
            .fan_out(
                ctx,
                recipients,
                Content::Template(&template),
                DeliverySource::Campaign(campaign.id),
                Some(campaign.id),
            )
            .await;

        let completed = self
            .store
            .transition_campaign(campaign.id, &[CampaignStatus::Sending], CampaignStatus::Sent)
            .await?;

        if completed {
            info!(
                campaign_id = %campaign.id,
                sent = stats.sent,
                failed = stats.failed,
                skipped = stats.skipped,
                no_device = stats.no_device,
                "Campaign sent"
            );
            Ok(CampaignOutcome::Completed {
                recipients: recipient_count,
                stats,
            })
        } else {
            info!(
                campaign_id = %campaign.id,
                sent = stats.sent,
                cancelled = stats.cancelled,
                "Campaign cancelled while sending"
            );
            Ok(CampaignOutcome::Cancelled {
                recipients: recipient_count,
                stats,
            })
        }
    }

    /// Sends one scheduled notification to its single recipient.
    pub async fn send_scheduled(&self, notification: &ScheduledNotification) -> Result<ScheduledOutcome> {
        let now = OffsetDateTime::now_utc();
        let claimed = self
            .store
            .claim_scheduled(notification.id, now, now - self.settings.claim_lease)
            .await?;
        if !claimed {
            CLAIM_CONFLICTS.inc();
            info!(notification_id = %notification.id, "Scheduled notification already claimed");
            return Ok(ScheduledOutcome::AlreadyClaimed);
        }

        let ctx = TenantContext::for_row(notification.tenant_id);
        let stats = self
            .deliver_to_user(
                ctx,
                notification.recipient_ref,
                Content::Payload(&notification.payload),
                DeliverySource::Scheduled(notification.id),
                None,
            )
            .await;

        // A recipient without devices ends failed, like one whose sends all failed
        let status = if stats.sent > 0 || stats.skipped > 0 {
            ScheduledStatus::Sent
        } else {
            ScheduledStatus::Failed
        };
        if stats.no_device > 0 {
            warn!(
                notification_id = %notification.id,
                recipient = %notification.recipient_ref,
                "Scheduled notification recipient has no registered devices"
            );
        }
        self.store.finish_scheduled(notification.id, status).await?;
        info!(
            notification_id = %notification.id,
            recipient = %notification.recipient_ref,
            status = ?status,
            "Scheduled notification processed"
        );
        Ok(ScheduledOutcome::Finished { status, stats })
    }

    pub async fn send_to_user(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        payload: &NotificationPayload,
    ) -> Result<DeliveryStats> {
        let stats = self
            .deliver_to_user(
                ctx,
                user_id,
                Content::Payload(payload),
                DeliverySource::Direct(Uuid::new_v4()),
                None,
            )
            .await;
        info!(user_id = %user_id, sent = stats.sent, failed = stats.failed, "Direct notification sent");
        Ok(stats)
    }

    /// Fans out to the devices of every subscriber with push enabled.
    pub async fn send_to_topic(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        payload: &NotificationPayload,
    ) -> Result<DeliveryStats> {
        let topic = self
            .store
            .get_topic(ctx, topic_id)
            .await?
            .ok_or(DispatchError::NotFound("topic"))?;
        let recipients: Vec<Uuid> = self
            .store
            .subscriptions_for_topic(ctx, topic_id)
            .await?
            .into_iter()
            .filter(|s| s.fcm_enabled)
            .map(|s| s.user_id)
            .collect();

        let stats = self
            .fan_out(
                ctx,
                recipients,
                Content::Payload(payload),
                DeliverySource::Topic(Uuid::new_v4()),
                None,
            )
            .await;
        info!(topic = %topic.slug, sent = stats.sent, failed = stats.failed, "Topic notification sent");
        Ok(stats)
    }

    async fn fan_out(
        &self,
        ctx: TenantContext,
        recipients: Vec<Uuid>,
        content: Content<'_>,
        source: DeliverySource,
        campaign: Option<Uuid>,
    ) -> DeliveryStats {
        stream::iter(recipients)
            .map(|user_id| self.deliver_to_user(ctx, user_id, content, source, campaign))
            .buffer_unordered(self.settings.concurrency.max(1))
            .fold(DeliveryStats::default(), |total, stats| async move { total + stats })
            .await
    }

    // Never fails: every problem is logged and counted against this recipient
    async fn deliver_to_user(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        content: Content<'_>,
        source: DeliverySource,
        campaign: Option<Uuid>,
    ) -> DeliveryStats {
        let mut stats = DeliveryStats::default();

        let devices = match self.store.devices_for_user(ctx, user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to load recipient devices");
                stats.failed += 1;
                self.add_to_campaign(campaign, &stats).await;
                return stats;
            }
        };
        if devices.is_empty() {
            debug!(user_id = %user_id, "Recipient has no devices, skipping");
            stats.no_device += 1;
            return stats;
        }

        let attributes = match self.store.get_user(ctx, user_id).await {
            Ok(Some(user)) => user.attributes,
            Ok(None) => json!({}),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to load recipient attributes");
                json!({})
            }
        };
        let message = content.render(&attributes);

        for device in devices {
            let outcome = self
                .deliver_one(user_id, device.tenant_id, &device.token, &message, source, campaign)
                .await;
            match outcome {
                DeliveryOutcome::Sent => stats.sent += 1,
                DeliveryOutcome::Failed => stats.failed += 1,
                DeliveryOutcome::Skipped => stats.skipped += 1,
                DeliveryOutcome::Cancelled => stats.cancelled += 1,
            }
        }

        self.add_to_campaign(campaign, &stats).await;
        stats
    }

    async fn add_to_campaign(&self, campaign: Option<Uuid>, stats: &DeliveryStats) {
        let Some(campaign_id) = campaign else {
            return;
        };
        if stats.sent == 0 && stats.failed == 0 {
            return;
        }
        if let Err(e) = self
            .store
            .add_campaign_counts(campaign_id, stats.sent as i64, stats.failed as i64)
            .await
        {
            error!(campaign_id = %campaign_id, error = %e, "Failed to update campaign counters");
        }
    }

    async fn deliver_one(
        &self,
        user_id: Uuid,
        tenant_id: Option<Uuid>,
        token: &str,
        message: &NotificationPayload,
        source: DeliverySource,
        campaign: Option<Uuid>,
    ) -> DeliveryOutcome {
        let key = dedup_key(source, user_id, token);
        match self.log.already_delivered(&key).await {
            Ok(true) => {
                DELIVERIES_SKIPPED.inc();
                debug!(user_id = %user_id, "Already delivered, skipping");
                return DeliveryOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Dedup lookup failed, sending anyway"),
        }

        let mut attempts: u32 = 0;
        let final_error = loop {
            if self.campaign_cancelled(campaign).await {
                if attempts == 0 {
                    return DeliveryOutcome::Cancelled;
                }
                break DispatchError::GatewayTransient("campaign cancelled before retry".to_string());
            }

            attempts += 1;
            match self.send_with_timeout(token, message).await {
                Ok(()) => {
                    DELIVERIES_SENT.inc();
                    self.record(&key, user_id, tenant_id, message, LogStatus::Sent, attempts)
                        .await;
                    return DeliveryOutcome::Sent;
                }
                Err(DispatchError::GatewayTransient(reason))
                    if attempts < self.settings.retry.max_attempts =>
                {
                    let delay = self.settings.retry.delay_for_retry(attempts - 1);
                    debug!(
                        user_id = %user_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient gateway failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break e,
            }
        };

        if matches!(final_error, DispatchError::InvalidToken) {
            match self.store.delete_device_by_token(tenant_id, token).await {
                Ok(true) => {
                    INVALID_TOKENS_REMOVED.inc();
                    info!(user_id = %user_id, "Removed device token rejected by gateway");
                }
                Ok(false) => {}
                Err(e) => error!(user_id = %user_id, error = %e, "Failed to remove invalid token"),
            }
        } else {
            warn!(user_id = %user_id, attempts, error = %final_error, "Delivery failed");
        }

        DELIVERIES_FAILED.inc();
        self.record(&key, user_id, tenant_id, message, LogStatus::Failed, attempts)
            .await;
        DeliveryOutcome::Failed
    }

    // Gateway outcomes arrive as DispatchError; a timeout counts as transient
    async fn send_with_timeout(&self, token: &str, message: &NotificationPayload) -> Result<()> {
        let timer = GATEWAY_SEND_TIME.start_timer();
        let result = tokio::time::timeout(self.settings.send_timeout, self.gateway.send(token, message)).await;
        timer.observe_duration();
        match result {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(DispatchError::GatewayTransient(format!(
                "gateway call exceeded {:?}",
                self.settings.send_timeout
            ))),
        }
    }

    async fn campaign_cancelled(&self, campaign: Option<Uuid>) -> bool {
        let Some(campaign_id) = campaign else {
            return false;
        };
        match self.store.get_campaign(TenantContext::Global, campaign_id).await {
            Ok(Some(row)) => row.status == CampaignStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Failed to check campaign status");
                false
            }
        }
    }

    async fn record(
        &self,
        key: &str,
        user_id: Uuid,
        tenant_id: Option<Uuid>,
        message: &NotificationPayload,
        status: LogStatus,
        attempts: u32,
    ) {
        let attempt = LogAttempt {
            dedup_key: key.to_string(),
            user_id,
            tenant_id,
            channel: PUSH_CHANNEL.to_string(),
            title: message.title.clone(),
            body: message.body.clone(),
            payload: json!(message.data),
            status,
            attempts: attempts as i32,
        };
        if let Err(e) = self.log.record(&attempt).await {
            error!(user_id = %user_id, error = %e, "Failed to write delivery log");
        }
    }
}

fn transition_error(id: Uuid, from: CampaignStatus, to: CampaignStatus) -> DispatchError {
    DispatchError::InvalidTransition {
        entity: "campaign",
        id,
        from: from.to_string(),
        to: to.to_string(),
    }
}
