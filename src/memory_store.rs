//! In-memory [`Store`] used by tests and by `STORE_BACKEND=memory`.
//!
//! All tables sit behind one `RwLock`, so every method is atomic with respect
//! to every other, which gives the same compare-and-swap guarantees the
//! Postgres store gets from conditional updates.

use sqlx::types::time::OffsetDateTime;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{
    Campaign, CampaignStatus, DeviceToken, LogAttempt, LogQuery, LogStatus, NewCampaign, NewDevice,
    NewScheduledNotification, NewTemplate, NewTopic, NotificationLog, ScheduledNotification,
    ScheduledStatus, Segment, SubscriptionChannels, Template, Topic, TopicSubscription, UserRecord,
};
use crate::segment::{ConditionGroup, Predicate};
use crate::store::Store;
use crate::tenant::TenantContext;

#[derive(Default)]
struct Tables {
    users: BTreeMap<Uuid, UserRecord>,
    devices: HashMap<Uuid, DeviceToken>,
    topics: HashMap<Uuid, Topic>,
    subscriptions: HashMap<Uuid, TopicSubscription>,
    segments: HashMap<Uuid, Segment>,
    templates: HashMap<Uuid, Template>,
    campaigns: HashMap<Uuid, Campaign>,
    scheduled: HashMap<Uuid, ScheduledNotification>,
    logs: HashMap<String, NotificationLog>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    fail_device_reads: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `devices_for_user` fail as if the database were unreachable.
    #[cfg(test)]
    pub fn fail_device_reads(&self, fail: bool) {
        self.fail_device_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    pub async fn segment_count(&self) -> usize {
        self.tables.read().await.segments.len()
    }

    #[cfg(test)]
    pub async fn subscription_count(&self) -> usize {
        self.tables.read().await.subscriptions.len()
    }

    #[cfg(test)]
    pub async fn log_count(&self) -> usize {
        self.tables.read().await.logs.len()
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

impl Store for MemoryStore {
    async fn upsert_user(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        attributes: serde_json::Value,
    ) -> Result<UserRecord> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.users.get(&user_id) {
            if !ctx.allows(existing.tenant_id) {
                return Err(DispatchError::NotFound("user"));
            }
        }
        let record = tables
            .users
            .entry(user_id)
            .and_modify(|u| u.attributes = attributes.clone())
            .or_insert_with(|| UserRecord {
                id: user_id,
                tenant_id: ctx.tenant_id(),
                attributes,
                created_at: now(),
            });
        Ok(record.clone())
    }

    async fn get_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Option<UserRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .get(&user_id)
            .filter(|u| ctx.allows(u.tenant_id))
            .cloned())
    }

    async fn count_matching_users(&self, predicate: &Predicate) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().filter(|u| predicate.matches(u)).count() as i64)
    }

    async fn matching_user_ids(
        &self,
        predicate: &Predicate,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let ids = tables
            .users
            .values()
            .filter(|u| after.map_or(true, |a| u.id > a))
            .filter(|u| predicate.matches(u))
            .take(limit.max(0) as usize)
            .map(|u| u.id)
            .collect();
        Ok(ids)
    }

    async fn upsert_device(&self, ctx: TenantContext, device: &NewDevice) -> Result<DeviceToken> {
        let mut tables = self.tables.write().await;
        let tenant_id = ctx.tenant_id();
        let existing = tables
            .devices
            .values_mut()
            .find(|d| d.tenant_id == tenant_id && d.token == device.token);

        if let Some(row) = existing {
            row.user_id = device.user_id;
            row.platform = device.platform;
            row.device_name = device.device_name.clone();
            row.last_active_at = now();
            return Ok(row.clone());
        }

        let row = DeviceToken {
            id: Uuid::new_v4(),
            user_id: device.user_id,
            tenant_id,
            token: device.token.clone(),
            platform: device.platform,
            device_name: device.device_name.clone(),
            last_active_at: now(),
            created_at: now(),
        };
        tables.devices.insert(row.id, row.clone());
        Ok(row)
    }

    async fn device_by_token(&self, ctx: TenantContext, token: &str) -> Result<Option<DeviceToken>> {
        let tables = self.tables.read().await;
        let tenant_id = ctx.tenant_id();
        Ok(tables
            .devices
            .values()
            .find(|d| d.tenant_id == tenant_id && d.token == token)
            .cloned())
    }

    async fn get_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<Option<DeviceToken>> {
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .get(&device_id)
            .filter(|d| ctx.allows(d.tenant_id))
            .cloned())
    }

    async fn devices_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<DeviceToken>> {
        #[cfg(test)]
        if self.fail_device_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DispatchError::Database(sqlx::Error::PoolTimedOut));
        }
        let tables = self.tables.read().await;
        let mut devices: Vec<DeviceToken> = tables
            .devices
            .values()
            .filter(|d| d.user_id == user_id && ctx.allows(d.tenant_id))
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.created_at);
        Ok(devices)
    }

    async fn delete_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let allowed = tables
            .devices
            .get(&device_id)
            .map_or(false, |d| ctx.allows(d.tenant_id));
        Ok(allowed && tables.devices.remove(&device_id).is_some())
    }

    async fn delete_device_by_token(&self, tenant_id: Option<Uuid>, token: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.devices.len();
        tables
            .devices
            .retain(|_, d| !(d.tenant_id == tenant_id && d.token == token));
        Ok(tables.devices.len() < before)
    }

    async fn insert_topic(&self, ctx: TenantContext, topic: &NewTopic) -> Result<Topic> {
        let mut tables = self.tables.write().await;
        let tenant_id = ctx.tenant_id();
        if tables
            .topics
            .values()
            .any(|t| t.tenant_id == tenant_id && t.slug == topic.slug)
        {
            return Err(DispatchError::Validation(format!(
                "topic slug '{}' already exists",
                topic.slug
            )));
        }
        let row = Topic {
            id: Uuid::new_v4(),
            tenant_id,
            name: topic.name.clone(),
            slug: topic.slug.clone(),
            description: topic.description.clone(),
            is_public: topic.is_public,
            is_default: topic.is_default,
            created_at: now(),
        };
        tables.topics.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<Option<Topic>> {
        let tables = self.tables.read().await;
        Ok(tables
            .topics
            .get(&topic_id)
            .filter(|t| ctx.allows(t.tenant_id))
            .cloned())
    }

    async fn default_topics(&self, ctx: TenantContext) -> Result<Vec<Topic>> {
        let tables = self.tables.read().await;
        Ok(tables
            .topics
            .values()
            .filter(|t| t.is_default && ctx.allows(t.tenant_id))
            .cloned()
            .collect())
    }

    async fn delete_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let allowed = tables
            .topics
            .get(&topic_id)
            .map_or(false, |t| ctx.allows(t.tenant_id));
        if !allowed {
            return Ok(false);
        }
        tables.topics.remove(&topic_id);
        tables.subscriptions.retain(|_, s| s.topic_id != topic_id);
        Ok(true)
    }

    async fn insert_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
        channels: SubscriptionChannels,
    ) -> Result<TopicSubscription> {
        let mut tables = self.tables.write().await;
        if tables
            .subscriptions
            .values()
            .any(|s| s.topic_id == topic_id && s.user_id == user_id)
        {
            return Err(DispatchError::DuplicateSubscription);
        }
        let row = TopicSubscription {
            id: Uuid::new_v4(),
            topic_id,
            user_id,
            tenant_id: ctx.tenant_id(),
            fcm_enabled: channels.fcm_enabled,
            sms_enabled: channels.sms_enabled,
            wba_enabled: channels.wba_enabled,
            fcm_synced: false,
            created_at: now(),
        };
        tables.subscriptions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TopicSubscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .find(|s| s.topic_id == topic_id && s.user_id == user_id && ctx.allows(s.tenant_id))
            .cloned())
    }

    async fn delete_subscription(&self, ctx: TenantContext, topic_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.subscriptions.len();
        tables.subscriptions.retain(|_, s| {
            !(s.topic_id == topic_id && s.user_id == user_id && ctx.allows(s.tenant_id))
        });
        Ok(tables.subscriptions.len() < before)
    }

    async fn subscriptions_for_topic(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
    ) -> Result<Vec<TopicSubscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.topic_id == topic_id && ctx.allows(s.tenant_id))
            .cloned()
            .collect())
    }

    async fn topics_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<Topic>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && ctx.allows(s.tenant_id))
            .filter_map(|s| tables.topics.get(&s.topic_id).cloned())
            .collect())
    }

    async fn set_subscription_synced(&self, subscription_id: Uuid, synced: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.subscriptions.get_mut(&subscription_id) {
            row.fcm_synced = synced;
        }
        Ok(())
    }

    async fn unsynced_subscriptions(&self, limit: i64) -> Result<Vec<TopicSubscription>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<TopicSubscription> = tables
            .subscriptions
            .values()
            .filter(|s| !s.fcm_synced && s.fcm_enabled)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn insert_segment(
        &self,
        ctx: TenantContext,
        name: &str,
        conditions: &ConditionGroup,
    ) -> Result<Segment> {
        let mut tables = self.tables.write().await;
        let row = Segment {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            name: name.to_string(),
            conditions: conditions.clone(),
            cached_count: None,
            cached_at: None,
            created_at: now(),
        };
        tables.segments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_segment_conditions(
        &self,
        ctx: TenantContext,
        segment_id: Uuid,
        conditions: &ConditionGroup,
    ) -> Result<Option<Segment>> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .segments
            .get_mut(&segment_id)
            .filter(|s| ctx.allows(s.tenant_id))
            .map(|s| {
                s.conditions = conditions.clone();
                s.clone()
            }))
    }

    async fn get_segment(&self, ctx: TenantContext, segment_id: Uuid) -> Result<Option<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .segments
            .get(&segment_id)
            .filter(|s| ctx.allows(s.tenant_id))
            .cloned())
    }

    async fn set_segment_count(
        &self,
        segment_id: Uuid,
        count: i64,
        at: OffsetDateTime,
    ) -> Result<Option<Segment>> {
        let mut tables = self.tables.write().await;
        Ok(tables.segments.get_mut(&segment_id).map(|s| {
            s.cached_count = Some(count);
            s.cached_at = Some(at);
            s.clone()
        }))
    }

    async fn insert_template(&self, ctx: TenantContext, template: &NewTemplate) -> Result<Template> {
        let mut tables = self.tables.write().await;
        let tenant_id = ctx.tenant_id();
        if tables
            .templates
            .values()
            .any(|t| t.tenant_id == tenant_id && t.key == template.key)
        {
            return Err(DispatchError::Validation(format!(
                "template key '{}' already exists",
                template.key
            )));
        }
        let row = Template {
            id: Uuid::new_v4(),
            tenant_id,
            key: template.key.clone(),
            title_pattern: template.title_pattern.clone(),
            body_pattern: template.body_pattern.clone(),
            variables: template.variables.clone(),
            created_at: now(),
        };
        tables.templates.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_template(&self, ctx: TenantContext, template_id: Uuid) -> Result<Option<Template>> {
        let tables = self.tables.read().await;
        Ok(tables
            .templates
            .get(&template_id)
            .filter(|t| ctx.allows(t.tenant_id))
            .cloned())
    }

    async fn insert_campaign(&self, ctx: TenantContext, campaign: &NewCampaign) -> Result<Campaign> {
        let mut tables = self.tables.write().await;
        let row = Campaign {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            name: campaign.name.clone(),
            template_id: campaign.template_id,
            segment_id: campaign.segment_id,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            sent_at: None,
            sent_count: 0,
            failed_count: 0,
            created_at: now(),
        };
        tables.campaigns.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<Option<Campaign>> {
        let tables = self.tables.read().await;
        Ok(tables
            .campaigns
            .get(&campaign_id)
            .filter(|c| ctx.allows(c.tenant_id))
            .cloned())
    }

    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.campaigns.get_mut(&campaign_id) {
            Some(row) if from.contains(&row.status) => {
                row.status = to;
                if to == CampaignStatus::Sent {
                    row.sent_at = Some(now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_campaign(
        &self,
        ctx: TenantContext,
        campaign_id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.campaigns.get_mut(&campaign_id) {
            Some(row)
                if ctx.allows(row.tenant_id)
                    && matches!(row.status, CampaignStatus::Draft | CampaignStatus::Scheduled) =>
            {
                row.status = CampaignStatus::Scheduled;
                row.scheduled_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_campaign_counts(&self, campaign_id: Uuid, sent: i64, failed: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.campaigns.get_mut(&campaign_id) {
            row.sent_count += sent;
            row.failed_count += failed;
        }
        Ok(())
    }

    async fn due_campaigns(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<Campaign>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Campaign> = tables
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Scheduled)
            .filter(|c| {
                c.scheduled_at
                    .map_or(false, |at| at <= now && at >= window_start)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn insert_scheduled(
        &self,
        ctx: TenantContext,
        notification: &NewScheduledNotification,
    ) -> Result<ScheduledNotification> {
        let mut tables = self.tables.write().await;
        let row = ScheduledNotification {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            recipient_ref: notification.recipient_ref,
            payload: notification.payload.clone(),
            scheduled_at: notification.scheduled_at,
            status: ScheduledStatus::Pending,
            sent_at: None,
            claimed_at: None,
            created_at: now(),
        };
        tables.scheduled.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_scheduled(
        &self,
        ctx: TenantContext,
        notification_id: Uuid,
    ) -> Result<Option<ScheduledNotification>> {
        let tables = self.tables.read().await;
        Ok(tables
            .scheduled
            .get(&notification_id)
            .filter(|n| ctx.allows(n.tenant_id))
            .cloned())
    }

    async fn due_scheduled(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        let tables = self.tables.read().await;
        let mut due: Vec<ScheduledNotification> = tables
            .scheduled
            .values()
            .filter(|n| n.status == ScheduledStatus::Pending)
            .filter(|n| n.scheduled_at <= now && n.scheduled_at >= window_start)
            .cloned()
            .collect();
        due.sort_by_key(|n| n.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_scheduled(
        &self,
        notification_id: Uuid,
        now: OffsetDateTime,
        lease_cutoff: OffsetDateTime,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.scheduled.get_mut(&notification_id) {
            Some(row)
                if row.status == ScheduledStatus::Pending
                    && row.claimed_at.map_or(true, |at| at < lease_cutoff) =>
            {
                row.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_scheduled(&self, notification_id: Uuid, status: ScheduledStatus) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.scheduled.get_mut(&notification_id) {
            Some(row) if row.status == ScheduledStatus::Pending => {
                row.status = status;
                if status == ScheduledStatus::Sent {
                    row.sent_at = Some(now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_log(&self, attempt: &LogAttempt) -> Result<NotificationLog> {
        let mut tables = self.tables.write().await;
        let sent_at = (attempt.status == LogStatus::Sent).then(now);
        let row = tables
            .logs
            .entry(attempt.dedup_key.clone())
            .and_modify(|row| {
                row.status = attempt.status;
                row.attempts += attempt.attempts;
                row.title = attempt.title.clone();
                row.body = attempt.body.clone();
                if sent_at.is_some() {
                    row.sent_at = sent_at;
                }
            })
            .or_insert_with(|| NotificationLog {
                id: Uuid::new_v4(),
                dedup_key: attempt.dedup_key.clone(),
                user_id: attempt.user_id,
                tenant_id: attempt.tenant_id,
                channel: attempt.channel.clone(),
                title: attempt.title.clone(),
                body: attempt.body.clone(),
                payload: attempt.payload.clone(),
                status: attempt.status,
                attempts: attempt.attempts,
                sent_at,
                opened_at: None,
                created_at: now(),
            });
        Ok(row.clone())
    }

    async fn find_log(&self, dedup_key: &str) -> Result<Option<NotificationLog>> {
        let tables = self.tables.read().await;
        Ok(tables.logs.get(dedup_key).cloned())
    }

    async fn query_logs(&self, ctx: TenantContext, query: &LogQuery) -> Result<Vec<NotificationLog>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<NotificationLog> = tables
            .logs
            .values()
            .filter(|l| ctx.allows(l.tenant_id))
            .filter(|l| query.status.map_or(true, |s| l.status == s))
            .filter(|l| query.user_id.map_or(true, |u| l.user_id == u))
            .filter(|l| query.from.map_or(true, |from| l.created_at >= from))
            .filter(|l| query.to.map_or(true, |to| l.created_at <= to))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(query.limit.unwrap_or(100).clamp(1, 1000) as usize);
        Ok(rows)
    }

    async fn mark_log_opened(&self, ctx: TenantContext, log_id: Uuid) -> Result<Option<NotificationLog>> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .logs
            .values_mut()
            .find(|l| l.id == log_id && ctx.allows(l.tenant_id))
            .map(|l| {
                if l.status == LogStatus::Sent {
                    l.status = LogStatus::Opened;
                    l.opened_at = Some(now());
                }
                l.clone()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationPayload, Platform};
    use serde_json::json;
    use time::Duration;

    async fn draft_campaign(store: &MemoryStore) -> Campaign {
        store
            .insert_campaign(
                TenantContext::Global,
                &NewCampaign {
                    name: "spring".to_string(),
                    template_id: None,
                    segment_id: None,
                },
            )
            .await
            .unwrap()
    }

    fn attempt(key: &str, status: LogStatus, attempts: i32) -> LogAttempt {
        LogAttempt {
            dedup_key: key.to_string(),
            user_id: Uuid::nil(),
            tenant_id: None,
            channel: "push".to_string(),
            title: "Hello".to_string(),
            body: "World".to_string(),
            payload: json!({}),
            status,
            attempts,
        }
    }

    #[tokio::test]
    async fn campaign_transition_only_fires_from_listed_states() {
        let store = MemoryStore::new();
        let campaign = draft_campaign(&store).await;

        assert!(!store
            .transition_campaign(campaign.id, &[CampaignStatus::Scheduled], CampaignStatus::Sending)
            .await
            .unwrap());
        assert!(store
            .transition_campaign(campaign.id, &[CampaignStatus::Draft], CampaignStatus::Sending)
            .await
            .unwrap());
        assert!(!store
            .transition_campaign(campaign.id, &[CampaignStatus::Draft], CampaignStatus::Sending)
            .await
            .unwrap());
        assert!(store
            .transition_campaign(campaign.id, &[CampaignStatus::Sending], CampaignStatus::Sent)
            .await
            .unwrap());

        let row = store
            .get_campaign(TenantContext::Global, campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CampaignStatus::Sent);
        assert!(row.sent_at.is_some());
        assert!(!store
            .transition_campaign(Uuid::new_v4(), &[CampaignStatus::Draft], CampaignStatus::Sending)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scheduled_claim_holds_until_lease_expires() {
        let store = MemoryStore::new();
        let row = store
            .insert_scheduled(
                TenantContext::Global,
                &NewScheduledNotification {
                    recipient_ref: Uuid::new_v4(),
                    payload: NotificationPayload::default(),
                    scheduled_at: now(),
                },
            )
            .await
            .unwrap();
        let claimed_at = now();
        let lease = Duration::minutes(10);

        assert!(store
            .claim_scheduled(row.id, claimed_at, claimed_at - lease)
            .await
            .unwrap());
        let later = claimed_at + Duration::minutes(1);
        assert!(!store.claim_scheduled(row.id, later, later - lease).await.unwrap());

        let after_lease = claimed_at + Duration::minutes(11);
        assert!(store
            .claim_scheduled(row.id, after_lease, after_lease - lease)
            .await
            .unwrap());

        assert!(store
            .finish_scheduled(row.id, ScheduledStatus::Sent)
            .await
            .unwrap());
        let much_later = after_lease + Duration::hours(1);
        assert!(!store
            .claim_scheduled(row.id, much_later, much_later - lease)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn log_upsert_accumulates_attempts() {
        let store = MemoryStore::new();

        let first = store.upsert_log(&attempt("k1", LogStatus::Failed, 1)).await.unwrap();
        assert_eq!(first.attempts, 1);
        assert!(first.sent_at.is_none());

        let second = store.upsert_log(&attempt("k1", LogStatus::Sent, 2)).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 3);
        assert_eq!(second.status, LogStatus::Sent);
        assert!(second.sent_at.is_some());
        assert_eq!(store.log_count().await, 1);
    }

    #[tokio::test]
    async fn device_lookup_by_token_is_tenant_scoped() {
        let store = MemoryStore::new();
        let tenant = TenantContext::Tenant(Uuid::new_v4());
        let device = store
            .upsert_device(
                tenant,
                &NewDevice {
                    user_id: Uuid::new_v4(),
                    token: "tok".to_string(),
                    platform: Platform::Android,
                    device_name: None,
                },
            )
            .await
            .unwrap();

        let found = store.device_by_token(tenant, "tok").await.unwrap().unwrap();
        assert_eq!(found.id, device.id);
        assert!(store
            .device_by_token(TenantContext::Global, "tok")
            .await
            .unwrap()
            .is_none());
        assert!(store.device_by_token(tenant, "other").await.unwrap().is_none());
    }
}
