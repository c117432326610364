//! Persistence seam shared by the Postgres store and the in-memory store.
//!
//! Every tenant-owned read and insert takes a [`TenantContext`]. Calls made on
//! behalf of the scheduler or reconciliation (due queries, claims, counters)
//! address rows by id and span all tenants.

use sqlx::types::time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Campaign, CampaignStatus, DeviceToken, LogAttempt, LogQuery, NewCampaign, NewDevice,
    NewScheduledNotification, NewTemplate, NewTopic, NotificationLog, ScheduledNotification,
    ScheduledStatus, Segment, SubscriptionChannels, Template, Topic, TopicSubscription, UserRecord,
};
use crate::segment::{ConditionGroup, Predicate};
use crate::tenant::TenantContext;

#[trait_variant::make(Store: Send)]
pub trait LocalStore {
    // Users

    async fn upsert_user(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        attributes: serde_json::Value,
    ) -> Result<UserRecord>;

    async fn get_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Option<UserRecord>>;

    async fn count_matching_users(&self, predicate: &Predicate) -> Result<i64>;

    /// Ids strictly greater than `after`, ascending, at most `limit`.
    async fn matching_user_ids(
        &self,
        predicate: &Predicate,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    // Devices

    /// Inserts or re-points the row owning `(tenant, token)`.
    async fn upsert_device(&self, ctx: TenantContext, device: &NewDevice) -> Result<DeviceToken>;

    /// The row owning `(tenant, token)` exactly, if any.
    async fn device_by_token(&self, ctx: TenantContext, token: &str) -> Result<Option<DeviceToken>>;

    async fn get_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<Option<DeviceToken>>;

    async fn devices_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<DeviceToken>>;

    async fn delete_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<bool>;

    async fn delete_device_by_token(&self, tenant_id: Option<Uuid>, token: &str) -> Result<bool>;

    // Topics and subscriptions

    async fn insert_topic(&self, ctx: TenantContext, topic: &NewTopic) -> Result<Topic>;

    async fn get_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<Option<Topic>>;

    async fn default_topics(&self, ctx: TenantContext) -> Result<Vec<Topic>>;

    /// Removes the topic and, with it, all of its subscriptions.
    async fn delete_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<bool>;

    /// Fails with `DuplicateSubscription` when `(topic, user)` already exists.
    async fn insert_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
        channels: SubscriptionChannels,
    ) -> Result<TopicSubscription>;

    async fn get_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TopicSubscription>>;

    async fn delete_subscription(&self, ctx: TenantContext, topic_id: Uuid, user_id: Uuid) -> Result<bool>;

    async fn subscriptions_for_topic(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
    ) -> Result<Vec<TopicSubscription>>;

    async fn topics_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<Topic>>;

    async fn set_subscription_synced(&self, subscription_id: Uuid, synced: bool) -> Result<()>;

    async fn unsynced_subscriptions(&self, limit: i64) -> Result<Vec<TopicSubscription>>;

    // Segments

    async fn insert_segment(
        &self,
        ctx: TenantContext,
        name: &str,
        conditions: &ConditionGroup,
    ) -> Result<Segment>;

    async fn update_segment_conditions(
        &self,
        ctx: TenantContext,
        segment_id: Uuid,
        conditions: &ConditionGroup,
    ) -> Result<Option<Segment>>;

    async fn get_segment(&self, ctx: TenantContext, segment_id: Uuid) -> Result<Option<Segment>>;

    /// Writes `cached_count` and `cached_at` together.
    async fn set_segment_count(
        &self,
        segment_id: Uuid,
        count: i64,
        at: OffsetDateTime,
    ) -> Result<Option<Segment>>;

    // Templates

    async fn insert_template(&self, ctx: TenantContext, template: &NewTemplate) -> Result<Template>;

    async fn get_template(&self, ctx: TenantContext, template_id: Uuid) -> Result<Option<Template>>;

    // Campaigns

    async fn insert_campaign(&self, ctx: TenantContext, campaign: &NewCampaign) -> Result<Campaign>;

    async fn get_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<Option<Campaign>>;

    /// Compare-and-swap on status. Returns true only if this call changed the row.
    /// Moving to `sent` also stamps `sent_at`.
    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    /// Moves a draft or scheduled campaign to `scheduled` at the given time.
    async fn schedule_campaign(
        &self,
        ctx: TenantContext,
        campaign_id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool>;

    async fn add_campaign_counts(&self, campaign_id: Uuid, sent: i64, failed: i64) -> Result<()>;

    async fn due_campaigns(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<Campaign>>;

    // Scheduled notifications

    async fn insert_scheduled(
        &self,
        ctx: TenantContext,
        notification: &NewScheduledNotification,
    ) -> Result<ScheduledNotification>;

    async fn get_scheduled(
        &self,
        ctx: TenantContext,
        notification_id: Uuid,
    ) -> Result<Option<ScheduledNotification>>;

    async fn due_scheduled(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>>;

    /// Takes the lease on a pending notification unless another worker holds
    /// a lease newer than `lease_cutoff`.
    async fn claim_scheduled(
        &self,
        notification_id: Uuid,
        now: OffsetDateTime,
        lease_cutoff: OffsetDateTime,
    ) -> Result<bool>;

    async fn finish_scheduled(&self, notification_id: Uuid, status: ScheduledStatus) -> Result<bool>;

    // Delivery log

    /// Inserts the row for `dedup_key` or updates its status and adds to `attempts`.
    async fn upsert_log(&self, attempt: &LogAttempt) -> Result<NotificationLog>;

    async fn find_log(&self, dedup_key: &str) -> Result<Option<NotificationLog>>;

    async fn query_logs(&self, ctx: TenantContext, query: &LogQuery) -> Result<Vec<NotificationLog>>;

    async fn mark_log_opened(&self, ctx: TenantContext, log_id: Uuid) -> Result<Option<NotificationLog>>;
}
