use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::gateway::{GatewayError, PushGateway};
use crate::metrics::TOPIC_SYNC_FAILURES;
use crate::models::{DeviceToken, NewDevice, NewTopic, SubscriptionChannels, Topic, TopicSubscription};
use crate::store::Store;
use crate::tenant::TenantContext;

pub const MIN_TOKEN_LEN: usize = 100;
pub const MAX_TOKEN_LEN: usize = 500;

pub fn validate_token(token: &str) -> Result<()> {
    let len = token.len();
    if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len) {
        return Err(DispatchError::Validation(format!(
            "token length must be between {} and {} characters, got {}",
            MIN_TOKEN_LEN, MAX_TOKEN_LEN, len
        )));
    }
    Ok(())
}

fn validate_slug(slug: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(DispatchError::Validation(format!(
            "topic slug '{}' may only contain letters, digits, '-', '_' and '.'",
            slug
        )));
    }
    Ok(())
}

/// Name of the topic at the gateway. Gateway topics are project-wide, so
/// tenant topics carry the tenant id as a prefix.
pub fn gateway_topic_name(topic: &Topic) -> String {
    match topic.tenant_id {
        Some(tenant_id) => format!("{}-{}", tenant_id, topic.slug),
        None => topic.slug.clone(),
    }
}

fn count_failures(topic: &str, results: &[std::result::Result<(), GatewayError>]) -> usize {
    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > 0 {
        TOPIC_SYNC_FAILURES.inc_by(failures as f64);
        warn!(topic = %topic, failures, "Gateway did not confirm topic membership change");
    }
    failures
}

/// Devices, topics and subscriptions.
///
/// The store is always written first; gateway topic membership follows and
/// its failures only show up as `fcm_synced = false`.
pub struct Registry<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
}

impl<S, G> Registry<S, G>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>) -> Self {
        Self { store, gateway }
    }

    pub async fn register_device(&self, ctx: TenantContext, device: NewDevice) -> Result<DeviceToken> {
        validate_token(&device.token)?;

        let previous_owner = self
            .store
            .device_by_token(ctx, &device.token)
            .await?
            .map(|d| d.user_id)
            .filter(|owner| *owner != device.user_id);
        let first_device = self
            .store
            .devices_for_user(ctx, device.user_id)
            .await?
            .is_empty();
        let row = self.store.upsert_device(ctx, &device).await?;
        info!(user_id = %row.user_id, device_id = %row.id, platform = ?row.platform, "Device registered");

        // A token handed to another user leaves the old owner's topics
        if let Some(owner) = previous_owner {
            let tokens = vec![row.token.clone()];
            for topic in self.store.topics_for_user(ctx, owner).await? {
                let name = gateway_topic_name(&topic);
                let results = self.gateway.unsubscribe_topic(&tokens, &name).await;
                count_failures(&name, &results);
            }
            info!(device_id = %row.id, previous_owner = %owner, "Device token moved to a new user");
        }

        if first_device {
            for topic in self.store.default_topics(ctx).await? {
                match self
                    .store
                    .insert_subscription(ctx, topic.id, row.user_id, SubscriptionChannels::default())
                    .await
                {
                    Ok(_) => debug!(user_id = %row.user_id, topic = %topic.slug, "Auto-subscribed to default topic"),
                    Err(DispatchError::DuplicateSubscription) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // The new token joins every topic the user already follows
        let new_token = vec![row.token.clone()];
        for topic in self.store.topics_for_user(ctx, row.user_id).await? {
            let Some(sub) = self.store.get_subscription(ctx, topic.id, row.user_id).await? else {
                continue;
            };
            if !sub.fcm_enabled {
                continue;
            }
            if sub.fcm_synced {
                // Older tokens are already members; only a failure can change the flag
                let name = gateway_topic_name(&topic);
                let results = self.gateway.subscribe_topic(&new_token, &name).await;
                if count_failures(&name, &results) > 0 {
                    self.store.set_subscription_synced(sub.id, false).await?;
                }
            } else {
                let tokens = self.user_tokens(ctx, row.user_id).await?;
                self.push_membership(&sub, &topic, &tokens).await?;
            }
        }

        Ok(row)
    }

    pub async fn get_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<DeviceToken> {
        self.store
            .get_device(ctx, device_id)
            .await?
            .ok_or(DispatchError::NotFound("device"))
    }

    pub async fn devices_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<DeviceToken>> {
        self.store.devices_for_user(ctx, user_id).await
    }

    /// Removes the device and pulls its token out of the user's topics.
    /// The user's subscription rows are kept.
    pub async fn delete_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<()> {
        let device = self.get_device(ctx, device_id).await?;
        if !self.store.delete_device(ctx, device_id).await? {
            return Err(DispatchError::NotFound("device"));
        }
        info!(user_id = %device.user_id, device_id = %device_id, "Device deleted");

        let tokens = vec![device.token];
        for topic in self.store.topics_for_user(ctx, device.user_id).await? {
            let name = gateway_topic_name(&topic);
            let results = self.gateway.unsubscribe_topic(&tokens, &name).await;
            count_failures(&name, &results);
        }
        Ok(())
    }

    pub async fn create_topic(&self, ctx: TenantContext, topic: &NewTopic) -> Result<Topic> {
        validate_slug(&topic.slug)?;
        let row = self.store.insert_topic(ctx, topic).await?;
        info!(topic_id = %row.id, slug = %row.slug, is_default = row.is_default, "Topic created");
        Ok(row)
    }

    pub async fn get_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<Topic> {
        self.store
            .get_topic(ctx, topic_id)
            .await?
            .ok_or(DispatchError::NotFound("topic"))
    }

    /// Deletes the topic with all of its subscriptions, then removes every
    /// subscriber token from the gateway topic.
    pub async fn delete_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<()> {
        let topic = self.get_topic(ctx, topic_id).await?;
        let subscriptions = self.store.subscriptions_for_topic(ctx, topic_id).await?;

        let mut tokens = Vec::new();
        for sub in &subscriptions {
            tokens.extend(self.user_tokens(ctx, sub.user_id).await?);
        }

        self.store.delete_topic(ctx, topic_id).await?;
        info!(
            topic_id = %topic_id,
            subscriptions = subscriptions.len(),
            "Topic deleted"
        );

        if !tokens.is_empty() {
            let name = gateway_topic_name(&topic);
            let results = self.gateway.unsubscribe_topic(&tokens, &name).await;
            count_failures(&name, &results);
        }
        Ok(())
    }

    /// Idempotent: an existing subscription is returned unchanged.
    pub async fn subscribe(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        topic_id: Uuid,
        channels: SubscriptionChannels,
    ) -> Result<TopicSubscription> {
        let topic = self.get_topic(ctx, topic_id).await?;

        let sub = match self
            .store
            .insert_subscription(ctx, topic_id, user_id, channels)
            .await
        {
            Ok(sub) => sub,
            Err(DispatchError::DuplicateSubscription) => {
                debug!(user_id = %user_id, topic_id = %topic_id, "Already subscribed");
                return self
                    .store
                    .get_subscription(ctx, topic_id, user_id)
                    .await?
                    .ok_or(DispatchError::NotFound("subscription"));
            }
            Err(e) => return Err(e),
        };
        info!(user_id = %user_id, topic = %topic.slug, "Subscribed to topic");

        if !sub.fcm_enabled {
            return Ok(sub);
        }
        let tokens = self.user_tokens(ctx, user_id).await?;
        let synced = self.push_membership(&sub, &topic, &tokens).await?;
        Ok(TopicSubscription {
            fcm_synced: synced,
            ..sub
        })
    }

    /// Removes the subscription whether or not the gateway call succeeds.
    pub async fn unsubscribe(&self, ctx: TenantContext, user_id: Uuid, topic_id: Uuid) -> Result<bool> {
        let topic = self.get_topic(ctx, topic_id).await?;
        let removed = self.store.delete_subscription(ctx, topic_id, user_id).await?;
        info!(user_id = %user_id, topic = %topic.slug, removed, "Unsubscribed from topic");

        let tokens = self.user_tokens(ctx, user_id).await?;
        if !tokens.is_empty() {
            let name = gateway_topic_name(&topic);
            let results = self.gateway.unsubscribe_topic(&tokens, &name).await;
            count_failures(&name, &results);
        }
        Ok(removed)
    }

    /// Retries gateway membership for subscriptions still marked unsynced.
    /// Returns how many became synced.
    pub async fn reconcile_unsynced(&self, limit: i64) -> Result<usize> {
        let pending = self.store.unsynced_subscriptions(limit).await?;
        let mut synced = 0;

        for sub in &pending {
            let ctx = TenantContext::for_row(sub.tenant_id);
            let Some(topic) = self.store.get_topic(ctx, sub.topic_id).await? else {
                continue;
            };
            let tokens = self.user_tokens(ctx, sub.user_id).await?;
            if self.push_membership(sub, &topic, &tokens).await? {
                synced += 1;
            }
        }

        if !pending.is_empty() {
            info!(checked = pending.len(), synced, "Reconciled unsynced subscriptions");
        }
        Ok(synced)
    }

    async fn user_tokens(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .store
            .devices_for_user(ctx, user_id)
            .await?
            .into_iter()
            .map(|d| d.token)
            .collect())
    }

    // Sends tokens to the gateway topic; marks the row synced only when every
    // token was accepted
    async fn push_membership(
        &self,
        sub: &TopicSubscription,
        topic: &Topic,
        tokens: &[String],
    ) -> Result<bool> {
        let name = gateway_topic_name(topic);
        let synced = if tokens.is_empty() {
            true
        } else {
            let results = self.gateway.subscribe_topic(tokens, &name).await;
            count_failures(&name, &results) == 0
        };

        if synced != sub.fcm_synced {
            self.store.set_subscription_synced(sub.id, synced).await?;
        }
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::memory_store::MemoryStore;
    use crate::models::Platform;

    fn token(seed: &str) -> String {
        format!("{}:{}", seed, "a".repeat(150))
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MockGateway>, Registry<MemoryStore, MockGateway>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let registry = Registry::new(store.clone(), gateway.clone());
        (store, gateway, registry)
    }

    fn device(user_id: Uuid, token: &str) -> NewDevice {
        NewDevice {
            user_id,
            token: token.to_string(),
            platform: Platform::Android,
            device_name: Some("Pixel".to_string()),
        }
    }

    fn new_topic(slug: &str, is_default: bool) -> NewTopic {
        NewTopic {
            name: slug.to_uppercase(),
            slug: slug.to_string(),
            description: None,
            is_public: true,
            is_default,
        }
    }

    #[tokio::test]
    async fn first_device_subscribes_to_default_topics() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let news = registry.create_topic(ctx, &new_topic("news", true)).await.unwrap();
        registry.create_topic(ctx, &new_topic("promo", false)).await.unwrap();
        let user = Uuid::new_v4();

        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();

        let topics = store.topics_for_user(ctx, user).await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].id, news.id);
        assert_eq!(gateway.subscribed(), vec![(token("t1"), "news".to_string())]);
        let sub = store.get_subscription(ctx, news.id, user).await.unwrap().unwrap();
        assert!(sub.fcm_synced);
    }

    #[tokio::test]
    async fn short_tokens_are_rejected() {
        let (_, _, registry) = setup();
        let result = registry
            .register_device(TenantContext::Global, device(Uuid::new_v4(), "short"))
            .await;
        assert!(matches!(result, Err(DispatchError::Validation(_))));
    }

    #[tokio::test]
    async fn double_subscribe_keeps_one_row() {
        let (store, _, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();

        let first = registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();
        let second = registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn deleting_only_device_keeps_subscriptions() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        let dev = registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();
        registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        registry.delete_device(ctx, dev.id).await.unwrap();

        assert!(store.devices_for_user(ctx, user).await.unwrap().is_empty());
        assert!(store.get_subscription(ctx, topic.id, user).await.unwrap().is_some());
        assert_eq!(gateway.unsubscribed(), vec![(token("t1"), "news".to_string())]);
    }

    #[tokio::test]
    async fn gateway_failure_leaves_subscription_unsynced_until_reconciled() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();

        gateway.fail_topic_calls(true);
        let sub = registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();
        assert!(!sub.fcm_synced);
        assert_eq!(registry.reconcile_unsynced(10).await.unwrap(), 0);

        gateway.fail_topic_calls(false);
        assert_eq!(registry.reconcile_unsynced(10).await.unwrap(), 1);
        let sub = store.get_subscription(ctx, topic.id, user).await.unwrap().unwrap();
        assert!(sub.fcm_synced);
    }

    #[tokio::test]
    async fn unsubscribe_removes_row_even_when_gateway_fails() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();
        registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        gateway.fail_topic_calls(true);
        assert!(registry.unsubscribe(ctx, user, topic.id).await.unwrap());
        assert_eq!(store.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn deleting_topic_cascades_and_unsubscribes_tokens() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        for seed in ["a", "b"] {
            let user = Uuid::new_v4();
            registry.register_device(ctx, device(user, &token(seed))).await.unwrap();
            registry
                .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
                .await
                .unwrap();
        }

        registry.delete_topic(ctx, topic.id).await.unwrap();

        assert_eq!(store.subscription_count().await, 0);
        assert_eq!(gateway.unsubscribed().len(), 2);
        assert!(matches!(
            registry.get_topic(ctx, topic.id).await,
            Err(DispatchError::NotFound("topic"))
        ));
    }

    #[tokio::test]
    async fn tenant_topics_are_prefixed_at_the_gateway() {
        let (_, gateway, registry) = setup();
        let tenant = Uuid::new_v4();
        let ctx = TenantContext::Tenant(tenant);
        registry.create_topic(ctx, &new_topic("news", true)).await.unwrap();

        registry
            .register_device(ctx, device(Uuid::new_v4(), &token("t1")))
            .await
            .unwrap();

        assert_eq!(gateway.subscribed()[0].1, format!("{}-news", tenant));
    }

    #[tokio::test]
    async fn new_device_does_not_mark_pending_tokens_synced() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();

        gateway.fail_topic_calls(true);
        let sub = registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();
        assert!(!sub.fcm_synced);

        gateway.fail_topic_calls(false);
        registry.register_device(ctx, device(user, &token("t2"))).await.unwrap();

        // t1 is pushed again alongside t2, so the row is synced for real
        let t1_joins = gateway
            .subscribed()
            .iter()
            .filter(|(t, name)| *t == token("t1") && name == "news")
            .count();
        assert_eq!(t1_joins, 2);
        let sub = store.get_subscription(ctx, topic.id, user).await.unwrap().unwrap();
        assert!(sub.fcm_synced);
        assert_eq!(registry.reconcile_unsynced(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_join_of_new_device_marks_subscription_unsynced() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();
        registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        gateway.fail_topic_calls(true);
        registry.register_device(ctx, device(user, &token("t2"))).await.unwrap();
        let sub = store.get_subscription(ctx, topic.id, user).await.unwrap().unwrap();
        assert!(!sub.fcm_synced);

        gateway.fail_topic_calls(false);
        assert_eq!(registry.reconcile_unsynced(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn moved_token_leaves_previous_owner_topics() {
        let (store, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.register_device(ctx, device(alice, &token("shared"))).await.unwrap();
        registry
            .subscribe(ctx, alice, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        let moved = registry.register_device(ctx, device(bob, &token("shared"))).await.unwrap();

        assert_eq!(moved.user_id, bob);
        assert_eq!(gateway.unsubscribed(), vec![(token("shared"), "news".to_string())]);
        assert!(store.devices_for_user(ctx, alice).await.unwrap().is_empty());
        // Alice keeps her subscription row for future devices
        assert!(store.get_subscription(ctx, topic.id, alice).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reregistering_same_owner_does_not_unsubscribe() {
        let (_, gateway, registry) = setup();
        let ctx = TenantContext::Global;
        let topic = registry.create_topic(ctx, &new_topic("news", false)).await.unwrap();
        let user = Uuid::new_v4();
        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();
        registry
            .subscribe(ctx, user, topic.id, SubscriptionChannels::default())
            .await
            .unwrap();

        registry.register_device(ctx, device(user, &token("t1"))).await.unwrap();

        assert!(gateway.unsubscribed().is_empty());
    }
}
