use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, QueryBuilder};
use sqlx::types::{time::OffsetDateTime, Json};
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{
    Campaign, CampaignStatus, DeviceToken, LogAttempt, LogQuery, LogStatus, NewCampaign, NewDevice,
    NewScheduledNotification, NewTemplate, NewTopic, NotificationLog, ScheduledNotification,
    ScheduledStatus, Segment, SubscriptionChannels, Template, Topic, TopicSubscription, UserRecord,
};
use crate::segment::{Bound, ConditionGroup, FieldTest, OrderOp, Predicate, TextOp};
use crate::store::Store;
use crate::tenant::TenantContext;

const USER_COLUMNS: &str = "id, tenant_id, attributes, created_at";
const DEVICE_COLUMNS: &str =
    "id, user_id, tenant_id, token, platform, device_name, last_active_at, created_at";
const TOPIC_COLUMNS: &str =
    "id, tenant_id, name, slug, description, is_public, is_default, created_at";
const SUBSCRIPTION_COLUMNS: &str = "id, topic_id, user_id, tenant_id, fcm_enabled, sms_enabled, \
     wba_enabled, fcm_synced, created_at";
const SEGMENT_COLUMNS: &str = "id, tenant_id, name, conditions, cached_count, cached_at, created_at";
const TEMPLATE_COLUMNS: &str =
    "id, tenant_id, key, title_pattern, body_pattern, variables, created_at";
const CAMPAIGN_COLUMNS: &str = "id, tenant_id, name, template_id, segment_id, status, scheduled_at, \
     sent_at, sent_count, failed_count, created_at";
const SCHEDULED_COLUMNS: &str =
    "id, tenant_id, recipient_ref, payload, scheduled_at, status, sent_at, claimed_at, created_at";
const LOG_COLUMNS: &str = "id, dedup_key, user_id, tenant_id, channel, title, body, payload, \
     status, attempts, sent_at, opened_at, created_at";

pub async fn init_db_pool(database_url: &str, max_connections: u32) -> anyhow::Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(pool)
}

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn unique_violation_as(err: sqlx::Error, message: String) -> DispatchError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DispatchError::Validation(message),
        _ => DispatchError::Database(err),
    }
}

/// Renders a compiled predicate as a SQL boolean over the `users` table.
///
/// Field names are always bound as parameters, never spliced into the text.
pub fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::True => {
            qb.push("TRUE");
        }
        Predicate::Tenant(id) => {
            qb.push("tenant_id = ").push_bind(*id);
        }
        Predicate::All(children) | Predicate::Any(children) => {
            if children.is_empty() {
                qb.push("TRUE");
                return;
            }
            let joiner = if matches!(predicate, Predicate::All(_)) {
                " AND "
            } else {
                " OR "
            };
            qb.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_predicate(qb, child);
            }
            qb.push(")");
        }
        Predicate::Not(inner) => {
            qb.push("((");
            push_predicate(qb, inner);
            qb.push(") IS NOT TRUE)");
        }
        Predicate::Test { field, test } => push_field_test(qb, field, test),
    }
}

// String view of an attribute; numbers and booleans are not text
fn push_text_attr(qb: &mut QueryBuilder<'_, Postgres>, field: &str, ignore_case: bool) {
    qb.push(if ignore_case { "lower(" } else { "(" });
    qb.push("CASE WHEN jsonb_typeof(attributes -> ")
        .push_bind(field.to_string())
        .push(") = 'string' THEN attributes ->> ")
        .push_bind(field.to_string())
        .push(" END)");
}

// Typed view of an attribute; NULL when the stored JSON has the wrong shape
fn push_typed_attr(qb: &mut QueryBuilder<'_, Postgres>, field: &str, bound: &Bound) {
    match bound {
        Bound::Number(_) => {
            qb.push("(CASE WHEN jsonb_typeof(attributes -> ")
                .push_bind(field.to_string())
                .push(") = 'number' THEN (attributes ->> ")
                .push_bind(field.to_string())
                .push(")::float8 END)");
        }
        Bound::Date(_) => {
            // safe_timestamptz yields NULL for anything that is not a valid date
            qb.push("safe_timestamptz(CASE WHEN jsonb_typeof(attributes -> ")
                .push_bind(field.to_string())
                .push(") = 'string' THEN attributes ->> ")
                .push_bind(field.to_string())
                .push(" END)");
        }
    }
}

fn push_bound(qb: &mut QueryBuilder<'_, Postgres>, bound: &Bound) {
    match bound {
        Bound::Number(n) => {
            qb.push_bind(*n);
        }
        Bound::Date(d) => {
            qb.push_bind(*d);
        }
    }
}

fn push_field_test(qb: &mut QueryBuilder<'_, Postgres>, field: &str, test: &FieldTest) {
    match test {
        FieldTest::Text {
            op,
            value,
            ignore_case,
        } => {
            let value = if *ignore_case {
                value.to_lowercase()
            } else {
                value.clone()
            };
            match op {
                TextOp::Equals => {
                    push_text_attr(qb, field, *ignore_case);
                    qb.push(" = ").push_bind(value);
                }
                TextOp::Contains => {
                    qb.push("strpos(");
                    push_text_attr(qb, field, *ignore_case);
                    qb.push(", ").push_bind(value).push(") > 0");
                }
                TextOp::StartsWith => {
                    qb.push("starts_with(");
                    push_text_attr(qb, field, *ignore_case);
                    qb.push(", ").push_bind(value).push(")");
                }
                TextOp::EndsWith => {
                    qb.push("right(");
                    push_text_attr(qb, field, *ignore_case);
                    qb.push(", char_length(")
                        .push_bind(value.clone())
                        .push(")) = ")
                        .push_bind(value);
                }
            }
        }
        FieldTest::TextBlank => {
            qb.push("COALESCE(attributes ->> ")
                .push_bind(field.to_string())
                .push(", '') = ''");
        }
        FieldTest::Order { op, bound } => {
            push_typed_attr(qb, field, bound);
            qb.push(match op {
                OrderOp::Eq => " = ",
                OrderOp::Gt => " > ",
                OrderOp::Gte => " >= ",
                OrderOp::Lt => " < ",
                OrderOp::Lte => " <= ",
            });
            push_bound(qb, bound);
        }
        FieldTest::Range { low, high } => {
            push_typed_attr(qb, field, low);
            qb.push(" BETWEEN ");
            push_bound(qb, low);
            qb.push(" AND ");
            push_bound(qb, high);
        }
        FieldTest::Missing => {
            qb.push("(attributes -> ")
                .push_bind(field.to_string())
                .push(" IS NULL OR attributes -> ")
                .push_bind(field.to_string())
                .push(" = 'null'::jsonb)");
        }
        FieldTest::SetMember(value) => {
            qb.push("(jsonb_typeof(attributes -> ")
                .push_bind(field.to_string())
                .push(") = 'array' AND attributes -> ")
                .push_bind(field.to_string())
                .push(" @> ")
                .push_bind(Json(serde_json::Value::Array(vec![value.clone()])))
                .push(")");
        }
        FieldTest::SetEmpty => {
            qb.push("(attributes -> ")
                .push_bind(field.to_string())
                .push(" IS NULL OR attributes -> ")
                .push_bind(field.to_string())
                .push(" IN ('null'::jsonb, '[]'::jsonb))");
        }
    }
}

impl Store for PgStore {
    async fn upsert_user(
        &self,
        ctx: TenantContext,
        user_id: Uuid,
        attributes: serde_json::Value,
    ) -> Result<UserRecord> {
        let sql = format!(
            r#"
            INSERT INTO users (id, tenant_id, attributes)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET attributes = EXCLUDED.attributes
            WHERE $2::uuid IS NULL OR users.tenant_id = $2
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, UserRecord>(&sql)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .bind(attributes)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DispatchError::NotFound("user"))
    }

    async fn get_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Option<UserRecord>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, UserRecord>(&sql)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn count_matching_users(&self, predicate: &Predicate) -> Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users WHERE ");
        push_predicate(&mut qb, predicate);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn matching_user_ids(
        &self,
        predicate: &Predicate,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM users WHERE (");
        push_predicate(&mut qb, predicate);
        qb.push(")");
        if let Some(after) = after {
            qb.push(" AND id > ").push_bind(after);
        }
        qb.push(" ORDER BY id LIMIT ").push_bind(limit);
        let ids: Vec<Uuid> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn upsert_device(&self, ctx: TenantContext, device: &NewDevice) -> Result<DeviceToken> {
        let sql = format!(
            r#"
            INSERT INTO device_tokens (id, user_id, tenant_id, token, platform, device_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT ON CONSTRAINT uq_device_tokens_tenant_token DO UPDATE
            SET user_id = EXCLUDED.user_id,
                platform = EXCLUDED.platform,
                device_name = EXCLUDED.device_name,
                last_active_at = NOW()
            RETURNING {DEVICE_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, DeviceToken>(&sql)
            .bind(Uuid::new_v4())
            .bind(device.user_id)
            .bind(ctx.tenant_id())
            .bind(&device.token)
            .bind(device.platform)
            .bind(&device.device_name)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn device_by_token(&self, ctx: TenantContext, token: &str) -> Result<Option<DeviceToken>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM device_tokens WHERE token = $1 AND tenant_id IS NOT DISTINCT FROM $2"
        );
        Ok(sqlx::query_as::<_, DeviceToken>(&sql)
            .bind(token)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<Option<DeviceToken>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM device_tokens WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, DeviceToken>(&sql)
            .bind(device_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn devices_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<DeviceToken>> {
        let sql = format!(
            r#"
            SELECT {DEVICE_COLUMNS} FROM device_tokens
            WHERE user_id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY created_at
            "#
        );
        Ok(sqlx::query_as::<_, DeviceToken>(&sql)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_device(&self, ctx: TenantContext, device_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM device_tokens WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)",
        )
        .bind(device_id)
        .bind(ctx.tenant_id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_device_by_token(&self, tenant_id: Option<Uuid>, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM device_tokens WHERE token = $1 AND tenant_id IS NOT DISTINCT FROM $2",
        )
        .bind(token)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_topic(&self, ctx: TenantContext, topic: &NewTopic) -> Result<Topic> {
        let sql = format!(
            r#"
            INSERT INTO topics (id, tenant_id, name, slug, description, is_public, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {TOPIC_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Topic>(&sql)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(&topic.name)
            .bind(&topic.slug)
            .bind(&topic.description)
            .bind(topic.is_public)
            .bind(topic.is_default)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unique_violation_as(e, format!("topic slug '{}' already exists", topic.slug)))
    }

    async fn get_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<Option<Topic>> {
        let sql = format!(
            "SELECT {TOPIC_COLUMNS} FROM topics WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, Topic>(&sql)
            .bind(topic_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn default_topics(&self, ctx: TenantContext) -> Result<Vec<Topic>> {
        let sql = format!(
            "SELECT {TOPIC_COLUMNS} FROM topics WHERE is_default AND ($1::uuid IS NULL OR tenant_id = $1)"
        );
        Ok(sqlx::query_as::<_, Topic>(&sql)
            .bind(ctx.tenant_id())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_topic(&self, ctx: TenantContext, topic_id: Uuid) -> Result<bool> {
        // Subscriptions go with it through ON DELETE CASCADE
        let result =
            sqlx::query("DELETE FROM topics WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)")
                .bind(topic_id)
                .bind(ctx.tenant_id())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
        channels: SubscriptionChannels,
    ) -> Result<TopicSubscription> {
        let sql = format!(
            r#"
            INSERT INTO topic_subscriptions
                (id, topic_id, user_id, tenant_id, fcm_enabled, sms_enabled, wba_enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (topic_id, user_id) DO NOTHING
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, TopicSubscription>(&sql)
            .bind(Uuid::new_v4())
            .bind(topic_id)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .bind(channels.fcm_enabled)
            .bind(channels.sms_enabled)
            .bind(channels.wba_enabled)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DispatchError::DuplicateSubscription)
    }

    async fn get_subscription(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TopicSubscription>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM topic_subscriptions
            WHERE topic_id = $1 AND user_id = $2 AND ($3::uuid IS NULL OR tenant_id = $3)
            "#
        );
        Ok(sqlx::query_as::<_, TopicSubscription>(&sql)
            .bind(topic_id)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_subscription(&self, ctx: TenantContext, topic_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM topic_subscriptions
            WHERE topic_id = $1 AND user_id = $2 AND ($3::uuid IS NULL OR tenant_id = $3)
            "#,
        )
        .bind(topic_id)
        .bind(user_id)
        .bind(ctx.tenant_id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn subscriptions_for_topic(
        &self,
        ctx: TenantContext,
        topic_id: Uuid,
    ) -> Result<Vec<TopicSubscription>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM topic_subscriptions
            WHERE topic_id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            "#
        );
        Ok(sqlx::query_as::<_, TopicSubscription>(&sql)
            .bind(topic_id)
            .bind(ctx.tenant_id())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn topics_for_user(&self, ctx: TenantContext, user_id: Uuid) -> Result<Vec<Topic>> {
        let sql = r#"
            SELECT t.id, t.tenant_id, t.name, t.slug, t.description, t.is_public, t.is_default, t.created_at
            FROM topics t
            JOIN topic_subscriptions s ON s.topic_id = t.id
            WHERE s.user_id = $1 AND ($2::uuid IS NULL OR s.tenant_id = $2)
            "#;
        Ok(sqlx::query_as::<_, Topic>(sql)
            .bind(user_id)
            .bind(ctx.tenant_id())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn set_subscription_synced(&self, subscription_id: Uuid, synced: bool) -> Result<()> {
        sqlx::query("UPDATE topic_subscriptions SET fcm_synced = $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(synced)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unsynced_subscriptions(&self, limit: i64) -> Result<Vec<TopicSubscription>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM topic_subscriptions
            WHERE NOT fcm_synced AND fcm_enabled
            ORDER BY created_at
            LIMIT $1
            "#
        );
        Ok(sqlx::query_as::<_, TopicSubscription>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_segment(
        &self,
        ctx: TenantContext,
        name: &str,
        conditions: &ConditionGroup,
    ) -> Result<Segment> {
        let sql = format!(
            r#"
            INSERT INTO segments (id, tenant_id, name, conditions)
            VALUES ($1, $2, $3, $4)
            RETURNING {SEGMENT_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Segment>(&sql)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(name)
            .bind(Json(conditions))
            .fetch_one(&self.pool)
            .await?)
    }

    async fn update_segment_conditions(
        &self,
        ctx: TenantContext,
        segment_id: Uuid,
        conditions: &ConditionGroup,
    ) -> Result<Option<Segment>> {
        let sql = format!(
            r#"
            UPDATE segments SET conditions = $3
            WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            RETURNING {SEGMENT_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Segment>(&sql)
            .bind(segment_id)
            .bind(ctx.tenant_id())
            .bind(Json(conditions))
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_segment(&self, ctx: TenantContext, segment_id: Uuid) -> Result<Option<Segment>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, Segment>(&sql)
            .bind(segment_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_segment_count(
        &self,
        segment_id: Uuid,
        count: i64,
        at: OffsetDateTime,
    ) -> Result<Option<Segment>> {
        let sql = format!(
            r#"
            UPDATE segments SET cached_count = $2, cached_at = $3
            WHERE id = $1
            RETURNING {SEGMENT_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Segment>(&sql)
            .bind(segment_id)
            .bind(count)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn insert_template(&self, ctx: TenantContext, template: &NewTemplate) -> Result<Template> {
        let sql = format!(
            r#"
            INSERT INTO templates (id, tenant_id, key, title_pattern, body_pattern, variables)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Template>(&sql)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(&template.key)
            .bind(&template.title_pattern)
            .bind(&template.body_pattern)
            .bind(&template.variables)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unique_violation_as(e, format!("template key '{}' already exists", template.key)))
    }

    async fn get_template(&self, ctx: TenantContext, template_id: Uuid) -> Result<Option<Template>> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, Template>(&sql)
            .bind(template_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn insert_campaign(&self, ctx: TenantContext, campaign: &NewCampaign) -> Result<Campaign> {
        let sql = format!(
            r#"
            INSERT INTO campaigns (id, tenant_id, name, template_id, segment_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Campaign>(&sql)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(&campaign.name)
            .bind(campaign.template_id)
            .bind(campaign.segment_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_campaign(&self, ctx: TenantContext, campaign_id: Uuid) -> Result<Option<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
        );
        Ok(sqlx::query_as::<_, Campaign>(&sql)
            .bind(campaign_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2,
                sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(campaign_id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn schedule_campaign(
        &self,
        ctx: TenantContext,
        campaign_id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET status = 'scheduled', scheduled_at = $3
            WHERE id = $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(campaign_id)
        .bind(ctx.tenant_id())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_campaign_counts(&self, campaign_id: Uuid, sent: i64, failed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET sent_count = sent_count + $2, failed_count = failed_count + $3
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_campaigns(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<Campaign>> {
        let sql = format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS} FROM campaigns
            WHERE status = 'scheduled' AND scheduled_at <= $1 AND scheduled_at >= $2
            ORDER BY scheduled_at
            LIMIT $3
            "#
        );
        Ok(sqlx::query_as::<_, Campaign>(&sql)
            .bind(now)
            .bind(window_start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_scheduled(
        &self,
        ctx: TenantContext,
        notification: &NewScheduledNotification,
    ) -> Result<ScheduledNotification> {
        let sql = format!(
            r#"
            INSERT INTO scheduled_notifications (id, tenant_id, recipient_ref, payload, scheduled_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SCHEDULED_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, ScheduledNotification>(&sql)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(notification.recipient_ref)
            .bind(Json(&notification.payload))
            .bind(notification.scheduled_at)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_scheduled(
        &self,
        ctx: TenantContext,
        notification_id: Uuid,
    ) -> Result<Option<ScheduledNotification>> {
        let sql = format!(
            r#"
            SELECT {SCHEDULED_COLUMNS} FROM scheduled_notifications
            WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            "#
        );
        Ok(sqlx::query_as::<_, ScheduledNotification>(&sql)
            .bind(notification_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn due_scheduled(
        &self,
        window_start: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        let sql = format!(
            r#"
            SELECT {SCHEDULED_COLUMNS} FROM scheduled_notifications
            WHERE status = 'pending' AND scheduled_at <= $1 AND scheduled_at >= $2
            ORDER BY scheduled_at
            LIMIT $3
            "#
        );
        Ok(sqlx::query_as::<_, ScheduledNotification>(&sql)
            .bind(now)
            .bind(window_start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn claim_scheduled(
        &self,
        notification_id: Uuid,
        now: OffsetDateTime,
        lease_cutoff: OffsetDateTime,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications SET claimed_at = $2
            WHERE id = $1
              AND status = 'pending'
              AND (claimed_at IS NULL OR claimed_at < $3)
            "#,
        )
        .bind(notification_id)
        .bind(now)
        .bind(lease_cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_scheduled(&self, notification_id: Uuid, status: ScheduledStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $2, sent_at = CASE WHEN $3 THEN NOW() ELSE sent_at END
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(notification_id)
        .bind(status)
        .bind(status == ScheduledStatus::Sent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_log(&self, attempt: &LogAttempt) -> Result<NotificationLog> {
        let sent_at = (attempt.status == LogStatus::Sent).then(OffsetDateTime::now_utc);
        let sql = format!(
            r#"
            INSERT INTO notification_logs
                (id, dedup_key, user_id, tenant_id, channel, title, body, payload, status, attempts, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (dedup_key) DO UPDATE
            SET status = EXCLUDED.status,
                attempts = notification_logs.attempts + EXCLUDED.attempts,
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                sent_at = COALESCE(EXCLUDED.sent_at, notification_logs.sent_at)
            RETURNING {LOG_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, NotificationLog>(&sql)
            .bind(Uuid::new_v4())
            .bind(&attempt.dedup_key)
            .bind(attempt.user_id)
            .bind(attempt.tenant_id)
            .bind(&attempt.channel)
            .bind(&attempt.title)
            .bind(&attempt.body)
            .bind(&attempt.payload)
            .bind(attempt.status)
            .bind(attempt.attempts)
            .bind(sent_at)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn find_log(&self, dedup_key: &str) -> Result<Option<NotificationLog>> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM notification_logs WHERE dedup_key = $1");
        Ok(sqlx::query_as::<_, NotificationLog>(&sql)
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn query_logs(&self, ctx: TenantContext, query: &LogQuery) -> Result<Vec<NotificationLog>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {LOG_COLUMNS} FROM notification_logs WHERE TRUE"
        ));
        if let Some(tenant_id) = ctx.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(user_id) = query.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(from) = query.from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(query.limit.unwrap_or(100).clamp(1, 1000));

        Ok(qb
            .build_query_as::<NotificationLog>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_log_opened(&self, ctx: TenantContext, log_id: Uuid) -> Result<Option<NotificationLog>> {
        let sql = format!(
            r#"
            UPDATE notification_logs
            SET status = CASE WHEN status = 'sent' THEN 'opened' ELSE status END,
                opened_at = CASE WHEN status = 'sent' THEN NOW() ELSE opened_at END
            WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            RETURNING {LOG_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, NotificationLog>(&sql)
            .bind(log_id)
            .bind(ctx.tenant_id())
            .fetch_optional(&self.pool)
            .await?)
    }
}
