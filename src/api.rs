use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Features;
use crate::delivery_log::DeliveryLog;
use crate::dispatch::{CampaignOutcome, DeliveryStats, Dispatcher};
use crate::error::DispatchError;
use crate::gateway::PushGateway;
use crate::metrics::metrics_handler;
use crate::models::{
    Campaign, DeviceToken, LogQuery, NewCampaign, NewDevice, NewScheduledNotification, NewTemplate,
    NewTopic, NotificationLog, NotificationPayload, Platform, ScheduledNotification, Segment,
    SubscriptionChannels, Template, Topic, TopicSubscription, UserRecord,
};
use crate::registry::Registry;
use crate::scheduler::{DueReport, Scheduler};
use crate::segment::{ConditionGroup, SegmentEngine};
use crate::store::Store;
use crate::tenant::TenantContext;

const TENANT_HEADER: &str = "x-tenant-id";
const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_IN_FLIGHT_REQUESTS: usize = 512;

pub struct ApiState<S, G> {
    pub store: Arc<S>,
    pub registry: Arc<Registry<S, G>>,
    pub segments: Arc<SegmentEngine<S>>,
    pub dispatcher: Arc<Dispatcher<S, G>>,
    pub scheduler: Arc<Scheduler<S, G>>,
    pub log: DeliveryLog<S>,
    pub multi_tenant: bool,
    pub default_tenant: TenantContext,
    pub due_limit: i64,
    pub due_tolerance_hours: i64,
}

impl<S, G> ApiState<S, G> {
    /// Resolves the tenant for a request. Without multi-tenancy every
    /// request runs unscoped and the header is ignored.
    fn tenant(&self, headers: &HeaderMap) -> Result<TenantContext, ApiError> {
        if !self.multi_tenant {
            return Ok(TenantContext::Global);
        }
        match headers.get(TENANT_HEADER) {
            None => Ok(self.default_tenant),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
                .map(TenantContext::Tenant)
                .ok_or_else(|| {
                    ApiError(DispatchError::Validation(format!(
                        "{} must be a UUID",
                        TENANT_HEADER
                    )))
                }),
        }
    }
}

pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            DispatchError::Validation(_) | DispatchError::InvalidToken => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            DispatchError::SegmentConfig(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.0.to_string()),
            DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            DispatchError::DuplicateSubscription
            | DispatchError::ConcurrencyLostRace(_)
            | DispatchError::InvalidTransition { .. } => (StatusCode::CONFLICT, self.0.to_string()),
            // Provider details stay in the logs
            DispatchError::GatewayTransient(_) | DispatchError::GatewayPermanent(_) => {
                error!(error = %self.0, "Gateway error reached the API");
                (StatusCode::BAD_GATEWAY, "push gateway unavailable".to_string())
            }
            DispatchError::Database(e) => {
                error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// Request and response models
#[derive(Deserialize)]
struct RegisterDeviceRequest {
    user_id: Uuid,
    token: String,
    platform: Platform,
    #[serde(default)]
    device_name: Option<String>,
}

#[derive(Deserialize)]
struct UpsertUserRequest {
    attributes: Value,
}

#[derive(Deserialize)]
struct SubscribeRequest {
    user_id: Uuid,
    #[serde(flatten)]
    channels: SubscriptionChannels,
}

#[derive(Deserialize)]
struct CreateSegmentRequest {
    name: String,
    conditions: ConditionGroup,
}

#[derive(Deserialize)]
struct UpdateSegmentRequest {
    conditions: ConditionGroup,
}

#[derive(Serialize)]
struct SegmentCount {
    segment_id: Uuid,
    count: i64,
}

#[derive(Deserialize)]
struct ScheduleRequest {
    #[serde(with = "time::serde::rfc3339")]
    scheduled_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct DispatchDueQuery {
    limit: Option<i64>,
    tolerance_hours: Option<i64>,
}

pub fn create_api_router<S, G>(state: Arc<ApiState<S, G>>, features: Features) -> Router
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/jobs/dispatch-due", post(dispatch_due::<S, G>));

    if features.devices {
        router = router
            .route("/devices", post(register_device::<S, G>))
            .route("/devices/:id", get(get_device::<S, G>).delete(delete_device::<S, G>))
            .route("/users/:user_id", put(upsert_user::<S, G>).get(get_user::<S, G>))
            .route("/users/:user_id/devices", get(user_devices::<S, G>));
    }
    if features.topics {
        router = router
            .route("/topics", post(create_topic::<S, G>))
            .route("/topics/:id", get(get_topic::<S, G>).delete(delete_topic::<S, G>))
            .route("/topics/:id/subscriptions", post(subscribe::<S, G>))
            .route(
                "/topics/:id/subscriptions/:user_id",
                delete(unsubscribe::<S, G>),
            )
            .route("/topics/:id/send", post(send_to_topic::<S, G>));
    }
    if features.segments {
        router = router
            .route("/segments", post(create_segment::<S, G>))
            .route("/segments/:id", put(update_segment::<S, G>))
            .route("/segments/:id/count", get(segment_count::<S, G>))
            .route("/segments/:id/refresh", post(refresh_segment::<S, G>));
    }
    if features.campaigns {
        router = router
            .route("/templates", post(create_template::<S, G>))
            .route("/campaigns", post(create_campaign::<S, G>))
            .route("/campaigns/:id", get(get_campaign::<S, G>))
            .route("/campaigns/:id/schedule", post(schedule_campaign::<S, G>))
            .route("/campaigns/:id/cancel", post(cancel_campaign::<S, G>))
            .route("/campaigns/:id/send", post(send_campaign::<S, G>));
    }
    if features.scheduled {
        router = router
            .route("/scheduled-notifications", post(create_scheduled::<S, G>))
            .route("/scheduled-notifications/:id", get(get_scheduled::<S, G>));
    }
    if features.direct_send {
        router = router.route("/users/:user_id/send", post(send_to_user::<S, G>));
    }
    if features.logs {
        router = router
            .route("/logs", get(query_logs::<S, G>))
            .route("/logs/:id/opened", post(mark_opened::<S, G>));
    }

    router
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics() -> String {
    metrics_handler()
}

async fn dispatch_due<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    Query(query): Query<DispatchDueQuery>,
) -> ApiResult<Json<DueReport>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let report = state
        .scheduler
        .dispatch_due(
            query.limit.unwrap_or(state.due_limit),
            query.tolerance_hours.unwrap_or(state.due_tolerance_hours),
        )
        .await?;
    Ok(Json(report))
}

// Users and devices

async fn register_device<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<(StatusCode, Json<DeviceToken>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let device = state
        .registry
        .register_device(
            ctx,
            NewDevice {
                user_id: req.user_id,
                token: req.token,
                platform: req.platform,
                device_name: req.device_name,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeviceToken>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.registry.get_device(ctx, id).await?))
}

async fn delete_device<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    state.registry.delete_device(ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_devices<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<DeviceToken>>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.registry.devices_for_user(ctx, user_id).await?))
}

async fn upsert_user<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpsertUserRequest>,
) -> ApiResult<Json<UserRecord>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    if !req.attributes.is_object() {
        return Err(DispatchError::Validation("attributes must be a JSON object".to_string()).into());
    }
    Ok(Json(state.store.upsert_user(ctx, user_id, req.attributes).await?))
}

async fn get_user<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserRecord>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let user = state
        .store
        .get_user(ctx, user_id)
        .await?
        .ok_or(DispatchError::NotFound("user"))?;
    Ok(Json(user))
}

// Topics

async fn create_topic<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<NewTopic>,
) -> ApiResult<(StatusCode, Json<Topic>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok((StatusCode::CREATED, Json(state.registry.create_topic(ctx, &req).await?)))
}

async fn get_topic<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Topic>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.registry.get_topic(ctx, id).await?))
}

async fn delete_topic<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    state.registry.delete_topic(ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn subscribe<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<TopicSubscription>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let sub = state
        .registry
        .subscribe(ctx, req.user_id, id, req.channels)
        .await?;
    Ok(Json(sub))
}

async fn unsubscribe<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    state.registry.unsubscribe(ctx, user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_to_topic<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<NotificationPayload>,
) -> ApiResult<Json<DeliveryStats>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.dispatcher.send_to_topic(ctx, id, &payload).await?))
}

// Segments

async fn create_segment<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<CreateSegmentRequest>,
) -> ApiResult<(StatusCode, Json<Segment>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let segment = state
        .segments
        .create_segment(ctx, &req.name, &req.conditions)
        .await?;
    Ok((StatusCode::CREATED, Json(segment)))
}

async fn update_segment<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSegmentRequest>,
) -> ApiResult<Json<Segment>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.segments.update_conditions(ctx, id, &req.conditions).await?))
}

async fn load_segment<S, G>(state: &ApiState<S, G>, ctx: TenantContext, id: Uuid) -> ApiResult<Segment>
where
    S: Store + Send + Sync + 'static,
{
    let segment = state
        .store
        .get_segment(ctx, id)
        .await?
        .ok_or(DispatchError::NotFound("segment"))?;
    Ok(segment)
}

async fn segment_count<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SegmentCount>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let segment = load_segment(&state, ctx, id).await?;
    let count = state.segments.match_count(&segment).await?;
    Ok(Json(SegmentCount {
        segment_id: id,
        count,
    }))
}

async fn refresh_segment<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Segment>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let segment = load_segment(&state, ctx, id).await?;
    Ok(Json(state.segments.refresh_cached_count(&segment).await?))
}

// Templates and campaigns

async fn create_template<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<NewTemplate>,
) -> ApiResult<(StatusCode, Json<Template>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    if req.key.trim().is_empty() {
        return Err(DispatchError::Validation("template key must not be empty".to_string()).into());
    }
    let template = state.store.insert_template(ctx, &req).await?;
    info!(template_id = %template.id, key = %template.key, "Template created");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn create_campaign<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<Campaign>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok((StatusCode::CREATED, Json(state.dispatcher.create_campaign(ctx, &req).await?)))
}

async fn get_campaign<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.dispatcher.get_campaign(ctx, id).await?))
}

async fn schedule_campaign<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<Json<Campaign>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(
        state
            .dispatcher
            .schedule_campaign(ctx, id, req.scheduled_at)
            .await?,
    ))
}

async fn cancel_campaign<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.dispatcher.cancel_campaign(ctx, id).await?))
}

/// Sends right away and answers once the fan-out has finished.
async fn send_campaign<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CampaignOutcome>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    match state.dispatcher.send_campaign(ctx, id).await? {
        CampaignOutcome::AlreadyClaimed => Err(DispatchError::ConcurrencyLostRace(id).into()),
        outcome => Ok(Json(outcome)),
    }
}

// Scheduled and direct sends

async fn create_scheduled<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Json(req): Json<NewScheduledNotification>,
) -> ApiResult<(StatusCode, Json<ScheduledNotification>)>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let row = state.store.insert_scheduled(ctx, &req).await?;
    info!(notification_id = %row.id, scheduled_at = %row.scheduled_at, "Notification scheduled");
    Ok((StatusCode::CREATED, Json(row)))
}

async fn get_scheduled<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduledNotification>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    let row = state
        .store
        .get_scheduled(ctx, id)
        .await?
        .ok_or(DispatchError::NotFound("scheduled notification"))?;
    Ok(Json(row))
}

async fn send_to_user<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<NotificationPayload>,
) -> ApiResult<Json<DeliveryStats>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.dispatcher.send_to_user(ctx, user_id, &payload).await?))
}

// Delivery log

async fn query_logs<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<NotificationLog>>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.log.query(ctx, &query).await?))
}

async fn mark_opened<S, G>(
    State(state): State<Arc<ApiState<S, G>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NotificationLog>>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let ctx = state.tenant(&headers)?;
    Ok(Json(state.log.mark_opened(ctx, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchSettings;
    use crate::gateway::mock::MockGateway;
    use crate::memory_store::MemoryStore;
    use crate::segment::{AttributeSchema, FieldType};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_with(multi_tenant: bool, features: Features) -> (Router, Arc<MockGateway>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let schema = AttributeSchema::new().with_field("plan", FieldType::Text);
        let segments = Arc::new(SegmentEngine::new(store.clone(), Arc::new(schema)));
        let registry = Arc::new(Registry::new(store.clone(), gateway.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            gateway.clone(),
            segments.clone(),
            DispatchSettings::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(store.clone(), dispatcher.clone(), registry.clone()));
        let state = Arc::new(ApiState {
            log: DeliveryLog::new(store.clone()),
            store,
            registry,
            segments,
            dispatcher,
            scheduler,
            multi_tenant,
            default_tenant: TenantContext::Global,
            due_limit: 100,
            due_tolerance_hours: 24,
        });
        (create_api_router(state, features), gateway)
    }

    fn app() -> (Router, Arc<MockGateway>) {
        app_with(false, Features::default())
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn token(seed: &str) -> String {
        format!("{}:{}", seed, "k".repeat(140))
    }

    #[tokio::test]
    async fn health_responds() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn device_registration_validates_token_length() {
        let (app, _) = app();
        let user = Uuid::new_v4();
        let (status, body) = call(
            &app,
            "POST",
            "/devices",
            Some(json!({"user_id": user, "token": "short", "platform": "ios"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("token length"));

        let (status, body) = call(
            &app,
            "POST",
            "/devices",
            Some(json!({"user_id": user, "token": token("a"), "platform": "web"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "DELETE", &format!("/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_segment_field_is_rejected() {
        let (app, _) = app();
        let (status, _) = call(
            &app,
            "POST",
            "/segments",
            Some(json!({
                "name": "bad",
                "conditions": {
                    "operator": "AND",
                    "conditions": [{"field": "shoe_size", "field_type": "number", "operator": "equals", "value": 42}]
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn campaign_flow_and_second_send_conflicts() {
        let (app, gateway) = app();
        let user = Uuid::new_v4();
        call(&app, "PUT", &format!("/users/{}", user), Some(json!({"attributes": {"plan": "pro"}}))).await;
        call(
            &app,
            "POST",
            "/devices",
            Some(json!({"user_id": user, "token": token("a"), "platform": "android"})),
        )
        .await;

        let (_, template) = call(
            &app,
            "POST",
            "/templates",
            Some(json!({"key": "welcome", "title_pattern": "Hi {{plan}}", "body_pattern": "Hello"})),
        )
        .await;
        let (_, segment) = call(
            &app,
            "POST",
            "/segments",
            Some(json!({
                "name": "pro",
                "conditions": {
                    "operator": "AND",
                    "conditions": [{"field": "plan", "field_type": "text", "operator": "equals", "value": "pro"}]
                }
            })),
        )
        .await;
        let (status, campaign) = call(
            &app,
            "POST",
            "/campaigns",
            Some(json!({"name": "launch", "template_id": template["id"], "segment_id": segment["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(campaign["status"], "draft");
        let campaign_id = campaign["id"].as_str().unwrap().to_string();

        let (status, outcome) =
            call(&app, "POST", &format!("/campaigns/{}/send", campaign_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "completed");
        assert_eq!(outcome["stats"]["sent"], 1);
        assert_eq!(gateway.sent()[0].1.title, "Hi pro");

        let (status, _) = call(&app, "POST", &format!("/campaigns/{}/send", campaign_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, logs) = call(&app, "GET", "/logs?status=sent", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs.as_array().unwrap().len(), 1);
        let log_id = logs[0]["id"].as_str().unwrap().to_string();
        let (_, opened) = call(&app, "POST", &format!("/logs/{}/opened", log_id), None).await;
        assert_eq!(opened["status"], "opened");
    }

    #[tokio::test]
    async fn disabled_features_are_not_mounted() {
        let features = Features {
            campaigns: false,
            ..Features::default()
        };
        let (app, _) = app_with(false, features);
        let (status, _) = call(&app, "POST", "/campaigns", Some(json!({"name": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tenant_header_scopes_requests() {
        let (app, _) = app_with(true, Features::default());
        let tenant = Uuid::new_v4().to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/topics")
            .header("content-type", "application/json")
            .header(TENANT_HEADER, &tenant)
            .body(Body::from(json!({"name": "News", "slug": "news"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let topic: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(topic["tenant_id"], tenant.as_str());

        // Another tenant cannot see it
        let other = Request::builder()
            .uri(format!("/topics/{}", topic["id"].as_str().unwrap()))
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(other).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bad = Request::builder()
            .uri("/topics/00000000-0000-0000-0000-000000000000")
            .header(TENANT_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(bad).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dispatch_due_job_reports_counts() {
        let (app, _) = app();
        let (status, report) = call(&app, "POST", "/jobs/dispatch-due", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["campaigns"], 0);
        assert_eq!(report["notifications"], 0);
    }

    #[tokio::test]
    async fn dispatch_due_job_rejects_bad_window() {
        let (app, _) = app();
        for uri in [
            "/jobs/dispatch-due?limit=0",
            "/jobs/dispatch-due?limit=-3",
            "/jobs/dispatch-due?tolerance_hours=-1",
        ] {
            let (status, _) = call(&app, "POST", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        }
    }
}
