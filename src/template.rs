use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{NotificationPayload, Template};
use crate::store::Store;
use crate::tenant::TenantContext;

/// Replaces every `{{ name }}` placeholder with the matching variable.
///
/// Unknown variables become an empty string. An unterminated `{{` is copied
/// through as-is.
pub fn render(pattern: &str, vars: &Value) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                out.push_str(&lookup(vars, name));
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(vars: &Value, name: &str) -> String {
    match vars.get(name) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    }
}

pub fn render_template(template: &Template, vars: &Value) -> NotificationPayload {
    NotificationPayload {
        title: render(&template.title_pattern, vars),
        body: render(&template.body_pattern, vars),
        data: Default::default(),
    }
}

pub fn render_payload(payload: &NotificationPayload, vars: &Value) -> NotificationPayload {
    NotificationPayload {
        title: render(&payload.title, vars),
        body: render(&payload.body, vars),
        data: payload
            .data
            .iter()
            .map(|(k, v)| (k.clone(), render(v, vars)))
            .collect(),
    }
}

/// Read-through template cache in front of the store.
///
/// Templates are immutable once created, so entries only leave by TTL/size.
pub struct TemplateCache<S> {
    store: Arc<S>,
    cache: Cache<Uuid, Arc<Template>>,
}

impl<S> TemplateCache<S>
where
    S: Store + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        let cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(600))
            .build();
        Self { store, cache }
    }

    pub async fn get(&self, ctx: TenantContext, template_id: Uuid) -> Result<Arc<Template>> {
        if let Some(template) = self.cache.get(&template_id) {
            if ctx.allows(template.tenant_id) {
                return Ok(template);
            }
            return Err(DispatchError::NotFound("template"));
        }

        let template = self
            .store
            .get_template(ctx, template_id)
            .await?
            .ok_or(DispatchError::NotFound("template"))?;
        let template = Arc::new(template);
        self.cache.insert(template_id, template.clone()).await;
        debug!(template_id = %template_id, key = %template.key, "Template cached");
        Ok(template)
    }
}
