use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::dispatch::{DispatchSettings, RetryPolicy};
use crate::gateway::FcmCredentials;
use crate::scheduler::{DEFAULT_DUE_LIMIT, DEFAULT_TOLERANCE_HOURS};
use crate::segment::AttributeSchema;
use crate::tenant::TenantContext;

const DEFAULT_SEGMENT_FIELDS: &str = "email:text,first_name:text,last_name:text,plan:text,\
     country:text,language:text,age:number,points:number,signup_at:date,last_seen_at:date,tags:set";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow!("unknown STORE_BACKEND '{}'", other)),
        }
    }
}

/// Which API surfaces are mounted. Every flag defaults to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub devices: bool,
    pub topics: bool,
    pub segments: bool,
    pub campaigns: bool,
    pub scheduled: bool,
    pub direct_send: bool,
    pub logs: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            devices: true,
            topics: true,
            segments: true,
            campaigns: true,
            scheduled: true,
            direct_send: true,
            logs: true,
        }
    }
}

impl Features {
    /// Parses a comma-separated allow list; `all` or an empty value enables everything.
    pub fn parse(list: &str) -> Result<Self> {
        let names: HashSet<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() || names.contains("all") {
            return Ok(Self::default());
        }

        const KNOWN: [&str; 7] = [
            "devices",
            "topics",
            "segments",
            "campaigns",
            "scheduled",
            "direct_send",
            "logs",
        ];
        if let Some(unknown) = names.iter().find(|n| !KNOWN.contains(n)) {
            bail!("unknown feature '{}' in ENABLED_FEATURES", unknown);
        }

        Ok(Self {
            devices: names.contains("devices"),
            topics: names.contains("topics"),
            segments: names.contains("segments"),
            campaigns: names.contains("campaigns"),
            scheduled: names.contains("scheduled"),
            direct_send: names.contains("direct_send"),
            logs: names.contains("logs"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub store_backend: StoreBackend,
    pub api_bind_address: String,
    pub fcm_project_id: String,
    pub fcm_credentials: FcmCredentials,
    pub fcm_api_url: String,
    pub fcm_iid_url: String,
    pub gateway_timeout: Duration,
    pub multi_tenant: bool,
    pub default_tenant_id: Option<Uuid>,
    pub dispatch: DispatchSettings,
    pub scheduler_interval: Duration,
    pub due_limit: i64,
    pub due_tolerance_hours: i64,
    pub retention_days: u32,
    pub segment_fields: AttributeSchema,
    pub features: Features,
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

/// A token file wins over an inline token.
fn fcm_credentials(
    token: Option<String>,
    file: Option<String>,
    refresh: Duration,
) -> Result<FcmCredentials> {
    if let Some(path) = file.filter(|p| !p.trim().is_empty()) {
        if refresh.is_zero() {
            bail!("FCM_TOKEN_REFRESH_SECS must be positive");
        }
        return Ok(FcmCredentials::File {
            path: PathBuf::from(path.trim()),
            refresh,
        });
    }
    match token.filter(|t| !t.trim().is_empty()) {
        Some(token) => Ok(FcmCredentials::Token(token.trim().to_string())),
        None => bail!("FCM_ACCESS_TOKEN or FCM_ACCESS_TOKEN_FILE must be set"),
    }
}

fn check_due_window(limit: i64, tolerance_hours: i64) -> Result<()> {
    if limit <= 0 {
        bail!("DUE_LIMIT must be positive");
    }
    if tolerance_hours < 0 {
        bail!("DUE_TOLERANCE_HOURS must not be negative");
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let store_backend: StoreBackend = parsed_or("STORE_BACKEND", StoreBackend::Postgres)?;
        let database_url = match store_backend {
            StoreBackend::Postgres => {
                Some(env::var("DATABASE_URL").context("DATABASE_URL must be set")?)
            }
            StoreBackend::Memory => env::var("DATABASE_URL").ok(),
        };

        let multi_tenant = parsed_or("MULTI_TENANT", false)?;
        let default_tenant_id = env::var("DEFAULT_TENANT_ID")
            .ok()
            .map(|raw| Uuid::parse_str(raw.trim()))
            .transpose()
            .context("DEFAULT_TENANT_ID must be a UUID")?;
        if multi_tenant && default_tenant_id.is_none() {
            bail!("DEFAULT_TENANT_ID must be set when MULTI_TENANT=true");
        }

        let segment_fields = env::var("SEGMENT_FIELDS")
            .unwrap_or_else(|_| DEFAULT_SEGMENT_FIELDS.to_string());
        let segment_fields = AttributeSchema::parse(&segment_fields)
            .map_err(|e| anyhow!("SEGMENT_FIELDS is invalid: {}", e))?;

        let gateway_timeout = Duration::from_secs(parsed_or("GATEWAY_TIMEOUT_SECS", 10)?);
        let due_limit = parsed_or("DUE_LIMIT", DEFAULT_DUE_LIMIT)?;
        let due_tolerance_hours = parsed_or("DUE_TOLERANCE_HOURS", DEFAULT_TOLERANCE_HOURS)?;
        check_due_window(due_limit, due_tolerance_hours)?;

        Ok(Self {
            database_url,
            database_max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10)?,
            store_backend,
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            fcm_project_id: env::var("FCM_PROJECT_ID").context("FCM_PROJECT_ID must be set")?,
            fcm_credentials: fcm_credentials(
                env::var("FCM_ACCESS_TOKEN").ok(),
                env::var("FCM_ACCESS_TOKEN_FILE").ok(),
                Duration::from_secs(parsed_or("FCM_TOKEN_REFRESH_SECS", 300)?),
            )?,
            fcm_api_url: env::var("FCM_API_URL")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            fcm_iid_url: env::var("FCM_IID_URL")
                .unwrap_or_else(|_| "https://iid.googleapis.com".to_string()),
            gateway_timeout,
            multi_tenant,
            default_tenant_id,
            dispatch: DispatchSettings {
                concurrency: parsed_or("DISPATCH_CONCURRENCY", 32)?,
                retry: RetryPolicy {
                    max_attempts: parsed_or("MAX_SEND_ATTEMPTS", 3)?,
                    initial_delay: Duration::from_millis(parsed_or("RETRY_BASE_DELAY_MS", 100)?),
                    ..RetryPolicy::default()
                },
                send_timeout: gateway_timeout,
                ..DispatchSettings::default()
            },
            scheduler_interval: Duration::from_secs(parsed_or("SCHEDULER_INTERVAL_SECS", 60)?),
            due_limit,
            due_tolerance_hours,
            retention_days: parsed_or("RETENTION_DAYS", 90)?,
            segment_fields,
            features: Features::parse(&env::var("ENABLED_FEATURES").unwrap_or_default())?,
        })
    }

    /// Tenant scope used when a request does not name one.
    pub fn default_tenant(&self) -> TenantContext {
        match (self.multi_tenant, self.default_tenant_id) {
            (true, Some(id)) => TenantContext::Tenant(id),
            _ => TenantContext::Global,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_feature_list_enables_everything() {
        assert_eq!(Features::parse("").unwrap(), Features::default());
        assert_eq!(Features::parse("all").unwrap(), Features::default());
    }

    #[test]
    fn feature_list_is_an_allow_list() {
        let features = Features::parse("devices, topics").unwrap();
        assert!(features.devices);
        assert!(features.topics);
        assert!(!features.campaigns);
        assert!(!features.logs);
        assert!(Features::parse("devices,sms").is_err());
    }

    #[test]
    fn default_segment_fields_parse() {
        let schema = AttributeSchema::parse(DEFAULT_SEGMENT_FIELDS).unwrap();
        assert!(schema.field_type("tags").is_some());
    }

    #[test]
    fn backend_names() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("Postgres".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert!("mysql".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn token_file_takes_precedence() {
        let refresh = Duration::from_secs(300);
        let creds = fcm_credentials(
            Some("inline".to_string()),
            Some("/run/secrets/fcm".to_string()),
            refresh,
        )
        .unwrap();
        assert_eq!(
            creds,
            FcmCredentials::File {
                path: PathBuf::from("/run/secrets/fcm"),
                refresh
            }
        );
        assert_eq!(
            fcm_credentials(Some(" inline ".to_string()), None, refresh).unwrap(),
            FcmCredentials::Token("inline".to_string())
        );
        assert!(fcm_credentials(None, Some(" ".to_string()), refresh).is_err());
        assert!(fcm_credentials(None, Some("/tmp/t".to_string()), Duration::ZERO).is_err());
    }

    #[test]
    fn due_window_bounds() {
        assert!(check_due_window(DEFAULT_DUE_LIMIT, DEFAULT_TOLERANCE_HOURS).is_ok());
        assert!(check_due_window(1, 0).is_ok());
        assert!(check_due_window(0, 24).is_err());
        assert!(check_due_window(100, -1).is_err());
    }
}
