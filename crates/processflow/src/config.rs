use crate::processes::registry::{ResourcePolicy, ResourceRegistry};

/// Runtime configuration, loaded from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queue: String,
    pub lease_seconds: i64,
    pub reap_interval_ms: u64,
    /// Name of the API namespace recorded on every process.
    pub api_name: String,
    /// JSON:API type of the process resource.
    pub jobs_resource: String,
    /// Prefix for links in rendered documents.
    pub base_url: String,
    pub api_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub default_policy: ResourcePolicy,
    pub resource_policies: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("PFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queue =
            env_or_fallback("PFLOW_QUEUE", "QUEUE").unwrap_or_else(|| "default".to_string());

        let lease_seconds = env_or_fallback("PFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let reap_interval_ms = env_or_fallback("PFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let api_name = env_or_fallback("PFLOW_API_NAME", "API_NAME")
            .unwrap_or_else(|| "default".to_string());

        let jobs_resource = env_or_fallback("PFLOW_JOBS_RESOURCE", "JOBS_RESOURCE")
            .unwrap_or_else(|| "queue-jobs".to_string());

        let base_url = env_or_fallback("PFLOW_BASE_URL", "BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_default();

        let api_addr = env_or_fallback("PFLOW_API_ADDR", "API_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("PFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let default_policy = ResourcePolicy {
            timeout: env_or_fallback("PFLOW_DEFAULT_TIMEOUT_SECS", "DEFAULT_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .filter(|n: &i32| *n > 0)
                .or(Some(60)),
            tries: env_or_fallback("PFLOW_DEFAULT_TRIES", "DEFAULT_TRIES")
                .and_then(|s| s.parse().ok())
                .filter(|n: &i32| *n > 0)
                .or(Some(3)),
        };

        let resource_policies =
            env_or_fallback("PFLOW_RESOURCE_POLICIES", "RESOURCE_POLICIES").unwrap_or_default();

        Ok(Self {
            database_url,
            worker_id,
            queue,
            lease_seconds,
            reap_interval_ms,
            api_name,
            jobs_resource,
            base_url,
            api_addr,
            migrate_on_startup,
            default_policy,
            resource_policies,
        })
    }

    /// Build the resource registry; fails on a malformed policy string.
    pub fn registry(&self) -> anyhow::Result<ResourceRegistry> {
        ResourceRegistry::parse(&self.resource_policies, self.default_policy)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
