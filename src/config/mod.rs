use std::env;

/// One external OSINT worker process the control plane can dispatch to.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEndpoint {
    pub name: String,
    pub base_url: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// Shared secret workers present on result/health callbacks, and that we
    /// present to workers on dispatch.
    pub worker_token: String,
    /// Base URL workers use to reach the results webhook.
    pub callback_base_url: String,
    /// Configured worker endpoints, parsed from `WORKER_ENDPOINTS`
    /// ("name=url,name=url").
    pub workers: Vec<WorkerEndpoint>,

    // Rate limiting
    pub scan_limit_max: i64,
    pub scan_limit_window_secs: i64,
    pub auth_limit_max: i64,
    pub auth_limit_window_secs: i64,
    pub auth_lockout_secs: i64,

    // Worker health monitoring
    pub health_probe_interval_secs: u64,
    pub health_probe_timeout_secs: u64,
    pub health_sla_latency_ms: i64,
    pub health_stale_after_secs: i64,

    // Job watchdog
    pub watchdog_interval_secs: u64,
    pub watchdog_stuck_threshold_minutes: i64,
    pub watchdog_batch_limit: i64,

    // Dispatch
    pub dispatch_timeout_secs: u64,
    pub dispatch_max_attempts: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse the `WORKER_ENDPOINTS` value ("maigret=http://host:8000,holehe=http://host:8001").
///
/// Entries without a `=` or with an empty side are skipped.
pub fn parse_worker_endpoints(raw: &str) -> Vec<WorkerEndpoint> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, url) = entry.split_once('=')?;
            let (name, url) = (name.trim(), url.trim().trim_end_matches('/'));
            if name.is_empty() || url.is_empty() {
                return None;
            }
            Some(WorkerEndpoint {
                name: name.to_string(),
                base_url: url.to_string(),
            })
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            host: env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("BACKEND_PORT", 3000),
            worker_token: env::var("WORKER_TOKEN")?,
            callback_base_url: env::var("CALLBACK_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            workers: parse_worker_endpoints(
                &env::var("WORKER_ENDPOINTS").unwrap_or_default(),
            ),

            scan_limit_max: env_parse("SCAN_LIMIT_MAX", 30),
            scan_limit_window_secs: env_parse("SCAN_LIMIT_WINDOW_SECS", 3600),
            auth_limit_max: env_parse("AUTH_LIMIT_MAX", 5),
            auth_limit_window_secs: env_parse("AUTH_LIMIT_WINDOW_SECS", 900),
            auth_lockout_secs: env_parse("AUTH_LOCKOUT_SECS", 900),

            health_probe_interval_secs: env_parse("HEALTH_PROBE_INTERVAL_SECS", 45),
            health_probe_timeout_secs: env_parse("HEALTH_PROBE_TIMEOUT_SECS", 5),
            health_sla_latency_ms: env_parse("HEALTH_SLA_LATENCY_MS", 2000),
            health_stale_after_secs: env_parse("HEALTH_STALE_AFTER_SECS", 180),

            watchdog_interval_secs: env_parse("WATCHDOG_INTERVAL_SECS", 300),
            watchdog_stuck_threshold_minutes: env_parse("WATCHDOG_STUCK_THRESHOLD_MINUTES", 15),
            watchdog_batch_limit: env_parse("WATCHDOG_BATCH_LIMIT", 100),

            dispatch_timeout_secs: env_parse("DISPATCH_TIMEOUT_SECS", 10),
            dispatch_max_attempts: env_parse("DISPATCH_MAX_ATTEMPTS", 2),
        })
    }

    /// Look up a configured worker endpoint by name.
    pub fn worker(&self, name: &str) -> Option<&WorkerEndpoint> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_endpoints() {
        let workers =
            parse_worker_endpoints("maigret=http://localhost:8000, holehe=http://localhost:8001/");
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].name, "maigret");
        assert_eq!(workers[0].base_url, "http://localhost:8000");
        assert_eq!(workers[1].base_url, "http://localhost:8001");
    }

    #[test]
    fn skips_malformed_endpoint_entries() {
        let workers = parse_worker_endpoints("maigret=http://x,,bad-entry,=http://y,name=");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "maigret");
    }

    #[test]
    fn empty_endpoints_are_empty() {
        assert!(parse_worker_endpoints("").is_empty());
    }
}
