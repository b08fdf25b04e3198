use std::time::Duration;

use envconfig::Envconfig;
use ureport_common::retry::RetryPolicy;
use uuid::Uuid;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "/var/spool/ureport")]
    pub spool_root: String,

    #[envconfig(default = "30")]
    pub cleanup_interval_secs: u64,

    // Must match the workers, or the janitor reclaims claims they still hold
    #[envconfig(from = "LIVENESS_TIMEOUT_MS", default = "300000")]
    pub liveness_timeout_ms: u64,

    #[envconfig(default = "5")]
    pub max_attempts: u32,

    #[envconfig(default = "3600")]
    pub orphan_grace_secs: u64,

    /// Saved reports are kept forever unless set.
    pub saved_retention_secs: Option<u64>,

    pub janitor_id: Option<String>,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get_janitor_settings(&self) -> JanitorSettings {
        JanitorSettings {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            retry_policy: RetryPolicy::build(2, Duration::from_secs(1))
                .max_attempts(self.max_attempts)
                .provide(),
            orphan_grace: Duration::from_secs(self.orphan_grace_secs),
            saved_retention: self.saved_retention_secs.map(Duration::from_secs),
            id: self
                .janitor_id
                .clone()
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
        }
    }
}

pub struct JanitorSettings {
    pub liveness_timeout: Duration,
    /// Only the attempt budget matters here, stalled reports are eligible right away.
    pub retry_policy: RetryPolicy,
    pub orphan_grace: Duration,
    pub saved_retention: Option<Duration>,
    pub id: String,
}
