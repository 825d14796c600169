use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Defaults from §6/§3 of the environment/configuration surface.
pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_CONTEXT_TTL_SECONDS: u64 = 90;
pub const DEFAULT_POLLING_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_MAX_POLLING_ATTEMPTS: u32 = 12;
pub const DEFAULT_AGGREGATION_DELAY_SECONDS: u64 = 15;
pub const DEFAULT_ARCHIVAL_TTL_SECONDS: i64 = 3600;

// Retry policy constants, shared by every retried call site (§7.2, §9).
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_SECS: u64 = 1;
pub const RETRY_FACTOR: u64 = 2;
pub const RETRY_CAP_SECS: u64 = 10;

/// Shared configuration record, loaded once at process startup and treated
/// as immutable thereafter (§5 "Resource discipline" — hot-reload is out of
/// scope). Environment variables are unprefixed, matching the exact names
/// fixed by §6 rather than this corpus's usual `SKYNET_`-style prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub google_cloud_project: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_context_ttl_seconds")]
    pub context_ttl_seconds: u64,
    #[serde(default = "default_polling_interval_seconds")]
    pub polling_interval_seconds: u64,
    #[serde(default = "default_max_polling_attempts")]
    pub max_polling_attempts: u32,
    #[serde(default = "default_aggregation_delay_seconds")]
    pub aggregation_delay_seconds: u64,
    #[serde(default)]
    pub aggregated_transcripts_bucket: String,
    #[serde(default)]
    pub frontend_url: Option<String>,
    #[serde(default = "default_archival_ttl_seconds")]
    pub archival_ttl_seconds: i64,
    /// Bind address for the service's own HTTP listener. Not part of §6's
    /// external env surface — an ambient concern every binary needs.
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl PipelineConfig {
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        let config: PipelineConfig = figment
            .merge(Env::raw())
            .extract()
            .map_err(|e| crate::error::PiiError::Config(e.to_string()))?;

        if config.google_cloud_project.trim().is_empty() {
            return Err(crate::error::PiiError::Config(
                "GOOGLE_CLOUD_PROJECT is required".into(),
            ));
        }

        Ok(config)
    }

    /// `projects/<project>/locations/<region>` scope string used when
    /// building detection and analytics-sink requests (§4.2, §4.4).
    pub fn parent_scope(&self) -> String {
        format!(
            "projects/{}/locations/{}",
            self.google_cloud_project, self.location
        )
    }
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}
fn default_context_ttl_seconds() -> u64 {
    DEFAULT_CONTEXT_TTL_SECONDS
}
fn default_polling_interval_seconds() -> u64 {
    DEFAULT_POLLING_INTERVAL_SECONDS
}
fn default_max_polling_attempts() -> u32 {
    DEFAULT_MAX_POLLING_ATTEMPTS
}
fn default_aggregation_delay_seconds() -> u64 {
    DEFAULT_AGGREGATION_DELAY_SECONDS
}
fn default_archival_ttl_seconds() -> i64 {
    DEFAULT_ARCHIVAL_TTL_SECONDS
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
