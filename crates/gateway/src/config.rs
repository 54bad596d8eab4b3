//! Startup configuration: environment variables first, with an optional
//! TOML bootstrap file for seeding stream/threshold definitions on first
//! boot (mirrors the teacher's `config.toml` zone/sensor seed).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

fn env_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub url_override: Option<String>,
    pub pool_size: u32,
    pub pool_overflow: u32,
    pub recycle_secs: u64,
}

impl DbConfig {
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url_override {
            return url.clone();
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub sensor_per_min: u64,
    pub device_per_min: u64,
    pub global_per_min: u64,
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub dedup_enabled: bool,
    pub dedup_ttl_secs: u64,
    pub dlq_enabled: bool,
    pub dlq_max_len: u64,
    pub dlq_max_retries: u32,
    pub cb_failure_threshold: u32,
    pub cb_recovery_timeout: Duration,
    pub cb_success_threshold: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub mqtt_universal: bool,
    pub websocket_enabled: bool,
    pub csv_enabled: bool,
    pub device_auth_enabled: bool,
    pub legacy_api_key_allowed: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub redis_url: String,
    pub mqtt: MqttConfig,
    pub rate_limit: RateLimitConfig,
    pub resilience: ResilienceConfig,
    pub features: FeatureFlags,
    pub ingest_api_key: Option<String>,
    pub internal_api_key: Option<String>,
    pub backend_url: Option<String>,
    pub ml_publish_min_interval_secs: f64,
    pub sensor_map_ttl_secs: u64,
    pub bootstrap_toml_path: Option<String>,
    pub http_bind: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        AppConfig {
            db: DbConfig {
                host: env_var("DB_HOST", "localhost"),
                port: env_parse("DB_PORT", 5432),
                user: env_var("DB_USER", "postgres"),
                password: env_var("DB_PASSWORD", ""),
                name: env_var("DB_NAME", "ingestion"),
                url_override: env::var("POSTGRES_URL").ok(),
                pool_size: env_parse("DB_POOL_SIZE", 5),
                pool_overflow: env_parse("DB_POOL_OVERFLOW", 10),
                recycle_secs: env_parse("DB_POOL_RECYCLE_SECONDS", 300),
            },
            redis_url: env_var("REDIS_URL", "redis://127.0.0.1:6379"),
            mqtt: MqttConfig {
                broker_host: env_var("MQTT_BROKER_HOST", "localhost"),
                broker_port: env_parse("MQTT_BROKER_PORT", 1883),
                username: env::var("MQTT_USERNAME").ok(),
                password: env::var("MQTT_PASSWORD").ok(),
            },
            rate_limit: RateLimitConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", true),
                sensor_per_min: env_parse("RATE_LIMIT_SENSOR_PER_MIN", 60),
                device_per_min: env_parse("RATE_LIMIT_DEVICE_PER_MIN", 300),
                global_per_min: env_parse("RATE_LIMIT_GLOBAL_PER_MIN", 1000),
            },
            resilience: ResilienceConfig {
                dedup_enabled: env_bool("DEDUP_ENABLED", true),
                dedup_ttl_secs: env_parse("DEDUP_TTL_SECONDS", 300),
                dlq_enabled: env_bool("DLQ_ENABLED", true),
                dlq_max_len: env_parse("DLQ_MAX_LEN", 5000),
                dlq_max_retries: env_parse("DLQ_MAX_RETRIES", 3),
                cb_failure_threshold: env_parse("CB_FAILURE_THRESHOLD", 5),
                cb_recovery_timeout: Duration::from_secs(env_parse("CB_RECOVERY_TIMEOUT", 30)),
                cb_success_threshold: env_parse("CB_SUCCESS_THRESHOLD", 2),
                retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
                retry_base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 200)),
                retry_max_delay: Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS", 5000)),
            },
            features: FeatureFlags {
                mqtt_universal: env_bool("FF_MQTT_UNIVERSAL", false),
                websocket_enabled: env_bool("FF_WEBSOCKET_ENABLED", true),
                csv_enabled: env_bool("FF_CSV_ENABLED", true),
                device_auth_enabled: env_bool("DEVICE_AUTH_ENABLED", true),
                legacy_api_key_allowed: env_bool("LEGACY_API_KEY_ALLOWED", true),
            },
            ingest_api_key: env::var("INGEST_API_KEY").ok(),
            internal_api_key: env::var("INTERNAL_API_KEY").ok(),
            backend_url: env::var("BACKEND_URL").ok(),
            ml_publish_min_interval_secs: env_parse("ML_PUBLISH_MIN_INTERVAL_SECONDS", 1.0),
            sensor_map_ttl_secs: env_parse("SENSOR_MAP_TTL_SECONDS", 300),
            bootstrap_toml_path: env::var("BOOTSTRAP_CONFIG_PATH").ok(),
            http_bind: env_var("HTTP_BIND", "0.0.0.0:8080"),
        }
    }
}

/// Bootstrap TOML shape for seeding stream/threshold definitions on first
/// boot, mirroring the teacher's zone/sensor seed file.
#[derive(Debug, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub streams: Vec<BootstrapStream>,
}

#[derive(Debug, Deserialize)]
pub struct BootstrapStream {
    pub domain: String,
    pub source: String,
    pub stream: String,
    pub sensor_type: String,
    pub physical_min: Option<f64>,
    pub physical_max: Option<f64>,
    pub warning_min: Option<f64>,
    pub warning_max: Option<f64>,
    pub delta_abs: Option<f64>,
    pub delta_rel: Option<f64>,
    pub slope_abs: Option<f64>,
    pub slope_rel: Option<f64>,
    #[serde(default)]
    pub delta_severity: Option<String>,
    #[serde(default)]
    pub consecutive_readings_required: Option<u32>,
    #[serde(default = "default_min_readings")]
    pub min_readings_for_normal: u32,
}

fn default_min_readings() -> u32 {
    5
}

pub fn load_bootstrap(path: &str) -> Result<BootstrapConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bootstrap config at {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing bootstrap config at {path}"))
}

/// Seeds/updates stream and threshold rows from the bootstrap file
/// (mirrors the teacher's zone/sensor `config::apply`).
pub async fn apply_bootstrap(cfg: &BootstrapConfig, db: &crate::db::Db) -> Result<()> {
    for stream in &cfg.streams {
        db.upsert_bootstrap_stream(stream)
            .await
            .with_context(|| format!("failed to upsert stream '{}/{}/{}'", stream.domain, stream.source, stream.stream))?;
    }
    tracing::info!(streams = cfg.streams.len(), "bootstrap config applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_connection_url_uses_override_when_present() {
        let mut cfg = DbConfig {
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            name: "n".into(),
            url_override: None,
            pool_size: 5,
            pool_overflow: 10,
            recycle_secs: 300,
        };
        assert_eq!(cfg.connection_url(), "postgres://u:p@h:5432/n");
        cfg.url_override = Some("postgres://custom".into());
        assert_eq!(cfg.connection_url(), "postgres://custom");
    }

    #[test]
    fn bootstrap_config_parses_minimal_toml() {
        let toml_src = r#"
            [[streams]]
            domain = "iot"
            source = "farm1"
            stream = "temp"
            physical_min = 10.0
            physical_max = 30.0
        "#;
        let parsed: BootstrapConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(parsed.streams.len(), 1);
        assert_eq!(parsed.streams[0].min_readings_for_normal, 5);
    }
}
