use crate::breaker::BreakerConfig;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn setup_config_path() -> Option<PathBuf> {
    env::var("SIDECAR_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    sidecar_mqtt_topic: Option<String>,
    #[serde(default)]
    sidecar_mqtt_keepalive_secs: Option<u64>,
    #[serde(default)]
    sidecar_enable_mqtt: Option<bool>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "greenhouse-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "greenhouse-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Setup-file values only land where `env_allows` says the environment left
/// the variable unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if config.database_url.is_none() {
        config.database_url =
            non_empty(overrides.database_url.as_deref()).map(normalize_database_url);
    }

    if env_allows("SIDECAR_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("SIDECAR_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("SIDECAR_MQTT_USERNAME") && overrides.mqtt_username.is_some() {
        config.mqtt_username = non_empty(overrides.mqtt_username.as_deref());
    }
    if env_allows("SIDECAR_MQTT_PASSWORD") && overrides.mqtt_password.is_some() {
        config.mqtt_password = non_empty(overrides.mqtt_password.as_deref());
    }
    if env_allows("SIDECAR_MQTT_TOPIC") {
        if let Some(topic) = non_empty(overrides.sidecar_mqtt_topic.as_deref()) {
            config.mqtt_topic = topic;
        }
    }
    if env_allows("SIDECAR_MQTT_KEEPALIVE_SECS") {
        if let Some(value) = overrides.sidecar_mqtt_keepalive_secs.filter(|v| *v != 0) {
            config.mqtt_keepalive_secs = value;
        }
    }
    if env_allows("SIDECAR_ENABLE_MQTT") {
        if let Some(value) = overrides.sidecar_enable_mqtt {
            config.enable_mqtt_listener = value;
        }
    }
}

fn positive_or<T>(value: Option<T>, default: T) -> T
where
    T: PartialEq + Default,
{
    value.filter(|v| *v != T::default()).unwrap_or(default)
}

fn env_number<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialEq + Default,
{
    positive_or(
        env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok()),
        default,
    )
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `None` disables persistence; windows are still computed and served.
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub window_secs: u64,
    pub queue_capacity: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_open_secs: u64,
    pub sink_write_timeout_ms: u64,
    pub grpc_socket_path: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_pool_size: 5,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic: "esp32/data".to_string(),
            mqtt_keepalive_secs: 60,
            mqtt_client_id: format!("greenhouse-sidecar-{}", std::process::id()),
            enable_mqtt_listener: true,
            window_secs: 60,
            queue_capacity: 1000,
            breaker_failure_threshold: 5,
            breaker_open_secs: 30,
            sink_write_timeout_ms: 5000,
            grpc_socket_path: "/tmp/greenhouse_averages.sock".to_string(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("SIDECAR_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .and_then(|value| non_empty(Some(value.as_str())))
            .map(normalize_database_url);

        let mqtt_host = non_empty(env::var("SIDECAR_MQTT_HOST").ok().as_deref())
            .unwrap_or(defaults.mqtt_host);
        let mqtt_port = env_number("SIDECAR_MQTT_PORT", defaults.mqtt_port);
        let mqtt_username = non_empty(env::var("SIDECAR_MQTT_USERNAME").ok().as_deref());
        let mqtt_password = non_empty(env::var("SIDECAR_MQTT_PASSWORD").ok().as_deref());
        let mqtt_topic = non_empty(env::var("SIDECAR_MQTT_TOPIC").ok().as_deref())
            .unwrap_or(defaults.mqtt_topic);
        let mqtt_keepalive_secs =
            env_number("SIDECAR_MQTT_KEEPALIVE_SECS", defaults.mqtt_keepalive_secs);
        let mqtt_client_id = non_empty(env::var("SIDECAR_MQTT_CLIENT_ID").ok().as_deref())
            .unwrap_or(defaults.mqtt_client_id);
        let enable_mqtt_listener = env::var("SIDECAR_ENABLE_MQTT")
            .map(|v| {
                let v = v.trim();
                v == "1" || v.eq_ignore_ascii_case("true")
            })
            .unwrap_or(defaults.enable_mqtt_listener);

        let window_secs = env_number("SIDECAR_WINDOW_SECS", defaults.window_secs);
        let queue_capacity = env_number("SIDECAR_QUEUE_CAPACITY", defaults.queue_capacity);
        let db_pool_size = env_number("SIDECAR_DB_POOL_SIZE", defaults.db_pool_size);
        let breaker_failure_threshold = env_number(
            "SIDECAR_BREAKER_FAILURE_THRESHOLD",
            defaults.breaker_failure_threshold,
        );
        let breaker_open_secs = env_number("SIDECAR_BREAKER_OPEN_SECS", defaults.breaker_open_secs);
        let sink_write_timeout_ms =
            env_number("SIDECAR_SINK_WRITE_TIMEOUT_MS", defaults.sink_write_timeout_ms);

        let grpc_socket_path = non_empty(env::var("SIDECAR_GRPC_SOCKET").ok().as_deref())
            .unwrap_or(defaults.grpc_socket_path);
        let otlp_endpoint = non_empty(env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref());

        let mut config = Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            window_secs,
            queue_capacity,
            breaker_failure_threshold,
            breaker_open_secs,
            sink_write_timeout_ms,
            grpc_socket_path,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| !env_is_set(key));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.enable_mqtt_listener {
            rumqttc::valid_filter(&self.mqtt_topic)
                .then_some(())
                .with_context(|| {
                    format!(
                        "SIDECAR_MQTT_TOPIC {:?} is not a valid MQTT filter",
                        self.mqtt_topic
                    )
                })?;
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            open_timeout: Duration::from_secs(self.breaker_open_secs),
            call_timeout: Duration::from_millis(self.sink_write_timeout_ms),
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
