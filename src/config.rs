use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub base: BaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(rename = "autoApproval", default)]
    pub auto_approval: AutoApprovalConfig,
    #[serde(rename = "loadBalancing", default)]
    pub load_balancing: LoadBalancingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Base URL of the authority API.
    #[serde(rename = "qredoAPI", default = "default_api_url")]
    pub qredo_api: String,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            qredo_api: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address of the local API server.
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: info, warn, error or debug.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    /// URL of the upstream action feed.
    #[serde(rename = "qredoWebsocket", default = "default_feed_url")]
    pub qredo_websocket: String,
    /// Total time window for reconnect attempts, in seconds.
    #[serde(rename = "reconnectTimeoutSec", default = "default_reconnect_timeout")]
    pub reconnect_timeout_sec: u64,
    /// Sleep between reconnect attempts, in seconds.
    #[serde(rename = "reconnectIntervalSec", default = "default_reconnect_interval")]
    pub reconnect_interval_sec: u64,
    /// Keepalive ping period for local feed clients, in seconds.
    #[serde(rename = "pingPeriodSec", default = "default_ping_period")]
    pub ping_period_sec: u64,
    /// Pong wait for local feed clients, in seconds.
    #[serde(rename = "pongWaitSec", default = "default_pong_wait")]
    pub pong_wait_sec: u64,
    /// Write deadline for local feed clients, in seconds.
    #[serde(rename = "writeWaitSec", default = "default_write_wait")]
    pub write_wait_sec: u64,
    #[serde(rename = "readBufferSize", default = "default_read_buffer")]
    pub read_buffer_size: usize,
    #[serde(rename = "writeBufferSize", default = "default_write_buffer")]
    pub write_buffer_size: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            qredo_websocket: default_feed_url(),
            reconnect_timeout_sec: default_reconnect_timeout(),
            reconnect_interval_sec: default_reconnect_interval(),
            ping_period_sec: default_ping_period(),
            pong_wait_sec: default_pong_wait(),
            write_wait_sec: default_write_wait(),
            read_buffer_size: default_read_buffer(),
            write_buffer_size: default_write_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprovalConfig {
    /// Approve every received pending action automatically.
    #[serde(default)]
    pub enabled: bool,
    /// Interval between approval attempts, in seconds.
    #[serde(rename = "retryIntervalSec", default = "default_retry_interval")]
    pub retry_interval_sec: u64,
    /// Total time budget for approval retries, in seconds.
    #[serde(rename = "retryIntervalMaxSec", default = "default_retry_interval_max")]
    pub retry_interval_max_sec: u64,
}

impl Default for AutoApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_interval_sec: default_retry_interval(),
            retry_interval_max_sec: default_retry_interval_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Coordinate with other agents sharing this identity.
    #[serde(default)]
    pub enable: bool,
    /// Sleep after a failed lock acquisition, in milliseconds.
    #[serde(rename = "onLockErrorTimeoutMs", default = "default_on_lock_error")]
    pub on_lock_error_timeout_ms: u64,
    /// TTL of the handled-marker per action id, in seconds.
    #[serde(rename = "actionIDExpirationSec", default = "default_action_id_expiration")]
    pub action_id_expiration_sec: u64,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            on_lock_error_timeout_ms: default_on_lock_error(),
            action_id_expiration_sec: default_action_id_expiration(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend for the agent identity: only `file` ships in this build.
    #[serde(rename = "type", default = "default_store_type")]
    pub store_type: String,
    /// Storage file path when the `file` backend is used.
    #[serde(default = "default_store_file")]
    pub file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: default_store_type(),
            file: default_store_file(),
        }
    }
}

fn default_api_url() -> String {
    "https://sandbox-api.qredo.network/api/v1/p".to_string()
}

fn default_http_addr() -> String {
    "127.0.0.1:8007".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_feed_url() -> String {
    "wss://sandbox-api.qredo.network/api/v1/p/coreclient/feed".to_string()
}

fn default_reconnect_timeout() -> u64 {
    300
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_ping_period() -> u64 {
    5
}

fn default_pong_wait() -> u64 {
    10
}

fn default_write_wait() -> u64 {
    10
}

fn default_read_buffer() -> usize {
    512
}

fn default_write_buffer() -> usize {
    1024
}

fn default_retry_interval() -> u64 {
    5
}

fn default_retry_interval_max() -> u64 {
    300
}

fn default_on_lock_error() -> u64 {
    300
}

fn default_action_id_expiration() -> u64 {
    6
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_store_type() -> String {
    "file".to_string()
}

fn default_store_file() -> String {
    "ccstore.db".to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file with environment overrides
    /// (`SIGNING_AGENT_` prefix, `__` as separator).
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("SIGNING_AGENT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.base.qredo_api.trim().is_empty() {
            errors.push("base.qredoAPI must not be empty".to_string());
        }
        if self.websocket.qredo_websocket.trim().is_empty() {
            errors.push("websocket.qredoWebsocket must not be empty".to_string());
        }
        if self.websocket.reconnect_interval_sec == 0 {
            errors.push("websocket.reconnectIntervalSec must be > 0".to_string());
        }
        if self.websocket.reconnect_timeout_sec < self.websocket.reconnect_interval_sec {
            errors.push(format!(
                "websocket.reconnectTimeoutSec must be >= reconnectIntervalSec, got {} < {}",
                self.websocket.reconnect_timeout_sec, self.websocket.reconnect_interval_sec
            ));
        }
        if self.auto_approval.enabled && self.auto_approval.retry_interval_sec == 0 {
            errors.push("autoApproval.retryIntervalSec must be > 0".to_string());
        }
        if self.load_balancing.enable && self.load_balancing.action_id_expiration_sec == 0 {
            errors.push("loadBalancing.actionIDExpirationSec must be > 0".to_string());
        }
        if self.store.store_type != "file" {
            errors.push(format!(
                "store.type `{}` is not supported by this build",
                self.store.store_type
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_empty());
        assert_eq!(cfg.websocket.reconnect_interval_sec, 5);
        assert_eq!(cfg.auto_approval.retry_interval_max_sec, 300);
        assert_eq!(cfg.load_balancing.action_id_expiration_sec, 6);
        assert_eq!(cfg.store.store_type, "file");
    }

    #[test]
    fn test_validate_rejects_zero_reconnect_interval() {
        let mut cfg = AppConfig::default();
        cfg.websocket.reconnect_interval_sec = 0;
        let errors = cfg.validate();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://redis:6379/0");
        redis.password = "secret".to_string();
        redis.host = "10.0.0.1".to_string();
        assert_eq!(redis.url(), "redis://:secret@10.0.0.1:6379/0");
    }

    #[test]
    fn test_deserializes_yaml_keys() {
        let yaml = r#"
base:
  qredoAPI: https://api.example.net/api/v1/p
websocket:
  qredoWebsocket: wss://api.example.net/feed
  reconnectTimeoutSec: 60
autoApproval:
  enabled: true
  retryIntervalSec: 2
loadBalancing:
  enable: true
  onLockErrorTimeoutMs: 150
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.base.qredo_api, "https://api.example.net/api/v1/p");
        assert_eq!(cfg.websocket.reconnect_timeout_sec, 60);
        assert!(cfg.auto_approval.enabled);
        assert_eq!(cfg.auto_approval.retry_interval_sec, 2);
        assert_eq!(cfg.load_balancing.on_lock_error_timeout_ms, 150);
        // untouched sections keep defaults
        assert_eq!(cfg.websocket.ping_period_sec, 5);
    }
}
