use std::time::Duration;

use kafkademo_retry::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// TransportKind は使用するブローカートランスポートの種類。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// rdkafka による Kafka 接続（feature = "kafka"）
    #[default]
    Kafka,
    /// プロセス内ブローカー
    Memory,
}

/// BackoffConfig は設定ファイル上のバックオフ設定。`RetryConfig` に変換して使う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// 最大試行回数。省略時は無制限。
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl BackoffConfig {
    /// 最大試行回数を指定して生成する。
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.map(|n| n.max(1)),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// MessagingConfig はブローカー接続設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// ブローカーアドレスのリスト（例: ["localhost:9092"]）
    pub brokers: Vec<String>,
    /// セキュリティプロトコル（PLAINTEXT / SSL / SASL_PLAINTEXT / SASL_SSL）
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// 接続タイムアウト（ミリ秒）
    #[serde(default = "default_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// リクエストタイムアウト（ミリ秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// メッセージの最大サイズ（バイト）
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// プロセス内ブローカーで自動作成するトピックのパーティション数
    #[serde(default = "default_partitions")]
    pub default_partitions: i32,
    /// 再接続のバックオフ設定
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffConfig,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_client_id() -> String {
    "kafkademo".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_max_message_bytes() -> usize {
    1_000_000
}

fn default_partitions() -> i32 {
    1
}

fn default_reconnect() -> BackoffConfig {
    BackoffConfig::bounded(5)
}

const SECURITY_PROTOCOLS: [&str; 4] = ["PLAINTEXT", "SSL", "SASL_PLAINTEXT", "SASL_SSL"];

impl MessagingConfig {
    /// ビルダーを取得する。
    pub fn builder() -> MessagingConfigBuilder {
        MessagingConfigBuilder::default()
    }

    /// ブローカーアドレスをカンマ区切り文字列で返す（rdkafka の bootstrap.servers 用）。
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// セキュリティプロトコルが TLS を使用するか判定する。
    pub fn uses_tls(&self) -> bool {
        self.security_protocol.contains("SSL")
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 設定の論理的妥当性を検証する。
    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.brokers.is_empty() {
            return Err(MessagingError::Configuration(
                "at least one broker must be specified".to_string(),
            ));
        }
        if self.brokers.iter().any(String::is_empty) {
            return Err(MessagingError::Configuration(
                "empty broker address".to_string(),
            ));
        }
        if !SECURITY_PROTOCOLS.contains(&self.security_protocol.as_str()) {
            return Err(MessagingError::Configuration(format!(
                "unknown security_protocol: {}",
                self.security_protocol
            )));
        }
        if self.default_partitions < 1 {
            return Err(MessagingError::Configuration(
                "default_partitions must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MessagingConfig {
    /// ローカルの Kafka ブローカー（localhost:9092）に接続する設定。
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            security_protocol: default_security_protocol(),
            transport: TransportKind::default(),
            client_id: default_client_id(),
            connection_timeout_ms: default_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_message_bytes: default_max_message_bytes(),
            default_partitions: default_partitions(),
            reconnect: default_reconnect(),
        }
    }
}

/// MessagingConfigBuilder は MessagingConfig のビルダー。
#[derive(Default)]
pub struct MessagingConfigBuilder {
    brokers: Vec<String>,
    security_protocol: Option<String>,
    transport: Option<TransportKind>,
    client_id: Option<String>,
    connection_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    max_message_bytes: Option<usize>,
    default_partitions: Option<i32>,
    reconnect: Option<BackoffConfig>,
}

impl MessagingConfigBuilder {
    /// ブローカーアドレスを設定する。
    pub fn brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = brokers;
        self
    }

    /// セキュリティプロトコルを設定する。
    pub fn security_protocol(mut self, protocol: &str) -> Self {
        self.security_protocol = Some(protocol.to_string());
        self
    }

    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    /// 接続タイムアウト（ミリ秒）を設定する。
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = Some(ms);
        self
    }

    /// リクエストタイムアウト（ミリ秒）を設定する。
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    /// 最大メッセージサイズ（バイト）を設定する。
    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = Some(bytes);
        self
    }

    pub fn default_partitions(mut self, partitions: i32) -> Self {
        self.default_partitions = Some(partitions);
        self
    }

    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = Some(backoff);
        self
    }

    /// MessagingConfig を構築する。ブローカーが未設定の場合はエラーを返す。
    pub fn build(self) -> Result<MessagingConfig, MessagingError> {
        let config = MessagingConfig {
            brokers: self.brokers,
            security_protocol: self
                .security_protocol
                .unwrap_or_else(default_security_protocol),
            transport: self.transport.unwrap_or_default(),
            client_id: self.client_id.unwrap_or_else(default_client_id),
            connection_timeout_ms: self.connection_timeout_ms.unwrap_or_else(default_timeout_ms),
            request_timeout_ms: self
                .request_timeout_ms
                .unwrap_or_else(default_request_timeout_ms),
            max_message_bytes: self
                .max_message_bytes
                .unwrap_or_else(default_max_message_bytes),
            default_partitions: self.default_partitions.unwrap_or_else(default_partitions),
            reconnect: self.reconnect.unwrap_or_else(default_reconnect),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_servers_multiple() {
        let cfg = MessagingConfig::builder()
            .brokers(vec!["kafka-0:9092".to_string(), "kafka-1:9092".to_string()])
            .build()
            .unwrap();
        assert_eq!(cfg.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
    }

    #[test]
    fn test_uses_tls() {
        let plain = MessagingConfig::builder()
            .brokers(vec!["kafka:9092".to_string()])
            .security_protocol("SASL_PLAINTEXT")
            .build()
            .unwrap();
        assert!(!plain.uses_tls());

        let tls = MessagingConfig::builder()
            .brokers(vec!["kafka:9094".to_string()])
            .security_protocol("SASL_SSL")
            .build()
            .unwrap();
        assert!(tls.uses_tls());
    }

    #[test]
    fn test_builder_requires_brokers() {
        let err = MessagingConfig::builder().build().unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_empty_broker() {
        let err = MessagingConfig::builder()
            .brokers(vec![String::new()])
            .build()
            .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_security_protocol() {
        let err = MessagingConfig::builder()
            .brokers(vec!["kafka:9092".to_string()])
            .security_protocol("TLS")
            .build()
            .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(ref m) if m.contains("TLS")));
    }

    #[test]
    fn test_default_points_to_local_broker() {
        let cfg = MessagingConfig::default();
        assert_eq!(cfg.bootstrap_servers(), "localhost:9092");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"brokers": ["localhost:9092"]}"#;
        let cfg: MessagingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.security_protocol, "PLAINTEXT");
        assert_eq!(cfg.transport, TransportKind::Kafka);
        assert_eq!(cfg.connection_timeout_ms, 5000);
        assert_eq!(cfg.request_timeout_ms, 30000);
        assert_eq!(cfg.max_message_bytes, 1_000_000);
        assert_eq!(cfg.default_partitions, 1);
        assert_eq!(cfg.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn test_deserialize_yaml_with_memory_transport() {
        let yaml = r#"
brokers:
  - "localhost:9092"
transport: memory
default_partitions: 3
reconnect:
  initial_delay_ms: 50
"#;
        let cfg: MessagingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.transport, TransportKind::Memory);
        assert_eq!(cfg.default_partitions, 3);
        // reconnect を指定すると max_attempts 省略時は無制限になる
        assert_eq!(cfg.reconnect.max_attempts, None);
        assert_eq!(cfg.reconnect.initial_delay_ms, 50);
    }

    #[test]
    fn test_backoff_to_retry_config() {
        let backoff = BackoffConfig {
            max_attempts: Some(0),
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 3.0,
            jitter: false,
        };
        let retry = backoff.to_retry_config();
        assert_eq!(retry.max_attempts, Some(1));
        assert_eq!(retry.initial_delay, Duration::from_millis(10));
        assert_eq!(retry.compute_delay(1), Duration::from_millis(30));
    }
}
