use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use kafkademo_messaging::{ConsumerConfig, Encoding, MessagingConfig, ProducerConfig, TransportKind};
use serde::Deserialize;

/// Config はアプリケーション全体の設定。
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_messaging")]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default = "default_consumer")]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

/// AppConfig はアプリケーション設定。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// LoggingConfig はログ出力設定。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 指定時は環境ごとの既定レベルより優先する
    #[serde(default)]
    pub level: Option<String>,
    /// "text" または "json"
    #[serde(default = "default_format")]
    pub format: String,
}

/// DemoConfig は送受信デモの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_message_count")]
    pub message_count: usize,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_name() -> String {
    "kafkademo".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_topic() -> String {
    "test".to_string()
}

fn default_message_count() -> usize {
    5
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

/// `kafka` フィーチャーなしのビルドではプロセス内ブローカーを既定にする。
fn default_messaging() -> MessagingConfig {
    let transport = if cfg!(feature = "kafka") {
        TransportKind::Kafka
    } else {
        TransportKind::Memory
    };
    MessagingConfig {
        transport,
        ..MessagingConfig::default()
    }
}

fn default_consumer() -> ConsumerConfig {
    ConsumerConfig {
        topics: vec![default_topic()],
        ..ConsumerConfig::new("test-group")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: default_format(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            message_count: default_message_count(),
            encoding: Encoding::default(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl DemoConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            logging: LoggingConfig::default(),
            messaging: default_messaging(),
            producer: ProducerConfig::default(),
            consumer: default_consumer(),
            demo: DemoConfig::default(),
        }
    }
}

impl Config {
    /// YAML ファイルから設定を読み込む。ファイルが存在しない場合は既定値を返す。
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.messaging.validate()?;
        Ok(config)
    }
}
