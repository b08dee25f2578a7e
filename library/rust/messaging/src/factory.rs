use std::sync::Arc;

use crate::config::{MessagingConfig, TransportKind};
use crate::connection::ConnectionManager;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::error::MessagingError;
use crate::memory::InMemoryBroker;
use crate::producer::{Producer, ProducerConfig};
use crate::transport::BrokerTransport;

/// MessagingFactory は 1 つの ConnectionManager を共有するプロデューサー・コンシューマーを生成する。
/// 生成時に I/O は行わず、接続は初回利用時に確立される。
pub struct MessagingFactory {
    config: MessagingConfig,
    connection: Arc<ConnectionManager>,
}

impl MessagingFactory {
    /// 任意のトランスポートからファクトリを生成する。テストダブルの差し替えに使う。
    pub fn new(config: MessagingConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            transport,
            config.reconnect.to_retry_config(),
        ));
        Self { config, connection }
    }

    /// プロセス内ブローカーを使うファクトリを生成する。
    pub fn in_memory(config: MessagingConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::with_config(&config));
        Self::new(config, broker)
    }

    /// rdkafka で Kafka に接続するファクトリを生成する。
    #[cfg(feature = "kafka")]
    pub fn kafka(config: MessagingConfig) -> Result<Self, MessagingError> {
        let transport = Arc::new(crate::kafka::KafkaTransport::new(&config)?);
        Ok(Self::new(config, transport))
    }

    /// 設定の `transport` に従ってファクトリを生成する。
    pub fn from_config(config: MessagingConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        match config.transport {
            TransportKind::Memory => Ok(Self::in_memory(config)),
            #[cfg(feature = "kafka")]
            TransportKind::Kafka => Self::kafka(config),
            #[cfg(not(feature = "kafka"))]
            TransportKind::Kafka => Err(MessagingError::Configuration(
                "kafka transport requires the `kafka` feature".to_string(),
            )),
        }
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// 共有している ConnectionManager を返す。状態監視やヘルスチェックに使う。
    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.clone()
    }

    /// プロデューサーを生成する。Tokio ランタイム内で呼び出す必要がある。
    pub fn create_producer(&self, config: ProducerConfig) -> Producer {
        Producer::new(
            self.connection.clone(),
            config,
            self.config.max_message_bytes,
        )
    }

    pub fn create_consumer(&self, config: ConsumerConfig) -> Consumer {
        Consumer::new(self.connection.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::transport::MockBrokerTransport;

    fn config(transport: TransportKind) -> MessagingConfig {
        MessagingConfig::builder()
            .brokers(vec!["localhost:9092".to_string()])
            .transport(transport)
            .build()
            .unwrap()
    }

    #[test]
    fn test_construction_performs_no_io() {
        let mut mock = MockBrokerTransport::new();
        mock.expect_connect().never();
        mock.expect_send_batch().never();
        let factory = MessagingFactory::new(config(TransportKind::Memory), Arc::new(mock));
        let _consumer = factory.create_consumer(ConsumerConfig::new("test-group"));
        assert_eq!(factory.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_producer_and_consumer_share_connection() {
        let factory = MessagingFactory::from_config(config(TransportKind::Memory)).unwrap();
        let producer = factory.create_producer(ProducerConfig::default());
        let consumer = factory.create_consumer(ConsumerConfig::new("test-group"));

        let result = producer
            .send("test", crate::envelope::MessageEnvelope::text("Message 1"))
            .wait()
            .await;
        assert!(result.is_success());
        assert!(factory.connection().is_ready());

        // 同じ接続を使うので追加の接続は発生しない
        consumer.subscribe(&["test".to_string()]).await.unwrap();
        assert!(factory.connection().is_ready());
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_kafka_transport_requires_feature() {
        let err = MessagingFactory::from_config(config(TransportKind::Kafka))
            .err()
            .unwrap();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }
}
