//! kafkademo-messaging: Kafka 互換ブローカー向けのプロデューサー・コンシューマー抽象化ライブラリ。
//!
//! - ConnectionManager: 遅延接続・バックオフ付き再接続・状態通知
//! - Producer: パーティション単位のバッチング・再送・順序付きの配信結果
//! - Consumer: ハンドラー成功後にのみコミットするキャンセル可能なループ
//! - MessagingFactory: トランスポートを差し替え可能な生成窓口

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod handler;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod partitioner;
pub mod producer;
pub mod transport;

pub use codec::{BytesCodec, Codec, Encoding, JsonCodec, StringCodec};
pub use config::{BackoffConfig, MessagingConfig, MessagingConfigBuilder, TransportKind};
pub use connection::{ConnectionManager, ConnectionState, HealthStatus};
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerState, HandlerFailurePolicy, PartitionCursor, StartOffset,
};
pub use envelope::{
    ConsumedRecord, DeliveryOutcome, DeliveryResult, MessageEnvelope, TopicPartition,
};
pub use error::MessagingError;
pub use factory::MessagingFactory;
pub use handler::{decoding, handler_fn, DecodingHandler, FnHandler, RecordHandler};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::InMemoryBroker;
pub use producer::{DeliveryHandle, Producer, ProducerConfig};
pub use transport::{BatchAck, BrokerTransport};

#[cfg(feature = "mock")]
pub use handler::MockRecordHandler;
#[cfg(feature = "mock")]
pub use transport::MockBrokerTransport;

pub use tokio_util::sync::CancellationToken;
