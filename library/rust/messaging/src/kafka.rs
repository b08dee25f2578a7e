//! KafkaTransport: rdkafka を使用した BrokerTransport 実装。
//! feature = "kafka" で有効化される。
//!
//! 送信は FutureProducer、読み出しはパーティションごとに assign した StreamConsumer、
//! オフセットのコミットはコンシューマーグループごとの BaseConsumer で行う。
//! rdkafka のブロッキング API は `spawn_blocking` 上で呼び出す。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kafkademo_retry::{with_retry_if, RetryConfig};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};

use crate::config::MessagingConfig;
use crate::envelope::{ConsumedRecord, MessageEnvelope, TopicPartition};
use crate::error::MessagingError;
use crate::transport::{BatchAck, BrokerTransport};

struct PartitionReader {
    consumer: StreamConsumer,
    /// 次に読み出されるオフセット
    next: i64,
}

pub struct KafkaTransport {
    config: MessagingConfig,
    producer: FutureProducer,
    readers: Mutex<HashMap<TopicPartition, Arc<tokio::sync::Mutex<PartitionReader>>>>,
    groups: Mutex<HashMap<String, Arc<BaseConsumer>>>,
}

impl KafkaTransport {
    /// MessagingConfig から KafkaTransport を生成する。クライアント生成のみでブローカーには接続しない。
    pub fn new(config: &MessagingConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        let producer: FutureProducer = Self::client_config(config)
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .set("message.max.bytes", config.max_message_bytes.to_string())
            .create()
            .map_err(|e| MessagingError::Configuration(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            producer,
            readers: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        })
    }

    fn client_config(config: &MessagingConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("security.protocol", &config.security_protocol)
            .set("socket.timeout.ms", config.request_timeout_ms.to_string());
        if config.uses_tls() {
            // ブローカー証明書のホスト名を検証する
            client.set("ssl.endpoint.identification.algorithm", "https");
        }
        client
    }

    fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut client = Self::client_config(&self.config);
        client
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        client
    }

    fn reader(
        &self,
        tp: &TopicPartition,
    ) -> Result<Arc<tokio::sync::Mutex<PartitionReader>>, MessagingError> {
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = readers.get(tp) {
            return Ok(reader.clone());
        }
        let group_id = format!("{}-reader", self.config.client_id);
        let consumer: StreamConsumer = self
            .consumer_config(&group_id)
            .create()
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        let reader = Arc::new(tokio::sync::Mutex::new(PartitionReader {
            consumer,
            // 未割り当てを表す。初回 poll で必ず assign される。
            next: -1,
        }));
        readers.insert(tp.clone(), reader.clone());
        Ok(reader)
    }

    fn group_client(&self, group_id: &str) -> Result<Arc<BaseConsumer>, MessagingError> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = groups.get(group_id) {
            return Ok(client.clone());
        }
        let client: BaseConsumer = self
            .consumer_config(group_id)
            .create()
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        let client = Arc::new(client);
        groups.insert(group_id.to_string(), client.clone());
        Ok(client)
    }

    async fn fetch_partition_count(&self, topic: &str) -> Result<i32, MessagingError> {
        let producer = self.producer.clone();
        let topic = topic.to_string();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map_err(classify_connection)?;
            let count = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map_or(0, |t| t.partitions().len());
            if count == 0 {
                // 自動作成直後はパーティションが見えない場合がある
                return Err(MessagingError::Timeout(format!(
                    "topic {topic} has no partitions yet"
                )));
            }
            Ok(count as i32)
        })
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn connect(&self) -> Result<(), MessagingError> {
        let producer = self.producer.clone();
        let timeout = self.config.connection_timeout();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|_| ())
                .map_err(classify_connection)
        })
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, MessagingError> {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(200));
        with_retry_if(
            &retry,
            || self.fetch_partition_count(topic),
            |e| matches!(e, MessagingError::Timeout(_)),
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn send_batch(
        &self,
        topic: &str,
        partition: i32,
        batch: Vec<Arc<MessageEnvelope>>,
    ) -> BatchAck {
        let mut offsets = Vec::with_capacity(batch.len());
        for envelope in batch {
            let mut headers = OwnedHeaders::new();
            for (name, value) in &envelope.headers {
                headers = headers.insert(Header {
                    key: name.as_str(),
                    value: Some(value.as_slice()),
                });
            }
            let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic)
                .payload(envelope.value.as_slice())
                .partition(partition)
                .timestamp(envelope.timestamp.timestamp_millis())
                .headers(headers);
            if let Some(key) = envelope.key.as_deref() {
                record = record.key(key);
            }

            match self
                .producer
                .send(record, self.config.request_timeout())
                .await
            {
                Ok((_, offset)) => offsets.push(offset),
                Err((err, _)) => return BatchAck::partial(offsets, classify_send(&err)),
            }
        }
        BatchAck::complete(offsets)
    }

    async fn subscribe(
        &self,
        _group_id: &str,
        topics: &[String],
    ) -> Result<Vec<TopicPartition>, MessagingError> {
        let mut assigned = Vec::new();
        for topic in topics {
            let count = self.partition_count(topic).await?;
            assigned.extend((0..count).map(|p| TopicPartition::new(topic.clone(), p)));
        }
        Ok(assigned)
    }

    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(i64, i64), MessagingError> {
        let producer = self.producer.clone();
        let tp = tp.clone();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_watermarks(&tp.topic, tp.partition, timeout)
                .map_err(classify_connection)
        })
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, MessagingError> {
        let client = self.group_client(group_id)?;
        let tp = tp.clone();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&tp.topic, tp.partition);
            let committed = client
                .committed_offsets(tpl, timeout)
                .map_err(classify_connection)?;
            // Kafka のコミット位置は「次に読むオフセット」なので 1 引いて処理済みオフセットに戻す
            let offset = committed
                .find_partition(&tp.topic, tp.partition)
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(next) if next > 0 => Some(next - 1),
                    _ => None,
                });
            Ok(offset)
        })
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?
    }

    async fn poll(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, MessagingError> {
        let reader = self.reader(tp)?;
        let mut guard = reader.lock().await;
        let PartitionReader { consumer, next } = &mut *guard;

        if *next != from_offset {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(from_offset))
                .map_err(classify_connection)?;
            consumer.assign(&tpl).map_err(classify_connection)?;
            *next = from_offset;
        }

        let mut deadline = tokio::time::Instant::now() + timeout;
        let mut records = Vec::new();
        while records.len() < max_records {
            let record = match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if records.is_empty() => return Err(classify_connection(e)),
                Ok(Err(_)) => break,
                Ok(Ok(msg)) => to_record(&msg),
            };
            *next = record.offset + 1;
            records.push(record);
            // 最初の 1 件を受け取ったら、すでに届いている分だけをまとめて返す
            deadline = deadline.min(tokio::time::Instant::now() + Duration::from_millis(5));
        }
        Ok(records)
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), MessagingError> {
        let client = self.group_client(group_id)?;
        let tp = tp.clone();
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset + 1))
                .map_err(|e| MessagingError::Commit(e.to_string()))?;
            client
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| MessagingError::Commit(e.to_string()))
        })
        .await
        .map_err(|e| MessagingError::Commit(e.to_string()))?
    }
}

fn to_record<M: Message>(msg: &M) -> ConsumedRecord {
    let mut envelope = MessageEnvelope::new(msg.payload().unwrap_or_default().to_vec());
    envelope.key = msg.key().map(<[u8]>::to_vec);
    if let Some(headers) = msg.headers() {
        envelope.headers = headers
            .iter()
            .map(|h| (h.key.to_string(), h.value.unwrap_or_default().to_vec()))
            .collect();
    }
    if let Some(timestamp) = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        envelope.timestamp = timestamp;
    }
    ConsumedRecord {
        envelope: Arc::new(envelope),
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
    }
}

fn classify_connection(err: KafkaError) -> MessagingError {
    MessagingError::Connection(err.to_string())
}

fn classify_send(err: &KafkaError) -> MessagingError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::UnknownPartition
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => MessagingError::PermanentSend(err.to_string()),
        _ => MessagingError::TransientSend(err.to_string()),
    }
}
