//! InMemoryBroker: プロセス内で完結するブローカー実装。
//!
//! パーティション単位の追記専用ログとコンシューマーグループごとのコミット位置を保持する。
//! テストダブルとして、またブローカーなしでデモを動かすために使う。
//! 接続失敗・送信失敗を指定回数だけ発生させる障害注入機能を持つ。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::MessagingConfig;
use crate::envelope::{ConsumedRecord, MessageEnvelope, TopicPartition};
use crate::error::MessagingError;
use crate::transport::{BatchAck, BrokerTransport};

#[derive(Default)]
struct BrokerState {
    /// トピック名 → パーティションごとのログ（インデックス = オフセット）
    topics: HashMap<String, Vec<Vec<Arc<MessageEnvelope>>>>,
    /// (グループ ID, パーティション) → 処理済みオフセット
    committed: HashMap<(String, TopicPartition), i64>,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    appended: Notify,
    default_partitions: i32,
    max_message_bytes: usize,
    failing_connects: AtomicU32,
    failing_sends: AtomicU32,
    connect_attempts: AtomicU32,
    send_attempts: AtomicU32,
}

impl InMemoryBroker {
    pub fn new(default_partitions: i32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            appended: Notify::new(),
            default_partitions: default_partitions.max(1),
            max_message_bytes: 1_000_000,
            failing_connects: AtomicU32::new(0),
            failing_sends: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            send_attempts: AtomicU32::new(0),
        }
    }

    pub fn with_config(config: &MessagingConfig) -> Self {
        Self::new(config.default_partitions).with_max_message_bytes(config.max_message_bytes)
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// パーティション数を指定してトピックを作成する。既存のトピックは変更しない。
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// 次の `n` 回の接続試行を失敗させる。
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// 次の `n` 回のバッチ送信を一時的エラーで失敗させる。
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// パーティションに書き込まれたエンベロープを返す。
    pub fn records(&self, tp: &TopicPartition) -> Vec<Arc<MessageEnvelope>> {
        self.lock()
            .topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// グループがコミットしたオフセットを返す。
    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group_id.to_string(), tp.clone()))
            .copied()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_topic<'a>(
        &self,
        state: &'a mut BrokerState,
        topic: &str,
    ) -> &'a mut Vec<Vec<Arc<MessageEnvelope>>> {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.default_partitions as usize])
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read_from(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_records: usize,
    ) -> Result<Vec<ConsumedRecord>, MessagingError> {
        let state = self.lock();
        let log = state
            .topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
            .ok_or_else(|| MessagingError::InvalidState(format!("unknown partition {tp}")))?;
        let start = from_offset.max(0) as usize;
        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(max_records)
            .map(|(offset, envelope)| ConsumedRecord {
                envelope: envelope.clone(),
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: offset as i64,
            })
            .collect())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<(), MessagingError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_connects) {
            return Err(MessagingError::Connection(
                "simulated connection failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, MessagingError> {
        let mut state = self.lock();
        Ok(self.ensure_topic(&mut state, topic).len() as i32)
    }

    async fn send_batch(
        &self,
        topic: &str,
        partition: i32,
        batch: Vec<Arc<MessageEnvelope>>,
    ) -> BatchAck {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_sends) {
            return BatchAck::failed(MessagingError::TransientSend(
                "simulated broker not available".to_string(),
            ));
        }

        let mut offsets = Vec::with_capacity(batch.len());
        let mut error = None;
        {
            let mut state = self.lock();
            let partitions = self.ensure_topic(&mut state, topic);
            let Some(log) = usize::try_from(partition)
                .ok()
                .and_then(|p| partitions.get_mut(p))
            else {
                return BatchAck::failed(MessagingError::PermanentSend(format!(
                    "unknown partition {topic}/{partition}"
                )));
            };
            for envelope in batch {
                let size = envelope.size_bytes();
                if size > self.max_message_bytes {
                    error = Some(MessagingError::PermanentSend(format!(
                        "message size {size} exceeds max {}",
                        self.max_message_bytes
                    )));
                    break;
                }
                log.push(envelope);
                offsets.push(log.len() as i64 - 1);
            }
        }
        if !offsets.is_empty() {
            self.appended.notify_waiters();
        }
        BatchAck { offsets, error }
    }

    async fn subscribe(
        &self,
        _group_id: &str,
        topics: &[String],
    ) -> Result<Vec<TopicPartition>, MessagingError> {
        let mut state = self.lock();
        let mut assigned = Vec::new();
        for topic in topics {
            let count = self.ensure_topic(&mut state, topic).len() as i32;
            assigned.extend((0..count).map(|p| TopicPartition::new(topic.clone(), p)));
        }
        Ok(assigned)
    }

    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(i64, i64), MessagingError> {
        let state = self.lock();
        let log = state
            .topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
            .ok_or_else(|| MessagingError::InvalidState(format!("unknown partition {tp}")))?;
        Ok((0, log.len() as i64))
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, MessagingError> {
        Ok(self.committed(group_id, tp))
    }

    async fn poll(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, MessagingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // 読み取り前に待機登録して、読み取り直後の追記を取りこぼさない
            notified.as_mut().enable();

            let records = self.read_from(tp, from_offset, max_records)?;
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), MessagingError> {
        self.lock()
            .committed
            .insert((group_id.to_string(), tp.clone()), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelopes(values: &[&str]) -> Vec<Arc<MessageEnvelope>> {
        values
            .iter()
            .map(|v| Arc::new(MessageEnvelope::text(v)))
            .collect()
    }

    #[tokio::test]
    async fn test_send_batch_assigns_increasing_offsets() {
        let broker = InMemoryBroker::new(1);
        let ack = broker.send_batch("test", 0, envelopes(&["a", "b"])).await;
        assert_eq!(ack, BatchAck::complete(vec![0, 1]));
        let ack = broker.send_batch("test", 0, envelopes(&["c"])).await;
        assert_eq!(ack, BatchAck::complete(vec![2]));
        assert_eq!(broker.records(&TopicPartition::new("test", 0)).len(), 3);
    }

    #[tokio::test]
    async fn test_send_batch_stops_at_oversized_message() {
        let broker = InMemoryBroker::new(1).with_max_message_bytes(4);
        let batch = envelopes(&["ok", "too large", "ok"]);
        let ack = broker.send_batch("test", 0, batch).await;
        assert_eq!(ack.offsets, vec![0]);
        assert!(matches!(ack.error, Some(MessagingError::PermanentSend(_))));
        // エラー以降のエンベロープは書き込まれない
        assert_eq!(broker.records(&TopicPartition::new("test", 0)).len(), 1);
    }

    #[tokio::test]
    async fn test_send_batch_unknown_partition() {
        let broker = InMemoryBroker::new(2);
        let ack = broker.send_batch("test", 5, envelopes(&["a"])).await;
        assert!(ack.offsets.is_empty());
        assert!(matches!(ack.error, Some(MessagingError::PermanentSend(_))));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);

        broker.fail_next_sends(1);
        let ack = broker.send_batch("test", 0, envelopes(&["a"])).await;
        assert!(matches!(ack.error, Some(MessagingError::TransientSend(_))));
        let ack = broker.send_batch("test", 0, envelopes(&["a"])).await;
        assert_eq!(ack, BatchAck::complete(vec![0]));
        assert_eq!(broker.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_returns_all_partitions() {
        let broker = InMemoryBroker::new(1);
        broker.create_topic("orders", 3);
        let assigned = broker
            .subscribe("group", &["orders".to_string(), "test".to_string()])
            .await
            .unwrap();
        assert_eq!(
            assigned,
            vec![
                TopicPartition::new("orders", 0),
                TopicPartition::new("orders", 1),
                TopicPartition::new("orders", 2),
                TopicPartition::new("test", 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_poll_from_offset() {
        let broker = InMemoryBroker::new(1);
        broker
            .send_batch("test", 0, envelopes(&["a", "b", "c"]))
            .await;
        let tp = TopicPartition::new("test", 0);
        let records = broker
            .poll(&tp, 1, 10, Duration::from_millis(10))
            .await
            .unwrap();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
        assert_eq!(records[0].value_str().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let broker = InMemoryBroker::new(1);
        broker.create_topic("test", 1);
        let records = broker
            .poll(&TopicPartition::new("test", 0), 0, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = Arc::new(InMemoryBroker::new(1));
        broker.create_topic("test", 1);

        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.send_batch("test", 0, envelopes(&["late"])).await;
        });

        let records = broker
            .poll(&TopicPartition::new("test", 0), 0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_offset_per_group() {
        let broker = InMemoryBroker::new(1);
        let tp = TopicPartition::new("test", 0);
        broker.commit_offset("group-a", &tp, 4).await.unwrap();
        assert_eq!(broker.committed_offset("group-a", &tp).await.unwrap(), Some(4));
        assert_eq!(broker.committed_offset("group-b", &tp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offset_bounds() {
        let broker = InMemoryBroker::new(1);
        broker.send_batch("test", 0, envelopes(&["a", "b"])).await;
        let bounds = broker
            .offset_bounds(&TopicPartition::new("test", 0))
            .await
            .unwrap();
        assert_eq!(bounds, (0, 2));
    }
}
