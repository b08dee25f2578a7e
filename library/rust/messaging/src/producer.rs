//! Producer: バッチング・再送・配信結果追跡を行うプロデューサーパイプライン。
//!
//! `send` は非ブロッキングで、投入されたエンベロープはディスパッチャーがパーティションを決め、
//! パーティションごとのバッチングワーカーへ渡す。ワーカーは linger 時間・件数・バイト数の
//! いずれかに達した時点でバッチを送信し、一時的エラーはバックオフ付きで再送する。
//! 投入したエンベロープ 1 件につき DeliveryResult がちょうど 1 回解決される。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use kafkademo_retry::RetryConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::config::BackoffConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{DeliveryResult, MessageEnvelope, TopicPartition};
use crate::error::MessagingError;
use crate::partitioner::Partitioner;

/// ProducerConfig はプロデューサーのバッチング・再送設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// 1 バッチの最大件数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 1 バッチの最大バイト数
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    /// バッチを送信するまでの待ち時間（ミリ秒）
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// 未解決の配信結果の上限。超えた送信は即座に失敗として解決する。
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// 一時的エラー時の再送設定
    #[serde(default = "default_send_retry")]
    pub retry: BackoffConfig,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_max_bytes() -> usize {
    1_048_576
}

fn default_linger_ms() -> u64 {
    5
}

fn default_max_pending() -> usize {
    10_000
}

fn default_send_retry() -> BackoffConfig {
    BackoffConfig::bounded(5)
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_max_bytes: default_batch_max_bytes(),
            linger_ms: default_linger_ms(),
            max_pending: default_max_pending(),
            retry: default_send_retry(),
        }
    }
}

type DeliveryCallback = Box<dyn Fn(&DeliveryResult) + Send + Sync>;

/// 受け付け済みの 1 件。結果を確定させないまま破棄されると `Closed` として解決される。
struct Submission {
    topic: String,
    envelope: Arc<MessageEnvelope>,
    // 投入時点の flush 世代
    flush_generation: u64,
    responder: Option<oneshot::Sender<DeliveryResult>>,
    shared: Arc<Shared>,
}

impl Submission {
    fn resolve(mut self, result: DeliveryResult) {
        if let Some(responder) = self.responder.take() {
            self.shared.resolve(responder, result);
        }
    }

    fn fail(self, partition: Option<i32>, err: &MessagingError) {
        let result = DeliveryResult::failed(self.envelope.clone(), &self.topic, partition, err);
        self.resolve(result);
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            let result = DeliveryResult::failed(
                self.envelope.clone(),
                &self.topic,
                None,
                &MessagingError::Closed("producer closed before delivery".to_string()),
            );
            self.shared.resolve(responder, result);
        }
    }
}

struct Shared {
    connection: Arc<ConnectionManager>,
    config: ProducerConfig,
    retry: RetryConfig,
    max_message_bytes: usize,
    partitioner: Partitioner,
    callbacks: RwLock<Vec<DeliveryCallback>>,
    pending: watch::Sender<usize>,
    flush_requests: watch::Sender<u64>,
    // close がタイムアウトしたときに滞留中の送信を打ち切る
    abort: CancellationToken,
}

impl Shared {
    fn deliver(&self, responder: oneshot::Sender<DeliveryResult>, result: DeliveryResult) {
        {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            for callback in callbacks.iter() {
                callback(&result);
            }
        }
        // 呼び出し側がハンドルを破棄していても結果は確定済みとして扱う
        let _ = responder.send(result);
    }

    /// 受け付け済みのエンベロープの結果を確定させ、未解決数を減らす。
    fn resolve(&self, responder: oneshot::Sender<DeliveryResult>, result: DeliveryResult) {
        self.deliver(responder, result);
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// DeliveryHandle は 1 件の送信に対する未確定の配信結果。
pub struct DeliveryHandle {
    rx: oneshot::Receiver<DeliveryResult>,
    envelope: Arc<MessageEnvelope>,
    topic: String,
}

impl DeliveryHandle {
    /// 配信結果を待つ。プロデューサーが結果を確定できずに破棄された場合も失敗結果を返す。
    pub async fn wait(self) -> DeliveryResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => DeliveryResult::failed(
                self.envelope,
                &self.topic,
                None,
                &MessagingError::Closed("producer dropped before delivery".to_string()),
            ),
        }
    }
}

/// Producer はエンベロープをパーティションごとにバッチングして送信するプロデューサー。
///
/// 投入した各エンベロープの結果は `DeliveryHandle` と `on_delivery` コールバックに
/// ちょうど 1 回ずつ届く。
pub struct Producer {
    shared: Arc<Shared>,
    submit_tx: mpsc::UnboundedSender<Submission>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// プロデューサーを生成し、ディスパッチャータスクを起動する。
    /// Tokio ランタイム内で呼び出す必要がある。ブローカーへの接続は初回送信時に行われる。
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: ProducerConfig,
        max_message_bytes: usize,
    ) -> Self {
        let (pending, _) = watch::channel(0usize);
        let (flush_requests, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            connection,
            retry: config.retry.to_retry_config(),
            config,
            max_message_bytes,
            partitioner: Partitioner::new(),
            callbacks: RwLock::new(Vec::new()),
            pending,
            flush_requests,
            abort: CancellationToken::new(),
        });
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), submit_rx, shutdown.clone()));

        Self {
            shared,
            submit_tx,
            closing: AtomicBool::new(false),
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// エンベロープを送信キューに投入し、配信結果のハンドルを返す。ブロックしない。
    pub fn send(&self, topic: &str, envelope: MessageEnvelope) -> DeliveryHandle {
        let envelope = Arc::new(envelope);
        let (responder, rx) = oneshot::channel();
        let handle = DeliveryHandle {
            rx,
            envelope: envelope.clone(),
            topic: topic.to_string(),
        };

        if let Err(e) = self.admit(&envelope) {
            tracing::warn!(topic = %topic, error = %e, "message rejected");
            let result = DeliveryResult::failed(envelope, topic, None, &e);
            self.shared.deliver(responder, result);
            return handle;
        }

        let submission = Submission {
            topic: topic.to_string(),
            envelope,
            flush_generation: *self.shared.flush_requests.borrow(),
            responder: Some(responder),
            shared: self.shared.clone(),
        };
        if let Err(mpsc::error::SendError(submission)) = self.submit_tx.send(submission) {
            submission.fail(None, &MessagingError::Closed("producer is closed".to_string()));
        }
        handle
    }

    /// 値をコーデックでエンコードして送信する。
    pub fn send_value<C: Codec>(
        &self,
        topic: &str,
        codec: &C,
        key: Option<Vec<u8>>,
        value: &C::Value,
    ) -> Result<DeliveryHandle, MessagingError> {
        let mut envelope = MessageEnvelope::new(codec.encode(value)?);
        envelope.key = key;
        Ok(self.send(topic, envelope))
    }

    /// 配信結果が確定するたびに呼ばれるコールバックを登録する。
    pub fn on_delivery<F>(&self, callback: F)
    where
        F: Fn(&DeliveryResult) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// 結果が未確定のエンベロープ数を返す。
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    /// 滞留中のバッチを即座に送信させ、すべての結果が確定するかタイムアウトするまで待つ。
    /// 戻り値はタイムアウト時点で未確定の件数（完了時は 0）。
    pub async fn flush(&self, timeout: Duration) -> usize {
        self.shared
            .flush_requests
            .send_modify(|generation| *generation = generation.wrapping_add(1));

        let mut rx = self.shared.pending.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if drained {
            return 0;
        }
        let remaining = *rx.borrow();
        tracing::warn!(remaining, "producer flush timed out");
        remaining
    }

    /// 新規送信の受け付けを停止し、滞留分を送信してからワーカーを終了する。
    /// タイムアウトまでに確定しなかった結果は `Closed` として失敗になり、戻る時点で
    /// すべての配信結果とコールバックが確定している。
    pub async fn close(&self, timeout: Duration) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let remaining = self.flush(timeout).await;
        self.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = dispatcher {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!(remaining, "producer workers did not finish before close timeout");
                self.shared.abort.cancel();
                let _ = handle.await;
            }
        }
        tracing::info!(remaining, "producer closed");
        remaining
    }

    fn admit(&self, envelope: &MessageEnvelope) -> Result<(), MessagingError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed("producer is closed".to_string()));
        }
        let size = envelope.size_bytes();
        if size > self.shared.max_message_bytes {
            return Err(MessagingError::PermanentSend(format!(
                "message size {size} exceeds max {}",
                self.shared.max_message_bytes
            )));
        }
        let max_pending = self.shared.config.max_pending;
        let mut admitted = false;
        self.shared.pending.send_if_modified(|n| {
            if *n >= max_pending {
                return false;
            }
            *n += 1;
            admitted = true;
            true
        });
        if admitted {
            Ok(())
        } else {
            Err(MessagingError::QueueFull(max_pending))
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        // 投入済みのエンベロープはワーカーが送信し終えてから終了する
        self.shutdown.cancel();
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Submission>,
    shutdown: CancellationToken,
) {
    let abort = shared.abort.clone();
    let mut router = Router {
        shared,
        workers: HashMap::new(),
        tasks: JoinSet::new(),
        partition_counts: HashMap::new(),
    };

    tokio::select! {
        () = router.drain(rx, &shutdown) => {}
        // キューに残った送信は破棄時に Closed として解決される
        () = abort.cancelled() => tracing::warn!("producer dispatcher aborted"),
    }

    router.shutdown().await;
}

struct Router {
    shared: Arc<Shared>,
    workers: HashMap<TopicPartition, mpsc::UnboundedSender<Submission>>,
    tasks: JoinSet<()>,
    partition_counts: HashMap<String, i32>,
}

impl Router {
    async fn drain(&mut self, mut rx: mpsc::UnboundedReceiver<Submission>, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(submission) => self.route(submission).await,
                    None => break,
                },
                () = shutdown.cancelled() => {
                    rx.close();
                    while let Some(submission) = rx.recv().await {
                        self.route(submission).await;
                    }
                    break;
                }
            }
        }
    }

    async fn route(&mut self, submission: Submission) {
        let count = match self.partition_counts.get(&submission.topic) {
            Some(count) => *count,
            None => match self.shared.connection.partition_count(&submission.topic).await {
                Ok(count) => {
                    self.partition_counts
                        .insert(submission.topic.clone(), count);
                    count
                }
                Err(e) => {
                    tracing::error!(topic = %submission.topic, error = %e, "failed to resolve partitions");
                    submission.fail(None, &e);
                    return;
                }
            },
        };

        let partition = self
            .shared
            .partitioner
            .partition(submission.envelope.key.as_deref(), count);
        let tp = TopicPartition::new(submission.topic.clone(), partition);
        let sender = self.workers.entry(tp.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.tasks
                .spawn(partition_worker(self.shared.clone(), tp.clone(), rx));
            tx
        });
        if let Err(mpsc::error::SendError(submission)) = sender.send(submission) {
            submission.fail(
                Some(partition),
                &MessagingError::Closed("partition worker stopped".to_string()),
            );
        }
    }

    async fn shutdown(mut self) {
        // 送信側を閉じるとワーカーはキューを送り切ってから終了する
        self.workers.clear();
        while self.tasks.join_next().await.is_some() {}
        tracing::debug!("producer dispatcher stopped");
    }
}

async fn partition_worker(
    shared: Arc<Shared>,
    tp: TopicPartition,
    rx: mpsc::UnboundedReceiver<Submission>,
) {
    let abort = shared.abort.clone();
    tokio::select! {
        () = run_batches(&shared, &tp, rx) => {}
        // 送信中・滞留中のバッチは破棄時に Closed として解決される
        () = abort.cancelled() => {
            tracing::warn!(topic = %tp.topic, partition = tp.partition, "partition worker aborted");
        }
    }
}

async fn run_batches(
    shared: &Shared,
    tp: &TopicPartition,
    mut rx: mpsc::UnboundedReceiver<Submission>,
) {
    let mut flush_rx = shared.flush_requests.subscribe();
    let linger = Duration::from_millis(shared.config.linger_ms);
    let max_records = shared.config.batch_size.max(1);
    let max_bytes = shared.config.batch_max_bytes;

    while let Some(first) = rx.recv().await {
        // 投入後に flush が要求されていれば linger を待たない
        let mut flushed = *flush_rx.borrow_and_update() > first.flush_generation;
        let mut batch_bytes = first.envelope.size_bytes();
        let mut batch = vec![first];
        let deadline = Instant::now() + linger;

        while batch.len() < max_records && batch_bytes < max_bytes {
            if flushed {
                match rx.try_recv() {
                    Ok(submission) => {
                        batch_bytes += submission.envelope.size_bytes();
                        batch.push(submission);
                        continue;
                    }
                    Err(_) => break,
                }
            }
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(submission) => {
                        batch_bytes += submission.envelope.size_bytes();
                        batch.push(submission);
                    }
                    None => break,
                },
                _ = flush_rx.changed() => flushed = true,
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        send_with_retry(shared, tp, batch).await;
    }
}

async fn send_with_retry(shared: &Shared, tp: &TopicPartition, batch: Vec<Submission>) {
    let mut remaining: VecDeque<Submission> = batch.into();
    let mut attempt: u32 = 0;

    while !remaining.is_empty() {
        let sent = remaining.len();
        let envelopes = remaining.iter().map(|s| s.envelope.clone()).collect();
        let ack = shared
            .connection
            .send_batch(&tp.topic, tp.partition, envelopes)
            .await;

        let acked = ack.offsets.len().min(sent);
        for offset in ack.offsets.into_iter().take(acked) {
            if let Some(submission) = remaining.pop_front() {
                let result = DeliveryResult::success(
                    submission.envelope.clone(),
                    &tp.topic,
                    tp.partition,
                    offset,
                );
                submission.resolve(result);
            }
        }
        tracing::debug!(topic = %tp.topic, partition = tp.partition, sent, acked, "batch sent");

        let error = match ack.error {
            Some(e) => e,
            None if remaining.is_empty() => break,
            None => MessagingError::TransientSend(format!(
                "broker acknowledged {acked} of {sent} messages"
            )),
        };
        if acked > 0 {
            attempt = 0;
        }

        if !error.is_transient() {
            // 恒久的エラーは先頭の未確認エンベロープだけに適用される
            if let Some(submission) = remaining.pop_front() {
                tracing::warn!(topic = %tp.topic, partition = tp.partition, error = %error, "message failed permanently");
                submission.fail(Some(tp.partition), &error);
            }
            continue;
        }

        attempt += 1;
        if !shared.retry.allows_attempt(attempt) {
            tracing::error!(
                topic = %tp.topic,
                partition = tp.partition,
                attempts = attempt,
                failed = remaining.len(),
                error = %error,
                "batch send retries exhausted"
            );
            for submission in remaining.drain(..) {
                submission.fail(Some(tp.partition), &error);
            }
            break;
        }

        let delay = shared.retry.compute_delay(attempt - 1);
        tracing::warn!(
            topic = %tp.topic,
            partition = tp.partition,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying batch send"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn producer_with(broker: Arc<InMemoryBroker>, config: ProducerConfig) -> Producer {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let connection = Arc::new(ConnectionManager::new(broker, retry));
        Producer::new(connection, config, 1_000_000)
    }

    #[test]
    fn test_producer_config_defaults() {
        let cfg: ProducerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.linger_ms, 5);
        assert_eq!(cfg.max_pending, 10_000);
        assert_eq!(cfg.retry.max_attempts, Some(5));
    }

    #[tokio::test]
    async fn test_linger_batches_messages_together() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let config = ProducerConfig {
            linger_ms: 50,
            ..ProducerConfig::default()
        };
        let producer = producer_with(broker.clone(), config);

        let handles: Vec<_> = (0..10)
            .map(|i| producer.send("test", MessageEnvelope::text(&format!("m{i}"))))
            .collect();
        for handle in handles {
            assert!(handle.wait().await.is_success());
        }
        // 10 件が 1 回のバッチ送信にまとまる
        assert_eq!(broker.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_threshold_splits_batches() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let config = ProducerConfig {
            batch_size: 4,
            linger_ms: 10_000,
            ..ProducerConfig::default()
        };
        let producer = producer_with(broker.clone(), config);

        let handles: Vec<_> = (0..8)
            .map(|i| producer.send("test", MessageEnvelope::text(&format!("m{i}"))))
            .collect();
        for handle in handles {
            assert!(handle.wait().await.is_success());
        }
        assert_eq!(broker.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_send_value_encodes_with_codec() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let producer = producer_with(broker.clone(), ProducerConfig::default());
        let handle = producer
            .send_value(
                "test",
                &crate::codec::StringCodec,
                Some(b"k".to_vec()),
                &"hello".to_string(),
            )
            .unwrap();
        let result = handle.wait().await;
        assert!(result.is_success());
        assert_eq!(result.envelope.value, b"hello");
        assert_eq!(result.envelope.key.as_deref(), Some(b"k".as_slice()));
    }

    #[tokio::test]
    async fn test_handle_resolves_even_if_producer_dropped() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let producer = producer_with(broker, ProducerConfig::default());
        let handle = producer.send("test", MessageEnvelope::text("Message 1"));
        drop(producer);
        // ワーカーは投入済みのエンベロープを送り切る
        assert!(handle.wait().await.is_success());
    }
}
