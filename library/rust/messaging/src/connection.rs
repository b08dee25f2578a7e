//! ConnectionManager: ブローカー接続の所有者。
//!
//! 接続状態（Disconnected / Connecting / Ready / Failed）を一元管理し、プロデューサーと
//! コンシューマーはこの型を経由してのみトランスポートを利用する。
//! 接続は初回利用時に遅延確立され、接続系エラーを検知すると次回の操作で再接続する。

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use kafkademo_retry::{with_retry_if, RetryConfig};
use tokio::sync::{watch, Mutex};

use crate::envelope::{ConsumedRecord, MessageEnvelope, TopicPartition};
use crate::error::MessagingError;
use crate::transport::{BatchAck, BrokerTransport};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed(String),
}

/// HealthStatus はブローカー接続のヘルス状態を表す。
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

type StateListener = Box<dyn Fn(&ConnectionState) + Send + Sync>;

/// ConnectionManager はブローカー接続のライフサイクルを管理する。
///
/// 初回利用時に遅延接続し、接続エラー後はバックオフ付きで再接続する。
/// プロデューサーとコンシューマーは同じインスタンスを共有する。
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    backoff: RetryConfig,
    state: watch::Sender<ConnectionState>,
    listeners: RwLock<Vec<StateListener>>,
    // 接続試行の直列化
    connect_lock: Mutex<()>,
    // バッチ書き込みの直列化（呼び出し側に部分的な書き込みを見せない）
    write_lock: Mutex<()>,
}

impl ConnectionManager {
    /// 新しい ConnectionManager を生成する。I/O は行わない。
    pub fn new(transport: Arc<dyn BrokerTransport>, backoff: RetryConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            backoff,
            state,
            listeners: RwLock::new(Vec::new()),
            connect_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// 現在の接続状態を返す。
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// 接続状態の変化を監視するレシーバーを返す。
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 接続状態が変化するたびに呼ばれるコールバックを登録する。
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Ready)
    }

    pub fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Ready => HealthStatus::Healthy,
            ConnectionState::Failed(reason) => HealthStatus::Unhealthy(reason),
            ConnectionState::Connecting => HealthStatus::Unhealthy("connecting".to_string()),
            ConnectionState::Disconnected => HealthStatus::Unhealthy("not connected".to_string()),
        }
    }

    /// ブローカーへ接続する。失敗した試行はバックオフ付きで再試行し、
    /// 試行回数を使い切った場合は `MessagingError::Connection` を返す。
    pub async fn connect(&self) -> Result<(), MessagingError> {
        if self.is_ready() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        // 待機中に別のタスクが接続を確立している場合がある
        if self.is_ready() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let transport = &self.transport;
        let result = with_retry_if(
            &self.backoff,
            move || transport.connect(),
            MessagingError::is_transient,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!("broker connection established");
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                let attempts = e.attempts();
                let err = match e.into_inner() {
                    err @ MessagingError::Connection(_) => err,
                    other => MessagingError::Connection(other.to_string()),
                };
                tracing::error!(attempts, error = %err, "broker connection failed");
                self.set_state(ConnectionState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn partition_count(&self, topic: &str) -> Result<i32, MessagingError> {
        self.connect().await?;
        let result = self.transport.partition_count(topic).await;
        self.observe(result)
    }

    pub async fn send_batch(
        &self,
        topic: &str,
        partition: i32,
        batch: Vec<Arc<MessageEnvelope>>,
    ) -> BatchAck {
        if let Err(e) = self.connect().await {
            return BatchAck::failed(e);
        }
        let ack = {
            let _write = self.write_lock.lock().await;
            self.transport.send_batch(topic, partition, batch).await
        };
        if let Some(e) = &ack.error {
            self.note_failure(e);
        }
        ack
    }

    pub async fn subscribe(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Vec<TopicPartition>, MessagingError> {
        self.connect().await?;
        let result = self.transport.subscribe(group_id, topics).await;
        self.observe(result)
    }

    pub async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(i64, i64), MessagingError> {
        self.connect().await?;
        let result = self.transport.offset_bounds(tp).await;
        self.observe(result)
    }

    pub async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, MessagingError> {
        self.connect().await?;
        let result = self.transport.committed_offset(group_id, tp).await;
        self.observe(result)
    }

    pub async fn poll(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, MessagingError> {
        self.connect().await?;
        let result = self
            .transport
            .poll(tp, from_offset, max_records, timeout)
            .await;
        self.observe(result)
    }

    pub async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), MessagingError> {
        self.connect().await?;
        let result = self.transport.commit_offset(group_id, tp, offset).await;
        self.observe(result)
    }

    fn observe<T>(&self, result: Result<T, MessagingError>) -> Result<T, MessagingError> {
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    fn note_failure(&self, err: &MessagingError) {
        if err.is_connection_error() && self.is_ready() {
            tracing::warn!(error = %err, "broker connection lost, reconnecting on next use");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous == next {
            return;
        }
        tracing::debug!(from = ?previous, to = ?next, "connection state changed");
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&next);
        }
    }
}
