//! Consumer: コミット・オン・サクセスのコンシューマーループ。
//!
//! 状態遷移は `Idle -> Subscribed -> Polling -> (Idle | Stopped)`。
//! パーティションごとに 1 タスクを起動し、パーティション内ではハンドラーをオフセット順に
//! 逐次呼び出す。コミットされるのはハンドラーが成功したレコードの連続した先頭部分だけである。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kafkademo_retry::RetryConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{ConsumedRecord, TopicPartition};
use crate::error::MessagingError;
use crate::handler::RecordHandler;

/// StartOffset はコミット済みオフセットがないパーティションの読み出し開始位置。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// パーティションの先頭から読む
    #[default]
    Earliest,
    /// 購読時点の末尾から読む
    Latest,
    /// コミット済みオフセットからの再開のみ許可する
    Committed,
}

/// HandlerFailurePolicy はハンドラーが失敗を返したときの振る舞い。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum HandlerFailurePolicy {
    /// 同じレコードを再試行する。`max_retries` が None の場合はキャンセルされるまで続ける。
    Retry {
        #[serde(default)]
        max_retries: Option<u32>,
    },
    /// ループを停止してエラーを返す。
    Stop,
}

impl Default for HandlerFailurePolicy {
    fn default() -> Self {
        HandlerFailurePolicy::Retry { max_retries: None }
    }
}

/// ConsumerConfig はコンシューマーの設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// コンシューマーグループ ID
    pub group_id: String,
    /// サブスクライブするトピックのリスト。`subscribe` に空のリストを渡したときに使う。
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub start_offset: StartOffset,
    /// 1 回のポーリングで取得する最大件数
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    /// ポーリングのタイムアウト（ミリ秒）
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub on_handler_failure: HandlerFailurePolicy,
    /// ハンドラー再試行・ポーリング失敗時のバックオフ
    #[serde(default)]
    pub retry: BackoffConfig,
}

fn default_max_poll_records() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl ConsumerConfig {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            topics: Vec::new(),
            start_offset: StartOffset::default(),
            max_poll_records: default_max_poll_records(),
            poll_timeout_ms: default_poll_timeout_ms(),
            on_handler_failure: HandlerFailurePolicy::default(),
            retry: BackoffConfig::default(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// ConsumerState はコンシューマーのライフサイクル状態。`Stopped` は終端。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribed,
    Polling,
    Stopped,
}

/// PartitionCursor はパーティションごとの読み出し位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCursor {
    /// コミット済みの最後の処理済みオフセット
    pub committed: Option<i64>,
    /// 次に取得するオフセット
    pub position: i64,
}

type Cursors = Arc<Mutex<HashMap<TopicPartition, PartitionCursor>>>;

/// Consumer は購読したパーティションをポーリングし、ハンドラーが成功したレコードだけを
/// コミットするコンシューマー。
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    cursors: Cursors,
    shutdown: CancellationToken,
}

impl Consumer {
    /// コンシューマーを生成する。I/O は行わない。
    pub fn new(connection: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            connection,
            config,
            state,
            cursors: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// パーティションのコミット済みオフセットを返す。
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        lock(&self.cursors).get(tp).and_then(|c| c.committed)
    }

    /// 全パーティションのカーソルのスナップショットを返す。
    pub fn cursors(&self) -> HashMap<TopicPartition, PartitionCursor> {
        lock(&self.cursors).clone()
    }

    /// トピックを購読し、割り当てられたパーティションのカーソルを登録する。
    /// `topics` が空なら設定の `topics` を使う。
    /// コミット済みオフセットがあればその次から、なければ `start_offset` に従って開始する。
    pub async fn subscribe(&self, topics: &[String]) -> Result<Vec<TopicPartition>, MessagingError> {
        self.expect_state(ConsumerState::Idle)?;
        let topics = if topics.is_empty() {
            self.config.topics.as_slice()
        } else {
            topics
        };
        if topics.is_empty() {
            return Err(MessagingError::Configuration(
                "at least one topic must be specified".to_string(),
            ));
        }

        let group_id = &self.config.group_id;
        let assigned = self.connection.subscribe(group_id, topics).await?;
        let mut cursors = HashMap::with_capacity(assigned.len());
        for tp in &assigned {
            let committed = self.connection.committed_offset(group_id, tp).await?;
            let position = match (committed, self.config.start_offset) {
                (Some(offset), _) => offset + 1,
                (None, StartOffset::Earliest) => self.connection.offset_bounds(tp).await?.0,
                (None, StartOffset::Latest) => self.connection.offset_bounds(tp).await?.1,
                (None, StartOffset::Committed) => {
                    return Err(MessagingError::InvalidState(format!(
                        "no committed offset for {tp} in group {group_id}"
                    )));
                }
            };
            tracing::debug!(topic = %tp.topic, partition = tp.partition, position, "cursor registered");
            cursors.insert(tp.clone(), PartitionCursor { committed, position });
        }

        *lock(&self.cursors) = cursors;
        self.state.send_replace(ConsumerState::Subscribed);
        tracing::info!(group_id = %group_id, partitions = assigned.len(), "subscribed");
        Ok(assigned)
    }

    /// 購読中の全パーティションを処理する。
    ///
    /// キャンセルされると実行中のハンドラー呼び出しの完了を待ち、処理済みの先頭部分を
    /// コミットしてから `Ok(())` を返す（状態は Stopped）。ハンドラー失敗でループを止めた場合は
    /// `MessagingError::Handler` を返し、状態は Idle に戻る。
    pub async fn run<H>(&self, handler: H, cancel: CancellationToken) -> Result<(), MessagingError>
    where
        H: RecordHandler + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(MessagingError::InvalidState(
                "consumer has been cancelled".to_string(),
            ));
        }
        self.expect_state(ConsumerState::Subscribed)?;
        self.state.send_replace(ConsumerState::Polling);

        // cancel() と内部の失敗で止まるトークン。呼び出し側のトークンはワーカーが直接見る。
        let run_token = self.shutdown.child_token();

        let handler: Arc<dyn RecordHandler> = Arc::new(handler);
        let retry = self.config.retry.to_retry_config();
        let partitions: Vec<(TopicPartition, i64)> = lock(&self.cursors)
            .iter()
            .map(|(tp, cursor)| (tp.clone(), cursor.position))
            .collect();

        let mut tasks = JoinSet::new();
        for (tp, position) in partitions {
            let worker = PartitionWorker {
                connection: self.connection.clone(),
                group_id: self.config.group_id.clone(),
                tp,
                position,
                handler: handler.clone(),
                cursors: self.cursors.clone(),
                max_poll_records: self.config.max_poll_records.max(1),
                poll_timeout: self.config.poll_timeout(),
                policy: self.config.on_handler_failure,
                retry: retry.clone(),
                token: run_token.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(worker.run());
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(MessagingError::Handler(format!("partition task aborted: {e}")))
            });
            if let Err(e) = outcome {
                // 他のパーティションも止める
                run_token.cancel();
                failure.get_or_insert(e);
            }
        }
        run_token.cancel();

        match failure {
            Some(e) => {
                tracing::error!(error = %e, "consumer loop stopped on failure");
                self.state.send_replace(ConsumerState::Idle);
                Err(e)
            }
            None => {
                tracing::info!("consumer loop stopped");
                self.state.send_replace(ConsumerState::Stopped);
                Ok(())
            }
        }
    }

    /// ループを停止する。実行中のハンドラー呼び出しは完了してから停止する。
    pub fn cancel(&self) {
        self.shutdown.cancel();
        // Polling 中は run が Stopped に遷移させる
        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Polling || *state == ConsumerState::Stopped {
                return false;
            }
            *state = ConsumerState::Stopped;
            true
        });
    }

    fn expect_state(&self, expected: ConsumerState) -> Result<(), MessagingError> {
        let current = self.state();
        if current == expected {
            Ok(())
        } else {
            Err(MessagingError::InvalidState(format!(
                "consumer is {current:?}, expected {expected:?}"
            )))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PartitionWorker {
    connection: Arc<ConnectionManager>,
    group_id: String,
    tp: TopicPartition,
    position: i64,
    handler: Arc<dyn RecordHandler>,
    cursors: Cursors,
    max_poll_records: usize,
    poll_timeout: Duration,
    policy: HandlerFailurePolicy,
    retry: RetryConfig,
    token: CancellationToken,
    cancel: CancellationToken,
}

/// レコード処理の結果。
enum Processed {
    Done,
    Cancelled,
}

impl PartitionWorker {
    async fn run(mut self) -> Result<(), MessagingError> {
        let mut uncommitted: Option<i64> = None;
        let mut poll_failures: u32 = 0;

        let outcome = loop {
            if self.is_stopping() {
                break Ok(());
            }
            let polled = tokio::select! {
                () = self.stopping() => break Ok(()),
                polled = self.connection.poll(
                    &self.tp,
                    self.position,
                    self.max_poll_records,
                    self.poll_timeout,
                ) => polled,
            };
            let records = match polled {
                Ok(records) => {
                    poll_failures = 0;
                    records
                }
                Err(e) => {
                    let delay = self.retry.compute_delay(poll_failures);
                    poll_failures = poll_failures.saturating_add(1);
                    tracing::warn!(
                        topic = %self.tp.topic,
                        partition = self.tp.partition,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "poll failed"
                    );
                    if !self.pause(delay).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            let mut failure = None;
            for record in records {
                if self.is_stopping() {
                    break;
                }
                match self.process(&record).await {
                    Ok(Processed::Done) => {
                        uncommitted = Some(record.offset);
                        self.position = record.offset + 1;
                    }
                    Ok(Processed::Cancelled) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            self.update_position();
            self.commit(&mut uncommitted).await;

            if let Some(e) = failure {
                break Err(e);
            }
        };

        // 失敗時の再コミットを終了前にもう一度試みる
        self.commit(&mut uncommitted).await;
        outcome
    }

    async fn process(&self, record: &ConsumedRecord) -> Result<Processed, MessagingError> {
        let mut failures: u32 = 0;
        loop {
            let err = match self.handler.handle(record).await {
                Ok(()) => return Ok(Processed::Done),
                Err(e) => e,
            };
            failures += 1;

            let exhausted = match self.policy {
                HandlerFailurePolicy::Stop => true,
                HandlerFailurePolicy::Retry { max_retries } => {
                    max_retries.is_some_and(|max| failures > max)
                }
            };
            if exhausted {
                tracing::error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempts = failures,
                    error = %err,
                    "handler failed"
                );
                return Err(MessagingError::Handler(format!(
                    "{} offset {}: {err}",
                    self.tp, record.offset
                )));
            }

            let delay = self.retry.compute_delay(failures - 1);
            tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "handler failed, retrying record"
            );
            if !self.pause(delay).await {
                return Ok(Processed::Cancelled);
            }
        }
    }

    fn is_stopping(&self) -> bool {
        self.token.is_cancelled() || self.cancel.is_cancelled()
    }

    async fn stopping(&self) {
        tokio::select! {
            () = self.token.cancelled() => {}
            () = self.cancel.cancelled() => {}
        }
    }

    /// キャンセルされずに待ち終えた場合は true。
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.stopping() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn commit(&self, uncommitted: &mut Option<i64>) {
        let Some(offset) = *uncommitted else {
            return;
        };
        match self
            .connection
            .commit_offset(&self.group_id, &self.tp, offset)
            .await
        {
            Ok(()) => {
                *uncommitted = None;
                if let Some(cursor) = lock(&self.cursors).get_mut(&self.tp) {
                    cursor.committed = Some(offset);
                }
                tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, offset, "offset committed");
            }
            Err(e) => {
                tracing::warn!(
                    topic = %self.tp.topic,
                    partition = self.tp.partition,
                    offset,
                    error = %e,
                    "offset commit failed"
                );
            }
        }
    }

    fn update_position(&self) {
        if let Some(cursor) = lock(&self.cursors).get_mut(&self.tp) {
            cursor.position = self.position;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_defaults() {
        let cfg: ConsumerConfig = serde_json::from_str(r#"{"group_id": "test-group"}"#).unwrap();
        assert_eq!(cfg.group_id, "test-group");
        assert!(cfg.topics.is_empty());
        assert_eq!(cfg.start_offset, StartOffset::Earliest);
        assert_eq!(cfg.max_poll_records, 500);
        assert_eq!(
            cfg.on_handler_failure,
            HandlerFailurePolicy::Retry { max_retries: None }
        );
    }

    #[test]
    fn test_handler_failure_policy_yaml() {
        let yaml = r#"
group_id: test-group
topics: ["test"]
start_offset: latest
on_handler_failure:
  policy: retry
  max_retries: 3
"#;
        let cfg: ConsumerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.start_offset, StartOffset::Latest);
        assert_eq!(
            cfg.on_handler_failure,
            HandlerFailurePolicy::Retry {
                max_retries: Some(3)
            }
        );

        let stop: HandlerFailurePolicy = serde_yaml::from_str("policy: stop").unwrap();
        assert_eq!(stop, HandlerFailurePolicy::Stop);
    }
}
