//! BrokerTransport: ブローカークライアントが提供する機能の抽象。
//!
//! コネクションマネージャーはこのトレイト越しにのみブローカーと通信する。
//! 本番では rdkafka 実装、テストでは InMemoryBroker またはモックに差し替える。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{ConsumedRecord, MessageEnvelope, TopicPartition};
use crate::error::MessagingError;

/// BatchAck はバッチ送信の応答。
///
/// `offsets` は先頭から順に確認応答されたエンベロープへ割り当てられたオフセット。
/// `error` が設定されている場合、それは最初の未確認エンベロープ（`offsets.len()` 番目）に
/// 対するエラーであり、それ以降のエンベロープはブローカーに書き込まれていない。
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAck {
    pub offsets: Vec<i64>,
    pub error: Option<MessagingError>,
}

impl BatchAck {
    /// 全件が確認応答された応答を生成する。
    pub fn complete(offsets: Vec<i64>) -> Self {
        Self {
            offsets,
            error: None,
        }
    }

    /// 1 件も書き込まれなかった応答を生成する。
    pub fn failed(error: MessagingError) -> Self {
        Self {
            offsets: Vec::new(),
            error: Some(error),
        }
    }

    pub fn partial(offsets: Vec<i64>, error: MessagingError) -> Self {
        Self {
            offsets,
            error: Some(error),
        }
    }
}

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// ブローカーへ接続する（疎通確認を含む）。
    async fn connect(&self) -> Result<(), MessagingError>;

    /// トピックのパーティション数を返す。
    async fn partition_count(&self, topic: &str) -> Result<i32, MessagingError>;

    /// 同一パーティション宛てのエンベロープをまとめて書き込む。
    async fn send_batch(
        &self,
        topic: &str,
        partition: i32,
        batch: Vec<Arc<MessageEnvelope>>,
    ) -> BatchAck;

    /// コンシューマーグループとしてトピックを購読し、割り当てられたパーティションを返す。
    async fn subscribe(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Vec<TopicPartition>, MessagingError>;

    /// パーティションの (最古オフセット, 次に書き込まれるオフセット) を返す。
    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(i64, i64), MessagingError>;

    /// グループが最後に処理済みとしてコミットしたオフセットを返す。
    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, MessagingError>;

    /// `from_offset` 以降のレコードを最大 `max_records` 件取得する。
    /// レコードがなければ `timeout` まで待ってから空のベクタを返す。
    async fn poll(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, MessagingError>;

    /// `offset` まで処理済みであることをコミットする。
    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), MessagingError>;
}
