use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MessagingError;

/// MessageEnvelope はキー・値・ヘッダー・タイムスタンプをまとめたワイヤ上のメッセージ。
/// プロデューサーに渡された時点で `Arc` に包まれ、以降は変更されない。
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// パーティションキー（キーなしの場合はラウンドロビンで振り分ける）
    pub key: Option<Vec<u8>>,
    /// ペイロード
    pub value: Vec<u8>,
    /// 順序付きヘッダー
    pub headers: Vec<(String, Vec<u8>)>,
    /// 生成日時
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// 値だけを持つエンベロープを生成する。
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// UTF-8 テキストの値で生成する。
    pub fn text(value: &str) -> Self {
        Self::new(value.as_bytes())
    }

    /// JSON ペイロードで生成する。
    pub fn json<T: Serialize>(payload: &T) -> Result<Self, MessagingError> {
        Ok(Self::new(serde_json::to_vec(payload)?))
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 名前が一致する最初のヘッダー値を返す。
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// キー・値・ヘッダーを合計したおおよそのサイズ（バイト）。
    /// バッチ閾値と最大メッセージサイズの判定に使う。
    pub fn size_bytes(&self) -> usize {
        let key = self.key.as_ref().map_or(0, Vec::len);
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        key + self.value.len() + headers
    }
}

/// TopicPartition はトピックとパーティション番号の組。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success,
    Failed(String),
}

/// DeliveryResult は送信したエンベロープ 1 件ごとにちょうど 1 回生成される配信結果。
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub envelope: Arc<MessageEnvelope>,
    pub topic: String,
    /// 割り当てられたパーティション（割り当て前に失敗した場合は None）
    pub partition: Option<i32>,
    /// ブローカーが付与したオフセット（成功時のみ）
    pub offset: Option<i64>,
    pub outcome: DeliveryOutcome,
}

impl DeliveryResult {
    pub(crate) fn success(
        envelope: Arc<MessageEnvelope>,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            envelope,
            topic: topic.to_string(),
            partition: Some(partition),
            offset: Some(offset),
            outcome: DeliveryOutcome::Success,
        }
    }

    pub(crate) fn failed(
        envelope: Arc<MessageEnvelope>,
        topic: &str,
        partition: Option<i32>,
        reason: &MessagingError,
    ) -> Self {
        Self {
            envelope,
            topic: topic.to_string(),
            partition,
            offset: None,
            outcome: DeliveryOutcome::Failed(reason.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DeliveryOutcome::Success
    }
}

/// ConsumedRecord はブローカーから受信したメッセージを表す。
/// offset はパーティション内で単調増加し、コミット位置を一意に特定する。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub envelope: Arc<MessageEnvelope>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// 値を UTF-8 テキストとして参照する。
    pub fn value_str(&self) -> Result<&str, MessagingError> {
        std::str::from_utf8(&self.envelope.value).map_err(|e| MessagingError::Decode(e.to_string()))
    }

    /// ペイロードを JSON としてデシリアライズする。
    pub fn deserialize_json<T: for<'de> serde::Deserialize<'de>>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.envelope.value).map_err(|e| MessagingError::Decode(e.to_string()))
    }
}
