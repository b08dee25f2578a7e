use std::future::Future;

use async_trait::async_trait;

use crate::codec::Codec;
use crate::envelope::ConsumedRecord;
use crate::error::MessagingError;

/// RecordHandler は受信レコードを処理するアプリケーション側のハンドラー。
/// `Ok(())` を返したレコードだけがコミット対象になる。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), MessagingError>;
}

/// FnHandler はクロージャを RecordHandler として扱うアダプター。
pub struct FnHandler<F> {
    f: F,
}

/// 非同期クロージャからハンドラーを作る。
///
/// ```ignore
/// let handler = handler_fn(|record: ConsumedRecord| async move {
///     tracing::info!(offset = record.offset, "received");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumedRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(ConsumedRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), MessagingError> {
        (self.f)(record.clone()).await
    }
}

/// DecodingHandler はレコードの値をコーデックでデコードしてからクロージャに渡す。
///
/// デコード失敗はループを止めずに `Err(MessagingError::Decode)` としてクロージャへ渡る。
/// クロージャがその失敗をそのまま返せばレコードは失敗扱いになり、コミットされない。
pub struct DecodingHandler<C, F> {
    codec: C,
    f: F,
}

pub fn decoding<C, F, Fut>(codec: C, f: F) -> DecodingHandler<C, F>
where
    C: Codec,
    F: Fn(ConsumedRecord, Result<C::Value, MessagingError>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    DecodingHandler { codec, f }
}

#[async_trait]
impl<C, F, Fut> RecordHandler for DecodingHandler<C, F>
where
    C: Codec,
    F: Fn(ConsumedRecord, Result<C::Value, MessagingError>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), MessagingError> {
        let decoded = self.codec.decode(&record.envelope.value);
        if let Err(e) = &decoded {
            tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "failed to decode record"
            );
        }
        (self.f)(record.clone(), decoded).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::{JsonCodec, StringCodec};
    use crate::envelope::MessageEnvelope;

    fn record(value: &[u8]) -> ConsumedRecord {
        ConsumedRecord {
            envelope: Arc::new(MessageEnvelope::new(value.to_vec())),
            topic: "test".to_string(),
            partition: 0,
            offset: 7,
        }
    }

    #[tokio::test]
    async fn test_handler_fn_passes_record() {
        let handler = handler_fn(|record: ConsumedRecord| async move {
            if record.offset == 7 {
                Ok(())
            } else {
                Err(MessagingError::Handler("unexpected offset".to_string()))
            }
        });
        assert!(handler.handle(&record(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_decoding_handler_decodes_value() {
        let handler = decoding(StringCodec, |_record, value: Result<String, MessagingError>| async move {
            assert_eq!(value.unwrap(), "Message 1");
            Ok(())
        });
        assert!(handler.handle(&record(b"Message 1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_decoding_handler_reports_decode_error() {
        let handler = decoding(
            JsonCodec::<serde_json::Value>::new(),
            |_record, value: Result<serde_json::Value, MessagingError>| async move { value.map(|_| ()) },
        );
        let err = handler.handle(&record(b"{not json")).await.unwrap_err();
        assert!(matches!(err, MessagingError::Decode(_)));
    }

    #[tokio::test]
    async fn test_mock_record_handler() {
        let mut mock = MockRecordHandler::new();
        mock.expect_handle()
            .withf(|record| record.offset == 7)
            .times(1)
            .returning(|_| Ok(()));
        assert!(mock.handle(&record(b"x")).await.is_ok());
    }
}
