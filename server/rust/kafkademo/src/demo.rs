//! 送受信デモ: "Message 1".."Message N" を送信し、受信したメッセージをログ出力する。

use std::time::Duration;

use kafkademo_messaging::{
    decoding, CancellationToken, Codec, ConsumedRecord, Consumer, DeliveryOutcome, DeliveryResult,
    Encoding, MessagingError, Producer,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// テキストのメッセージを `count` 件送信し、すべての配信結果を返す。
pub async fn produce_messages(producer: &Producer, topic: &str, count: usize) -> Vec<DeliveryResult> {
    produce_encoded(producer, topic, count, Encoding::Text, FLUSH_TIMEOUT).await
}

/// 指定したエンコーディングでメッセージを送信し、flush してから配信結果を集める。
pub async fn produce_encoded(
    producer: &Producer,
    topic: &str,
    count: usize,
    encoding: Encoding,
    flush_timeout: Duration,
) -> Vec<DeliveryResult> {
    let codec = encoding.string_codec();
    let mut handles = Vec::with_capacity(count);
    for i in 1..=count {
        let value = format!("Message {i}");
        match producer.send_value(topic, &codec, None, &value) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "failed to encode message"),
        }
    }

    let remaining = producer.flush(flush_timeout).await;
    if remaining > 0 {
        tracing::warn!(remaining, "messages still pending after flush");
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle.wait().await;
        let value = codec
            .decode(&result.envelope.value)
            .unwrap_or_else(|_| String::from_utf8_lossy(&result.envelope.value).into_owned());
        match &result.outcome {
            DeliveryOutcome::Success => tracing::info!(
                topic = %result.topic,
                partition = result.partition,
                offset = result.offset,
                "Produced: {value}"
            ),
            DeliveryOutcome::Failed(reason) => tracing::warn!(
                topic = %result.topic,
                reason = %reason,
                "Delivery failed: {value}"
            ),
        }
        results.push(result);
    }
    results
}

/// トピックを購読し、キャンセルされるまで受信したテキストメッセージをログ出力する。
pub async fn consume_messages(
    consumer: &Consumer,
    topic: &str,
    cancel: CancellationToken,
) -> Result<(), MessagingError> {
    consume_decoded(consumer, &[topic.to_string()], Encoding::Text, cancel).await
}

/// `topics` が空ならコンシューマー設定の `topics` を購読する。
pub async fn consume_decoded(
    consumer: &Consumer,
    topics: &[String],
    encoding: Encoding,
    cancel: CancellationToken,
) -> Result<(), MessagingError> {
    consumer.subscribe(topics).await?;
    let handler = decoding(
        encoding.string_codec(),
        |record: ConsumedRecord, value: Result<String, MessagingError>| async move {
            match value {
                Ok(value) => {
                    tracing::info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Consumed: {value}"
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            }
        },
    );
    consumer.run(handler, cancel).await
}
