//! ペイロードのエンコード・デコード規約。
//!
//! プロデューサー・コンシューマーごとに差し替え可能で、既定はプレーンテキスト（UTF-8）。

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// Codec はアプリケーションの値とワイヤ上のバイト列を相互変換する。
pub trait Codec: Send + Sync + 'static {
    type Value: Send + 'static;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, MessagingError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, MessagingError>;
}

/// UTF-8 テキストのコーデック。
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Value = String;

    fn encode(&self, value: &String) -> Result<Vec<u8>, MessagingError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, MessagingError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| MessagingError::Decode(e.to_string()))
    }
}

/// バイト列をそのまま通すコーデック。
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Vec<u8>;

    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, MessagingError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, MessagingError> {
        Ok(bytes.to_vec())
    }
}

/// serde_json による構造化コーデック。
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, MessagingError> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::Decode(e.to_string()))
    }
}

/// Encoding は設定ファイルから文字列値のエンコード方式を選ぶための列挙。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// プレーンテキスト
    #[default]
    Text,
    /// JSON 文字列リテラル
    Json,
}

impl Encoding {
    /// 文字列値用のコーデックを返す。
    pub fn string_codec(self) -> Box<dyn Codec<Value = String>> {
        match self {
            Encoding::Text => Box::new(StringCodec),
            Encoding::Json => Box::new(JsonCodec::<String>::new()),
        }
    }
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    type Value = C::Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, MessagingError> {
        (**self).encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, MessagingError> {
        (**self).decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        amount: u64,
    }

    #[test]
    fn test_string_codec_roundtrip() {
        let codec = StringCodec;
        let bytes = codec.encode(&"Message 1".to_string()).unwrap();
        assert_eq!(bytes, b"Message 1");
        assert_eq!(codec.decode(&bytes).unwrap(), "Message 1");
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        let err = StringCodec.decode(&[0xc3, 0x28]).unwrap_err();
        assert!(matches!(err, MessagingError::Decode(_)));
    }

    #[test]
    fn test_bytes_codec_passthrough() {
        let raw = vec![0u8, 1, 2, 255];
        assert_eq!(BytesCodec.decode(&BytesCodec.encode(&raw).unwrap()).unwrap(), raw);
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec::<OrderCreated>::new();
        let value = OrderCreated {
            order_id: "ord-001".to_string(),
            amount: 100,
        };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec::<OrderCreated>::new();
        let err = codec.decode(b"{\"order_id\": 1}").unwrap_err();
        assert!(matches!(err, MessagingError::Decode(_)));
    }

    #[test]
    fn test_encoding_selection() {
        let text = Encoding::Text.string_codec();
        assert_eq!(text.encode(&"hi".to_string()).unwrap(), b"hi");

        let json = Encoding::Json.string_codec();
        assert_eq!(json.encode(&"hi".to_string()).unwrap(), b"\"hi\"");
        assert_eq!(json.decode(b"\"hi\"").unwrap(), "hi");
    }

    #[test]
    fn test_encoding_deserialize() {
        let enc: Encoding = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(enc, Encoding::Json);
        assert_eq!(Encoding::default(), Encoding::Text);
    }
}
