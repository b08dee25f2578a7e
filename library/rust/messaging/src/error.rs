/// MessagingError はメッセージング操作に関するエラーを表す。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessagingError {
    /// ブローカーに到達できない・認証に失敗した。バックオフ付きで再接続される。
    #[error("connection error: {0}")]
    Connection(String),

    /// タイムアウトやブローカー不在など、再送で回復しうる送信エラー。
    #[error("transient send error: {0}")]
    TransientSend(String),

    /// メッセージサイズ超過など、再送しても回復しない送信エラー。
    #[error("permanent send error: {0}")]
    PermanentSend(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler failure: {0}")]
    Handler(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("producer queue full: {0} messages pending")]
    QueueFull(usize),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("closed: {0}")]
    Closed(String),
}

impl MessagingError {
    /// 再試行で回復しうるエラーかどうかを返す。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::TransientSend(_)
                | MessagingError::Timeout(_)
        )
    }

    /// 接続の張り直しが必要なエラーかどうかを返す。
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MessagingError::Connection(_))
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        MessagingError::Serialization(e.to_string())
    }
}
