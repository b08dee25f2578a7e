//! kafkademo-retry: 指数バックオフ付きリトライライブラリ。
//!
//! ブローカー接続やバッチ送信など、一時的な失敗が起こりうる操作の再試行に使用する。

pub mod error;
pub mod policy;
pub mod retry;

pub use error::RetryError;
pub use policy::RetryConfig;
pub use retry::{with_retry, with_retry_if};
