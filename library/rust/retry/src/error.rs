use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("すべてのリトライが失敗しました ({attempts} 回): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: E },
    #[error("リトライ不可能なエラーで中断しました ({attempts} 回目): {error}")]
    NonRetryable { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// 最後に発生したエラーを取り出す。
    pub fn into_inner(self) -> E {
        match self {
            RetryError::ExhaustedRetries { last_error, .. } => last_error,
            RetryError::NonRetryable { error, .. } => error,
        }
    }

    /// 実行した試行回数を返す。
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::ExhaustedRetries { attempts, .. }
            | RetryError::NonRetryable { attempts, .. } => *attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_inner_returns_last_error() {
        let err: RetryError<String> = RetryError::ExhaustedRetries {
            attempts: 3,
            last_error: "broker unreachable".to_string(),
        };
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_inner(), "broker unreachable");
    }

    #[test]
    fn test_non_retryable_display() {
        let err: RetryError<String> = RetryError::NonRetryable {
            attempts: 1,
            error: "message too large".to_string(),
        };
        assert!(err.to_string().contains("message too large"));
    }
}
