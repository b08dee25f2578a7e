//! 構造化ログの初期化。
//! tracing クレートを使用し、JSON またはテキスト形式の構造化ログを出力する。

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 環境ごとの既定ログレベルを返す。
///
/// - dev: debug
/// - staging: info
/// - それ以外: warn
pub fn level_for(env: &str) -> &'static str {
    match env {
        "dev" => "debug",
        "staging" => "info",
        _ => "warn",
    }
}

/// init_logger は tracing-subscriber を初期化する。
///
/// `RUST_LOG` が設定されていればそれを優先し、次に `level`、最後に環境ごとの既定レベルを使う。
/// format が "text" の場合はプレーンテキスト出力、それ以外は JSON 出力。
pub fn init_logger(env: &str, format: &str, level: Option<&str>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or_else(|| level_for(env))));

    let registry = tracing_subscriber::registry().with(filter);

    if format == "text" {
        registry.with(fmt::layer().with_target(true)).try_init()
    } else {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_environment() {
        assert_eq!(level_for("dev"), "debug");
        assert_eq!(level_for("staging"), "info");
        assert_eq!(level_for("prod"), "warn");
        assert_eq!(level_for(""), "warn");
    }

    #[test]
    fn test_init_logger_twice_returns_error() {
        let _ = init_logger("dev", "json", None);
        // グローバルサブスクライバーは一度しか設定できない
        assert!(init_logger("dev", "text", Some("info")).is_err());
    }
}
