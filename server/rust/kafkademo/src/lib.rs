//! kafkademo: メッセージング抽象化を使った送受信デモアプリケーション。

pub mod config;
pub mod demo;
pub mod logging;
