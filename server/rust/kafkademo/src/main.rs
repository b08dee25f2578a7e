use anyhow::Context;
use tracing::{error, info};

use kafkademo::config::Config;
use kafkademo::{demo, logging};
use kafkademo_messaging::{CancellationToken, MessagingFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let cfg = Config::load(&config_path)?;

    // Logger
    logging::init_logger(
        &cfg.app.environment,
        &cfg.logging.format,
        cfg.logging.level.as_deref(),
    )
    .context("failed to init logger")?;

    info!(
        app_name = %cfg.app.name,
        environment = %cfg.app.environment,
        brokers = %cfg.messaging.bootstrap_servers(),
        transport = ?cfg.messaging.transport,
        tls = cfg.messaging.uses_tls(),
        "starting kafkademo"
    );

    if let Err(e) = run(cfg).await {
        error!(error = %e, "An error occurred");
        return Err(e);
    }
    Ok(())
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let factory = MessagingFactory::from_config(cfg.messaging.clone())?;

    // Produce
    let producer = factory.create_producer(cfg.producer.clone());
    let results = demo::produce_encoded(
        &producer,
        &cfg.demo.topic,
        cfg.demo.message_count,
        cfg.demo.encoding,
        cfg.demo.flush_timeout(),
    )
    .await;
    let failed = results.iter().filter(|r| !r.is_success()).count();
    info!(
        delivered = results.len() - failed,
        failed,
        "message production finished"
    );
    producer.close(cfg.demo.flush_timeout()).await;

    // Consume until Ctrl-C
    let consumer = factory.create_consumer(cfg.consumer.clone());
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    // 購読先は consumer.topics
    demo::consume_decoded(&consumer, &[], cfg.demo.encoding, cancel).await?;
    info!("kafkademo stopped");
    Ok(())
}
