use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use herald_common::config::AppConfig;
use herald_common::redis_pool;
use herald_common::types::{Channel, NotificationRequest, validate_request};
use herald_notifier::DeliveryCoordinator;
use herald_notifier::sink::{LogSink, RedisStreamSink};
use herald_notifier::transport::{EmailTransport, SmsTransport, TelegramTransport};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    for channel in Channel::ALL {
        if !config.channel_enabled(channel) {
            tracing::info!(%channel, "Channel disabled, no credentials configured");
        }
    }

    let mut builder = DeliveryCoordinator::builder(config.dispatch.clone()).sink(Arc::new(LogSink));

    if let Some(telegram) = &config.telegram {
        builder = builder.transport(Arc::new(TelegramTransport::new(telegram)));
    }
    if let Some(smtp) = config.smtp.clone() {
        builder = builder.transport(Arc::new(EmailTransport::new(smtp)?));
    }
    if let Some(smpp) = config.smpp.clone() {
        builder = builder.transport(Arc::new(SmsTransport::new(smpp)));
    }

    if let Some(redis_url) = &config.redis_url {
        let conn = redis_pool::create_redis_pool(redis_url).await?;
        builder = builder.sink(Arc::new(RedisStreamSink::new(conn, &config.event_stream_key)));
        tracing::info!(stream = %config.event_stream_key, "Publishing delivery events to Redis");
    }

    let coordinator = builder.build();
    if coordinator.channels().is_empty() {
        anyhow::bail!("no channel configured: set TELEGRAM_BOT_TOKEN, SMTP_HOST or SMPP_HOST");
    }
    coordinator.start();

    tracing::info!(
        channels = ?coordinator.channels(),
        "Reading notification requests from stdin"
    );

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = run_until_drained(&coordinator) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Request reader exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    coordinator.shutdown().await;
    tracing::info!("Herald notifier stopped.");
    Ok(())
}

/// Feed stdin to the coordinator, then wait for every request to settle.
async fn run_until_drained(coordinator: &DeliveryCoordinator) -> anyhow::Result<()> {
    read_requests(coordinator).await?;
    tracing::info!("stdin closed, waiting for outstanding deliveries");
    while coordinator.active_count() > 0 {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    Ok(())
}

/// Submit newline-delimited JSON requests until stdin closes.
async fn read_requests(coordinator: &DeliveryCoordinator) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: NotificationRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request line");
                continue;
            }
        };

        if let Err(e) = validate_request(&request) {
            tracing::warn!(request_id = %request.id, error = %e, "Invalid request");
            continue;
        }

        match coordinator.submit(request) {
            Ok(id) => tracing::info!(request_id = %id, "Request accepted"),
            Err(e) => tracing::warn!(error = %e, "Request rejected"),
        }
    }

    Ok(())
}
