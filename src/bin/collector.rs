use anyhow::Result;
use tokio_util::sync::CancellationToken;

use aquamon::collector::http::{self as status_http, HttpState};
use aquamon::collector::poller::{Collector, PollSettings};
use aquamon::collector::sink::VictoriaSink;
use aquamon::config::CollectorConfig;
use aquamon::tuya::DeviceClient;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,aquamon=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = CollectorConfig::from_env()?;
    init_tracing()?;

    tracing::info!(
        host = %config.device_host,
        port = config.device_port,
        version = %config.protocol_version,
        store = %config.victoria_url,
        interval_seconds = config.poll_interval_seconds,
        "starting aquamon collector"
    );

    let client = DeviceClient::new(config.device_endpoint(), config.device_timeout());
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let sink = VictoriaSink::new(
        &config.victoria_url,
        &config.sensor_label,
        http,
        config.sink_retries,
        config.sink_backoff(),
    );
    let collector = Collector::new(client, sink, PollSettings::from_config(&config));
    let status = collector.status();

    let cancel = CancellationToken::new();
    let poll_handle = tokio::spawn(collector.run(cancel.clone()));

    let app = status_http::router(HttpState { status });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "collector status HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = poll_handle => {}
        _ = http_handle => {}
    }
    cancel.cancel();

    Ok(())
}
