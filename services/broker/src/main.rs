// Broker service main entry point.
use anyhow::{Context, Result};
use beacon_security::License;
use broker::config::BrokerConfig;
use broker::observability::{init_observability, serve_metrics};
use broker::{Service, ServiceOptions, serve};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = init_observability();
    let config = BrokerConfig::from_env_or_yaml().context("load broker config")?;

    // A fresh license (and its master key) is minted on first start so the
    // operator can begin issuing channel keys immediately.
    let license = match &config.license {
        Some(text) => License::parse(text).context("parse BEACON_LICENSE")?,
        None => {
            let license = License::generate();
            tracing::warn!(license = %license, "no license configured, generated a new one");
            license
        }
    };

    let service = Service::new(ServiceOptions::new(license));
    tracing::info!(
        contract = service.license().contract(),
        master_key = %service.master_key(),
        "broker started"
    );

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics endpoint exited");
        }
    });

    let listener = TcpListener::bind(config.listen_bind)
        .await
        .context("bind broker listener")?;
    tracing::info!(addr = %listener.local_addr()?, "listener started");

    let accept_task = {
        let service = std::sync::Arc::clone(&service);
        let max_packet = config.max_packet_bytes;
        tokio::spawn(async move {
            if let Err(err) = serve(listener, service, max_packet).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}
