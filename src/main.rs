//! Virtual kubelet
//!
//! Main entry point. Parses the configuration, connects to the cluster,
//! and runs the engine, the kubelet server and the metrics server until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use virtual_kubelet::{
    config::{EngineConfig, LogFormat, Opts},
    engine::Engine,
    metrics,
    provider::{
        mock::{MockConfig, MockProvider},
        Provider,
    },
    server::KubeletServer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing(opts.log_format);

    let config = EngineConfig::try_from(&opts).context("invalid configuration")?;
    info!(node = %config.node_name, provider = %config.provider, "Starting virtual kubelet");

    let provider = build_provider(&config)?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let kubelet_port = config.kubelet_port;
    let engine = Arc::new(Engine::from_client(config, provider, client));
    let token = CancellationToken::new();

    let server = KubeletServer::new(engine.provider().clone(), engine.resources().clone());
    let mut server_handle = tokio::spawn(server.serve(kubelet_port, token.clone()));

    let mut metrics_handle = tokio::spawn(metrics::serve(opts.metrics_port));
    info!("Metrics server starting on port {}", opts.metrics_port);

    let mut engine_handle = tokio::spawn(engine.clone().run(token.clone()));

    tokio::select! {
        _ = &mut engine_handle => {
            error!("Engine exited unexpectedly");
        }
        res = &mut server_handle => {
            error!("Kubelet server exited unexpectedly: {:?}", res);
        }
        res = &mut metrics_handle => {
            error!("Metrics server exited unexpectedly: {:?}", res);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping virtual kubelet");
        }
    }

    token.cancel();
    if !engine_handle.is_finished() {
        let _ = engine_handle.await;
    }
    metrics_handle.abort();

    info!("Virtual kubelet stopped");
    Ok(())
}

fn build_provider(config: &EngineConfig) -> anyhow::Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "mock" => {
            let mock = MockProvider::new(MockConfig {
                node_name: config.node_name.clone(),
                operating_system: config.operating_system.to_string(),
                internal_ip: config
                    .pod_ip
                    .clone()
                    .unwrap_or_else(|| MockConfig::default().internal_ip),
                daemon_port: i32::from(config.kubelet_port),
                ..Default::default()
            });
            Ok(Arc::new(mock))
        }
        other => bail!("provider {:?} is not supported", other),
    }
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,virtual_kubelet=debug,kube=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
