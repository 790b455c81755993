use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use holodeck::runtime::handler::HandlerRegistry;
use holodeck::runtime::kubernetes::{KubernetesRuntime, register_handlers};
use holodeck::runtime::{self, AgentConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("HOLODECK_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AgentConfig::parse();
    tracing::info!(agent_id = %config.agent_id, platform = %config.platform, "starting agent");

    let client = kube::Client::try_default().await?;
    let active = Arc::new(AtomicI64::new(0));
    let k8s = KubernetesRuntime::new(client, config.namespace.clone(), active.clone());
    if let Err(e) = k8s.reconcile().await {
        tracing::warn!(error = %e, "startup reconciliation failed, continuing");
    }

    let mut handlers = HandlerRegistry::new();
    register_handlers(&mut handlers, k8s.clone());

    runtime::run(config, Arc::new(handlers), active, k8s).await
}
