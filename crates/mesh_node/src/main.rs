//! Mesh node entry point.
//!
//! Loads the configuration, boots one cluster node and runs it until a
//! termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::Args;
use config::AppConfig;
use node_mesh::{ChannelDispatcher, Handle, LocalModules, MeshHandle, ModuleEvent, NodeMesh};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_from_file(&args.config).await?;
    config.apply_cli(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

    logging::setup_logging(&config.logging)?;
    info!("🚀 Mesh node v{}", env!("CARGO_PKG_VERSION"));
    info!("📂 Config: {}", args.config.display());

    let (modules, mut module_events) = LocalModules::new();
    for module in &config.modules.publish {
        modules.register(module.name.clone(), module.id);
    }
    let (dispatcher, mut deliveries) = ChannelDispatcher::new();

    let mesh = NodeMesh::start(
        config.to_mesh_config(),
        Arc::new(modules),
        Arc::new(dispatcher),
    )
    .await
    .context("Mesh startup failed")?;

    log_summary(&mesh, &config);
    announce_modules(&mesh, &config).await?;

    let delivery_task = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            debug!(
                "📨 {} -> module {} (type {}, {} bytes)",
                delivery.source,
                delivery.dest,
                delivery.msg_type.0,
                delivery.payload.len()
            );
        }
    });
    let module_task = tokio::spawn(async move {
        while let Some(event) = module_events.recv().await {
            match event {
                ModuleEvent::Started { name, handle, addr } => {
                    info!(
                        "📦 Module {} up at {} (gate {}:{})",
                        name, handle, addr.gate_host, addr.gate_port
                    );
                }
                ModuleEvent::BatchBegin { name } => debug!("Publisher batch for {} begins", name),
                ModuleEvent::BatchEnd { name } => debug!("Publisher batch for {} ends", name),
                ModuleEvent::Exited { handle } => warn!("📤 Module {} went away", handle),
            }
        }
    });

    info!("✅ Node {} is running", mesh.node_id());
    info!("🛑 Press Ctrl+C to gracefully shutdown");
    let signal = signals::wait_for_shutdown().await?;

    info!("🛑 {} received, closing links...", signal);
    if let Err(e) = mesh.shutdown().await {
        warn!("Mesh shutdown: {}", e);
    }
    delivery_task.abort();
    module_task.abort();

    info!("✅ Node {} shutdown complete", mesh.node_id());
    Ok(())
}

fn log_summary(mesh: &MeshHandle, config: &AppConfig) {
    info!("📋 Configuration Summary:");
    info!("  🆔 Node id: {}", mesh.node_id());
    info!("  🌐 Mesh address: {}", mesh.local_addr());
    if mesh.is_center() {
        info!("  🏛️ Role: center");
    } else {
        info!(
            "  🏛️ Role: member of {}:{}",
            config.center.host, config.center.port
        );
    }
    info!(
        "  💓 Heartbeat: {}s",
        node_mesh::config::clamp_heartbeat(config.mesh.heartbeat_secs)
    );
    info!("  👥 Max connections: {}", config.mesh.max_connections);
}

/// Publishes the configured local modules and subscribes to the configured
/// names.
async fn announce_modules(mesh: &MeshHandle, config: &AppConfig) -> Result<()> {
    for module in &config.modules.publish {
        let handle = mesh
            .publish(&module.name, Handle::new(mesh.node_id(), module.id))
            .await?;
        info!("📣 Published {} as {}", module.name, handle);
    }
    for name in &config.modules.subscribe {
        mesh.subscribe(name).await?;
        info!("🔔 Subscribed to {}", name);
    }
    Ok(())
}
