//! Logging system setup.
//!
//! Installs the global tracing subscriber used by the node and the mesh
//! library.

use crate::config::LoggingSettings;
use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
///
/// # Arguments
/// * `settings` - Configured level and output format
///
/// # Environment Variables
/// * `RUST_LOG` - Overrides the configured filter (e.g., "debug", "node_mesh=trace")
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", settings.level);
    Ok(())
}
