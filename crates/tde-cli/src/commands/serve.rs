//! Serve command for starting the TDE proxy.
//!
//! `tde serve` - Start the Postgres proxy server.

use anyhow::Context;
use std::path::Path;
use tde_core::TdeConfig;
use tde_proxy::TdeProxy;

/// Load the configuration and run the proxy until interrupted.
pub async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = TdeConfig::load_with_context(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let proxy = TdeProxy::from_config(&config)?;
    if config.proxy.password.is_none() {
        tracing::warn!("proxy.password is not set, any client password is accepted");
    }

    tokio::select! {
        result = proxy.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    Ok(())
}
