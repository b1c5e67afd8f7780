//! Environment/runtime helpers
//!
//! Sanity checks to ensure expected directories exist at startup.

use tracing::{info, warn};

/// Ensure the local storage directory exists. `None` means memory-only.
pub async fn ensure_storage_dir(dir: Option<&str>) -> anyhow::Result<()> {
    let Some(dir) = dir else {
        warn!("no local storage directory configured; local storage will not survive restarts");
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| anyhow::anyhow!("cannot create {dir}: {e}"))?;
    info!(%dir, "local storage directory ready");
    Ok(())
}
