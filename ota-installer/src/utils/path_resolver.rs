use anyhow::Result;
use std::path::PathBuf;

const APP_DIR: &str = "ota-installer";

/// Resolve the default suite storage root (absolute path).
///
/// `$XDG_DATA_HOME/ota-installer` (or the platform equivalent), falling back to
/// `<cwd>/ota-installer-data` when no data directory is known.
pub fn resolve_storage_root() -> Result<PathBuf> {
    if let Some(data) = dirs::data_local_dir() {
        return Ok(data.join(APP_DIR));
    }
    let cwd = std::env::current_dir()
        .map_err(|e| anyhow::anyhow!("Failed to resolve current directory: {}", e))?;
    Ok(cwd.join("ota-installer-data"))
}

/// Resolve log folder (absolute path), creating it if needed.
///
/// An explicitly configured folder wins; otherwise `<cache dir>/ota-installer/logs`, then
/// `<storage root>/logs`.
pub fn resolve_log_folder(configured: Option<&std::path::Path>) -> Result<PathBuf> {
    let log_dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => match dirs::cache_dir() {
            Some(cache) => cache.join(APP_DIR).join("logs"),
            None => resolve_storage_root()?.join("logs"),
        },
    };
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}
