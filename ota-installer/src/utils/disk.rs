//! Free-space detection for the suite storage root.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;
use std::time::Instant;
use tokio::time::Duration;

/// Best-effort free-space check for a filesystem path (returns bytes).
///
/// Uses `df -Pk <path>` through the retrying command runner and parses the available KiB.
pub async fn get_free_space_bytes_for_path(path: &Path) -> Result<u64> {
    let started = Instant::now();
    debug!(
        "[PHASE: storage] [STEP: free_space] get_free_space_bytes_for_path entered (path={:?})",
        path
    );

    let bytes = free_space_bytes_df(path).await?;

    info!(
        "[PHASE: storage] [STEP: free_space] get_free_space_bytes_for_path exit (bytes={}, duration_ms={})",
        bytes,
        started.elapsed().as_millis()
    );
    Ok(bytes)
}

#[cfg(unix)]
async fn free_space_bytes_df(path: &Path) -> Result<u64> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path"))?
        .to_string();

    let out = crate::utils::command::run_cmd_with_timeout(
        "df",
        &["-Pk".to_string(), path_str],
        Duration::from_secs(10),
        "free_space_df",
    )
    .await?;

    if out.exit_code != Some(0) {
        anyhow::bail!("Failed to query free space (exit_code={:?})", out.exit_code);
    }
    parse_df_available_bytes(&out.stdout)
}

#[cfg(not(unix))]
async fn free_space_bytes_df(_path: &Path) -> Result<u64> {
    anyhow::bail!("Free space detection is not available on this OS")
}

/// Parse POSIX `df -Pk` output:
///
/// ```text
/// Filesystem 1024-blocks Used Available Capacity Mounted on
/// /dev/sda1  1000        400  600       40%      /
/// ```
pub fn parse_df_available_bytes(stdout: &str) -> Result<u64> {
    let mut lines = stdout.lines();
    let _header = lines.next();
    let data = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("df output missing data row"))?;
    let cols: Vec<&str> = data.split_whitespace().collect();
    if cols.len() < 4 {
        anyhow::bail!("df output parse error");
    }
    let avail_kb: u64 = cols[3]
        .parse()
        .with_context(|| format!("Unable to parse df available KB '{}'", cols[3]))?;
    Ok(avail_kb.saturating_mul(1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_available_column() {
        let out = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                   /dev/nvme0n1p2   490691512 10000000  98765432      10% /\n";
        assert_eq!(parse_df_available_bytes(out).unwrap(), 98_765_432 * 1024);
    }

    #[test]
    fn rejects_truncated_output() {
        assert!(parse_df_available_bytes("Filesystem 1024-blocks Used Available\n").is_err());
        assert!(parse_df_available_bytes("Filesystem\n/dev/sda1 10\n").is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reports_free_space_for_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = get_free_space_bytes_for_path(dir.path()).await.unwrap();
        assert!(bytes > 0, "a writable temp dir should have free space");
    }
}
