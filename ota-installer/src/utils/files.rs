//! File helpers for suite storage.
//!
//! - Async I/O only (tokio)
//! - Transient errors are retried with backoff; every operation is bounded by a timeout
//! - Never fail silently (log with context)

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);
const ATTEMPTS: u32 = 3;

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("resource busy")
        || msg.contains("in use")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("interrupted")
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(200_u64.saturating_mul(1_u64 << (attempt - 1)))
}

/// Run `op` up to three times, retrying transient failures and timeouts.
async fn with_retries<T, F, Fut>(label: &str, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=ATTEMPTS {
        match timeout(FILE_OP_TIMEOUT, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                let transient = is_transient_fs_error(&err);
                warn!(
                    "[PHASE: storage] [STEP: files] {} failed (label={}, attempt={}, transient={}, err={:#})",
                    what, label, attempt, transient, err
                );
                last_err = Some(err);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: storage] [STEP: files] {} timeout (label={}, attempt={}, timeout_ms={})",
                    what,
                    label,
                    attempt,
                    FILE_OP_TIMEOUT.as_millis()
                );
                last_err = Some(anyhow::anyhow!(
                    "{} timed out after {}s",
                    what,
                    FILE_OP_TIMEOUT.as_secs()
                ));
            }
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(backoff(attempt)).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed", what)))
}

/// Copy one file with retries + timeout. Caller must create the parent directory.
pub async fn copy_file_with_retries(src: &Path, dst: &Path, label: &str) -> Result<u64> {
    let started = Instant::now();
    debug!(
        "[PHASE: storage] [STEP: files] copy_file_with_retries entered (label={}, src={:?}, dst={:?})",
        label, src, dst
    );

    let bytes = with_retries(label, "copy", || async {
        tokio::fs::copy(src, dst)
            .await
            .with_context(|| format!("copy failed: {:?} -> {:?}", src, dst))
    })
    .await?;

    debug!(
        "[PHASE: storage] [STEP: files] copy_file_with_retries exit ok (label={}, bytes={}, duration_ms={})",
        label,
        bytes,
        started.elapsed().as_millis()
    );
    Ok(bytes)
}

/// Rename with retries + timeout.
pub async fn rename_with_retries(src: &Path, dst: &Path, label: &str) -> Result<()> {
    with_retries(label, "rename", || async {
        tokio::fs::rename(src, dst)
            .await
            .with_context(|| format!("rename failed: {:?} -> {:?}", src, dst))
    })
    .await
}

/// Recursively collect all regular files under `root`. Returns absolute paths.
pub async fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    Ok(out)
}

/// Copy the tree under `src` into `dst` (created if needed). Returns the number of files copied.
pub async fn copy_dir_with_retries(src: &Path, dst: &Path, label: &str) -> Result<usize> {
    let started = Instant::now();
    let files = collect_files_recursive(src).await?;
    tokio::fs::create_dir_all(dst)
        .await
        .with_context(|| format!("create_dir_all failed: {:?}", dst))?;

    for file in &files {
        let rel = file
            .strip_prefix(src)
            .with_context(|| format!("{:?} is outside {:?}", file, src))?;
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all failed: {:?}", parent))?;
        }
        copy_file_with_retries(file, &target, label).await?;
    }

    debug!(
        "[PHASE: storage] [STEP: files] copy_dir_with_retries exit (label={}, files={}, duration_ms={})",
        label,
        files.len(),
        started.elapsed().as_millis()
    );
    Ok(files.len())
}

/// Write `contents` to `path` through a sibling temp file and a rename, so readers never observe
/// a partially written file.
pub async fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid file path: {:?}", path))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let write = async {
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create failed: {:?}", tmp))?;
        f.write_all(contents).await?;
        f.sync_all().await?;
        Ok::<(), anyhow::Error>(())
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = rename_with_retries(&tmp, path, file_name).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Remove a directory tree if it exists.
pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("remove_dir_all failed: {:?}", path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_dir_preserves_layout() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("rms");
        tokio::fs::create_dir_all(src.join("nested")).await.unwrap();
        tokio::fs::write(src.join("scores.db"), b"1").await.unwrap();
        tokio::fs::write(src.join("nested/prefs.db"), b"22").await.unwrap();

        let dst = dir.path().join("copy");
        let copied = copy_dir_with_retries(&src, &dst, "rms").await.unwrap();

        assert_eq!(copied, 2);
        assert_eq!(tokio::fs::read(dst.join("nested/prefs.db")).await.unwrap(), b"22");
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.json");
        write_file_atomic(&path, b"{\"v\":1}").await.unwrap();
        write_file_atomic(&path, b"{\"v\":2}").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{\"v\":2}");
        let leftovers = collect_files_recursive(dir.path()).await.unwrap();
        assert_eq!(leftovers, vec![path], "temp files must not be left behind");
    }

    #[tokio::test]
    async fn copy_of_missing_file_fails_without_retry_loop() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_file_with_retries(
            &dir.path().join("absent.jar"),
            &dir.path().join("copy.jar"),
            "archive",
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("copy failed"));
    }

    #[tokio::test]
    async fn removing_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&dir.path().join("nope")).await.unwrap();
    }
}
