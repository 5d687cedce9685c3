// Installed-suite storage.
//
// The installer only talks to `SuiteStorage`. `FileSuiteStorage` keeps each suite under
// `<root>/suites/<id>/` and commits by staging a complete copy and swapping it in.

use crate::error::{InstallError, InstallErrorKind};
use crate::properties::PropertyStore;
use crate::security::{PermissionLevel, PermissionSet};
use crate::utils::{disk, files};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

const SUITES_DIR: &str = "suites";
const TEMP_DIR: &str = "tmp";
const METADATA_FILE: &str = "suite.json";
const ARCHIVE_FILE: &str = "suite.jar";
const RMS_DIR: &str = "rms";

/// Stable identity of a suite: the same vendor and name always map to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuiteId(String);

impl SuiteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-256 of `vendor \0 name`, truncated to 16 characters.
pub fn suite_id_for(vendor: &str, name: &str) -> SuiteId {
    let mut hasher = Sha256::new();
    hasher.update(vendor.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    SuiteId(hex[..16].to_string())
}

/// Everything persisted about an installed suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledSuite {
    pub id: SuiteId,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub descriptor_url: Option<String>,
    pub archive_url: String,
    pub descriptor: Option<PropertyStore>,
    pub manifest: PropertyStore,
    pub auth_path: Vec<String>,
    pub domain: String,
    pub trusted: bool,
    pub permissions: PermissionSet,
    pub push_interrupt_level: PermissionLevel,
    pub push_options: u32,
    pub integrity_hash: String,
    pub archive_size: u64,
    pub installed_at: DateTime<Utc>,
}

impl InstalledSuite {
    /// Descriptor attribute first, then manifest.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.descriptor
            .as_ref()
            .and_then(|d| d.get(key))
            .or_else(|| self.manifest.get(key))
    }
}

/// Result of looking up a suite id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteLookup {
    NotFound,
    Found(Box<InstalledSuite>),
    /// Present but unreadable; installing over it is allowed.
    Corrupted(SuiteId),
}

/// The single write the installer makes.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub suite: InstalledSuite,
    /// Downloaded archive (temporary file) to take over.
    pub archive_source: PathBuf,
    /// Drop the previous version's record stores instead of carrying them over.
    pub discard_record_stores: bool,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("suite {0} is not installed")]
    NotFound(SuiteId),
    #[error("suite {0} metadata is unreadable")]
    Corrupted(SuiteId),
    #[error("storage backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl From<StorageError> for InstallError {
    fn from(e: StorageError) -> Self {
        InstallError::with_detail(InstallErrorKind::StorageFailure, e.to_string())
    }
}

/// Persistent suite storage. `commit_suite` must be all-or-nothing.
#[async_trait]
pub trait SuiteStorage: Send + Sync {
    fn create_suite_id(&self, vendor: &str, name: &str) -> SuiteId {
        suite_id_for(vendor, name)
    }

    async fn lookup(&self, id: &SuiteId) -> Result<SuiteLookup, StorageError>;

    async fn free_space_bytes(&self) -> Result<u64, StorageError>;

    /// Directory for in-progress downloads.
    fn temp_dir(&self) -> PathBuf;

    async fn has_record_stores(&self, id: &SuiteId) -> Result<bool, StorageError>;

    async fn commit_suite(&self, request: CommitRequest) -> Result<(), StorageError>;

    async fn list_suites(&self) -> Result<Vec<InstalledSuite>, StorageError>;
}

/// Filesystem-backed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileSuiteStorage {
    root: PathBuf,
}

impl FileSuiteStorage {
    /// Open (creating if needed) storage under `root`.
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        for dir in [root.join(SUITES_DIR), root.join(TEMP_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create storage directory {:?}", dir))?;
        }
        info!(
            "[PHASE: storage] [STEP: open] Suite storage ready (root={:?})",
            root
        );
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn suite_dir(&self, id: &SuiteId) -> PathBuf {
        self.root.join(SUITES_DIR).join(id.as_str())
    }

    pub fn record_store_dir(&self, id: &SuiteId) -> PathBuf {
        self.suite_dir(id).join(RMS_DIR)
    }

    fn sibling(&self, id: &SuiteId, suffix: &str) -> PathBuf {
        self.root
            .join(SUITES_DIR)
            .join(format!("{}.{}", id.as_str(), suffix))
    }

    async fn read_metadata(&self, dir: &Path, id: &SuiteId) -> Result<SuiteLookup, StorageError> {
        let path = dir.join(METADATA_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::try_exists(dir).await.unwrap_or(false) {
                    warn!(
                        "[PHASE: storage] [STEP: lookup] Suite directory has no metadata (suite_id={})",
                        id
                    );
                    return Ok(SuiteLookup::Corrupted(id.clone()));
                }
                return Ok(SuiteLookup::NotFound);
            }
            Err(e) => {
                return Err(StorageError::Backend(
                    anyhow::Error::new(e).context(format!("Failed to read {:?}", path)),
                ))
            }
        };
        match serde_json::from_slice::<InstalledSuite>(&bytes) {
            Ok(suite) if &suite.id == id => Ok(SuiteLookup::Found(Box::new(suite))),
            Ok(suite) => {
                warn!(
                    "[PHASE: storage] [STEP: lookup] Suite metadata id mismatch (suite_id={}, recorded={})",
                    id, suite.id
                );
                Ok(SuiteLookup::Corrupted(id.clone()))
            }
            Err(e) => {
                warn!(
                    "[PHASE: storage] [STEP: lookup] Suite metadata unreadable (suite_id={}, err={})",
                    id, e
                );
                Ok(SuiteLookup::Corrupted(id.clone()))
            }
        }
    }

    /// Build the complete new suite directory next to the live one.
    async fn stage(&self, request: &CommitRequest, staging: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let id = &request.suite.id;
        files::remove_dir_if_exists(staging).await?;
        tokio::fs::create_dir_all(staging)
            .await
            .with_context(|| format!("Failed to create staging directory {:?}", staging))?;

        files::copy_file_with_retries(
            &request.archive_source,
            &staging.join(ARCHIVE_FILE),
            "archive",
        )
        .await?;

        let previous_rms = self.record_store_dir(id);
        let keep_rms = !request.discard_record_stores
            && tokio::fs::try_exists(&previous_rms).await.unwrap_or(false);
        if keep_rms {
            let copied = files::copy_dir_with_retries(&previous_rms, &staging.join(RMS_DIR), "rms").await?;
            debug!(
                "[PHASE: storage] [STEP: commit] Record stores carried over (suite_id={}, files={})",
                id, copied
            );
        } else {
            tokio::fs::create_dir_all(staging.join(RMS_DIR)).await?;
        }

        let metadata = serde_json::to_vec_pretty(&request.suite)
            .context("Failed to serialize suite metadata")?;
        files::write_file_atomic(&staging.join(METADATA_FILE), &metadata).await?;
        Ok(())
    }

    /// Swap `staging` in as the live suite directory. On failure the previous suite is restored.
    async fn swap_in(&self, id: &SuiteId, staging: &Path) -> anyhow::Result<()> {
        let live = self.suite_dir(id);
        let retired = self.sibling(id, "old");
        files::remove_dir_if_exists(&retired).await?;

        let had_previous = tokio::fs::try_exists(&live).await.unwrap_or(false);
        if had_previous {
            files::rename_with_retries(&live, &retired, "retire").await?;
        }
        if let Err(e) = files::rename_with_retries(staging, &live, "activate").await {
            if had_previous {
                if let Err(restore) = files::rename_with_retries(&retired, &live, "restore").await {
                    error!(
                        "[PHASE: storage] [STEP: commit] Failed to restore previous suite (suite_id={}, err={:#})",
                        id, restore
                    );
                }
            }
            return Err(e);
        }
        if had_previous {
            if let Err(e) = files::remove_dir_if_exists(&retired).await {
                warn!(
                    "[PHASE: storage] [STEP: commit] Failed to remove retired suite copy (suite_id={}, err={:#})",
                    id, e
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SuiteStorage for FileSuiteStorage {
    async fn lookup(&self, id: &SuiteId) -> Result<SuiteLookup, StorageError> {
        self.read_metadata(&self.suite_dir(id), id).await
    }

    async fn free_space_bytes(&self) -> Result<u64, StorageError> {
        Ok(disk::get_free_space_bytes_for_path(&self.root).await?)
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    async fn has_record_stores(&self, id: &SuiteId) -> Result<bool, StorageError> {
        let dir = self.record_store_dir(id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(false);
        }
        Ok(!files::collect_files_recursive(&dir).await?.is_empty())
    }

    async fn commit_suite(&self, request: CommitRequest) -> Result<(), StorageError> {
        let started = Instant::now();
        let id = request.suite.id.clone();
        info!(
            "[PHASE: storage] [STEP: commit] commit_suite entered (suite_id={}, name={}, version={}, discard_rms={})",
            id, request.suite.name, request.suite.version, request.discard_record_stores
        );

        let staging = self.sibling(&id, "staging");
        if let Err(e) = self.stage(&request, &staging).await {
            let _ = files::remove_dir_if_exists(&staging).await;
            error!(
                "[PHASE: storage] [STEP: commit] Staging failed; previous suite untouched (suite_id={}, err={:#})",
                id, e
            );
            return Err(StorageError::Backend(e));
        }
        if let Err(e) = self.swap_in(&id, &staging).await {
            let _ = files::remove_dir_if_exists(&staging).await;
            error!(
                "[PHASE: storage] [STEP: commit] Swap failed (suite_id={}, err={:#})",
                id, e
            );
            return Err(StorageError::Backend(e));
        }

        info!(
            "[PHASE: storage] [STEP: commit] commit_suite exit (suite_id={}, duration_ms={})",
            id,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn list_suites(&self) -> Result<Vec<InstalledSuite>, StorageError> {
        use anyhow::Context;
        let dir = self.root.join(SUITES_DIR);
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        let mut suites = Vec::new();
        while let Some(entry) = rd.next_entry().await.context("read_dir entry failed")? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Skip staging and retired copies.
            if name.contains('.') || !entry.path().is_dir() {
                continue;
            }
            let id = SuiteId(name);
            match self.read_metadata(&entry.path(), &id).await? {
                SuiteLookup::Found(suite) => suites.push(*suite),
                SuiteLookup::Corrupted(id) => warn!(
                    "[PHASE: storage] [STEP: list] Skipping corrupted suite (suite_id={})",
                    id
                ),
                SuiteLookup::NotFound => {}
            }
        }
        suites.sort_by(|a, b| (&a.vendor, &a.name).cmp(&(&b.vendor, &b.name)));
        Ok(suites)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::PermissionCatalog;

    pub(crate) fn sample_suite(vendor: &str, name: &str, version: &str) -> InstalledSuite {
        let catalog = PermissionCatalog::builtin().unwrap();
        let mut manifest = PropertyStore::new();
        manifest.set(crate::properties::MIDLET_NAME, name);
        manifest.set(crate::properties::MIDLET_VENDOR, vendor);
        manifest.set(crate::properties::MIDLET_VERSION, version);
        InstalledSuite {
            id: suite_id_for(vendor, name),
            name: name.to_string(),
            vendor: vendor.to_string(),
            version: version.to_string(),
            descriptor_url: Some("http://ota.example.com/app.jad".to_string()),
            archive_url: "http://ota.example.com/app.jar".to_string(),
            descriptor: None,
            manifest,
            auth_path: Vec::new(),
            domain: "unidentified".to_string(),
            trusted: false,
            permissions: PermissionSet {
                current: catalog.empty_levels(),
                maximum: catalog.empty_levels(),
            },
            push_interrupt_level: PermissionLevel::Never,
            push_options: 0,
            integrity_hash: "00".to_string(),
            archive_size: 2,
            installed_at: Utc::now(),
        }
    }

    async fn commit(storage: &FileSuiteStorage, suite: InstalledSuite, archive: &[u8], discard: bool) {
        let source = storage.temp_dir().join(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&source, archive).await.unwrap();
        storage
            .commit_suite(CommitRequest {
                suite,
                archive_source: source,
                discard_record_stores: discard,
            })
            .await
            .unwrap();
    }

    #[test]
    fn suite_ids_are_deterministic() {
        let a = suite_id_for("Acme", "Chess");
        assert_eq!(a, suite_id_for("Acme", "Chess"));
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, suite_id_for("AcmeC", "hess"), "separator must keep fields apart");
    }

    #[tokio::test]
    async fn commit_then_lookup_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSuiteStorage::open(dir.path()).await.unwrap();
        let suite = sample_suite("Acme", "Chess", "1.0");
        let id = suite.id.clone();

        assert_eq!(storage.lookup(&id).await.unwrap(), SuiteLookup::NotFound);
        commit(&storage, suite.clone(), b"PK", false).await;

        assert_eq!(
            storage.lookup(&id).await.unwrap(),
            SuiteLookup::Found(Box::new(suite))
        );
        assert_eq!(
            tokio::fs::read(storage.suite_dir(&id).join(ARCHIVE_FILE)).await.unwrap(),
            b"PK"
        );
        assert_eq!(storage.list_suites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upgrade_keeps_or_discards_record_stores() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSuiteStorage::open(dir.path()).await.unwrap();
        let id = suite_id_for("Acme", "Chess");

        commit(&storage, sample_suite("Acme", "Chess", "1.0"), b"PK1", false).await;
        assert!(!storage.has_record_stores(&id).await.unwrap());
        tokio::fs::write(storage.record_store_dir(&id).join("scores"), b"42")
            .await
            .unwrap();
        assert!(storage.has_record_stores(&id).await.unwrap());

        commit(&storage, sample_suite("Acme", "Chess", "1.1"), b"PK2", false).await;
        assert!(storage.has_record_stores(&id).await.unwrap(), "records kept on retain");

        commit(&storage, sample_suite("Acme", "Chess", "1.2"), b"PK3", true).await;
        assert!(!storage.has_record_stores(&id).await.unwrap(), "records dropped on discard");

        let entries = files::collect_files_recursive(&dir.path().join(SUITES_DIR))
            .await
            .unwrap();
        assert!(
            entries.iter().all(|p| !p.to_string_lossy().contains(".staging")
                && !p.to_string_lossy().contains(".old")),
            "no staging leftovers: {:?}",
            entries
        );
    }

    #[tokio::test]
    async fn failed_commit_leaves_previous_suite_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSuiteStorage::open(dir.path()).await.unwrap();
        let v1 = sample_suite("Acme", "Chess", "1.0");
        let id = v1.id.clone();
        commit(&storage, v1.clone(), b"PK1", false).await;

        let err = storage
            .commit_suite(CommitRequest {
                suite: sample_suite("Acme", "Chess", "2.0"),
                archive_source: dir.path().join("missing.jar"),
                discard_record_stores: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(storage.lookup(&id).await.unwrap(), SuiteLookup::Found(Box::new(v1)));
        assert!(!storage.sibling(&id, "staging").exists());
    }

    #[tokio::test]
    async fn unreadable_metadata_is_reported_as_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSuiteStorage::open(dir.path()).await.unwrap();
        let id = suite_id_for("Acme", "Chess");
        tokio::fs::create_dir_all(storage.suite_dir(&id)).await.unwrap();
        tokio::fs::write(storage.suite_dir(&id).join(METADATA_FILE), b"{not json")
            .await
            .unwrap();

        assert_eq!(storage.lookup(&id).await.unwrap(), SuiteLookup::Corrupted(id.clone()));
        assert!(storage.list_suites().await.unwrap().is_empty());
    }
}
