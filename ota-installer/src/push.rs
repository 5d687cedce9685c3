// Push connection registration and its rollback across upgrades.
//
// A suite declares `MIDlet-Push-<n>: <connection>, <midlet class>, <sender filter>`. Registration
// is all-or-nothing per suite: a failure unregisters what was added and, on upgrade, puts the
// previous version's connections back.

use crate::error::{InstallError, InstallErrorKind};
use crate::properties::{PropertyStore, MIDLET_PUSH_PREFIX};
use crate::security::{PermissionCatalog, PermissionLevel, PermissionLevels, PUSH_REGISTRY_PERMISSION};
use crate::storage::{InstalledSuite, SuiteId};
use crate::utils::files;
use anyhow::Context;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const PUSH_FILE: &str = "push.json";

/// One declared push connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEntry {
    pub connection: String,
    pub midlet: String,
    pub filter: String,
}

impl PushEntry {
    /// Parse `connection, class, filter` (fields trimmed).
    pub fn parse(value: &str) -> Result<Self, PushError> {
        let fields: Vec<&str> = value.split(',').map(str::trim).collect();
        let [connection, midlet, filter] = fields.as_slice() else {
            return Err(PushError::Malformed(value.to_string()));
        };
        let entry = Self {
            connection: connection.to_string(),
            midlet: midlet.to_string(),
            filter: filter.to_string(),
        };
        if entry.scheme().is_none() || entry.midlet.is_empty() || entry.filter.is_empty() {
            return Err(PushError::Malformed(value.to_string()));
        }
        Ok(entry)
    }

    /// Connection scheme (`socket` in `socket://:5000`), lowercase.
    pub fn scheme(&self) -> Option<String> {
        let (scheme, _) = self.connection.split_once("://")?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '.' || c == '-') {
            return None;
        }
        Some(scheme.to_ascii_lowercase())
    }
}

/// Every `MIDlet-Push-<n>` entry, in order.
pub fn parse_push_entries(props: &PropertyStore) -> Result<Vec<PushEntry>, PushError> {
    props
        .numbered(MIDLET_PUSH_PREFIX)
        .map(|(_, value)| PushEntry::parse(value))
        .collect()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("malformed push entry '{0}'")]
    Malformed(String),
    #[error("unsupported push connection protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("push connection '{0}' is already registered")]
    Duplicate(String),
    #[error("push entry names undeclared class '{0}'")]
    MissingClass(String),
    #[error("push registry failure: {0}")]
    Registry(String),
}

impl From<PushError> for InstallError {
    fn from(e: PushError) -> Self {
        let kind = match &e {
            PushError::Malformed(_) => InstallErrorKind::PushFormat,
            PushError::UnsupportedProtocol(_) => InstallErrorKind::PushProto,
            PushError::Duplicate(_) => InstallErrorKind::PushDup,
            PushError::MissingClass(_) => InstallErrorKind::PushClassFailure,
            PushError::Registry(_) => InstallErrorKind::StorageFailure,
        };
        let detail = match e {
            PushError::Malformed(d)
            | PushError::UnsupportedProtocol(d)
            | PushError::Duplicate(d)
            | PushError::MissingClass(d)
            | PushError::Registry(d) => d,
        };
        InstallError::with_detail(kind, detail)
            .with_status(crate::notifier::OtaStatus::PushRegistrationFailure)
    }
}

/// The push subsystem's connection table.
#[async_trait]
pub trait PushRegistry: Send + Sync {
    /// Fails with [`PushError::Duplicate`] if any suite already holds the connection.
    async fn register(&self, suite: &SuiteId, entry: &PushEntry) -> Result<(), PushError>;

    async fn unregister_all(&self, suite: &SuiteId) -> Result<(), PushError>;

    async fn entries(&self, suite: &SuiteId) -> Result<Vec<PushEntry>, PushError>;
}

/// Registers a suite's push connections with rollback to the previous version's set.
pub struct PushMigration {
    registry: Arc<dyn PushRegistry>,
    supported_protocols: Vec<String>,
}

impl PushMigration {
    pub fn new(registry: Arc<dyn PushRegistry>, supported_protocols: &[String]) -> Self {
        Self {
            registry,
            supported_protocols: supported_protocols
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn PushRegistry> {
        &self.registry
    }

    fn check_entry(&self, entry: &PushEntry, midlet_classes: &[String]) -> Result<(), PushError> {
        if !midlet_classes.iter().any(|c| *c == entry.midlet) {
            return Err(PushError::MissingClass(entry.midlet.clone()));
        }
        let scheme = entry
            .scheme()
            .ok_or_else(|| PushError::Malformed(entry.connection.clone()))?;
        if !self.supported_protocols.contains(&scheme) {
            return Err(PushError::UnsupportedProtocol(scheme));
        }
        Ok(())
    }

    /// Replace `suite`'s registrations with `entries`.
    ///
    /// `previous` holds the connections of the version being upgraded; they are removed first
    /// and restored if any new entry fails.
    pub async fn register(
        &self,
        suite: &SuiteId,
        entries: &[PushEntry],
        midlet_classes: &[String],
        previous: Option<&[PushEntry]>,
    ) -> Result<(), PushError> {
        info!(
            "[PHASE: push] [STEP: register] register entered (suite_id={}, entries={}, upgrade={})",
            suite,
            entries.len(),
            previous.is_some()
        );
        if previous.is_some() {
            self.registry.unregister_all(suite).await?;
        }

        for entry in entries {
            let result = match self.check_entry(entry, midlet_classes) {
                Ok(()) => self.registry.register(suite, entry).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    "[PHASE: push] [STEP: register] Push registration failed; rolling back (suite_id={}, connection={}, err={})",
                    suite, entry.connection, e
                );
                self.rollback(suite, previous).await;
                return Err(e);
            }
            debug!(
                "[PHASE: push] [STEP: register] Connection registered (suite_id={}, connection={}, midlet={})",
                suite, entry.connection, entry.midlet
            );
        }
        Ok(())
    }

    /// Remove everything registered for `suite` and best-effort restore `previous`.
    /// Failures are logged, never returned.
    pub async fn rollback(&self, suite: &SuiteId, previous: Option<&[PushEntry]>) {
        if let Err(e) = self.registry.unregister_all(suite).await {
            error!(
                "[PHASE: push] [STEP: rollback] Failed to unregister connections (suite_id={}, err={})",
                suite, e
            );
        }
        for entry in previous.unwrap_or_default() {
            if let Err(e) = self.registry.register(suite, entry).await {
                error!(
                    "[PHASE: push] [STEP: rollback] Failed to restore previous connection (suite_id={}, connection={}, err={})",
                    suite, entry.connection, e
                );
            }
        }
        info!(
            "[PHASE: push] [STEP: rollback] Push registrations rolled back (suite_id={}, restored={})",
            suite,
            previous.map(<[PushEntry]>::len).unwrap_or(0)
        );
    }
}

/// Push interrupt level and options for the suite being committed.
///
/// An upgrade keeps the previous version's settings unless its level was `Never`; otherwise the
/// level follows the push registry permission (`Allow` becomes `Session`).
pub fn push_interrupt_settings(
    catalog: &PermissionCatalog,
    current: &PermissionLevels,
    previous: Option<&InstalledSuite>,
) -> (PermissionLevel, u32) {
    if let Some(prev) = previous.filter(|p| p.push_interrupt_level != PermissionLevel::Never) {
        return (prev.push_interrupt_level, prev.push_options);
    }
    let level = catalog
        .permission_id(PUSH_REGISTRY_PERMISSION)
        .map(|id| current.get(id))
        .unwrap_or(PermissionLevel::Never);
    let level = match level {
        PermissionLevel::Allow => PermissionLevel::Session,
        other => other,
    };
    (level, 0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Registration {
    suite: SuiteId,
    entry: PushEntry,
}

/// Push table persisted as `<root>/push.json`.
pub struct FilePushRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePushRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(PUSH_FILE),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<Registration>, PushError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {:?}", self.path))
                .map_err(|e| PushError::Registry(format!("{:#}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PushError::Registry(format!("{:?}: {}", self.path, e))),
        }
    }

    async fn save(&self, table: &[Registration]) -> Result<(), PushError> {
        let bytes = serde_json::to_vec_pretty(table).map_err(|e| PushError::Registry(e.to_string()))?;
        files::write_file_atomic(&self.path, &bytes)
            .await
            .map_err(|e| PushError::Registry(format!("{:#}", e)))
    }
}

#[async_trait]
impl PushRegistry for FilePushRegistry {
    async fn register(&self, suite: &SuiteId, entry: &PushEntry) -> Result<(), PushError> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        if table.iter().any(|r| r.entry.connection == entry.connection) {
            return Err(PushError::Duplicate(entry.connection.clone()));
        }
        table.push(Registration {
            suite: suite.clone(),
            entry: entry.clone(),
        });
        self.save(&table).await
    }

    async fn unregister_all(&self, suite: &SuiteId) -> Result<(), PushError> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let before = table.len();
        table.retain(|r| &r.suite != suite);
        if table.len() == before {
            return Ok(());
        }
        self.save(&table).await
    }

    async fn entries(&self, suite: &SuiteId) -> Result<Vec<PushEntry>, PushError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| &r.suite == suite)
            .map(|r| r.entry)
            .collect())
    }
}
