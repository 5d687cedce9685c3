// Suite archive (JAR) structure verification.

use crate::error::{InstallError, InstallErrorKind};
use crate::notifier::OtaStatus;
use crate::properties::{self, PropertyError, PropertyStore, MIDLET_PREFIX};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("archive has no {MANIFEST_PATH}")]
    MissingManifest,
    #[error("archive is not a readable zip file: {0}")]
    Corrupt(String),
    #[error("declared class is missing from the archive: {0}")]
    MissingClass(String),
    #[error("malformed MIDlet entry '{0}'")]
    InvalidMidletEntry(String),
    #[error("manifest is malformed: {0}")]
    Manifest(#[from] PropertyError),
    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VerifyError> for InstallError {
    fn from(e: VerifyError) -> Self {
        let err = match e {
            VerifyError::MissingManifest => {
                InstallError::with_detail(InstallErrorKind::CorruptJar, MANIFEST_PATH)
            }
            VerifyError::Corrupt(detail) => {
                InstallError::with_detail(InstallErrorKind::CorruptJar, detail)
            }
            VerifyError::MissingClass(entry) => {
                InstallError::with_detail(InstallErrorKind::CorruptJar, entry)
            }
            VerifyError::InvalidMidletEntry(entry) => {
                InstallError::with_detail(InstallErrorKind::InvalidValue, entry)
            }
            VerifyError::Manifest(PropertyError::TooManyProperties) => {
                InstallError::new(InstallErrorKind::TooManyProperties)
            }
            VerifyError::Manifest(other) => {
                InstallError::with_detail(InstallErrorKind::CorruptJar, other.to_string())
            }
            VerifyError::Io(io) => InstallError::from(io),
        };
        err.with_status(OtaStatus::InvalidArchive)
    }
}

/// Result of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedArchive {
    pub manifest: PropertyStore,
    /// Lowercase hex SHA-256 of the archive bytes.
    pub integrity_hash: String,
    pub size: u64,
    /// Class names of the declared MIDlets, in declaration order.
    pub midlet_classes: Vec<String>,
}

/// Class field (third) of a `MIDlet-<n>: name, icon, class` value.
pub fn midlet_class(value: &str) -> Result<&str, VerifyError> {
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    match fields.as_slice() {
        [name, _icon, class] if !name.is_empty() && !class.is_empty() => Ok(*class),
        _ => Err(VerifyError::InvalidMidletEntry(value.to_string())),
    }
}

/// `com.acme.Chess` -> `com/acme/Chess.class`
pub fn class_entry_name(class: &str) -> String {
    format!("{}.class", class.replace('.', "/"))
}

/// Class names of every declared `MIDlet-<n>` in `props`.
pub fn declared_midlet_classes(props: &PropertyStore) -> Result<Vec<String>, VerifyError> {
    props
        .numbered(MIDLET_PREFIX)
        .map(|(_, value)| midlet_class(value).map(str::to_string))
        .collect()
}

/// Checks archive structure only: manifest presence and the presence of every declared class.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveVerifier;

impl ArchiveVerifier {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify(&self, path: &Path) -> Result<VerifiedArchive, VerifyError> {
        let started = Instant::now();
        info!(
            "[PHASE: verify] [STEP: archive] verify entered (path={:?})",
            path
        );
        let owned: PathBuf = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || verify_blocking(&owned))
            .await
            .map_err(|e| VerifyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        match &result {
            Ok(verified) => info!(
                "[PHASE: verify] [STEP: archive] verify exit ok (midlets={}, bytes={}, sha256={}, duration_ms={})",
                verified.midlet_classes.len(),
                verified.size,
                verified.integrity_hash,
                started.elapsed().as_millis()
            ),
            Err(e) => warn!(
                "[PHASE: verify] [STEP: archive] verify failed (path={:?}, err={}, duration_ms={})",
                path,
                e,
                started.elapsed().as_millis()
            ),
        }
        result
    }
}

fn verify_blocking(path: &Path) -> Result<VerifiedArchive, VerifyError> {
    let bytes = std::fs::read(path)?;
    let integrity_hash = format!("{:x}", Sha256::digest(&bytes));
    let size = bytes.len() as u64;

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| VerifyError::Corrupt(e.to_string()))?;

    let manifest_bytes = {
        let mut entry = match zip.by_name(MANIFEST_PATH) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(VerifyError::MissingManifest),
            Err(e) => return Err(VerifyError::Corrupt(e.to_string())),
        };
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| VerifyError::Corrupt(e.to_string()))?;
        buf
    };
    let manifest = properties::parse_manifest(&manifest_bytes)?;

    let midlet_classes = declared_midlet_classes(&manifest)?;
    for class in &midlet_classes {
        let entry_name = class_entry_name(class);
        debug!(
            "[PHASE: verify] [STEP: classes] Checking declared class (class={}, entry={})",
            class, entry_name
        );
        match zip.by_name(&entry_name) {
            Ok(_) => {}
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(VerifyError::MissingClass(entry_name))
            }
            Err(e) => return Err(VerifyError::Corrupt(e.to_string())),
        }
    }

    Ok(VerifiedArchive {
        manifest,
        integrity_hash,
        size,
        midlet_classes,
    })
}
