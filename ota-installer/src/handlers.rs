// Collaborator seams invoked while committing a suite.

use crate::error::{InstallError, InstallErrorKind};
use crate::properties::PropertyStore;
use crate::storage::SuiteId;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentHandlerError {
    #[error("content handler conflicts with another suite: {0}")]
    Conflict(String),
    #[error("invalid content handler declaration: {0}")]
    Invalid(String),
}

impl From<ContentHandlerError> for InstallError {
    fn from(e: ContentHandlerError) -> Self {
        match e {
            ContentHandlerError::Conflict(d) => {
                InstallError::with_detail(InstallErrorKind::ContentHandlerConflict, d)
            }
            ContentHandlerError::Invalid(d) => {
                InstallError::with_detail(InstallErrorKind::InvalidContentHandler, d)
            }
        }
    }
}

/// Registry of content handlers declared by suites.
#[async_trait]
pub trait ContentHandlerRegistry: Send + Sync {
    /// Validate the suite's declarations against already-installed handlers.
    async fn pre_install(
        &self,
        suite: &SuiteId,
        attributes: &PropertyStore,
        is_upgrade: bool,
    ) -> Result<(), ContentHandlerError>;

    /// Register the declarations validated by `pre_install`.
    async fn install(&self, suite: &SuiteId) -> Result<(), ContentHandlerError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoContentHandlers;

#[async_trait]
impl ContentHandlerRegistry for NoContentHandlers {
    async fn pre_install(
        &self,
        _suite: &SuiteId,
        _attributes: &PropertyStore,
        _is_upgrade: bool,
    ) -> Result<(), ContentHandlerError> {
        Ok(())
    }

    async fn install(&self, _suite: &SuiteId) -> Result<(), ContentHandlerError> {
        Ok(())
    }
}

/// Produces a platform-specific application image from the downloaded archive.
#[async_trait]
pub trait AppImageGenerator: Send + Sync {
    async fn generate(&self, suite: &SuiteId, archive_path: &Path) -> anyhow::Result<()>;
}
