// Callbacks from the installer to whoever is driving it (CLI prompts, tests).

use super::state::InstallState;
use crate::download::Credentials;
use crate::error::InstallError;
use async_trait::async_trait;

/// Progress milestones reported through `InstallListener::update_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    DownloadingDescriptor,
    DescriptorProgress { bytes: u64 },
    DownloadingArchive,
    ArchiveProgress { bytes: u64 },
    Verifying,
    GeneratingAppImage,
    Storing,
    /// The installed copy being replaced could not be read; installation continues over it.
    CorruptedPreviousSuite,
}

/// Observer and decision-maker for one installation.
///
/// Every question returns `true` to continue. Installing without a listener treats warnings
/// as fatal and answers every other question with its default.
#[async_trait]
pub trait InstallListener: Send + Sync {
    async fn update_status(&self, _phase: InstallPhase, _state: &InstallState) {}

    /// Approve continuing past `warning`.
    async fn warn_user(&self, state: &InstallState, warning: &InstallError) -> bool;

    /// Last chance to back out before the archive is downloaded.
    async fn confirm_archive_download(&self, state: &InstallState) -> bool;

    /// Approve the signer in `state.auth_path`.
    async fn confirm_auth_path(&self, state: &InstallState) -> bool;

    /// Keep the previous version's record stores across an upgrade whose provenance is unproven.
    async fn keep_rms_data(&self, state: &InstallState) -> bool;

    /// Credentials for a server (`proxy == false`) or proxy challenge. `None` gives up.
    async fn credentials(&self, _state: &InstallState, _proxy: bool) -> Option<Credentials> {
        None
    }
}
