// Per-installation state, step sequencing and cancellation control.

use crate::download::Credentials;
use crate::error::InstallError;
use crate::properties::PropertyStore;
use crate::push::PushEntry;
use crate::security::{PermissionLevel, PermissionSet};
use crate::storage::{InstalledSuite, SuiteId};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallStep {
    FetchDescriptor,
    CheckContinuity,
    CheckStorage,
    ConfirmUser,
    FetchArchive,
    CheckArchiveContinuity,
    CommitPermissionsAndStore,
    Done,
}

impl InstallStep {
    /// 1-based step number; `Done` is 8.
    pub fn number(self) -> u8 {
        match self {
            Self::FetchDescriptor => 1,
            Self::CheckContinuity => 2,
            Self::CheckStorage => 3,
            Self::ConfirmUser => 4,
            Self::FetchArchive => 5,
            Self::CheckArchiveContinuity => 6,
            Self::CommitPermissionsAndStore => 7,
            Self::Done => 8,
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::FetchDescriptor => Self::CheckContinuity,
            Self::CheckContinuity => Self::CheckStorage,
            Self::CheckStorage => Self::ConfirmUser,
            Self::ConfirmUser => Self::FetchArchive,
            Self::FetchArchive => Self::CheckArchiveContinuity,
            Self::CheckArchiveContinuity => Self::CommitPermissionsAndStore,
            Self::CommitPermissionsAndStore | Self::Done => Self::Done,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FetchDescriptor => "fetch_descriptor",
            Self::CheckContinuity => "check_continuity",
            Self::CheckStorage => "check_storage",
            Self::ConfirmUser => "confirm_user",
            Self::FetchArchive => "fetch_archive",
            Self::CheckArchiveContinuity => "check_archive_continuity",
            Self::CommitPermissionsAndStore => "commit",
            Self::Done => "done",
        }
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Recoverable: the listener may approve continuing.
    Warn(InstallError),
    Fatal(InstallError),
}

impl From<InstallError> for StepOutcome {
    fn from(e: InstallError) -> Self {
        if e.is_warning() {
            StepOutcome::Warn(e)
        } else {
            StepOutcome::Fatal(e)
        }
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    stop_requested: bool,
    commit_point: bool,
    ignore_cancel: bool,
}

/// Cancellation state shared between the install task and whoever may call `stop()`.
///
/// All flags live under one lock so a stop request and the commit point cannot interleave.
#[derive(Debug, Default)]
pub(crate) struct InstallControl {
    flags: Mutex<ControlFlags>,
    token: CancellationToken,
}

impl InstallControl {
    fn flags(&self) -> MutexGuard<'_, ControlFlags> {
        // A poisoned lock only means a panicking holder; the flags are still meaningful.
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` once the commit point has been reached.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut flags = self.flags();
        if flags.commit_point {
            return false;
        }
        flags.stop_requested = true;
        if !flags.ignore_cancel {
            self.token.cancel();
        }
        true
    }

    pub(crate) fn begin_ignore_cancel(&self) {
        self.flags().ignore_cancel = true;
    }

    /// Closes the confirmation window, applying any stop recorded while it was open.
    pub(crate) fn end_ignore_cancel(&self) {
        let mut flags = self.flags();
        flags.ignore_cancel = false;
        if flags.stop_requested {
            self.token.cancel();
        }
    }

    /// Latches the commit point unless a stop is already pending.
    pub(crate) fn enter_commit_point(&self) -> bool {
        let mut flags = self.flags();
        if flags.stop_requested {
            return false;
        }
        flags.commit_point = true;
        true
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.flags().stop_requested
    }

    pub(crate) fn is_commit_irrevocable(&self) -> bool {
        self.flags().commit_point
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Caller-side handle for stopping an installation from another task.
#[derive(Debug, Clone, Default)]
pub struct InstallHandle {
    control: Arc<InstallControl>,
}

impl InstallHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `false` (and does nothing) once the suite is being committed.
    pub fn stop(&self) -> bool {
        let accepted = self.control.request_cancel();
        log::info!(
            "[PHASE: install] [STEP: cancel] stop requested (accepted={})",
            accepted
        );
        accepted
    }

    pub fn is_commit_irrevocable(&self) -> bool {
        self.control.is_commit_irrevocable()
    }

    pub(crate) fn control(&self) -> &InstallControl {
        &self.control
    }
}

/// Everything known about the installation in progress. Read-only to listeners.
#[derive(Debug, Clone)]
pub struct InstallState {
    pub descriptor_url: Option<String>,
    pub archive_url: Option<String>,
    pub force: bool,
    pub remove_rms: bool,
    pub current_step: InstallStep,
    /// Warning raised by the current step, cleared before each step.
    pub last_warning: Option<InstallError>,

    pub descriptor: Option<PropertyStore>,
    pub descriptor_size: u64,
    pub manifest: Option<PropertyStore>,
    pub suite_name: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<String>,
    pub suite_id: Option<SuiteId>,

    pub is_upgrade: bool,
    pub previous: Option<InstalledSuite>,
    pub previous_corrupted: bool,

    pub permissions: Option<PermissionSet>,
    pub domain: Option<String>,
    pub trusted: bool,
    pub auth_path: Vec<String>,

    /// `MIDlet-Jar-Size` from the descriptor.
    pub expected_archive_size: Option<u64>,
    pub temp_archive: Option<PathBuf>,
    pub archive_size: u64,
    pub integrity_hash: Option<String>,
    pub midlet_classes: Vec<String>,

    pub push_interrupt_level: PermissionLevel,
    pub push_options: u32,
    pub discard_rms: bool,
    pub previous_push_entries: Option<Vec<PushEntry>>,
    pub push_registered: bool,

    pub(crate) credentials: Option<Credentials>,
    pub(crate) proxy_credentials: Option<Credentials>,
}

impl InstallState {
    pub(crate) fn new(first_step: InstallStep) -> Self {
        Self {
            descriptor_url: None,
            archive_url: None,
            force: false,
            remove_rms: false,
            current_step: first_step,
            last_warning: None,
            descriptor: None,
            descriptor_size: 0,
            manifest: None,
            suite_name: None,
            vendor: None,
            version: None,
            suite_id: None,
            is_upgrade: false,
            previous: None,
            previous_corrupted: false,
            permissions: None,
            domain: None,
            trusted: false,
            auth_path: Vec::new(),
            expected_archive_size: None,
            temp_archive: None,
            archive_size: 0,
            integrity_hash: None,
            midlet_classes: Vec::new(),
            push_interrupt_level: PermissionLevel::Never,
            push_options: 0,
            discard_rms: false,
            previous_push_entries: None,
            push_registered: false,
            credentials: None,
            proxy_credentials: None,
        }
    }

    /// Attribute lookup: descriptor first, then manifest.
    pub fn app_property(&self, key: &str) -> Option<&str> {
        self.descriptor
            .as_ref()
            .and_then(|d| d.get_non_empty(key))
            .or_else(|| self.manifest.as_ref().and_then(|m| m.get_non_empty(key)))
    }

    /// Descriptor attributes overlaid on the manifest, descriptor values winning.
    pub fn app_properties(&self) -> PropertyStore {
        let mut merged = PropertyStore::new();
        for source in [self.descriptor.as_ref(), self.manifest.as_ref()]
            .into_iter()
            .flatten()
        {
            for (key, value) in source.iter() {
                merged.add_if_absent(key, value);
            }
        }
        merged
    }
}
