// Installation error vocabulary.
//
// Every failure the pipeline can surface is an `InstallError`. Warnings share the same
// representation: a warning is an error that the listener may override.

use crate::notifier::OtaStatus;
use std::fmt;

/// Reason an installation stopped (or paused for listener approval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallErrorKind {
    // Descriptor / manifest format
    MissingSuiteName,
    MissingVendor,
    MissingVersion,
    InvalidVersion,
    MissingJarSize,
    MissingJarUrl,
    InvalidValue,
    TooManyProperties,

    // Transport
    InvalidJadUrl,
    JadServerNotFound,
    JadNotFound,
    InvalidJadType,
    InvalidJarUrl,
    JarServerNotFound,
    JarNotFound,
    InvalidJarType,
    TransferFailed,
    Unauthorized,
    ProxyAuth,
    CannotAuthenticate,

    // Resources
    InsufficientStorage,

    // Integrity
    CorruptJar,
    JarClassesVerificationFailed,
    JarSizeMismatch,
    SuiteNameMismatch,
    VendorMismatch,
    VersionMismatch,
    AttributeMismatch,

    // Previous version / continuity warnings
    OldVersion,
    AlreadyInstalled,
    NewVersion,
    JadMoved,

    // Policy
    AuthorizationFailure,
    TrustedOverwriteFailure,
    AuthenticationFailure,
    MissingConfiguration,
    MissingProfile,
    DeviceIncompatible,
    PushFormat,
    PushProto,
    PushDup,
    PushClassFailure,
    ContentHandlerConflict,
    InvalidContentHandler,

    // User / collaborators
    Cancelled,
    StorageFailure,
    Io,
}

impl InstallErrorKind {
    /// Recoverable kinds: the listener may approve continuing past them.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Self::OldVersion
                | Self::AlreadyInstalled
                | Self::NewVersion
                | Self::JadMoved
                | Self::Unauthorized
                | Self::ProxyAuth
        )
    }

    /// Authentication warnings re-run the step that raised them once credentials are known.
    pub fn reruns_step(self) -> bool {
        matches!(self, Self::Unauthorized | Self::ProxyAuth)
    }

    /// Provider message reported for this kind when it ends an installation.
    pub fn default_status(self) -> Option<OtaStatus> {
        use InstallErrorKind::*;
        match self {
            MissingSuiteName | MissingVendor | MissingVersion | InvalidVersion | MissingJarSize
            | MissingJarUrl | InvalidValue | TooManyProperties | InvalidJadUrl
            | JadServerNotFound | JadNotFound | InvalidJadType | InvalidJarUrl => {
                Some(OtaStatus::InvalidDescriptor)
            }
            JarServerNotFound | JarNotFound | InvalidJarType | CorruptJar
            | JarClassesVerificationFailed | MissingConfiguration | MissingProfile => {
                Some(OtaStatus::InvalidArchive)
            }
            InsufficientStorage => Some(OtaStatus::InsufficientMemory),
            JarSizeMismatch => Some(OtaStatus::SizeMismatch),
            SuiteNameMismatch | VendorMismatch | VersionMismatch | AttributeMismatch => {
                Some(OtaStatus::AttributeMismatch)
            }
            AuthorizationFailure | TrustedOverwriteFailure | AuthenticationFailure => {
                Some(OtaStatus::AuthorizationFailure)
            }
            DeviceIncompatible => Some(OtaStatus::IncompatibleDevice),
            PushFormat | PushProto | PushDup | PushClassFailure => {
                Some(OtaStatus::PushRegistrationFailure)
            }
            ContentHandlerConflict | InvalidContentHandler => {
                Some(OtaStatus::ContentHandlerConflict)
            }
            Cancelled => Some(OtaStatus::UserCancelled),
            TransferFailed | Unauthorized | ProxyAuth | CannotAuthenticate | OldVersion
            | AlreadyInstalled | NewVersion | JadMoved | StorageFailure | Io => None,
        }
    }

    fn describe(self) -> &'static str {
        use InstallErrorKind::*;
        match self {
            MissingSuiteName => "suite name attribute is missing",
            MissingVendor => "suite vendor attribute is missing",
            MissingVersion => "suite version attribute is missing",
            InvalidVersion => "suite version is malformed",
            MissingJarSize => "archive size attribute is missing",
            MissingJarUrl => "archive URL attribute is missing",
            InvalidValue => "attribute has an invalid value",
            TooManyProperties => "too many attributes",
            InvalidJadUrl => "descriptor URL is invalid",
            JadServerNotFound => "descriptor server not found",
            JadNotFound => "descriptor not found",
            InvalidJadType => "descriptor has an unacceptable media type",
            InvalidJarUrl => "archive URL is invalid",
            JarServerNotFound => "archive server not found",
            JarNotFound => "archive not found",
            InvalidJarType => "archive has an unacceptable media type",
            TransferFailed => "transfer failed",
            Unauthorized => "server requires authentication",
            ProxyAuth => "proxy requires authentication",
            CannotAuthenticate => "server requests an unsupported authentication scheme",
            InsufficientStorage => "insufficient storage (KiB required)",
            CorruptJar => "archive is corrupt",
            JarClassesVerificationFailed => "archive classes failed verification",
            JarSizeMismatch => "archive size does not match the descriptor",
            SuiteNameMismatch => "suite name differs between descriptor and manifest",
            VendorMismatch => "suite vendor differs between descriptor and manifest",
            VersionMismatch => "suite version differs between descriptor and manifest",
            AttributeMismatch => "attribute differs between descriptor and manifest",
            OldVersion => "a newer version is already installed",
            AlreadyInstalled => "this version is already installed",
            NewVersion => "an older version is installed",
            JadMoved => "suite is being installed from a different origin",
            AuthorizationFailure => "suite is not authorized for a requested permission",
            TrustedOverwriteFailure => "an untrusted suite cannot replace a trusted suite",
            AuthenticationFailure => "suite signature could not be authenticated",
            MissingConfiguration => "configuration attribute is missing",
            MissingProfile => "profile attribute is missing",
            DeviceIncompatible => "suite is incompatible with this device",
            PushFormat => "push entry is malformed",
            PushProto => "push connection protocol is not supported",
            PushDup => "push connection is already registered",
            PushClassFailure => "push entry names an undeclared class",
            ContentHandlerConflict => "content handler conflicts with another suite",
            InvalidContentHandler => "content handler declaration is invalid",
            Cancelled => "installation cancelled",
            StorageFailure => "suite storage failed",
            Io => "I/O failure",
        }
    }
}

impl fmt::Display for InstallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Installation failure: a kind, an optional detail (offending entry, previous version, required KiB),
/// and the provider message to report if this error ends the installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallError {
    kind: InstallErrorKind,
    detail: Option<String>,
    status: Option<OtaStatus>,
}

impl InstallError {
    pub fn new(kind: InstallErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            status: kind.default_status(),
        }
    }

    pub fn with_detail(kind: InstallErrorKind, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(kind)
        }
    }

    /// Override the provider message (e.g. a manifest attribute failure reports an invalid archive).
    pub fn with_status(mut self, status: OtaStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn insufficient_storage(required_bytes: u64) -> Self {
        let kib = required_bytes.div_ceil(1024);
        Self::with_detail(InstallErrorKind::InsufficientStorage, kib.to_string())
    }

    pub fn cancelled() -> Self {
        Self::new(InstallErrorKind::Cancelled)
    }

    pub fn kind(&self) -> InstallErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn status(&self) -> Option<OtaStatus> {
        self.status
    }

    pub fn is_warning(&self) -> bool {
        self.kind.is_warning()
    }
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for InstallError {}

impl From<std::io::Error> for InstallError {
    fn from(e: std::io::Error) -> Self {
        Self::with_detail(InstallErrorKind::Io, e.to_string())
    }
}
