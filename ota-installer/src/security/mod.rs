// Security: permission catalog, policy engine and archive trust.

pub mod permissions;
pub mod policy;
pub mod trust;

pub use permissions::{
    GroupKind, PermissionCatalog, PermissionLevel, PermissionLevels, PermissionSet,
    SecurityDomain, PUSH_REGISTRY_PERMISSION,
};
pub use policy::{apply_prior_user_levels, PermissionPolicyEngine, PolicyError};
pub use trust::{ArchiveTrustVerifier, NoSignatureVerifier, PinnedSignerVerifier, SignerIdentity};
