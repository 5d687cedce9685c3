// Permission catalog: permissions, groups and security domains.
//
// The catalog is built once at startup (built-in policy or a policy TOML file) and shared
// read-only by the policy engine and the installer.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Name of the built-in all-allowed domain.
pub const MANUFACTURER_DOMAIN: &str = "manufacturer";
/// Permission consulted for push registration and push interrupts.
pub const PUSH_REGISTRY_PERMISSION: &str = "javax.microedition.io.PushRegistry";

const DEFAULT_POLICY: &str = include_str!("default_policy.toml");

/// How a runtime permission check behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Never,
    Allow,
    BlanketGranted,
    Blanket,
    Session,
    Oneshot,
    BlanketDenied,
}

impl PermissionLevel {
    /// Numeric encoding shared with the runtime security handler.
    pub fn code(self) -> i8 {
        match self {
            Self::Never => 0,
            Self::Allow => 1,
            Self::BlanketGranted => 2,
            Self::Blanket => 4,
            Self::Session => 8,
            Self::Oneshot => 16,
            Self::BlanketDenied => -128,
        }
    }

    /// `Never` and `Allow` are fixed grants; every other level is a user interaction level.
    pub fn is_user_level(self) -> bool {
        !matches!(self, Self::Never | Self::Allow)
    }

    /// Interaction tier of a user level: one-shot < session < blanket.
    /// `BlanketDenied` sits below one-shot so it is always carried across upgrades.
    pub fn interaction_tier(self) -> Option<u8> {
        match self {
            Self::Never | Self::Allow => None,
            Self::BlanketDenied => Some(0),
            Self::Oneshot => Some(1),
            Self::Session => Some(2),
            Self::Blanket | Self::BlanketGranted => Some(3),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Allow => "allow",
            Self::BlanketGranted => "blanket_granted",
            Self::Blanket => "blanket",
            Self::Session => "session",
            Self::Oneshot => "oneshot",
            Self::BlanketDenied => "blanket_denied",
        }
    }
}

/// Permission groups known to the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    NetAccess,
    Messaging,
    ReadMessaging,
    ApplicationAutoInvocation,
    LocalConnectivity,
    MultimediaRecording,
    ReadUserDataAccess,
    WriteUserDataAccess,
}

impl GroupKind {
    pub const ALL: [GroupKind; 8] = [
        GroupKind::NetAccess,
        GroupKind::Messaging,
        GroupKind::ReadMessaging,
        GroupKind::ApplicationAutoInvocation,
        GroupKind::LocalConnectivity,
        GroupKind::MultimediaRecording,
        GroupKind::ReadUserDataAccess,
        GroupKind::WriteUserDataAccess,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::NetAccess => "net_access",
            Self::Messaging => "messaging",
            Self::ReadMessaging => "read_messaging",
            Self::ApplicationAutoInvocation => "application_auto_invocation",
            Self::LocalConnectivity => "local_connectivity",
            Self::MultimediaRecording => "multimedia_recording",
            Self::ReadUserDataAccess => "read_user_data_access",
            Self::WriteUserDataAccess => "write_user_data_access",
        }
    }
}

/// Per-permission levels, indexed by permission id. The length is fixed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionLevels(Vec<PermissionLevel>);

impl PermissionLevels {
    pub(crate) fn filled(len: usize, level: PermissionLevel) -> Self {
        Self(vec![level; len])
    }

    pub(crate) fn from_vec(levels: Vec<PermissionLevel>) -> Self {
        Self(levels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Level of `id`; out-of-range ids read as `Never`.
    pub fn get(&self, id: usize) -> PermissionLevel {
        self.0.get(id).copied().unwrap_or(PermissionLevel::Never)
    }

    /// Ids outside the fixed length are ignored.
    pub(crate) fn set(&mut self, id: usize, level: PermissionLevel) {
        if let Some(slot) = self.0.get_mut(id) {
            *slot = level;
        }
    }

    pub fn as_slice(&self) -> &[PermissionLevel] {
        &self.0
    }
}

/// Current and maximum levels of one suite (or one domain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub current: PermissionLevels,
    pub maximum: PermissionLevels,
}

#[derive(Debug, Clone)]
pub struct PermissionGroup {
    pub kind: GroupKind,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct SecurityDomain {
    name: String,
    trusted: bool,
    levels: PermissionSet,
}

impl SecurityDomain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn current(&self) -> &PermissionLevels {
        &self.levels.current
    }

    pub fn maximum(&self) -> &PermissionLevels {
        &self.levels.maximum
    }

    pub fn levels(&self) -> &PermissionSet {
        &self.levels
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupLevels {
    maximum: PermissionLevel,
    default: PermissionLevel,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PermissionEntry {
    name: String,
    group: Option<GroupKind>,
}

fn never() -> PermissionLevel {
    PermissionLevel::Never
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DomainEntry {
    name: String,
    #[serde(default)]
    trusted: bool,
    #[serde(default = "never")]
    ungrouped: PermissionLevel,
    #[serde(default)]
    groups: BTreeMap<GroupKind, GroupLevels>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    unsigned_domain: Option<String>,
    #[serde(default)]
    permissions: Vec<PermissionEntry>,
    #[serde(default)]
    domains: Vec<DomainEntry>,
}

/// Process-wide, read-only permission tables.
#[derive(Debug, Clone)]
pub struct PermissionCatalog {
    permissions: Vec<String>,
    permission_groups: Vec<Option<GroupKind>>,
    groups: Vec<PermissionGroup>,
    domains: Vec<SecurityDomain>,
    unsigned_domain: String,
}

impl PermissionCatalog {
    /// Catalog from the policy shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(DEFAULT_POLICY).context("Built-in security policy is invalid")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read security policy {:?}", path))?;
        let catalog = Self::from_toml(&text)
            .with_context(|| format!("Invalid security policy {:?}", path))?;
        info!(
            "[PHASE: policy] [STEP: load] Security policy loaded (path={:?}, permissions={}, domains={})",
            path,
            catalog.len(),
            catalog.domains.len()
        );
        Ok(catalog)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(text).context("Failed to parse policy TOML")?;

        let mut seen = HashSet::new();
        for p in &file.permissions {
            if p.name.trim().is_empty() {
                anyhow::bail!("Permission with an empty name");
            }
            if !seen.insert(p.name.as_str()) {
                anyhow::bail!("Duplicate permission '{}'", p.name);
            }
        }

        let permissions: Vec<String> = file.permissions.iter().map(|p| p.name.clone()).collect();
        let permission_groups: Vec<Option<GroupKind>> =
            file.permissions.iter().map(|p| p.group).collect();
        let groups: Vec<PermissionGroup> = GroupKind::ALL
            .iter()
            .map(|&kind| PermissionGroup {
                kind,
                members: permission_groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| **g == Some(kind))
                    .map(|(id, _)| id)
                    .collect(),
            })
            .collect();

        let mut domains = Vec::new();
        let mut domain_names = HashSet::new();
        for entry in &file.domains {
            if !domain_names.insert(entry.name.as_str()) {
                anyhow::bail!("Duplicate domain '{}'", entry.name);
            }
            domains.push(build_domain(entry, &permission_groups)?);
        }
        if !domain_names.contains(MANUFACTURER_DOMAIN) {
            let all = PermissionLevels::filled(permissions.len(), PermissionLevel::Allow);
            domains.push(SecurityDomain {
                name: MANUFACTURER_DOMAIN.to_string(),
                trusted: true,
                levels: PermissionSet {
                    current: all.clone(),
                    maximum: all,
                },
            });
        }

        let unsigned_domain = file
            .unsigned_domain
            .unwrap_or_else(|| "unidentified".to_string());
        if !domains.iter().any(|d| d.name == unsigned_domain) {
            anyhow::bail!("Unsigned domain '{}' is not defined", unsigned_domain);
        }

        Ok(Self {
            permissions,
            permission_groups,
            groups,
            domains,
            unsigned_domain,
        })
    }

    /// Number of permissions; every level array has this length.
    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    pub fn permission_id(&self, name: &str) -> Option<usize> {
        self.permissions.iter().position(|p| p == name)
    }

    pub fn permission_name(&self, id: usize) -> Option<&str> {
        self.permissions.get(id).map(String::as_str)
    }

    pub fn permission_group(&self, id: usize) -> Option<GroupKind> {
        self.permission_groups.get(id).copied().flatten()
    }

    pub fn groups(&self) -> &[PermissionGroup] {
        &self.groups
    }

    pub fn group_members(&self, kind: GroupKind) -> &[usize] {
        self.groups
            .iter()
            .find(|g| g.kind == kind)
            .map(|g| g.members.as_slice())
            .unwrap_or(&[])
    }

    pub fn domains(&self) -> &[SecurityDomain] {
        &self.domains
    }

    pub fn domain(&self, name: &str) -> Option<&SecurityDomain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Unknown domains are untrusted.
    pub fn is_trusted(&self, name: &str) -> bool {
        self.domain(name).map(SecurityDomain::is_trusted).unwrap_or(false)
    }

    pub fn unsigned_domain(&self) -> &str {
        &self.unsigned_domain
    }

    /// Levels array of the catalog's length, all `Never`.
    pub fn empty_levels(&self) -> PermissionLevels {
        PermissionLevels::filled(self.len(), PermissionLevel::Never)
    }
}

fn build_domain(entry: &DomainEntry, permission_groups: &[Option<GroupKind>]) -> Result<SecurityDomain> {
    if entry.ungrouped.is_user_level() {
        anyhow::bail!(
            "Domain '{}': ungrouped level must be never or allow (found {})",
            entry.name,
            entry.ungrouped.as_str()
        );
    }
    for (kind, levels) in &entry.groups {
        validate_group_levels(&entry.name, *kind, levels)?;
    }

    let len = permission_groups.len();
    let mut current = PermissionLevels::filled(len, PermissionLevel::Never);
    let mut maximum = PermissionLevels::filled(len, PermissionLevel::Never);
    for (id, group) in permission_groups.iter().enumerate() {
        let (max, default) = match group {
            None => (entry.ungrouped, entry.ungrouped),
            Some(kind) => match entry.groups.get(kind) {
                Some(levels) => (levels.maximum, levels.default),
                None => (PermissionLevel::Never, PermissionLevel::Never),
            },
        };
        maximum.set(id, max);
        current.set(id, default);
    }

    Ok(SecurityDomain {
        name: entry.name.clone(),
        trusted: entry.trusted,
        levels: PermissionSet { current, maximum },
    })
}

fn validate_group_levels(domain: &str, kind: GroupKind, levels: &GroupLevels) -> Result<()> {
    match (levels.maximum.interaction_tier(), levels.default.interaction_tier()) {
        // Fixed grants: the default must be the same fixed grant.
        (None, _) if levels.default != levels.maximum => anyhow::bail!(
            "Domain '{}', group {}: default {} must equal fixed maximum {}",
            domain,
            kind.name(),
            levels.default.as_str(),
            levels.maximum.as_str()
        ),
        (None, _) => Ok(()),
        (Some(_), None) => anyhow::bail!(
            "Domain '{}', group {}: default {} is not a user level",
            domain,
            kind.name(),
            levels.default.as_str()
        ),
        (Some(max_tier), Some(default_tier)) if default_tier > max_tier => anyhow::bail!(
            "Domain '{}', group {}: default {} exceeds maximum {}",
            domain,
            kind.name(),
            levels.default.as_str(),
            levels.maximum.as_str()
        ),
        _ => Ok(()),
    }
}
