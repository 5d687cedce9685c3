// Permission policy engine: initial grants, group level changes and upgrade migration.

use super::permissions::{
    GroupKind, PermissionCatalog, PermissionLevel, PermissionLevels, PermissionSet,
};
use crate::error::{InstallError, InstallErrorKind};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown security domain '{0}'")]
    UnknownDomain(String),
    #[error("unknown permission '{0}'")]
    UnknownPermission(String),
    #[error("permission '{0}' is not granted by the security domain")]
    AuthorizationFailure(String),
    #[error("permission list contains an empty entry")]
    InvalidPermissionList,
    #[error("{} cannot be blanket-granted while {} is blanket-granted", .group.name(), .other)]
    MutuallyExclusive { group: GroupKind, other: String },
}

impl From<PolicyError> for InstallError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::InvalidPermissionList => {
                InstallError::with_detail(InstallErrorKind::InvalidValue, e.to_string())
            }
            PolicyError::UnknownDomain(ref d) => {
                InstallError::with_detail(InstallErrorKind::AuthorizationFailure, d.clone())
            }
            PolicyError::UnknownPermission(ref p) | PolicyError::AuthorizationFailure(ref p) => {
                InstallError::with_detail(InstallErrorKind::AuthorizationFailure, p.clone())
            }
            PolicyError::MutuallyExclusive { .. } => {
                InstallError::with_detail(InstallErrorKind::AuthorizationFailure, e.to_string())
            }
        }
    }
}

/// Group pairs that may not both be blanket-granted. Push interrupt is checked separately
/// because it is not a permission group.
const EXCLUSIVE_PAIRS: [(GroupKind, GroupKind); 5] = [
    (GroupKind::NetAccess, GroupKind::ApplicationAutoInvocation),
    (GroupKind::NetAccess, GroupKind::ReadUserDataAccess),
    (GroupKind::NetAccess, GroupKind::MultimediaRecording),
    (GroupKind::LocalConnectivity, GroupKind::ReadUserDataAccess),
    (GroupKind::LocalConnectivity, GroupKind::MultimediaRecording),
];

fn is_blanket(level: PermissionLevel) -> bool {
    matches!(level, PermissionLevel::Blanket | PermissionLevel::BlanketGranted)
}

fn split_permission_list(list: Option<&str>) -> Result<Vec<&str>, PolicyError> {
    let Some(list) = list.map(str::trim).filter(|l| !l.is_empty()) else {
        return Ok(Vec::new());
    };
    list.split(',')
        .map(str::trim)
        .map(|name| {
            if name.is_empty() {
                Err(PolicyError::InvalidPermissionList)
            } else {
                Ok(name)
            }
        })
        .collect()
}

pub struct PermissionPolicyEngine {
    catalog: Arc<PermissionCatalog>,
}

impl PermissionPolicyEngine {
    pub fn new(catalog: Arc<PermissionCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    /// A domain's own current and maximum levels, for suites that receive them wholesale.
    pub fn domain_levels(&self, domain: &str) -> Result<PermissionSet, PolicyError> {
        self.catalog
            .domain(domain)
            .map(|d| d.levels().clone())
            .ok_or_else(|| PolicyError::UnknownDomain(domain.to_string()))
    }

    /// Levels for a suite bound to `domain` that requests the comma-separated `required` and
    /// `optional` permission lists.
    ///
    /// A required permission that is unknown or denied by the domain fails the whole
    /// computation; an optional one is skipped. Granted permissions get the domain's current
    /// level; everything else stays `Never`.
    pub fn initial_permissions(
        &self,
        domain: &str,
        required: Option<&str>,
        optional: Option<&str>,
    ) -> Result<PermissionSet, PolicyError> {
        let domain_def = self
            .catalog
            .domain(domain)
            .ok_or_else(|| PolicyError::UnknownDomain(domain.to_string()))?;

        let mut set = PermissionSet {
            current: self.catalog.empty_levels(),
            maximum: self.catalog.empty_levels(),
        };

        for (names, is_required) in [(required, true), (optional, false)] {
            for name in split_permission_list(names)? {
                let Some(id) = self.catalog.permission_id(name) else {
                    if is_required {
                        return Err(PolicyError::UnknownPermission(name.to_string()));
                    }
                    debug!(
                        "[PHASE: policy] [STEP: initial] Skipping unknown optional permission (permission={})",
                        name
                    );
                    continue;
                };
                let current = domain_def.current().get(id);
                if current == PermissionLevel::Never {
                    if is_required {
                        return Err(PolicyError::AuthorizationFailure(name.to_string()));
                    }
                    debug!(
                        "[PHASE: policy] [STEP: initial] Skipping denied optional permission (permission={}, domain={})",
                        name, domain
                    );
                    continue;
                }
                set.current.set(id, current);
                set.maximum.set(id, domain_def.maximum().get(id));
            }
        }

        info!(
            "[PHASE: policy] [STEP: initial] Initial permissions computed (domain={}, granted={})",
            domain,
            set.current
                .as_slice()
                .iter()
                .filter(|l| **l != PermissionLevel::Never)
                .count()
        );
        Ok(set)
    }

    /// Effective level of a group: the lowest-coded level among its members that is not `Never`.
    pub fn group_level(&self, levels: &PermissionLevels, group: GroupKind) -> PermissionLevel {
        self.catalog
            .group_members(group)
            .iter()
            .map(|&id| levels.get(id))
            .filter(|l| *l != PermissionLevel::Never)
            .min_by_key(|l| l.code())
            .unwrap_or(PermissionLevel::Never)
    }

    fn check_mutual_exclusion(
        &self,
        levels: &PermissionLevels,
        push_interrupt: PermissionLevel,
        group: GroupKind,
        new_level: PermissionLevel,
    ) -> Result<(), PolicyError> {
        if new_level != PermissionLevel::BlanketGranted {
            return Ok(());
        }
        if group == GroupKind::NetAccess && is_blanket(push_interrupt) {
            return Err(PolicyError::MutuallyExclusive {
                group,
                other: "push_interrupt".to_string(),
            });
        }
        for (a, b) in EXCLUSIVE_PAIRS {
            let other = if group == a {
                b
            } else if group == b {
                a
            } else {
                continue;
            };
            if is_blanket(self.group_level(levels, other)) {
                return Err(PolicyError::MutuallyExclusive {
                    group,
                    other: other.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Set every user-adjustable member of `group` to `new_level`.
    ///
    /// Mutual exclusion is checked before anything changes: on conflict `levels` is untouched.
    /// Send-messaging and read-messaging are kept in lockstep.
    pub fn set_group_level(
        &self,
        levels: &mut PermissionLevels,
        push_interrupt: PermissionLevel,
        group: GroupKind,
        new_level: PermissionLevel,
    ) -> Result<(), PolicyError> {
        if let Err(e) = self.check_mutual_exclusion(levels, push_interrupt, group, new_level) {
            warn!(
                "[PHASE: policy] [STEP: set_group] Rejected group level change (group={}, level={}, err={})",
                group.name(),
                new_level.as_str(),
                e
            );
            return Err(e);
        }

        self.apply_to_group(levels, group, new_level);
        match group {
            GroupKind::Messaging if new_level != PermissionLevel::BlanketDenied => {
                self.apply_to_group(levels, GroupKind::ReadMessaging, PermissionLevel::BlanketGranted);
            }
            GroupKind::ReadMessaging if new_level == PermissionLevel::BlanketDenied => {
                self.apply_to_group(levels, GroupKind::Messaging, PermissionLevel::BlanketDenied);
            }
            _ => {}
        }

        debug!(
            "[PHASE: policy] [STEP: set_group] Group level changed (group={}, level={})",
            group.name(),
            new_level.as_str()
        );
        Ok(())
    }

    fn apply_to_group(&self, levels: &mut PermissionLevels, group: GroupKind, level: PermissionLevel) {
        for &id in self.catalog.group_members(group) {
            if levels.get(id).is_user_level() {
                levels.set(id, level);
            }
        }
    }

    /// Push interrupts may not be blanket-granted while net access is.
    pub fn check_push_interrupt_level(
        &self,
        levels: &PermissionLevels,
        push_interrupt: PermissionLevel,
    ) -> Result<(), PolicyError> {
        if is_blanket(push_interrupt)
            && is_blanket(self.group_level(levels, GroupKind::NetAccess))
        {
            return Err(PolicyError::MutuallyExclusive {
                group: GroupKind::NetAccess,
                other: "push_interrupt".to_string(),
            });
        }
        Ok(())
    }
}

/// Carry user-chosen levels from the previous version of a suite into `next`.
///
/// Fixed grants (`Never`/`Allow`) on either side are left alone. A prior user level is carried
/// only when the new domain's maximum allows the same or a higher interaction tier.
pub fn apply_prior_user_levels(
    prior: &PermissionLevels,
    new_maximum: &PermissionLevels,
    next: &mut PermissionLevels,
) {
    let len = prior.len().min(next.len());
    for id in 0..len {
        let Some(prior_tier) = prior.get(id).interaction_tier() else {
            continue;
        };
        let Some(max_tier) = new_maximum.get(id).interaction_tier() else {
            continue;
        };
        if prior_tier <= max_tier {
            next.set(id, prior.get(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PermissionLevel::*;

    fn engine() -> PermissionPolicyEngine {
        PermissionPolicyEngine::new(Arc::new(PermissionCatalog::builtin().unwrap()))
    }

    fn id(engine: &PermissionPolicyEngine, name: &str) -> usize {
        engine.catalog().permission_id(name).unwrap()
    }

    /// Levels where every grouped permission is `level`.
    fn uniform(engine: &PermissionPolicyEngine, level: PermissionLevel) -> PermissionLevels {
        let mut levels = engine.catalog().empty_levels();
        for g in engine.catalog().groups() {
            for &m in &g.members {
                levels.set(m, level);
            }
        }
        levels
    }

    fn set_group(engine: &PermissionPolicyEngine, levels: &mut PermissionLevels, group: GroupKind, level: PermissionLevel) {
        for &m in engine.catalog().group_members(group) {
            levels.set(m, level);
        }
    }

    #[test]
    fn required_permissions_must_be_granted() {
        let e = engine();
        let set = e
            .initial_permissions(
                "identified",
                Some("javax.microedition.io.Connector.http, javax.microedition.io.PushRegistry"),
                None,
            )
            .unwrap();
        let http = id(&e, "javax.microedition.io.Connector.http");
        let push = id(&e, "javax.microedition.io.PushRegistry");
        let socket = id(&e, "javax.microedition.io.Connector.socket");
        assert_eq!(set.current.get(http), Session, "current level, not maximum");
        assert_eq!(set.maximum.get(http), Blanket);
        assert_eq!(set.current.get(push), Session);
        assert_eq!(set.current.get(socket), Never, "unrequested stays never");
        assert_eq!(set.current.len(), e.catalog().len());

        let err = e
            .initial_permissions("minimum", Some("javax.microedition.io.Connector.http"), None)
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::AuthorizationFailure("javax.microedition.io.Connector.http".to_string())
        );

        let err = e
            .initial_permissions("identified", Some("com.example.Unknown"), None)
            .unwrap_err();
        assert_eq!(err, PolicyError::UnknownPermission("com.example.Unknown".to_string()));
    }

    #[test]
    fn optional_permissions_are_skipped_when_unavailable() {
        let e = engine();
        let set = e
            .initial_permissions(
                "unidentified",
                None,
                Some("com.example.Unknown, com.sun.midp.ams, javax.microedition.io.Connector.http"),
            )
            .unwrap();
        assert_eq!(set.current.get(id(&e, "com.sun.midp.ams")), Never);
        assert_eq!(
            set.current.get(id(&e, "javax.microedition.io.Connector.http")),
            Oneshot
        );
    }

    #[test]
    fn empty_list_entries_are_rejected() {
        let e = engine();
        let err = e
            .initial_permissions("identified", Some("javax.microedition.io.Connector.http,,"), None)
            .unwrap_err();
        assert_eq!(err, PolicyError::InvalidPermissionList);
        assert!(e.initial_permissions("identified", Some("  "), None).is_ok());
    }

    #[test]
    fn unknown_domain_is_rejected() {
        let err = engine().initial_permissions("nowhere", None, None).unwrap_err();
        assert_eq!(err, PolicyError::UnknownDomain("nowhere".to_string()));
    }

    #[test]
    fn net_access_blanket_grant_conflicts_with_blanket_push_interrupt() {
        let e = engine();
        let mut levels = uniform(&e, Session);
        let before = levels.clone();

        let err = e
            .set_group_level(&mut levels, BlanketGranted, GroupKind::NetAccess, BlanketGranted)
            .unwrap_err();
        assert!(matches!(err, PolicyError::MutuallyExclusive { group: GroupKind::NetAccess, .. }));
        assert_eq!(levels, before, "no level may change on conflict");
    }

    #[test]
    fn exclusive_pairs_are_checked_from_both_sides() {
        let e = engine();
        for (a, b) in EXCLUSIVE_PAIRS {
            for (setting, existing) in [(a, b), (b, a)] {
                let mut levels = uniform(&e, Session);
                set_group(&e, &mut levels, existing, Blanket);
                let before = levels.clone();
                let result = e.set_group_level(&mut levels, Session, setting, BlanketGranted);
                assert!(
                    result.is_err(),
                    "{} should conflict with blanket {}",
                    setting.name(),
                    existing.name()
                );
                assert_eq!(levels, before);
            }
        }
    }

    #[test]
    fn non_exclusive_change_updates_only_user_levels() {
        let e = engine();
        let mut levels = uniform(&e, Session);
        let http = id(&e, "javax.microedition.io.Connector.http");
        let https = id(&e, "javax.microedition.io.Connector.https");
        levels.set(https, Allow);

        e.set_group_level(&mut levels, Session, GroupKind::NetAccess, BlanketGranted)
            .unwrap();
        assert_eq!(levels.get(http), BlanketGranted);
        assert_eq!(levels.get(https), Allow, "fixed grants are not user adjustable");
    }

    #[test]
    fn lower_levels_never_conflict() {
        let e = engine();
        let mut levels = uniform(&e, BlanketGranted);
        e.set_group_level(&mut levels, BlanketGranted, GroupKind::NetAccess, Session)
            .unwrap();
        assert_eq!(e.group_level(&levels, GroupKind::NetAccess), Session);
    }

    #[test]
    fn messaging_groups_move_in_lockstep() {
        let e = engine();
        let mut levels = uniform(&e, Oneshot);
        let sms_send = id(&e, "javax.wireless.messaging.sms.send");
        let sms_receive = id(&e, "javax.wireless.messaging.sms.receive");

        e.set_group_level(&mut levels, Session, GroupKind::Messaging, Session)
            .unwrap();
        assert_eq!(levels.get(sms_send), Session);
        assert_eq!(levels.get(sms_receive), BlanketGranted);

        e.set_group_level(&mut levels, Session, GroupKind::ReadMessaging, BlanketDenied)
            .unwrap();
        assert_eq!(levels.get(sms_receive), BlanketDenied);
        assert_eq!(levels.get(sms_send), BlanketDenied);
    }

    #[test]
    fn push_interrupt_check_considers_net_access() {
        let e = engine();
        let mut levels = uniform(&e, Session);
        assert!(e.check_push_interrupt_level(&levels, BlanketGranted).is_ok());
        set_group(&e, &mut levels, GroupKind::NetAccess, BlanketGranted);
        assert!(e.check_push_interrupt_level(&levels, BlanketGranted).is_err());
        assert!(e.check_push_interrupt_level(&levels, Session).is_ok());
        assert!(e.check_push_interrupt_level(&levels, Blanket).is_err());
    }

    #[test]
    fn group_level_picks_lowest_non_never_code() {
        let e = engine();
        let mut levels = e.catalog().empty_levels();
        assert_eq!(e.group_level(&levels, GroupKind::NetAccess), Never);
        levels.set(id(&e, "javax.microedition.io.Connector.http"), Oneshot);
        levels.set(id(&e, "javax.microedition.io.Connector.https"), Session);
        assert_eq!(e.group_level(&levels, GroupKind::NetAccess), Session);
    }

    #[test]
    fn prior_user_levels_carry_only_within_new_maximum() {
        let prior = PermissionLevels::from_vec(vec![Allow, Session, Blanket, Session, Oneshot, BlanketDenied, Never]);
        let new_max = PermissionLevels::from_vec(vec![Blanket, Oneshot, Session, Blanket, Allow, Oneshot, Blanket]);
        let mut next = PermissionLevels::from_vec(vec![Oneshot; 7]);

        apply_prior_user_levels(&prior, &new_max, &mut next);

        assert_eq!(
            next.as_slice(),
            &[
                Oneshot,       // prior fixed grant: untouched
                Oneshot,       // session does not fit a one-shot maximum
                Oneshot,       // blanket does not fit a session maximum
                Session,       // session fits a blanket maximum
                Oneshot,       // new maximum is a fixed grant: untouched
                BlanketDenied, // denial always carries
                Oneshot,       // prior never: untouched
            ]
        );
    }

    #[test]
    fn policy_errors_map_to_authorization_failure() {
        let err: InstallError = PolicyError::AuthorizationFailure("x".to_string()).into();
        assert_eq!(err.kind(), InstallErrorKind::AuthorizationFailure);
        assert_eq!(
            err.status(),
            Some(crate::notifier::OtaStatus::AuthorizationFailure)
        );
        let err: InstallError = PolicyError::InvalidPermissionList.into();
        assert_eq!(err.kind(), InstallErrorKind::InvalidValue);
    }
}
