// Record store retention across upgrades.

use crate::location::same_scheme_host_path;
use crate::storage::InstalledSuite;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmsDecision {
    Retain,
    Discard,
    /// Neither signer nor location proves continuity; the user decides (discard without a listener).
    AskUser,
}

/// Decides what happens to the previous version's record stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmsRetentionPolicy {
    pub remove_rms: bool,
}

impl RmsRetentionPolicy {
    pub fn new(remove_rms: bool) -> Self {
        Self { remove_rms }
    }

    pub fn decide(
        &self,
        previous: &InstalledSuite,
        has_records: bool,
        new_auth_path: &[String],
        new_jad_url: Option<&str>,
        new_jar_url: &str,
    ) -> RmsDecision {
        let decision = if self.remove_rms {
            RmsDecision::Discard
        } else if !has_records {
            RmsDecision::Retain
        } else if !new_auth_path.is_empty() && new_auth_path == previous.auth_path.as_slice() {
            RmsDecision::Retain
        } else if same_location(previous, new_jad_url, new_jar_url) {
            RmsDecision::Retain
        } else {
            RmsDecision::AskUser
        };
        debug!(
            "[PHASE: rms] [STEP: decide] Record store decision (suite_id={}, remove_rms={}, has_records={}, decision={:?})",
            previous.id, self.remove_rms, has_records, decision
        );
        decision
    }
}

fn same_location(previous: &InstalledSuite, new_jad_url: Option<&str>, new_jar_url: &str) -> bool {
    match (new_jad_url, previous.descriptor_url.as_deref()) {
        (Some(new), Some(old)) => same_scheme_host_path(new, old),
        (Some(_), None) => false,
        (None, _) => same_scheme_host_path(new_jar_url, &previous.archive_url),
    }
}
