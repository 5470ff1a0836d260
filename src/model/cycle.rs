//! Regression cycles and staged build artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cron::CronConfig;
use super::release::{Platform, ReleaseId, TenantId};

/// Status of one regression round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    #[default]
    NotStarted,
    InProgress,
    Done,
    Abandoned,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::InProgress)
    }
}

/// One execution round of the regression stage.
///
/// Superseded cycles keep their rows for audit; only the newest carries
/// `is_latest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionCycle {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub release_id: ReleaseId,
    /// Human-facing round tag, e.g. "RC1".
    pub cycle_tag: String,
    pub status: CycleStatus,
    pub is_latest: bool,
    /// Config override carried over from the slot that activated this
    /// cycle; `None` means the release's cron config applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<CronConfig>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RegressionCycle {
    /// Create an in-progress cycle (cycles are created at activation).
    pub fn new(
        tenant_id: TenantId,
        release_id: ReleaseId,
        cycle_tag: &str,
        config: Option<CronConfig>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            release_id,
            cycle_tag: cycle_tag.to_string(),
            status: CycleStatus::InProgress,
            is_latest: true,
            config,
            created_at: now,
            completed_at: None,
        }
    }
}

/// A build artifact reference, as recorded on the task that consumed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub platform: Platform,
    /// Artifact path or store-verification token.
    pub artifact_ref: String,
}

/// Artifact metadata staged per platform ahead of consumption.
///
/// Consumption is a move, not a copy: `consumed` flips once, after which
/// the consuming task's `builds` output is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedBuild {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub release_id: ReleaseId,
    pub platform: Platform,
    pub artifact_ref: String,
    pub consumed: bool,
    /// Task that consumed this build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_by: Option<Uuid>,
    pub staged_at: DateTime<Utc>,
}

impl StagedBuild {
    pub fn new(
        tenant_id: TenantId,
        release_id: ReleaseId,
        platform: Platform,
        artifact_ref: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            release_id,
            platform,
            artifact_ref: artifact_ref.to_string(),
            consumed: false,
            consumed_by: None,
            staged_at: now,
        }
    }

    /// The artifact reference as recorded on a consuming task.
    pub fn artifact(&self) -> BuildArtifact {
        BuildArtifact {
            platform: self.platform,
            artifact_ref: self.artifact_ref.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cycle_starts_in_progress_and_latest() {
        let cycle = RegressionCycle::new(Uuid::new_v4(), Uuid::new_v4(), "RC1", None, Utc::now());
        assert_eq!(cycle.status, CycleStatus::InProgress);
        assert!(cycle.is_latest);
        assert!(cycle.completed_at.is_none());
    }

    #[test]
    fn cycle_terminal_states() {
        assert!(CycleStatus::Done.is_terminal());
        assert!(CycleStatus::Abandoned.is_terminal());
        assert!(!CycleStatus::InProgress.is_terminal());
        assert!(!CycleStatus::NotStarted.is_terminal());
    }
}
