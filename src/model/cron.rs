//! The cron-job companion record: stage state, feature toggles, upcoming
//! regression slots, and the cross-instance lock fields.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::release::ReleaseId;
use super::task::ReleaseStage;

/// Status of one release stage. Monotonic: Pending → InProgress → Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl StageStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Status of the recurring poll loop for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CronStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
}

/// Feature toggles controlling which optional tasks a release carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronConfig {
    pub kick_off_reminder: bool,
    pub pre_regression_builds: bool,
    pub test_flight_builds: bool,
    pub regression_reminder: bool,
    pub auto_ticket_updates: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            kick_off_reminder: true,
            pre_regression_builds: true,
            test_flight_builds: true,
            regression_reminder: true,
            auto_ticket_updates: true,
        }
    }
}

impl CronConfig {
    /// Enable or disable the kickoff reminder.
    pub fn with_kick_off_reminder(mut self, enabled: bool) -> Self {
        self.kick_off_reminder = enabled;
        self
    }

    /// Enable or disable pre-regression builds.
    pub fn with_pre_regression_builds(mut self, enabled: bool) -> Self {
        self.pre_regression_builds = enabled;
        self
    }

    /// Enable or disable TestFlight build verification.
    pub fn with_test_flight_builds(mut self, enabled: bool) -> Self {
        self.test_flight_builds = enabled;
        self
    }

    /// Enable or disable regression status reminders.
    pub fn with_regression_reminder(mut self, enabled: bool) -> Self {
        self.regression_reminder = enabled;
        self
    }

    /// Enable or disable automatic ticket updates.
    pub fn with_auto_ticket_updates(mut self, enabled: bool) -> Self {
        self.auto_ticket_updates = enabled;
        self
    }
}

/// A scheduled future regression round, with an optional config override
/// applied to the cycle it activates into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionSlot {
    pub id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<CronConfig>,
}

impl RegressionSlot {
    pub fn new(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scheduled_at,
            config: None,
        }
    }

    /// Override the cron config for the cycle this slot activates.
    pub fn with_config(mut self, config: CronConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// 1:1 companion to a Release: stage-state and locking record.
///
/// The lock fields (`locked_by`/`locked_at`/`lock_timeout_secs`) are the
/// only cross-instance mutable shared state in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub release_id: ReleaseId,
    pub stage1_status: StageStatus,
    pub stage2_status: StageStatus,
    pub stage3_status: StageStatus,
    pub cron_status: CronStatus,
    pub cron_config: CronConfig,
    /// Ordered (earliest first) scheduled regression slots.
    pub upcoming_regressions: Vec<RegressionSlot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_timeout_secs: i64,
    pub auto_transition_to_stage3: bool,
}

/// Default lease timeout. Bounds the outage window when a lock-holding
/// instance crashes without renewing.
pub(crate) const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 300;

impl CronJob {
    /// Create the companion record for a release.
    pub fn new(release_id: ReleaseId) -> Self {
        Self {
            id: Uuid::new_v4(),
            release_id,
            stage1_status: StageStatus::Pending,
            stage2_status: StageStatus::Pending,
            stage3_status: StageStatus::Pending,
            cron_status: CronStatus::Pending,
            cron_config: CronConfig::default(),
            upcoming_regressions: Vec::new(),
            locked_by: None,
            locked_at: None,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            auto_transition_to_stage3: false,
        }
    }

    /// Set the cron config.
    pub fn with_config(mut self, config: CronConfig) -> Self {
        self.cron_config = config;
        self
    }

    /// Enable automatic transition into stage 3 once stage 2 completes.
    pub fn with_auto_transition_to_stage3(mut self, enabled: bool) -> Self {
        self.auto_transition_to_stage3 = enabled;
        self
    }

    /// Set the lease timeout in seconds.
    pub fn with_lock_timeout_secs(mut self, secs: i64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Status of the given stage.
    pub fn stage_status(&self, stage: ReleaseStage) -> StageStatus {
        match stage {
            ReleaseStage::Kickoff => self.stage1_status,
            ReleaseStage::Regression => self.stage2_status,
            ReleaseStage::PostRegression => self.stage3_status,
        }
    }

    /// Set the status of the given stage.
    pub fn set_stage_status(&mut self, stage: ReleaseStage, status: StageStatus) {
        match stage {
            ReleaseStage::Kickoff => self.stage1_status = status,
            ReleaseStage::Regression => self.stage2_status = status,
            ReleaseStage::PostRegression => self.stage3_status = status,
        }
    }

    /// The stage currently in progress. Invariant: at most one.
    pub fn active_stage(&self) -> Option<ReleaseStage> {
        ReleaseStage::ALL
            .into_iter()
            .find(|stage| self.stage_status(*stage).is_in_progress())
    }

    /// Whether all three stages have completed.
    pub fn all_stages_completed(&self) -> bool {
        ReleaseStage::ALL
            .into_iter()
            .all(|stage| self.stage_status(stage).is_completed())
    }

    /// Whether the lease has gone stale and may be re-acquired by any
    /// instance.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(locked_at) => now - locked_at > Duration::seconds(self.lock_timeout_secs),
            None => true,
        }
    }

    /// Whether the given holder currently owns a live lease.
    pub fn lock_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.locked_by.as_deref() == Some(holder) && !self.lock_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_stage_tracks_first_in_progress() {
        let mut job = CronJob::new(Uuid::new_v4());
        assert_eq!(job.active_stage(), None);

        job.set_stage_status(ReleaseStage::Kickoff, StageStatus::InProgress);
        assert_eq!(job.active_stage(), Some(ReleaseStage::Kickoff));

        job.set_stage_status(ReleaseStage::Kickoff, StageStatus::Completed);
        job.set_stage_status(ReleaseStage::Regression, StageStatus::InProgress);
        assert_eq!(job.active_stage(), Some(ReleaseStage::Regression));
    }

    #[test]
    fn lock_expiry_respects_timeout() {
        let now = Utc::now();
        let mut job = CronJob::new(Uuid::new_v4()).with_lock_timeout_secs(60);

        // No lock at all counts as expired (acquirable).
        assert!(job.lock_expired(now));

        job.locked_by = Some("instance-a".to_string());
        job.locked_at = Some(now);
        assert!(!job.lock_expired(now + Duration::seconds(59)));
        assert!(job.lock_expired(now + Duration::seconds(61)));
    }

    #[test]
    fn lock_held_by_requires_live_lease() {
        let now = Utc::now();
        let mut job = CronJob::new(Uuid::new_v4()).with_lock_timeout_secs(60);
        job.locked_by = Some("instance-a".to_string());
        job.locked_at = Some(now);

        assert!(job.lock_held_by("instance-a", now));
        assert!(!job.lock_held_by("instance-b", now));
        assert!(!job.lock_held_by("instance-a", now + Duration::seconds(120)));
    }

    #[test]
    fn all_stages_completed_only_at_the_end() {
        let mut job = CronJob::new(Uuid::new_v4());
        assert!(!job.all_stages_completed());
        for stage in ReleaseStage::ALL {
            job.set_stage_status(stage, StageStatus::Completed);
        }
        assert!(job.all_stages_completed());
    }
}
