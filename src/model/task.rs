//! Release tasks: the unit of orchestrated work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cycle::BuildArtifact;
use super::release::{ReleaseId, TenantId};

/// The three sequential release stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStage {
    Kickoff,
    Regression,
    PostRegression,
}

impl ReleaseStage {
    /// All stages in execution order.
    pub const ALL: [Self; 3] = [Self::Kickoff, Self::Regression, Self::PostRegression];

    /// The stage after this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Kickoff => Some(Self::Regression),
            Self::Regression => Some(Self::PostRegression),
            Self::PostRegression => None,
        }
    }
}

/// Execution status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Check if the task completed successfully.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Closed set of task kinds the engine can execute.
///
/// Every kind belongs to exactly one stage (`stage()`), and check-type
/// kinds name the trigger task whose external reference they poll
/// (`trigger_counterpart()`). Adding a variant without wiring it into the
/// strategy table fails to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    // Kickoff
    CreateReleaseBranch,
    CreateProjectManagementTicket,
    CreateTestManagementPlan,
    SendKickoffReminder,
    TriggerPreRegressionBuilds,
    CheckPreRegressionBuilds,
    NotifyKickoffComplete,
    // Regression (scoped to a cycle)
    TriggerRegressionBuilds,
    CreateRegressionTestRuns,
    CheckRegressionTestRuns,
    NotifyRegressionStatus,
    // Post-regression
    TriggerTestFlightBuild,
    CheckTestFlightBuild,
    TriggerReleaseCandidateBuilds,
    CheckReleaseCandidateBuilds,
    CreateReleaseTag,
    CloseProjectManagementTicket,
    NotifyReleaseReady,
}

impl TaskType {
    /// All task kinds.
    pub const ALL: [Self; 18] = [
        Self::CreateReleaseBranch,
        Self::CreateProjectManagementTicket,
        Self::CreateTestManagementPlan,
        Self::SendKickoffReminder,
        Self::TriggerPreRegressionBuilds,
        Self::CheckPreRegressionBuilds,
        Self::NotifyKickoffComplete,
        Self::TriggerRegressionBuilds,
        Self::CreateRegressionTestRuns,
        Self::CheckRegressionTestRuns,
        Self::NotifyRegressionStatus,
        Self::TriggerTestFlightBuild,
        Self::CheckTestFlightBuild,
        Self::TriggerReleaseCandidateBuilds,
        Self::CheckReleaseCandidateBuilds,
        Self::CreateReleaseTag,
        Self::CloseProjectManagementTicket,
        Self::NotifyReleaseReady,
    ];

    /// The stage this task kind belongs to.
    pub fn stage(self) -> ReleaseStage {
        match self {
            Self::CreateReleaseBranch
            | Self::CreateProjectManagementTicket
            | Self::CreateTestManagementPlan
            | Self::SendKickoffReminder
            | Self::TriggerPreRegressionBuilds
            | Self::CheckPreRegressionBuilds
            | Self::NotifyKickoffComplete => ReleaseStage::Kickoff,
            Self::TriggerRegressionBuilds
            | Self::CreateRegressionTestRuns
            | Self::CheckRegressionTestRuns
            | Self::NotifyRegressionStatus => ReleaseStage::Regression,
            Self::TriggerTestFlightBuild
            | Self::CheckTestFlightBuild
            | Self::TriggerReleaseCandidateBuilds
            | Self::CheckReleaseCandidateBuilds
            | Self::CreateReleaseTag
            | Self::CloseProjectManagementTicket
            | Self::NotifyReleaseReady => ReleaseStage::PostRegression,
        }
    }

    /// For check-type tasks, the trigger task whose external reference
    /// this task polls.
    pub fn trigger_counterpart(self) -> Option<Self> {
        match self {
            Self::CheckPreRegressionBuilds => Some(Self::TriggerPreRegressionBuilds),
            Self::CheckRegressionTestRuns => Some(Self::CreateRegressionTestRuns),
            Self::CheckTestFlightBuild => Some(Self::TriggerTestFlightBuild),
            Self::CheckReleaseCandidateBuilds => Some(Self::TriggerReleaseCandidateBuilds),
            _ => None,
        }
    }
}

/// Classification of an execution failure, persisted with the task so the
/// UI can tell "not configured" apart from "failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Network/timeout/5xx class — retryable.
    Transient,
    /// The enabling integration is absent.
    NotConfigured,
    /// A precondition on task state or inputs was not met.
    Precondition,
    /// The provider reported a terminal failure.
    Provider,
}

/// Error payload recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorPayload {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

/// Output recorded by the executor on task completion (or failure).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorPayload>,
    /// Builds consumed by this task. Once set, this is the authoritative
    /// record of the artifacts (the staging rows are marked used).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builds: Vec<BuildArtifact>,
    /// Provider-specific extras.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl TaskOutput {
    /// Output carrying only a human-readable message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach consumed build artifacts.
    pub fn with_builds(mut self, builds: Vec<BuildArtifact>) -> Self {
        self.builds = builds;
        self
    }
}

/// One unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTask {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub release_id: ReleaseId,
    pub stage: ReleaseStage,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Back-reference to the regression cycle owning this task, for
    /// regression-stage tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression_id: Option<Uuid>,
    /// Reference id in the external system, once triggered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Raw provider response payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_data: Option<serde_json::Value>,
    pub output: TaskOutput,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseTask {
    /// Create a pending task for a stage (optionally scoped to a cycle).
    pub fn new(
        tenant_id: TenantId,
        release_id: ReleaseId,
        stage: ReleaseStage,
        task_type: TaskType,
        regression_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            release_id,
            stage,
            task_type,
            status: TaskStatus::Pending,
            regression_id,
            external_id: None,
            external_data: None,
            output: TaskOutput::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_task_type_belongs_to_its_stage_table() {
        for task_type in TaskType::ALL {
            // stage() must agree with membership of ALL; the canonical
            // order tables in the policy module are checked separately.
            let stage = task_type.stage();
            assert!(ReleaseStage::ALL.contains(&stage));
        }
    }

    #[test]
    fn check_tasks_pair_with_triggers_in_the_same_stage() {
        for task_type in TaskType::ALL {
            if let Some(trigger) = task_type.trigger_counterpart() {
                assert_eq!(trigger.stage(), task_type.stage());
            }
        }
    }

    #[test]
    fn stage_order_is_linear() {
        assert_eq!(ReleaseStage::Kickoff.next(), Some(ReleaseStage::Regression));
        assert_eq!(
            ReleaseStage::Regression.next(),
            Some(ReleaseStage::PostRegression)
        );
        assert_eq!(ReleaseStage::PostRegression.next(), None);
    }

    #[test]
    fn task_output_round_trips_through_json() {
        let mut output = TaskOutput::message("ticket created");
        output
            .data
            .insert("key".to_string(), serde_json::json!("REL-421"));

        let json = serde_json::to_string(&output).unwrap();
        let back: TaskOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }
}
