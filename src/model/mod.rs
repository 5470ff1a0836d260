//! Domain model for the release orchestration engine.
//!
//! Releases, their cron-job companions, per-stage tasks, regression
//! cycles, and staged build artifacts. All types are plain data with
//! serde derives; behaviour lives in the policy, coordinator, and
//! executor modules.

mod cron;
mod cycle;
mod release;
mod task;

pub use cron::{CronConfig, CronJob, CronStatus, RegressionSlot, StageStatus};
pub use cycle::{BuildArtifact, CycleStatus, RegressionCycle, StagedBuild};
pub use release::{Platform, PlatformTarget, Release, ReleaseId, ReleaseStatus, ReleaseType, TenantId};
pub use task::{
    ExecutionErrorKind, ReleaseStage, ReleaseTask, TaskErrorPayload, TaskOutput, TaskStatus,
    TaskType,
};
