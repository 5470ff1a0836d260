//! Repository contracts for persisted orchestration state.
//!
//! Persistence itself is an external collaborator; the engine sees only
//! these narrow async contracts. `memory` provides the in-process
//! adapters used by tests and local runs.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RepositoryError;
use crate::model::{
    CronJob, RegressionCycle, Release, ReleaseId, ReleaseStage, ReleaseTask, StagedBuild,
};

pub use memory::{
    InMemoryActivityLog, InMemoryBuildRepository, InMemoryCronJobRepository,
    InMemoryCycleRepository, InMemoryReleaseRepository, InMemoryTaskRepository,
};

/// Access to release records.
#[async_trait]
pub trait ReleaseRepository: Send + Sync {
    async fn get(&self, id: ReleaseId) -> Result<Option<Release>, RepositoryError>;
    async fn create(&self, release: Release) -> Result<Release, RepositoryError>;
    async fn update(&self, release: Release) -> Result<Release, RepositoryError>;
}

/// Access to cron-job records, including the lease operations.
#[async_trait]
pub trait CronJobRepository: Send + Sync {
    async fn get_by_release(&self, release_id: ReleaseId)
        -> Result<Option<CronJob>, RepositoryError>;

    async fn create(&self, job: CronJob) -> Result<CronJob, RepositoryError>;

    async fn update(&self, job: CronJob) -> Result<CronJob, RepositoryError>;

    /// Compare-and-set lease acquisition. Succeeds (returning the fresh
    /// row) when the lock is free, already held by `holder`, or expired;
    /// returns `None` when another instance holds a live lease.
    async fn try_acquire_lock(
        &self,
        release_id: ReleaseId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CronJob>, RepositoryError>;

    /// Drop the lease if `holder` owns it. No-op otherwise.
    async fn release_lock(
        &self,
        release_id: ReleaseId,
        holder: &str,
    ) -> Result<(), RepositoryError>;
}

/// Access to release tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ReleaseTask>, RepositoryError>;

    /// Tasks for a (release, stage) scope. Regression tasks are further
    /// scoped by cycle: `regression_id` must match exactly.
    async fn get_by_release_and_stage(
        &self,
        release_id: ReleaseId,
        stage: ReleaseStage,
        regression_id: Option<Uuid>,
    ) -> Result<Vec<ReleaseTask>, RepositoryError>;

    /// Create a task. Fails with `RepositoryError::Duplicate` when a task
    /// with the same (release, stage, cycle, type) already exists — the
    /// uniqueness guard idempotent creation leans on.
    async fn create(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError>;

    async fn update(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError>;
}

/// Access to regression-cycle records.
#[async_trait]
pub trait CycleRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<RegressionCycle>, RepositoryError>;

    async fn get_by_release(
        &self,
        release_id: ReleaseId,
    ) -> Result<Vec<RegressionCycle>, RepositoryError>;

    async fn create(&self, cycle: RegressionCycle) -> Result<RegressionCycle, RepositoryError>;

    async fn update(&self, cycle: RegressionCycle) -> Result<RegressionCycle, RepositoryError>;
}

/// Access to staged build artifacts.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Unconsumed staged builds for a release.
    async fn staged(&self, release_id: ReleaseId) -> Result<Vec<StagedBuild>, RepositoryError>;

    async fn stage(&self, build: StagedBuild) -> Result<StagedBuild, RepositoryError>;

    /// Mark a staged build consumed by a task. Consumption is a move: a
    /// second attempt fails with `Duplicate`.
    async fn mark_consumed(
        &self,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<StagedBuild, RepositoryError>;
}

/// What changed in an activity-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    TaskStatusChanged,
    StageStatusChanged,
    CronStatusChanged,
    CycleStatusChanged,
    TaskRetried,
}

/// Audit record: previous value → new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub release_id: ReleaseId,
    /// Account that triggered the change; `None` for engine-driven
    /// transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    pub at: DateTime<Utc>,
    pub kind: ActivityKind,
    pub previous: serde_json::Value,
    pub next: serde_json::Value,
}

impl ActivityEntry {
    pub fn new(
        release_id: ReleaseId,
        account_id: Option<Uuid>,
        at: DateTime<Utc>,
        kind: ActivityKind,
        previous: impl Serialize,
        next: impl Serialize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            release_id,
            account_id,
            at,
            kind,
            previous: serde_json::to_value(previous).unwrap_or(serde_json::Value::Null),
            next: serde_json::to_value(next).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Sink for audit entries.
#[async_trait]
pub trait ActivityLogSink: Send + Sync {
    async fn record(&self, entry: ActivityEntry) -> Result<(), RepositoryError>;
}
