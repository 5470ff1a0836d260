//! In-memory repository adapters for tests and local runs.
//!
//! These enforce the same contracts a database-backed adapter would: the
//! task uniqueness guard, compare-and-set lease acquisition, and
//! consume-once build staging.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ActivityEntry, ActivityLogSink, BuildRepository, CronJobRepository, CycleRepository,
    ReleaseRepository, TaskRepository,
};
use crate::errors::RepositoryError;
use crate::model::{
    CronJob, RegressionCycle, Release, ReleaseId, ReleaseStage, ReleaseTask, StagedBuild,
};

/// In-memory release store.
#[derive(Default)]
pub struct InMemoryReleaseRepository {
    releases: RwLock<HashMap<ReleaseId, Release>>,
}

impl InMemoryReleaseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseRepository for InMemoryReleaseRepository {
    async fn get(&self, id: ReleaseId) -> Result<Option<Release>, RepositoryError> {
        Ok(self.releases.read().await.get(&id).cloned())
    }

    async fn create(&self, release: Release) -> Result<Release, RepositoryError> {
        let mut releases = self.releases.write().await;
        if releases.contains_key(&release.id) {
            return Err(RepositoryError::Duplicate {
                constraint: "release_id",
            });
        }
        releases.insert(release.id, release.clone());
        Ok(release)
    }

    async fn update(&self, release: Release) -> Result<Release, RepositoryError> {
        let mut releases = self.releases.write().await;
        if !releases.contains_key(&release.id) {
            return Err(RepositoryError::NotFound {
                entity: "release",
                id: release.id,
            });
        }
        releases.insert(release.id, release.clone());
        Ok(release)
    }
}

/// In-memory cron-job store keyed by release.
#[derive(Default)]
pub struct InMemoryCronJobRepository {
    jobs: RwLock<HashMap<ReleaseId, CronJob>>,
}

impl InMemoryCronJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronJobRepository for InMemoryCronJobRepository {
    async fn get_by_release(
        &self,
        release_id: ReleaseId,
    ) -> Result<Option<CronJob>, RepositoryError> {
        Ok(self.jobs.read().await.get(&release_id).cloned())
    }

    async fn create(&self, job: CronJob) -> Result<CronJob, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.release_id) {
            return Err(RepositoryError::Duplicate {
                constraint: "cron_job_release_id",
            });
        }
        jobs.insert(job.release_id, job.clone());
        Ok(job)
    }

    async fn update(&self, job: CronJob) -> Result<CronJob, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.release_id) {
            return Err(RepositoryError::NotFound {
                entity: "cron job",
                id: job.id,
            });
        }
        jobs.insert(job.release_id, job.clone());
        Ok(job)
    }

    async fn try_acquire_lock(
        &self,
        release_id: ReleaseId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CronJob>, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&release_id)
            .ok_or(RepositoryError::NotFound {
                entity: "cron job",
                id: release_id,
            })?;

        let acquirable = match job.locked_by.as_deref() {
            None => true,
            Some(current) => current == holder || job.lock_expired(now),
        };
        if !acquirable {
            return Ok(None);
        }

        job.locked_by = Some(holder.to_string());
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn release_lock(
        &self,
        release_id: ReleaseId,
        holder: &str,
    ) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&release_id)
            && job.locked_by.as_deref() == Some(holder)
        {
            job.locked_by = None;
            job.locked_at = None;
        }
        Ok(())
    }
}

/// In-memory task store enforcing the (release, stage, cycle, type)
/// uniqueness guard.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, ReleaseTask>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(&self, id: Uuid) -> Result<Option<ReleaseTask>, RepositoryError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn get_by_release_and_stage(
        &self,
        release_id: ReleaseId,
        stage: ReleaseStage,
        regression_id: Option<Uuid>,
    ) -> Result<Vec<ReleaseTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| {
                t.release_id == release_id
                    && t.stage == stage
                    && t.regression_id == regression_id
            })
            .cloned()
            .collect())
    }

    async fn create(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let duplicate = tasks.values().any(|t| {
            t.release_id == task.release_id
                && t.stage == task.stage
                && t.regression_id == task.regression_id
                && t.task_type == task.task_type
        });
        if duplicate {
            return Err(RepositoryError::Duplicate {
                constraint: "release_stage_task_type",
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn update(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(RepositoryError::NotFound {
                entity: "task",
                id: task.id,
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }
}

/// In-memory regression-cycle store.
#[derive(Default)]
pub struct InMemoryCycleRepository {
    cycles: RwLock<HashMap<Uuid, RegressionCycle>>,
}

impl InMemoryCycleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleRepository for InMemoryCycleRepository {
    async fn get(&self, id: Uuid) -> Result<Option<RegressionCycle>, RepositoryError> {
        Ok(self.cycles.read().await.get(&id).cloned())
    }

    async fn get_by_release(
        &self,
        release_id: ReleaseId,
    ) -> Result<Vec<RegressionCycle>, RepositoryError> {
        let cycles = self.cycles.read().await;
        let mut found: Vec<RegressionCycle> = cycles
            .values()
            .filter(|c| c.release_id == release_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn create(&self, cycle: RegressionCycle) -> Result<RegressionCycle, RepositoryError> {
        let mut cycles = self.cycles.write().await;
        if cycles.contains_key(&cycle.id) {
            return Err(RepositoryError::Duplicate {
                constraint: "cycle_id",
            });
        }
        cycles.insert(cycle.id, cycle.clone());
        Ok(cycle)
    }

    async fn update(&self, cycle: RegressionCycle) -> Result<RegressionCycle, RepositoryError> {
        let mut cycles = self.cycles.write().await;
        if !cycles.contains_key(&cycle.id) {
            return Err(RepositoryError::NotFound {
                entity: "cycle",
                id: cycle.id,
            });
        }
        cycles.insert(cycle.id, cycle.clone());
        Ok(cycle)
    }
}

/// In-memory staged-build store with consume-once semantics.
#[derive(Default)]
pub struct InMemoryBuildRepository {
    builds: RwLock<HashMap<Uuid, StagedBuild>>,
}

impl InMemoryBuildRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildRepository for InMemoryBuildRepository {
    async fn staged(&self, release_id: ReleaseId) -> Result<Vec<StagedBuild>, RepositoryError> {
        let builds = self.builds.read().await;
        let mut found: Vec<StagedBuild> = builds
            .values()
            .filter(|b| b.release_id == release_id && !b.consumed)
            .cloned()
            .collect();
        found.sort_by_key(|b| b.staged_at);
        Ok(found)
    }

    async fn stage(&self, build: StagedBuild) -> Result<StagedBuild, RepositoryError> {
        let mut builds = self.builds.write().await;
        builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn mark_consumed(
        &self,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<StagedBuild, RepositoryError> {
        let mut builds = self.builds.write().await;
        let build = builds.get_mut(&id).ok_or(RepositoryError::NotFound {
            entity: "staged build",
            id,
        })?;
        if build.consumed {
            return Err(RepositoryError::Duplicate {
                constraint: "staged_build_consumed",
            });
        }
        build.consumed = true;
        build.consumed_by = Some(task_id);
        Ok(build.clone())
    }
}

/// In-memory activity log, inspectable from tests.
#[derive(Default)]
pub struct InMemoryActivityLog {
    entries: RwLock<Vec<ActivityEntry>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ActivityLogSink for InMemoryActivityLog {
    async fn record(&self, entry: ActivityEntry) -> Result<(), RepositoryError> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, TaskType};
    use chrono::Duration;

    fn pending_task(release_id: ReleaseId, task_type: TaskType) -> ReleaseTask {
        ReleaseTask::new(
            Uuid::new_v4(),
            release_id,
            task_type.stage(),
            task_type,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn task_uniqueness_guard_rejects_same_scope_and_type() {
        let repo = InMemoryTaskRepository::new();
        let release_id = Uuid::new_v4();

        repo.create(pending_task(release_id, TaskType::CreateReleaseBranch))
            .await
            .unwrap();
        let err = repo
            .create(pending_task(release_id, TaskType::CreateReleaseBranch))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate { .. }));

        // Same type scoped to a cycle is a different row.
        let mut scoped = pending_task(release_id, TaskType::CreateReleaseBranch);
        scoped.regression_id = Some(Uuid::new_v4());
        repo.create(scoped).await.unwrap();
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expiry() {
        let repo = InMemoryCronJobRepository::new();
        let release_id = Uuid::new_v4();
        let job = CronJob::new(release_id).with_lock_timeout_secs(60);
        repo.create(job).await.unwrap();

        let t0 = Utc::now();
        assert!(repo.try_acquire_lock(release_id, "a", t0).await.unwrap().is_some());
        // B is shut out while the lease is live.
        assert!(repo
            .try_acquire_lock(release_id, "b", t0 + Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
        // A renews by re-acquiring.
        assert!(repo
            .try_acquire_lock(release_id, "a", t0 + Duration::seconds(30))
            .await
            .unwrap()
            .is_some());
        // Once the lease goes stale, B takes over.
        let job = repo
            .try_acquire_lock(release_id, "b", t0 + Duration::seconds(120))
            .await
            .unwrap()
            .expect("expired lease should be acquirable");
        assert_eq!(job.locked_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn release_lock_only_drops_own_lease() {
        let repo = InMemoryCronJobRepository::new();
        let release_id = Uuid::new_v4();
        repo.create(CronJob::new(release_id)).await.unwrap();

        let now = Utc::now();
        repo.try_acquire_lock(release_id, "a", now).await.unwrap();
        repo.release_lock(release_id, "b").await.unwrap();
        let job = repo.get_by_release(release_id).await.unwrap().unwrap();
        assert_eq!(job.locked_by.as_deref(), Some("a"));

        repo.release_lock(release_id, "a").await.unwrap();
        let job = repo.get_by_release(release_id).await.unwrap().unwrap();
        assert!(job.locked_by.is_none());
    }

    #[tokio::test]
    async fn staged_build_consumption_is_a_move() {
        let repo = InMemoryBuildRepository::new();
        let release_id = Uuid::new_v4();
        let build = StagedBuild::new(
            Uuid::new_v4(),
            release_id,
            Platform::Ios,
            "s3://artifacts/ios-7.2.0.ipa",
            Utc::now(),
        );
        let build_id = build.id;
        repo.stage(build).await.unwrap();

        let task_id = Uuid::new_v4();
        let consumed = repo.mark_consumed(build_id, task_id).await.unwrap();
        assert!(consumed.consumed);
        assert_eq!(consumed.consumed_by, Some(task_id));
        assert!(repo.staged(release_id).await.unwrap().is_empty());

        let err = repo.mark_consumed(build_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate { .. }));
    }
}
