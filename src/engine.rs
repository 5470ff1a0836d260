//! Public surface of the engine: the dependency set and the
//! `ReleaseOrchestrator` facade.
//!
//! All user-facing operations are tenant-checked: a caller acting for
//! one tenant cannot read or mutate another tenant's release, and the
//! mismatch is a hard error, never a silent filter.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::coordinator::{StageCoordinator, TickOutcome};
use crate::errors::EngineError;
use crate::integrations::Integrations;
use crate::model::{
    CronJob, CronStatus, Platform, RegressionCycle, RegressionSlot, Release, ReleaseId,
    ReleaseStage, ReleaseTask, StageStatus, StagedBuild, TaskStatus, TaskType, TenantId,
};
use crate::policy::{self, StagePolicy};
use crate::regression::RegressionManager;
use crate::repo::{
    ActivityEntry, ActivityKind, ActivityLogSink, BuildRepository, CronJobRepository,
    CycleRepository, InMemoryActivityLog, InMemoryBuildRepository, InMemoryCronJobRepository,
    InMemoryCycleRepository, InMemoryReleaseRepository, InMemoryTaskRepository,
    ReleaseRepository, TaskRepository,
};
use crate::scheduler::PollScheduler;

/// Explicit dependency set injected into the coordinator and scheduler.
pub struct EngineDeps {
    pub releases: Arc<dyn ReleaseRepository>,
    pub cron_jobs: Arc<dyn CronJobRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub cycles: Arc<dyn CycleRepository>,
    pub builds: Arc<dyn BuildRepository>,
    pub activity: Arc<dyn ActivityLogSink>,
    pub integrations: Arc<Integrations>,
    pub clock: Arc<dyn Clock>,
}

impl EngineDeps {
    /// Fully in-memory dependency set, for tests and local runs.
    pub fn in_memory(integrations: Integrations, clock: Arc<dyn Clock>) -> Self {
        Self {
            releases: Arc::new(InMemoryReleaseRepository::new()),
            cron_jobs: Arc::new(InMemoryCronJobRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            cycles: Arc::new(InMemoryCycleRepository::new()),
            builds: Arc::new(InMemoryBuildRepository::new()),
            activity: Arc::new(InMemoryActivityLog::new()),
            integrations: Arc::new(integrations),
            clock,
        }
    }
}

/// One task in a stage snapshot, annotated for UI consumption so the
/// dashboard can distinguish "waiting on a predecessor" from "failed"
/// from "not required".
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task: ReleaseTask,
    pub required: bool,
    /// Required predecessors not yet completed.
    pub waiting_on: Vec<TaskType>,
}

/// Stage status triple plus the annotated task list.
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub stage1_status: StageStatus,
    pub stage2_status: StageStatus,
    pub stage3_status: StageStatus,
    pub tasks: Vec<TaskSnapshot>,
}

/// Facade over the coordinator, scheduler, and regression manager.
pub struct ReleaseOrchestrator {
    deps: Arc<EngineDeps>,
    scheduler: PollScheduler,
    regression: RegressionManager,
}

impl ReleaseOrchestrator {
    pub fn new(deps: EngineDeps, instance_id: &str, poll_interval: Duration) -> Self {
        let deps = Arc::new(deps);
        let coordinator = Arc::new(StageCoordinator::new(deps.clone()));
        let scheduler = PollScheduler::new(deps.clone(), coordinator, instance_id, poll_interval);
        let regression = RegressionManager::new(deps.clone());
        Self {
            deps,
            scheduler,
            regression,
        }
    }

    /// Identity this instance uses as its lease holder.
    pub fn instance_id(&self) -> &str {
        self.scheduler.instance_id()
    }

    /// Create a release together with its cron-job companion. The job's
    /// release binding is set by the engine regardless of the template.
    pub async fn register_release(
        &self,
        release: Release,
        job: CronJob,
    ) -> Result<(Release, CronJob), EngineError> {
        let release = self.deps.releases.create(release).await?;
        let mut job = job;
        job.release_id = release.id;
        let job = self.deps.cron_jobs.create(job).await?;
        info!(release_id = %release.id, branch = %release.branch, "release registered");
        Ok((release, job))
    }

    /// Start the recurring poll loop for a release. Idempotent.
    pub async fn start_release_polling(&self, release_id: ReleaseId) -> Result<(), EngineError> {
        let mut job = self.cron_job(release_id).await?;
        if matches!(job.cron_status, CronStatus::Pending | CronStatus::Paused) {
            job.cron_status = CronStatus::Running;
            self.deps.cron_jobs.update(job).await?;
        }
        self.scheduler.start(release_id).await
    }

    /// Stop the recurring poll loop for a release. Idempotent; stage
    /// state is untouched.
    pub async fn stop_release_polling(&self, release_id: ReleaseId) {
        self.scheduler.stop(release_id).await;
    }

    /// Whether this instance is currently polling the release.
    pub async fn is_polling(&self, release_id: ReleaseId) -> bool {
        self.scheduler.is_polling(release_id).await
    }

    /// Run a single poll tick now. Also the entry point the recurring
    /// timer uses, so tests can drive the engine deterministically.
    pub async fn run_tick_once(&self, release_id: ReleaseId) -> Result<TickOutcome, EngineError> {
        self.scheduler.run_tick_once(release_id).await
    }

    /// Pause a release: stop the timer, leave stage state untouched.
    /// In-flight external calls are not rolled back.
    pub async fn pause_release(
        &self,
        tenant_id: TenantId,
        account_id: Option<Uuid>,
        release_id: ReleaseId,
    ) -> Result<CronJob, EngineError> {
        let release = self.release_for(tenant_id, release_id).await?;
        self.scheduler.stop(release_id).await;

        let mut job = self.cron_job(release_id).await?;
        let previous = job.cron_status;
        if previous != CronStatus::Paused {
            job.cron_status = CronStatus::Paused;
            job = self.deps.cron_jobs.update(job).await?;
            self.record(
                &release,
                account_id,
                ActivityKind::CronStatusChanged,
                previous,
                CronStatus::Paused,
            )
            .await;
            info!(release_id = %release_id, "release paused");
        }
        Ok(job)
    }

    /// Resume a paused release. State is re-derived from persisted rows;
    /// nothing in memory survives a pause.
    pub async fn resume_release(
        &self,
        tenant_id: TenantId,
        account_id: Option<Uuid>,
        release_id: ReleaseId,
    ) -> Result<(), EngineError> {
        let release = self.release_for(tenant_id, release_id).await?;
        let job = self.cron_job(release_id).await?;
        if job.cron_status == CronStatus::Paused {
            self.record(
                &release,
                account_id,
                ActivityKind::CronStatusChanged,
                CronStatus::Paused,
                CronStatus::Running,
            )
            .await;
        }
        self.start_release_polling(release_id).await
    }

    /// Re-queue a failed task: Failed → Pending, error payload cleared.
    /// The next tick re-executes it. The coordinator never auto-retries.
    pub async fn retry_task(
        &self,
        tenant_id: TenantId,
        account_id: Option<Uuid>,
        task_id: Uuid,
    ) -> Result<ReleaseTask, EngineError> {
        let task = self
            .deps
            .tasks
            .get(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        if task.tenant_id != tenant_id {
            return Err(EngineError::TenantMismatch { entity: "task" });
        }
        if task.status != TaskStatus::Failed {
            return Err(EngineError::NotRetryable {
                task_id,
                status: task.status,
            });
        }

        let release = self.release_for(tenant_id, task.release_id).await?;
        let mut retried = task;
        retried.status = TaskStatus::Pending;
        retried.output.error = None;
        retried.updated_at = self.deps.clock.now();
        let retried = self.deps.tasks.update(retried).await?;
        self.record(
            &release,
            account_id,
            ActivityKind::TaskRetried,
            TaskStatus::Failed,
            TaskStatus::Pending,
        )
        .await;
        info!(task_id = %task_id, "task re-queued for retry");
        Ok(retried)
    }

    /// Manually move a pending stage into progress (e.g. stage 3 when
    /// `auto_transition_to_stage3` is off). The prior stage must have
    /// completed.
    pub async fn approve_stage(
        &self,
        tenant_id: TenantId,
        account_id: Option<Uuid>,
        release_id: ReleaseId,
        stage: ReleaseStage,
    ) -> Result<CronJob, EngineError> {
        let release = self.release_for(tenant_id, release_id).await?;
        let mut job = self.cron_job(release_id).await?;

        if !job.stage_status(stage).is_pending() {
            return Ok(job);
        }
        for prior in ReleaseStage::ALL {
            if prior == stage {
                break;
            }
            if !job.stage_status(prior).is_completed() {
                return Err(EngineError::StageNotApprovable {
                    stage,
                    blocker: prior,
                });
            }
        }

        job.set_stage_status(stage, StageStatus::InProgress);
        let job = self.deps.cron_jobs.update(job).await?;
        self.record(
            &release,
            account_id,
            ActivityKind::StageStatusChanged,
            StageStatus::Pending,
            StageStatus::InProgress,
        )
        .await;
        info!(release_id = %release_id, stage = ?stage, "stage approved");
        Ok(job)
    }

    /// Stage a build artifact for later consumption by a regression
    /// cycle.
    pub async fn stage_build(
        &self,
        tenant_id: TenantId,
        release_id: ReleaseId,
        platform: Platform,
        artifact_ref: &str,
    ) -> Result<StagedBuild, EngineError> {
        let release = self.release_for(tenant_id, release_id).await?;
        let build = StagedBuild::new(
            release.tenant_id,
            release.id,
            platform,
            artifact_ref,
            self.deps.clock.now(),
        );
        let build = self.deps.builds.stage(build).await?;
        info!(release_id = %release_id, platform = ?platform, "build staged");
        Ok(build)
    }

    /// Schedule an upcoming regression slot, kept ordered by time.
    pub async fn schedule_regression(
        &self,
        tenant_id: TenantId,
        release_id: ReleaseId,
        slot: RegressionSlot,
    ) -> Result<CronJob, EngineError> {
        self.release_for(tenant_id, release_id).await?;
        let mut job = self.cron_job(release_id).await?;
        let position = job
            .upcoming_regressions
            .iter()
            .position(|s| s.scheduled_at > slot.scheduled_at)
            .unwrap_or(job.upcoming_regressions.len());
        job.upcoming_regressions.insert(position, slot);
        let job = self.deps.cron_jobs.update(job).await?;
        info!(release_id = %release_id, "regression slot scheduled");
        Ok(job)
    }

    /// Abandon an in-flight regression cycle. Idempotent on terminal
    /// cycles.
    pub async fn cancel_regression(
        &self,
        tenant_id: TenantId,
        cycle_id: Uuid,
    ) -> Result<RegressionCycle, EngineError> {
        let cycle = self
            .deps
            .cycles
            .get(cycle_id)
            .await?
            .ok_or(EngineError::CycleNotFound(cycle_id))?;
        if cycle.tenant_id != tenant_id {
            return Err(EngineError::TenantMismatch { entity: "cycle" });
        }
        let release = self.release_for(tenant_id, cycle.release_id).await?;
        self.regression.abandon_cycle(&release, cycle_id).await
    }

    /// Stage status triple plus annotated task list for UI consumption.
    /// Regression tasks come from the latest cycle.
    pub async fn get_stage_snapshot(
        &self,
        tenant_id: TenantId,
        release_id: ReleaseId,
    ) -> Result<StageSnapshot, EngineError> {
        let release = self.release_for(tenant_id, release_id).await?;
        let job = self.cron_job(release_id).await?;

        let availability = self.deps.integrations.availability();
        let platforms = release.platforms();
        let mut tasks = Vec::new();

        for stage in ReleaseStage::ALL {
            let (scope, config) = match stage {
                ReleaseStage::Regression => {
                    let cycles = self.deps.cycles.get_by_release(release_id).await?;
                    let Some(latest) = cycles.into_iter().find(|c| c.is_latest) else {
                        continue;
                    };
                    let config = latest.config.unwrap_or(job.cron_config);
                    (Some(latest.id), config)
                }
                _ => (None, job.cron_config),
            };
            let stage_tasks = self
                .deps
                .tasks
                .get_by_release_and_stage(release_id, stage, scope)
                .await?;
            let policy = StagePolicy::new(stage, availability, config, &platforms);
            let ordered = policy::order_tasks(stage_tasks, stage);
            for task in &ordered {
                tasks.push(TaskSnapshot {
                    required: policy.is_required(task.task_type),
                    waiting_on: waiting_on(task, &ordered, &policy),
                    task: task.clone(),
                });
            }
        }

        Ok(StageSnapshot {
            stage1_status: job.stage1_status,
            stage2_status: job.stage2_status,
            stage3_status: job.stage3_status,
            tasks,
        })
    }

    async fn release_for(
        &self,
        tenant_id: TenantId,
        release_id: ReleaseId,
    ) -> Result<Release, EngineError> {
        let release = self
            .deps
            .releases
            .get(release_id)
            .await?
            .ok_or(EngineError::ReleaseNotFound(release_id))?;
        if release.tenant_id != tenant_id {
            return Err(EngineError::TenantMismatch { entity: "release" });
        }
        Ok(release)
    }

    async fn cron_job(&self, release_id: ReleaseId) -> Result<CronJob, EngineError> {
        self.deps
            .cron_jobs
            .get_by_release(release_id)
            .await?
            .ok_or(EngineError::CronJobNotFound(release_id))
    }

    async fn record(
        &self,
        release: &Release,
        account_id: Option<Uuid>,
        kind: ActivityKind,
        previous: impl Serialize,
        next: impl Serialize,
    ) {
        let entry = ActivityEntry::new(
            release.id,
            account_id,
            self.deps.clock.now(),
            kind,
            previous,
            next,
        );
        if let Err(err) = self.deps.activity.record(entry).await {
            tracing::warn!(release_id = %release.id, error = %err, "failed to record activity entry");
        }
    }
}

/// Required predecessors of `task` that have not completed.
fn waiting_on(
    task: &ReleaseTask,
    ordered: &[ReleaseTask],
    policy: &StagePolicy,
) -> Vec<TaskType> {
    let position = ordered
        .iter()
        .position(|t| t.id == task.id)
        .unwrap_or(ordered.len());
    ordered[..position]
        .iter()
        .filter(|prior| policy.is_required(prior.task_type) && !prior.status.is_completed())
        .map(|prior| prior.task_type)
        .collect()
}
