//! Stage coordinator: the per-release state machine.
//!
//! One `run_tick` call does the coordinator work for one poll tick:
//! enter stages whose trigger condition is met, create the stage's task
//! set if absent (execution deferred to the next tick), execute every
//! eligible task in canonical order, then recompute completion. The
//! caller must hold the release's lease.

mod tasks;

use std::sync::Arc;

use tracing::{error, info};

use crate::engine::EngineDeps;
use crate::errors::EngineError;
use crate::executor::{TaskContext, TaskExecutor};
use crate::model::{
    CronJob, CronStatus, CycleStatus, Release, ReleaseStage, ReleaseTask, StageStatus, TaskStatus,
    TaskType,
};
use crate::policy::{self, StagePolicy};
use crate::regression::RegressionManager;
use crate::repo::{ActivityEntry, ActivityKind};

pub use tasks::{create_stage_tasks, expected_task_count};

/// What one poll tick accomplished for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do (no active stage, paused, or lease held elsewhere).
    Idle,
    /// The active stage's task set was just created; execution starts
    /// next tick.
    TasksCreated(ReleaseStage),
    /// The active stage ran tasks but is not complete yet.
    InProgress(ReleaseStage),
    /// The active stage completed this tick.
    StageCompleted(ReleaseStage),
    /// All stages are complete; the poll loop must stop permanently.
    Finished,
}

/// Result of running one stage's task set.
enum StageRun {
    Created,
    InProgress,
    Complete,
}

/// Per-release state machine over stage statuses and task sets.
pub struct StageCoordinator {
    deps: Arc<EngineDeps>,
    executor: TaskExecutor,
    regression: RegressionManager,
}

impl StageCoordinator {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        let executor = TaskExecutor::new(
            deps.integrations.clone(),
            deps.tasks.clone(),
            deps.activity.clone(),
            deps.clock.clone(),
        );
        Self {
            executor,
            regression: RegressionManager::new(deps.clone()),
            deps,
        }
    }

    /// Run one tick of coordinator work. Caller holds the lease.
    pub async fn run_tick(&self, release: &Release) -> Result<TickOutcome, EngineError> {
        let mut job = self
            .deps
            .cron_jobs
            .get_by_release(release.id)
            .await?
            .ok_or(EngineError::CronJobNotFound(release.id))?;

        match job.cron_status {
            CronStatus::Paused => return Ok(TickOutcome::Idle),
            CronStatus::Completed => return Ok(TickOutcome::Finished),
            CronStatus::Pending | CronStatus::Running => {}
        }

        self.enter_due_stages(release, &mut job).await?;

        let Some(stage) = job.active_stage() else {
            if job.all_stages_completed() {
                return self.finish(release, job).await;
            }
            // Waiting for the kickoff date or a manual stage approval.
            return Ok(TickOutcome::Idle);
        };

        let run = match stage {
            ReleaseStage::Regression => self.run_regression_tick(release, &mut job).await?,
            ReleaseStage::Kickoff | ReleaseStage::PostRegression => {
                let policy = StagePolicy::new(
                    stage,
                    self.deps.integrations.availability(),
                    job.cron_config,
                    &release.platforms(),
                );
                let prior = if stage == ReleaseStage::PostRegression {
                    self.deps
                        .tasks
                        .get_by_release_and_stage(release.id, ReleaseStage::Kickoff, None)
                        .await?
                } else {
                    Vec::new()
                };
                self.run_stage(release, stage, None, None, &policy, &prior)
                    .await?
            }
        };

        match run {
            StageRun::Created => Ok(TickOutcome::TasksCreated(stage)),
            StageRun::InProgress => Ok(TickOutcome::InProgress(stage)),
            StageRun::Complete => {
                self.complete_stage(release, &mut job, stage).await?;
                if stage == ReleaseStage::PostRegression {
                    return self.finish(release, job).await;
                }
                Ok(TickOutcome::StageCompleted(stage))
            }
        }
    }

    /// Apply stage-entry transitions whose trigger condition holds.
    async fn enter_due_stages(
        &self,
        release: &Release,
        job: &mut CronJob,
    ) -> Result<(), EngineError> {
        let now = self.deps.clock.now();
        let due = if job.stage1_status.is_pending()
            && job.active_stage().is_none()
            && now >= release.kick_off_date
        {
            Some(ReleaseStage::Kickoff)
        } else if job.stage1_status.is_completed()
            && job.stage2_status.is_pending()
            && job.active_stage().is_none()
        {
            Some(ReleaseStage::Regression)
        } else if job.stage2_status.is_completed()
            && job.stage3_status.is_pending()
            && job.auto_transition_to_stage3
            && job.active_stage().is_none()
        {
            Some(ReleaseStage::PostRegression)
        } else {
            None
        };

        if let Some(stage) = due {
            let previous = job.stage_status(stage);
            job.set_stage_status(stage, StageStatus::InProgress);
            *job = self.deps.cron_jobs.update(job.clone()).await?;
            self.record_activity(
                release,
                ActivityKind::StageStatusChanged,
                previous,
                StageStatus::InProgress,
            )
            .await;
            info!(release_id = %release.id, stage = ?stage, "stage entered");
        }
        Ok(())
    }

    /// Run one tick of the regression stage: drive the in-progress cycle,
    /// or activate the next due slot, then recompute stage completion.
    async fn run_regression_tick(
        &self,
        release: &Release,
        job: &mut CronJob,
    ) -> Result<StageRun, EngineError> {
        let cycles = self.deps.cycles.get_by_release(release.id).await?;

        if let Some(cycle) = cycles.iter().find(|c| c.status.is_in_progress()) {
            let config = cycle.config.unwrap_or(job.cron_config);
            let policy = StagePolicy::new(
                ReleaseStage::Regression,
                self.deps.integrations.availability(),
                config,
                &release.platforms(),
            );
            let run = self
                .run_stage(
                    release,
                    ReleaseStage::Regression,
                    Some(cycle.id),
                    Some(&cycle.cycle_tag),
                    &policy,
                    &[],
                )
                .await?;
            if matches!(run, StageRun::Complete) {
                self.regression.complete_cycle(release, cycle).await?;
            }
        } else if self
            .regression
            .try_activate_next(release, job)
            .await?
            .is_some()
        {
            // Cycle tasks were just created; execution starts next tick.
            return Ok(StageRun::InProgress);
        }

        // The stage completes when no slot remains, no cycle is running,
        // and at least one cycle finished.
        let cycles = self.deps.cycles.get_by_release(release.id).await?;
        let any_in_progress = cycles.iter().any(|c| c.status.is_in_progress());
        let any_done = cycles.iter().any(|c| c.status == CycleStatus::Done);
        if job.upcoming_regressions.is_empty() && !any_in_progress && any_done {
            Ok(StageRun::Complete)
        } else {
            Ok(StageRun::InProgress)
        }
    }

    /// Create-or-execute the task set for one stage scope.
    async fn run_stage(
        &self,
        release: &Release,
        stage: ReleaseStage,
        regression_id: Option<uuid::Uuid>,
        cycle_tag: Option<&str>,
        policy: &StagePolicy,
        prior: &[ReleaseTask],
    ) -> Result<StageRun, EngineError> {
        let existing = self
            .deps
            .tasks
            .get_by_release_and_stage(release.id, stage, regression_id)
            .await?;

        if existing.is_empty() {
            let created = create_stage_tasks(
                self.deps.tasks.as_ref(),
                release,
                stage,
                regression_id,
                self.deps.clock.now(),
            )
            .await?;
            info!(
                release_id = %release.id,
                stage = ?stage,
                count = created.len(),
                "stage tasks created"
            );
            return Ok(StageRun::Created);
        }

        let expected = expected_task_count(stage);
        if existing.len() < expected {
            error!(
                release_id = %release.id,
                stage = ?stage,
                found = existing.len(),
                expected,
                "stage task set below minimum, aborting tick"
            );
            return Err(EngineError::StageCreationInconsistent {
                stage,
                found: existing.len(),
                expected,
            });
        }

        let mut ordered = policy::order_tasks(existing, stage);
        self.skip_non_required(release, &mut ordered, policy).await?;

        let now = self.deps.clock.now();
        let kick_off_date = release.kick_off_date;
        let time_gate = move |task: &ReleaseTask| match task.task_type {
            TaskType::SendKickoffReminder => now >= kick_off_date,
            _ => true,
        };

        // Walk in canonical order so a task completed this tick unblocks
        // its successors within the same tick.
        for index in 0..ordered.len() {
            let task = ordered[index].clone();
            if policy::can_execute_task(&task, &ordered, policy, &time_gate) {
                let ctx = TaskContext {
                    release,
                    task: &task,
                    scope: &ordered,
                    prior,
                    cycle_tag,
                };
                let saved = self.executor.execute(&ctx).await?;
                drop(ctx);
                ordered[index] = saved;
            }
        }

        if policy::stage_complete(&ordered, policy) {
            Ok(StageRun::Complete)
        } else {
            Ok(StageRun::InProgress)
        }
    }

    /// Persist `Skipped` for pending tasks the policy deems not required,
    /// so the task list distinguishes "not required" from "waiting".
    async fn skip_non_required(
        &self,
        release: &Release,
        ordered: &mut [ReleaseTask],
        policy: &StagePolicy,
    ) -> Result<(), EngineError> {
        for slot in ordered.iter_mut() {
            if slot.status == TaskStatus::Pending && !policy.is_required(slot.task_type) {
                let mut task = slot.clone();
                task.status = TaskStatus::Skipped;
                task.updated_at = self.deps.clock.now();
                let saved = self.deps.tasks.update(task).await?;
                self.record_activity(
                    release,
                    ActivityKind::TaskStatusChanged,
                    TaskStatus::Pending,
                    TaskStatus::Skipped,
                )
                .await;
                *slot = saved;
            }
        }
        Ok(())
    }

    async fn complete_stage(
        &self,
        release: &Release,
        job: &mut CronJob,
        stage: ReleaseStage,
    ) -> Result<(), EngineError> {
        let previous = job.stage_status(stage);
        job.set_stage_status(stage, StageStatus::Completed);
        *job = self.deps.cron_jobs.update(job.clone()).await?;
        self.record_activity(
            release,
            ActivityKind::StageStatusChanged,
            previous,
            StageStatus::Completed,
        )
        .await;
        info!(release_id = %release.id, stage = ?stage, "stage completed");
        Ok(())
    }

    /// Terminal transition: all stages done, the poll loop stops for good.
    async fn finish(
        &self,
        release: &Release,
        mut job: CronJob,
    ) -> Result<TickOutcome, EngineError> {
        if job.cron_status != CronStatus::Completed {
            let previous = job.cron_status;
            job.cron_status = CronStatus::Completed;
            self.deps.cron_jobs.update(job).await?;
            self.record_activity(
                release,
                ActivityKind::CronStatusChanged,
                previous,
                CronStatus::Completed,
            )
            .await;
            info!(release_id = %release.id, "release orchestration finished");
        }
        Ok(TickOutcome::Finished)
    }

    async fn record_activity(
        &self,
        release: &Release,
        kind: ActivityKind,
        previous: impl serde::Serialize,
        next: impl serde::Serialize,
    ) {
        let entry = ActivityEntry::new(
            release.id,
            None,
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
