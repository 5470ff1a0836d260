//! Regression cycle manager: the stage-2 sub-state-machine.
//!
//! An upcoming slot activates into a cycle when its scheduled time has
//! arrived and every required platform has a staged build. Activation
//! consumes the staged builds into the cycle's trigger task (completed
//! immediately) and creates the cycle's task set. Only one cycle runs at
//! a time; the next slot waits, even past its scheduled time.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::coordinator::{create_stage_tasks, expected_task_count};
use crate::engine::EngineDeps;
use crate::errors::EngineError;
use crate::model::{
    CronJob, CycleStatus, RegressionCycle, Release, ReleaseStage, StagedBuild, TaskOutput,
    TaskStatus, TaskType,
};
use crate::repo::{ActivityEntry, ActivityKind};

/// Manages cycle activation, build consumption, and cycle lifecycle.
pub struct RegressionManager {
    deps: Arc<EngineDeps>,
}

impl RegressionManager {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }

    /// Activate the earliest due slot if its builds are staged. Returns
    /// the new cycle, or `None` when no slot is due or builds are
    /// missing. The caller guarantees no other cycle is in progress.
    pub async fn try_activate_next(
        &self,
        release: &Release,
        job: &mut CronJob,
    ) -> Result<Option<RegressionCycle>, EngineError> {
        let now = self.deps.clock.now();
        let Some(slot_index) = job
            .upcoming_regressions
            .iter()
            .position(|slot| slot.scheduled_at <= now)
        else {
            return Ok(None);
        };

        let Some(builds) = self.staged_builds_for(release).await? else {
            return Ok(None);
        };

        let slot = job.upcoming_regressions.remove(slot_index);
        self.clear_latest(release).await?;

        let existing = self.deps.cycles.get_by_release(release.id).await?;
        let cycle_tag = format!("RC{}", existing.len() + 1);
        let cycle = self
            .deps
            .cycles
            .create(RegressionCycle::new(
                release.tenant_id,
                release.id,
                &cycle_tag,
                slot.config,
                now,
            ))
            .await?;

        let tasks = create_stage_tasks(
            self.deps.tasks.as_ref(),
            release,
            ReleaseStage::Regression,
            Some(cycle.id),
            now,
        )
        .await?;

        // Consumption is a move: the staging rows flip to used and the
        // trigger task's builds output becomes authoritative.
        let trigger = tasks
            .iter()
            .find(|t| t.task_type == TaskType::TriggerRegressionBuilds)
            .cloned()
            .ok_or(EngineError::StageCreationInconsistent {
                stage: ReleaseStage::Regression,
                found: tasks.len(),
                expected: expected_task_count(ReleaseStage::Regression),
            })?;

        let mut artifacts = Vec::new();
        for build in &builds {
            let consumed = self.deps.builds.mark_consumed(build.id, trigger.id).await?;
            artifacts.push(consumed.artifact());
        }

        let mut trigger = trigger;
        trigger.status = TaskStatus::Completed;
        trigger.output =
            TaskOutput::message("consumed staged regression builds").with_builds(artifacts);
        trigger.updated_at = now;
        self.deps.tasks.update(trigger).await?;

        *job = self.deps.cron_jobs.update(job.clone()).await?;
        self.record_cycle_activity(release, CycleStatus::NotStarted, CycleStatus::InProgress)
            .await;
        info!(
            release_id = %release.id,
            cycle = %cycle.cycle_tag,
            "regression cycle activated"
        );
        Ok(Some(cycle))
    }

    /// All required platform builds, or `None` when any is missing.
    async fn staged_builds_for(
        &self,
        release: &Release,
    ) -> Result<Option<Vec<StagedBuild>>, EngineError> {
        let staged = self.deps.builds.staged(release.id).await?;
        let mut chosen = Vec::new();
        for platform in release.platforms() {
            match staged.iter().find(|b| b.platform == platform) {
                Some(build) => chosen.push(build.clone()),
                None => {
                    debug!(
                        release_id = %release.id,
                        platform = ?platform,
                        "slot due but platform build not staged"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(chosen))
    }

    /// Clear `is_latest` on prior cycles; the new cycle supersedes them.
    async fn clear_latest(&self, release: &Release) -> Result<(), EngineError> {
        let cycles = self.deps.cycles.get_by_release(release.id).await?;
        for cycle in cycles {
            if cycle.is_latest {
                let mut superseded = cycle;
                superseded.is_latest = false;
                self.deps.cycles.update(superseded).await?;
            }
        }
        Ok(())
    }

    /// Transition a cycle to `Done` once all its required tasks completed.
    pub async fn complete_cycle(
        &self,
        release: &Release,
        cycle: &RegressionCycle,
    ) -> Result<RegressionCycle, EngineError> {
        let mut done = cycle.clone();
        let previous = done.status;
        done.status = CycleStatus::Done;
        done.completed_at = Some(self.deps.clock.now());
        let done = self.deps.cycles.update(done).await?;
        self.record_cycle_activity(release, previous, CycleStatus::Done)
            .await;
        info!(
            release_id = %release.id,
            cycle = %done.cycle_tag,
            "regression cycle done"
        );
        Ok(done)
    }

    /// Abandon a cycle that has not finished. Terminal cycles are
    /// returned unchanged, so cancellation is idempotent.
    pub async fn abandon_cycle(
        &self,
        release: &Release,
        cycle_id: Uuid,
    ) -> Result<RegressionCycle, EngineError> {
        let cycle = self
            .deps
            .cycles
            .get(cycle_id)
            .await?
            .ok_or(EngineError::CycleNotFound(cycle_id))?;
        if cycle.status.is_terminal() {
            return Ok(cycle);
        }
        let mut abandoned = cycle;
        let previous = abandoned.status;
        abandoned.status = CycleStatus::Abandoned;
        abandoned.completed_at = Some(self.deps.clock.now());
        let abandoned = self.deps.cycles.update(abandoned).await?;
        self.record_cycle_activity(release, previous, CycleStatus::Abandoned)
            .await;
        info!(
            release_id = %release.id,
            cycle = %abandoned.cycle_tag,
            "regression cycle abandoned"
        );
        Ok(abandoned)
    }

    async fn record_cycle_activity(
        &self,
        release: &Release,
        previous: CycleStatus,
        next: CycleStatus,
    ) {
        let entry = ActivityEntry::new(
            release.id,
            None,
            self.deps.clock.now(),
            ActivityKind::CycleStatusChanged,
            previous,
            next,
        );
        if let Err(err) = self.deps.activity.record(entry).await {
            tracing::warn!(release_id = %release.id, error = %err, "failed to record activity entry");
        }
    }
}
