//! Idempotent stage-task creation.
//!
//! The fixed task set for a stage is created exactly once per
//! (release, stage, cycle) scope. The caller-side emptiness check is the
//! idempotency boundary; the repository's uniqueness guard covers the
//! check-then-create race between instances.

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use crate::errors::{EngineError, RepositoryError};
use crate::model::{Release, ReleaseStage, ReleaseTask};
use crate::policy;
use crate::repo::TaskRepository;

/// Minimum number of tasks a stage must carry once created.
pub fn expected_task_count(stage: ReleaseStage) -> usize {
    policy::stage_order(stage).len()
}

/// Create the fixed task set for a stage, tolerating concurrent creators.
///
/// If any tasks already exist for the scope, creation is skipped entirely
/// (not merged). A duplicate-key error mid-batch means another instance
/// won the race: the remaining types are still attempted (the racer may
/// have died part-way), then the surviving set is re-queried. Fewer
/// survivors than the stage minimum is a fatal inconsistency.
pub async fn create_stage_tasks(
    tasks: &dyn TaskRepository,
    release: &Release,
    stage: ReleaseStage,
    regression_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Vec<ReleaseTask>, EngineError> {
    let existing = tasks
        .get_by_release_and_stage(release.id, stage, regression_id)
        .await?;
    if !existing.is_empty() {
        return Ok(policy::order_tasks(existing, stage));
    }

    let mut created = Vec::new();
    let mut raced = false;
    for task_type in policy::stage_order(stage) {
        let task = ReleaseTask::new(
            release.tenant_id,
            release.id,
            stage,
            *task_type,
            regression_id,
            now,
        );
        match tasks.create(task).await {
            Ok(task) => created.push(task),
            Err(RepositoryError::Duplicate { .. }) => {
                warn!(
                    release_id = %release.id,
                    stage = ?stage,
                    task_type = ?task_type,
                    "concurrent creator hit the uniqueness guard"
                );
                raced = true;
            }
            Err(err) => return Err(err.into()),
        }
    }

    if raced {
        let surviving = tasks
            .get_by_release_and_stage(release.id, stage, regression_id)
            .await?;
        let expected = expected_task_count(stage);
        if surviving.len() < expected {
            error!(
                release_id = %release.id,
                stage = ?stage,
                found = surviving.len(),
                expected,
                "stage task set inconsistent after creation race"
            );
            return Err(EngineError::StageCreationInconsistent {
                stage,
                found: surviving.len(),
                expected,
            });
        }
        return Ok(policy::order_tasks(surviving, stage));
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, ReleaseType, TaskType};
    use crate::repo::memory::InMemoryTaskRepository;

    fn release() -> Release {
        Release::new(
            Uuid::new_v4(),
            ReleaseType::Major,
            "release/8.0.0",
            "main",
            Utc::now(),
        )
        .with_target(Platform::Ios, "app-store", "8.0.0")
    }

    #[tokio::test]
    async fn creates_the_full_fixed_set_once() {
        let repo = InMemoryTaskRepository::new();
        let release = release();

        let created =
            create_stage_tasks(&repo, &release, ReleaseStage::Kickoff, None, Utc::now())
                .await
                .unwrap();
        assert_eq!(created.len(), expected_task_count(ReleaseStage::Kickoff));

        // Second call is a no-op returning the existing rows.
        let again = create_stage_tasks(&repo, &release, ReleaseStage::Kickoff, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(again.len(), created.len());

        let mut type_counts = std::collections::HashMap::new();
        for task in &again {
            *type_counts.entry(task.task_type).or_insert(0usize) += 1;
        }
        assert!(type_counts.values().all(|count| *count == 1));
    }

    #[tokio::test]
    async fn existing_tasks_short_circuit_creation() {
        let repo = InMemoryTaskRepository::new();
        let release = release();

        // Another instance already created the full set.
        for task_type in policy::stage_order(ReleaseStage::PostRegression) {
            use crate::repo::TaskRepository as _;
            repo.create(ReleaseTask::new(
                release.tenant_id,
                release.id,
                ReleaseStage::PostRegression,
                *task_type,
                None,
                Utc::now(),
            ))
            .await
            .unwrap();
        }

        let surviving =
            create_stage_tasks(&repo, &release, ReleaseStage::PostRegression, None, Utc::now())
                .await
                .unwrap();
        assert_eq!(
            surviving.len(),
            expected_task_count(ReleaseStage::PostRegression)
        );
    }

    /// Test double reproducing the check-then-create race: the emptiness
    /// check sees nothing, then a concurrent creator lands its rows
    /// before ours, so every create hits the uniqueness guard.
    struct RacingRepo {
        inner: InMemoryTaskRepository,
        racer_rows: Vec<ReleaseTask>,
        first_query: std::sync::atomic::AtomicBool,
        racer_landed: tokio::sync::Mutex<bool>,
    }

    impl RacingRepo {
        fn new(racer_rows: Vec<ReleaseTask>) -> Self {
            Self {
                inner: InMemoryTaskRepository::new(),
                racer_rows,
                first_query: std::sync::atomic::AtomicBool::new(false),
                racer_landed: tokio::sync::Mutex::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::repo::TaskRepository for RacingRepo {
        async fn get(&self, id: Uuid) -> Result<Option<ReleaseTask>, RepositoryError> {
            self.inner.get(id).await
        }

        async fn get_by_release_and_stage(
            &self,
            release_id: Uuid,
            stage: ReleaseStage,
            regression_id: Option<Uuid>,
        ) -> Result<Vec<ReleaseTask>, RepositoryError> {
            if !self
                .first_query
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return Ok(Vec::new());
            }
            self.inner
                .get_by_release_and_stage(release_id, stage, regression_id)
                .await
        }

        async fn create(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
            let mut landed = self.racer_landed.lock().await;
            if !*landed {
                for row in &self.racer_rows {
                    self.inner.create(row.clone()).await?;
                }
                *landed = true;
            }
            self.inner.create(task).await
        }

        async fn update(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
            self.inner.update(task).await
        }
    }

    fn racer_rows(release: &Release, task_types: &[TaskType]) -> Vec<ReleaseTask> {
        task_types
            .iter()
            .map(|t| {
                ReleaseTask::new(
                    release.tenant_id,
                    release.id,
                    ReleaseStage::Kickoff,
                    *t,
                    None,
                    Utc::now(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn creation_race_resolves_to_the_surviving_set() {
        let release = release();
        let repo = RacingRepo::new(racer_rows(
            &release,
            policy::stage_order(ReleaseStage::Kickoff),
        ));

        let surviving =
            create_stage_tasks(&repo, &release, ReleaseStage::Kickoff, None, Utc::now())
                .await
                .unwrap();
        assert_eq!(surviving.len(), expected_task_count(ReleaseStage::Kickoff));

        let mut type_counts = std::collections::HashMap::new();
        for task in &surviving {
            *type_counts.entry(task.task_type).or_insert(0usize) += 1;
        }
        assert!(type_counts.values().all(|count| *count == 1));
    }

    /// A racer that died after writing two rows, in a store whose
    /// sequence guard then rejects every further write as a duplicate.
    struct PartialRaceRepo {
        inner: InMemoryTaskRepository,
        first_query: std::sync::atomic::AtomicBool,
    }

    impl PartialRaceRepo {
        async fn with_rows(rows: Vec<ReleaseTask>) -> Self {
            let inner = InMemoryTaskRepository::new();
            for row in rows {
                use crate::repo::TaskRepository as _;
                inner.create(row).await.unwrap();
            }
            Self {
                inner,
                first_query: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::repo::TaskRepository for PartialRaceRepo {
        async fn get(&self, id: Uuid) -> Result<Option<ReleaseTask>, RepositoryError> {
            self.inner.get(id).await
        }

        async fn get_by_release_and_stage(
            &self,
            release_id: Uuid,
            stage: ReleaseStage,
            regression_id: Option<Uuid>,
        ) -> Result<Vec<ReleaseTask>, RepositoryError> {
            if !self
                .first_query
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return Ok(Vec::new());
            }
            self.inner
                .get_by_release_and_stage(release_id, stage, regression_id)
                .await
        }

        async fn create(&self, _task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
            Err(RepositoryError::Duplicate {
                constraint: "release_stage_task_type",
            })
        }

        async fn update(&self, task: ReleaseTask) -> Result<ReleaseTask, RepositoryError> {
            self.inner.update(task).await
        }
    }

    #[tokio::test]
    async fn partial_survivors_after_a_race_are_fatal() {
        let release = release();
        let rows = racer_rows(
            &release,
            &[TaskType::CreateReleaseBranch, TaskType::SendKickoffReminder],
        );
        let repo = PartialRaceRepo::with_rows(rows).await;

        let err = create_stage_tasks(&repo, &release, ReleaseStage::Kickoff, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StageCreationInconsistent { found: 2, .. }
        ));
    }

    #[tokio::test]
    async fn cycle_scoped_sets_are_independent() {
        let repo = InMemoryTaskRepository::new();
        let release = release();
        let first_cycle = Some(Uuid::new_v4());
        let second_cycle = Some(Uuid::new_v4());

        let first = create_stage_tasks(
            &repo,
            &release,
            ReleaseStage::Regression,
            first_cycle,
            Utc::now(),
        )
        .await
        .unwrap();
        let second = create_stage_tasks(
            &repo,
            &release,
            ReleaseStage::Regression,
            second_cycle,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(first.len(), expected_task_count(ReleaseStage::Regression));
        assert_eq!(second.len(), first.len());
        assert!(first.iter().any(|t| t.task_type == TaskType::TriggerRegressionBuilds));
        assert!(first.iter().all(|t| t.regression_id == first_cycle));
        assert!(second.iter().all(|t| t.regression_id == second_cycle));
    }
}
