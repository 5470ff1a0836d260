//! Task executor: dispatches one eligible task to its integration
//! strategy and records the outcome.
//!
//! Failures are caught per task — a failing task is marked `Failed` with
//! its error payload and never aborts evaluation of siblings in the same
//! tick. The executor does not re-check task status; callers gate
//! execution through `policy::can_execute_task`.

mod strategies;

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::errors::{EngineError, ExecutionError};
use crate::integrations::{ExternalRef, Integrations};
use crate::model::{Release, ReleaseTask, TaskErrorPayload, TaskOutput, TaskStatus};
use crate::repo::{ActivityEntry, ActivityKind, ActivityLogSink, TaskRepository};

pub use strategies::StrategyTable;

/// Everything a strategy may read while executing one task.
pub struct TaskContext<'a> {
    pub release: &'a Release,
    pub task: &'a ReleaseTask,
    /// Tasks in the same (stage, cycle) scope, canonically ordered.
    /// Check-type strategies find their trigger's external reference here.
    pub scope: &'a [ReleaseTask],
    /// Tasks from earlier stages, for cross-stage references (e.g. the
    /// kickoff ticket closed in post-regression).
    pub prior: &'a [ReleaseTask],
    /// Tag of the owning regression cycle, for cycle-scoped tasks.
    pub cycle_tag: Option<&'a str>,
}

/// Successful completion of a task.
pub struct TaskCompletion {
    pub output: TaskOutput,
    pub external: Option<ExternalRef>,
}

impl TaskCompletion {
    pub fn new(output: TaskOutput) -> Self {
        Self {
            output,
            external: None,
        }
    }

    pub fn with_external(mut self, external: ExternalRef) -> Self {
        self.external = Some(external);
        self
    }
}

/// What a strategy produced for one execution pass.
pub enum StrategyOutcome {
    /// The task's work is done; record outputs and complete it.
    Done(TaskCompletion),
    /// External work has not reached a terminal state. The task stays
    /// `Pending` and is re-evaluated next tick.
    InProgress,
}

/// One execution strategy, keyed by task type in the dispatch table.
#[async_trait::async_trait]
pub trait TaskStrategy: Send + Sync {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError>;
}

/// Executes single tasks against the strategy table and persists the
/// resulting transition.
pub struct TaskExecutor {
    strategies: StrategyTable,
    tasks: Arc<dyn TaskRepository>,
    activity: Arc<dyn ActivityLogSink>,
    clock: Arc<dyn Clock>,
}

impl TaskExecutor {
    pub fn new(
        integrations: Arc<Integrations>,
        tasks: Arc<dyn TaskRepository>,
        activity: Arc<dyn ActivityLogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategies: StrategyTable::new(integrations),
            tasks,
            activity,
            clock,
        }
    }

    /// Execute one task and persist the outcome. Returns the stored row,
    /// which may be unchanged when the external system is still running.
    pub async fn execute(
        &self,
        ctx: &TaskContext<'_>,
    ) -> Result<ReleaseTask, EngineError> {
        let task = ctx.task;
        let previous_status = task.status;

        let outcome = match self.strategies.get(task.task_type) {
            Some(strategy) => strategy.run(ctx).await,
            None => Err(ExecutionError::Precondition(format!(
                "no strategy registered for {:?}",
                task.task_type
            ))),
        };

        let mut updated = task.clone();
        updated.updated_at = self.clock.now();

        match outcome {
            Ok(StrategyOutcome::Done(completion)) => {
                updated.status = TaskStatus::Completed;
                updated.output = completion.output;
                if let Some(external) = completion.external {
                    updated.external_id = Some(external.id);
                    updated.external_data = Some(external.data);
                }
            }
            Ok(StrategyOutcome::InProgress) => {
                // Not terminal yet; stays Pending for the next tick.
                info!(
                    task_id = %task.id,
                    task_type = ?task.task_type,
                    "external work still running"
                );
                return Ok(task.clone());
            }
            Err(err) => {
                warn!(
                    task_id = %task.id,
                    task_type = ?task.task_type,
                    error = %err,
                    "task execution failed"
                );
                updated.status = TaskStatus::Failed;
                updated.output.error = Some(TaskErrorPayload {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }

        let saved = self.tasks.update(updated).await?;
        info!(
            task_id = %saved.id,
            task_type = ?saved.task_type,
            status = ?saved.status,
            "task executed"
        );

        if saved.status != previous_status {
            let entry = ActivityEntry::new(
                saved.release_id,
                None,
                saved.updated_at,
                ActivityKind::TaskStatusChanged,
                previous_status,
                saved.status,
            );
            // Audit is best-effort; a sink hiccup must not fail the task.
            if let Err(err) = self.activity.record(entry).await {
                warn!(task_id = %saved.id, error = %err, "failed to record activity entry");
            }
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::integrations::{ExternalState, fakes};
    use crate::model::{
        ExecutionErrorKind, Platform, Release, ReleaseType, TaskType,
    };
    use crate::repo::InMemoryActivityLog;
    use crate::repo::memory::InMemoryTaskRepository;
    use chrono::Utc;
    use uuid::Uuid;

    fn release() -> Release {
        Release::new(
            Uuid::new_v4(),
            ReleaseType::Minor,
            "release/7.2.0",
            "main",
            Utc::now(),
        )
        .with_target(Platform::Ios, "app-store", "7.2.0")
    }

    async fn executor_with(
        integrations: Integrations,
        tasks: Arc<InMemoryTaskRepository>,
    ) -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(integrations),
            tasks,
            Arc::new(InMemoryActivityLog::new()),
            Arc::new(FixedClock::new(Utc::now())),
        )
    }

    async fn stored_task(
        tasks: &Arc<InMemoryTaskRepository>,
        release: &Release,
        task_type: TaskType,
    ) -> ReleaseTask {
        let task = ReleaseTask::new(
            release.tenant_id,
            release.id,
            task_type.stage(),
            task_type,
            None,
            Utc::now(),
        );
        use crate::repo::TaskRepository as _;
        tasks.create(task).await.unwrap()
    }

    #[tokio::test]
    async fn successful_execution_stores_output_and_external_ref() {
        let release = release();
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let integrations =
            Integrations::new().with_source_control(Arc::new(fakes::FakeSourceControl::new()));
        let executor = executor_with(integrations, tasks.clone()).await;

        let task = stored_task(&tasks, &release, TaskType::CreateReleaseBranch).await;
        let ctx = TaskContext {
            release: &release,
            task: &task,
            scope: &[],
            prior: &[],
            cycle_tag: None,
        };

        let saved = executor.execute(&ctx).await.unwrap();
        assert_eq!(saved.status, TaskStatus::Completed);
        assert!(saved.external_id.is_some());
        assert!(saved.output.message.is_some());
    }

    #[tokio::test]
    async fn missing_integration_fails_with_not_configured_kind() {
        let release = release();
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let executor = executor_with(Integrations::new(), tasks.clone()).await;

        let task = stored_task(&tasks, &release, TaskType::CreateProjectManagementTicket).await;
        let ctx = TaskContext {
            release: &release,
            task: &task,
            scope: &[],
            prior: &[],
            cycle_tag: None,
        };

        let saved = executor.execute(&ctx).await.unwrap();
        assert_eq!(saved.status, TaskStatus::Failed);
        let error = saved.output.error.expect("error payload");
        assert_eq!(error.kind, ExecutionErrorKind::NotConfigured);
    }

    #[tokio::test]
    async fn check_task_stays_pending_while_external_work_runs() {
        let release = release();
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let ci = Arc::new(fakes::FakeCi::new());
        let integrations = Integrations::new().with_ci(ci.clone());
        let executor = executor_with(integrations, tasks.clone()).await;

        let mut trigger = stored_task(&tasks, &release, TaskType::TriggerPreRegressionBuilds).await;
        trigger.status = TaskStatus::Completed;
        trigger.external_id = Some("ci-1".to_string());
        let check = stored_task(&tasks, &release, TaskType::CheckPreRegressionBuilds).await;

        ci.set_status("ci-1", ExternalState::Running).await;
        let scope = vec![trigger.clone(), check.clone()];
        let ctx = TaskContext {
            release: &release,
            task: &check,
            scope: &scope,
            prior: &[],
            cycle_tag: None,
        };
        let saved = executor.execute(&ctx).await.unwrap();
        assert_eq!(saved.status, TaskStatus::Pending);

        ci.set_status("ci-1", ExternalState::Succeeded).await;
        let saved = executor.execute(&ctx).await.unwrap();
        assert_eq!(saved.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_not_thrown() {
        let release = release();
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let ci = Arc::new(fakes::FakeCi::new());
        let integrations = Integrations::new().with_ci(ci.clone());
        let executor = executor_with(integrations, tasks.clone()).await;

        let mut trigger = stored_task(&tasks, &release, TaskType::TriggerPreRegressionBuilds).await;
        trigger.status = TaskStatus::Completed;
        trigger.external_id = Some("ci-9".to_string());
        let check = stored_task(&tasks, &release, TaskType::CheckPreRegressionBuilds).await;

        ci.set_status("ci-9", ExternalState::Failed).await;
        let scope = vec![trigger, check.clone()];
        let ctx = TaskContext {
            release: &release,
            task: &check,
            scope: &scope,
            prior: &[],
            cycle_tag: None,
        };

        let saved = executor.execute(&ctx).await.unwrap();
        assert_eq!(saved.status, TaskStatus::Failed);
        assert_eq!(
            saved.output.error.unwrap().kind,
            ExecutionErrorKind::Provider
        );
    }
}
