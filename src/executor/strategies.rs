//! Execution strategies, one per task-type family, and the dispatch
//! table that maps every task kind to its strategy at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{StrategyOutcome, TaskCompletion, TaskContext, TaskStrategy};
use crate::errors::ExecutionError;
use crate::integrations::{BuildPurpose, ExternalState, Integrations};
use crate::model::{TaskOutput, TaskType};

/// Find the external reference stored by this check task's trigger
/// counterpart in the same scope.
fn upstream_external_id(ctx: &TaskContext<'_>) -> Result<String, ExecutionError> {
    let trigger_type = ctx
        .task
        .task_type
        .trigger_counterpart()
        .ok_or_else(|| {
            ExecutionError::Precondition(format!(
                "{:?} has no trigger counterpart",
                ctx.task.task_type
            ))
        })?;
    ctx.scope
        .iter()
        .find(|t| t.task_type == trigger_type)
        .and_then(|t| t.external_id.clone())
        .ok_or_else(|| {
            ExecutionError::Precondition(format!(
                "{trigger_type:?} has not recorded an external reference"
            ))
        })
}

/// Find the external reference of a task from an earlier stage.
fn prior_external_id(
    ctx: &TaskContext<'_>,
    task_type: TaskType,
) -> Result<String, ExecutionError> {
    ctx.prior
        .iter()
        .find(|t| t.task_type == task_type)
        .and_then(|t| t.external_id.clone())
        .ok_or_else(|| {
            ExecutionError::Precondition(format!(
                "{task_type:?} from an earlier stage has no external reference"
            ))
        })
}

/// Cut the release branch.
struct CreateBranchStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CreateBranchStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_source_control()?;
        let external = provider.create_branch(ctx.release).await?;
        let output = TaskOutput::message(format!(
            "created branch {} from {}",
            ctx.release.branch, ctx.release.base_branch
        ));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Tag the release.
struct CreateTagStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CreateTagStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_source_control()?;
        let tag = ctx.release.tag_name();
        let external = provider.create_tag(ctx.release, &tag).await?;
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(TaskOutput::message(format!("created tag {tag}")))
                .with_external(external),
        ))
    }
}

/// Open the release ticket in the project-management system.
struct CreateTicketStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CreateTicketStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_project_management()?;
        let external = provider.create_release_ticket(ctx.release).await?;
        let output = TaskOutput::message(format!("created release ticket {}", external.id));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Close the ticket opened at kickoff.
struct CloseTicketStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CloseTicketStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_project_management()?;
        let ticket_id = prior_external_id(ctx, TaskType::CreateProjectManagementTicket)?;
        provider.close_release_ticket(&ticket_id).await?;
        Ok(StrategyOutcome::Done(TaskCompletion::new(
            TaskOutput::message(format!("closed release ticket {ticket_id}")),
        )))
    }
}

/// Create the release's test plan.
struct CreateTestPlanStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CreateTestPlanStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_test_management()?;
        let external = provider.create_plan(ctx.release).await?;
        let output = TaskOutput::message(format!("created test plan {}", external.id));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Create the test runs for a regression cycle.
struct CreateTestRunsStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CreateTestRunsStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_test_management()?;
        let cycle_tag = ctx.cycle_tag.ok_or_else(|| {
            ExecutionError::Precondition("task is not scoped to a regression cycle".to_string())
        })?;
        let external = provider.create_runs(ctx.release, cycle_tag).await?;
        let output =
            TaskOutput::message(format!("created test runs for cycle {cycle_tag}"));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Poll the regression test runs until they finish.
struct CheckTestRunsStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CheckTestRunsStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_test_management()?;
        let run_id = upstream_external_id(ctx)?;
        match provider.run_status(&run_id).await? {
            ExternalState::Succeeded => Ok(StrategyOutcome::Done(TaskCompletion::new(
                TaskOutput::message(format!("test runs {run_id} passed")),
            ))),
            ExternalState::Failed => Err(ExecutionError::Provider {
                integration: "test management",
                message: format!("test runs {run_id} failed"),
            }),
            ExternalState::Queued | ExternalState::Running => Ok(StrategyOutcome::InProgress),
        }
    }
}

/// Trigger a CI build batch.
struct TriggerBuildsStrategy {
    integrations: Arc<Integrations>,
    purpose: BuildPurpose,
}

#[async_trait]
impl TaskStrategy for TriggerBuildsStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_ci()?;
        let platforms = ctx.release.platforms();
        let external = provider
            .trigger_builds(ctx.release, &platforms, self.purpose)
            .await?;
        let output = TaskOutput::message(format!(
            "triggered {:?} builds for {} platform(s)",
            self.purpose,
            platforms.len()
        ));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Poll a CI build batch until it finishes.
struct CheckBuildsStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CheckBuildsStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_ci()?;
        let build_id = upstream_external_id(ctx)?;
        match provider.build_status(&build_id).await? {
            ExternalState::Succeeded => Ok(StrategyOutcome::Done(TaskCompletion::new(
                TaskOutput::message(format!("builds {build_id} succeeded")),
            ))),
            ExternalState::Failed => Err(ExecutionError::Provider {
                integration: "ci",
                message: format!("builds {build_id} failed"),
            }),
            ExternalState::Queued | ExternalState::Running => Ok(StrategyOutcome::InProgress),
        }
    }
}

/// Push a TestFlight build.
struct TriggerTestFlightStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for TriggerTestFlightStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_store_connect()?;
        let external = provider.trigger_test_flight(ctx.release).await?;
        let output = TaskOutput::message(format!("submitted TestFlight build {}", external.id));
        Ok(StrategyOutcome::Done(
            TaskCompletion::new(output).with_external(external),
        ))
    }
}

/// Poll TestFlight processing until the build is available.
struct CheckTestFlightStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for CheckTestFlightStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_store_connect()?;
        let build_id = upstream_external_id(ctx)?;
        match provider.test_flight_status(&build_id).await? {
            ExternalState::Succeeded => Ok(StrategyOutcome::Done(TaskCompletion::new(
                TaskOutput::message(format!("TestFlight build {build_id} processed")),
            ))),
            ExternalState::Failed => Err(ExecutionError::Provider {
                integration: "store connect",
                message: format!("TestFlight build {build_id} rejected"),
            }),
            ExternalState::Queued | ExternalState::Running => Ok(StrategyOutcome::InProgress),
        }
    }
}

/// Send a chat notification; the message depends on the task kind.
struct NotifyStrategy {
    integrations: Arc<Integrations>,
}

#[async_trait]
impl TaskStrategy for NotifyStrategy {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<StrategyOutcome, ExecutionError> {
        let provider = self.integrations.require_chat()?;
        let release = ctx.release;
        let message = match ctx.task.task_type {
            TaskType::SendKickoffReminder => {
                format!("Release {} kicks off today", release.branch)
            }
            TaskType::NotifyKickoffComplete => {
                format!("Kickoff complete for {}", release.branch)
            }
            TaskType::NotifyRegressionStatus => format!(
                "Regression {} underway for {}",
                ctx.cycle_tag.unwrap_or("cycle"),
                release.branch
            ),
            TaskType::NotifyReleaseReady => {
                format!("{} is ready for release", release.branch)
            }
            other => {
                return Err(ExecutionError::Precondition(format!(
                    "notify strategy cannot handle {other:?}"
                )));
            }
        };
        provider.notify(release, &message).await?;
        Ok(StrategyOutcome::Done(TaskCompletion::new(
            TaskOutput::message(message),
        )))
    }
}

/// Dispatch table built once at startup.
///
/// The constructor matches over every `TaskType` variant, so a new task
/// kind without a strategy is a compile error, not a runtime surprise.
pub struct StrategyTable {
    map: HashMap<TaskType, Arc<dyn TaskStrategy>>,
}

impl StrategyTable {
    pub fn new(integrations: Arc<Integrations>) -> Self {
        let mut map: HashMap<TaskType, Arc<dyn TaskStrategy>> = HashMap::new();
        for task_type in TaskType::ALL {
            let i = integrations.clone();
            let strategy: Arc<dyn TaskStrategy> = match task_type {
                TaskType::CreateReleaseBranch => Arc::new(CreateBranchStrategy { integrations: i }),
                TaskType::CreateReleaseTag => Arc::new(CreateTagStrategy { integrations: i }),
                TaskType::CreateProjectManagementTicket => {
                    Arc::new(CreateTicketStrategy { integrations: i })
                }
                TaskType::CloseProjectManagementTicket => {
                    Arc::new(CloseTicketStrategy { integrations: i })
                }
                TaskType::CreateTestManagementPlan => {
                    Arc::new(CreateTestPlanStrategy { integrations: i })
                }
                TaskType::CreateRegressionTestRuns => {
                    Arc::new(CreateTestRunsStrategy { integrations: i })
                }
                TaskType::CheckRegressionTestRuns => {
                    Arc::new(CheckTestRunsStrategy { integrations: i })
                }
                TaskType::TriggerPreRegressionBuilds => Arc::new(TriggerBuildsStrategy {
                    integrations: i,
                    purpose: BuildPurpose::PreRegression,
                }),
                TaskType::TriggerRegressionBuilds => Arc::new(TriggerBuildsStrategy {
                    integrations: i,
                    purpose: BuildPurpose::Regression,
                }),
                TaskType::TriggerReleaseCandidateBuilds => Arc::new(TriggerBuildsStrategy {
                    integrations: i,
                    purpose: BuildPurpose::ReleaseCandidate,
                }),
                TaskType::CheckPreRegressionBuilds
                | TaskType::CheckReleaseCandidateBuilds => {
                    Arc::new(CheckBuildsStrategy { integrations: i })
                }
                TaskType::TriggerTestFlightBuild => {
                    Arc::new(TriggerTestFlightStrategy { integrations: i })
                }
                TaskType::CheckTestFlightBuild => {
                    Arc::new(CheckTestFlightStrategy { integrations: i })
                }
                TaskType::SendKickoffReminder
                | TaskType::NotifyKickoffComplete
                | TaskType::NotifyRegressionStatus
                | TaskType::NotifyReleaseReady => Arc::new(NotifyStrategy { integrations: i }),
            };
            map.insert(task_type, strategy);
        }
        Self { map }
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskStrategy>> {
        self.map.get(&task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_task_type() {
        let table = StrategyTable::new(Arc::new(Integrations::new()));
        for task_type in TaskType::ALL {
            assert!(table.get(task_type).is_some(), "{task_type:?} unmapped");
        }
    }
}
