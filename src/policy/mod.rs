//! Task sequencing policy: pure functions computing order, eligibility,
//! and required-vs-optional status for a stage.
//!
//! Nothing here touches a repository or a provider. The coordinator
//! computes one `StagePolicy` per tick and passes it to creation,
//! execution, and completion checks so required-ness cannot drift
//! between call sites.

use serde::{Deserialize, Serialize};

use crate::model::{CronConfig, Platform, ReleaseStage, ReleaseTask, TaskStatus, TaskType};

/// Which integration families are configured for the tenant.
///
/// A task whose enabling integration is absent is optional: it never
/// blocks stage completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IntegrationSet {
    pub source_control: bool,
    pub ci: bool,
    pub project_management: bool,
    pub test_management: bool,
    pub chat: bool,
    pub store_connect: bool,
}

impl IntegrationSet {
    /// Every integration available.
    pub fn all() -> Self {
        Self {
            source_control: true,
            ci: true,
            project_management: true,
            test_management: true,
            chat: true,
            store_connect: true,
        }
    }
}

/// Canonical execution order for the kickoff stage.
const KICKOFF_ORDER: &[TaskType] = &[
    TaskType::CreateReleaseBranch,
    TaskType::CreateProjectManagementTicket,
    TaskType::CreateTestManagementPlan,
    TaskType::SendKickoffReminder,
    TaskType::TriggerPreRegressionBuilds,
    TaskType::CheckPreRegressionBuilds,
    TaskType::NotifyKickoffComplete,
];

/// Canonical execution order for one regression cycle.
const REGRESSION_ORDER: &[TaskType] = &[
    TaskType::TriggerRegressionBuilds,
    TaskType::CreateRegressionTestRuns,
    TaskType::CheckRegressionTestRuns,
    TaskType::NotifyRegressionStatus,
];

/// Canonical execution order for the post-regression stage.
const POST_REGRESSION_ORDER: &[TaskType] = &[
    TaskType::TriggerTestFlightBuild,
    TaskType::CheckTestFlightBuild,
    TaskType::TriggerReleaseCandidateBuilds,
    TaskType::CheckReleaseCandidateBuilds,
    TaskType::CreateReleaseTag,
    TaskType::CloseProjectManagementTicket,
    TaskType::NotifyReleaseReady,
];

/// The fixed task set (and canonical order) for a stage.
pub fn stage_order(stage: ReleaseStage) -> &'static [TaskType] {
    match stage {
        ReleaseStage::Kickoff => KICKOFF_ORDER,
        ReleaseStage::Regression => REGRESSION_ORDER,
        ReleaseStage::PostRegression => POST_REGRESSION_ORDER,
    }
}

fn order_position(stage: ReleaseStage, task_type: TaskType) -> usize {
    let table = stage_order(stage);
    // Types outside the stage's table sort last.
    table
        .iter()
        .position(|t| *t == task_type)
        .unwrap_or(table.len())
}

/// Return tasks in the stage's canonical order. Ties (types outside the
/// table) break by creation time, then id, so repeated calls on the same
/// input produce the same total order.
pub fn order_tasks(mut tasks: Vec<ReleaseTask>, stage: ReleaseStage) -> Vec<ReleaseTask> {
    tasks.sort_by(|a, b| {
        order_position(stage, a.task_type)
            .cmp(&order_position(stage, b.task_type))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    tasks
}

/// Required-ness decisions for one stage, computed once per tick from the
/// integration set, the effective cron config, and the release's
/// platforms.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    stage: ReleaseStage,
    integrations: IntegrationSet,
    config: CronConfig,
    targets_ios: bool,
}

impl StagePolicy {
    pub fn new(
        stage: ReleaseStage,
        integrations: IntegrationSet,
        config: CronConfig,
        platforms: &[Platform],
    ) -> Self {
        Self {
            stage,
            integrations,
            config,
            targets_ios: platforms.contains(&Platform::Ios),
        }
    }

    pub fn stage(&self) -> ReleaseStage {
        self.stage
    }

    /// Whether a task of this kind blocks stage completion.
    ///
    /// A task is optional when its enabling integration is absent or a
    /// cron-config toggle disables it. TestFlight verification requires
    /// both an iOS target and the `test_flight_builds` toggle.
    pub fn is_required(&self, task_type: TaskType) -> bool {
        let i = self.integrations;
        let c = self.config;
        match task_type {
            TaskType::CreateReleaseBranch | TaskType::CreateReleaseTag => i.source_control,
            TaskType::CreateProjectManagementTicket => i.project_management,
            TaskType::CloseProjectManagementTicket => i.project_management && c.auto_ticket_updates,
            TaskType::CreateTestManagementPlan
            | TaskType::CreateRegressionTestRuns
            | TaskType::CheckRegressionTestRuns => i.test_management,
            TaskType::SendKickoffReminder => i.chat && c.kick_off_reminder,
            TaskType::NotifyRegressionStatus => i.chat && c.regression_reminder,
            TaskType::NotifyKickoffComplete | TaskType::NotifyReleaseReady => i.chat,
            TaskType::TriggerPreRegressionBuilds | TaskType::CheckPreRegressionBuilds => {
                i.ci && c.pre_regression_builds
            }
            TaskType::TriggerReleaseCandidateBuilds | TaskType::CheckReleaseCandidateBuilds => i.ci,
            // Staged-build consumption is part of every cycle.
            TaskType::TriggerRegressionBuilds => true,
            TaskType::TriggerTestFlightBuild | TaskType::CheckTestFlightBuild => {
                i.store_connect && c.test_flight_builds && self.targets_ios
            }
        }
    }
}

/// True iff every required task ordered strictly before `task` is
/// completed. Tasks not in the ordered list (foreign id) gate on the
/// whole list.
pub fn are_previous_tasks_complete(
    task: &ReleaseTask,
    ordered: &[ReleaseTask],
    policy: &StagePolicy,
) -> bool {
    let position = ordered
        .iter()
        .position(|t| t.id == task.id)
        .unwrap_or(ordered.len());
    ordered[..position]
        .iter()
        .filter(|prior| policy.is_required(prior.task_type))
        .all(|prior| prior.status.is_completed())
}

/// Whether a task may execute this tick.
///
/// `is_time_to_execute` is the caller-supplied time gate, e.g. "now is
/// past the kickoff date" for stage-1 reminder tasks.
pub fn can_execute_task(
    task: &ReleaseTask,
    ordered: &[ReleaseTask],
    policy: &StagePolicy,
    is_time_to_execute: impl Fn(&ReleaseTask) -> bool,
) -> bool {
    task.status == TaskStatus::Pending
        && policy.is_required(task.task_type)
        && are_previous_tasks_complete(task, ordered, policy)
        && is_time_to_execute(task)
}

/// Stage completion: every required task is completed. Non-required
/// tasks never block, whatever their status.
pub fn stage_complete(ordered: &[ReleaseTask], policy: &StagePolicy) -> bool {
    ordered
        .iter()
        .filter(|task| policy.is_required(task.task_type))
        .all(|task| task.status.is_completed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn task(task_type: TaskType, status: TaskStatus) -> ReleaseTask {
        let mut t = ReleaseTask::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            task_type.stage(),
            task_type,
            None,
            Utc::now(),
        );
        t.status = status;
        t
    }

    fn stage_tasks(stage: ReleaseStage, status: TaskStatus) -> Vec<ReleaseTask> {
        stage_order(stage).iter().map(|t| task(*t, status)).collect()
    }

    fn full_policy(stage: ReleaseStage) -> StagePolicy {
        StagePolicy::new(
            stage,
            IntegrationSet::all(),
            CronConfig::default(),
            &[Platform::Ios, Platform::Android],
        )
    }

    #[test]
    fn order_tables_cover_every_task_type_exactly_once() {
        let mut covered: Vec<TaskType> = Vec::new();
        for stage in ReleaseStage::ALL {
            for task_type in stage_order(stage) {
                assert_eq!(task_type.stage(), stage);
                assert!(!covered.contains(task_type), "{task_type:?} listed twice");
                covered.push(*task_type);
            }
        }
        assert_eq!(covered.len(), TaskType::ALL.len());
    }

    #[test]
    fn order_is_deterministic_across_calls() {
        let mut tasks = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Pending);
        tasks.reverse();

        let first = order_tasks(tasks.clone(), ReleaseStage::Kickoff);
        let second = order_tasks(tasks, ReleaseStage::Kickoff);
        let first_ids: Vec<_> = first.iter().map(|t| t.id).collect();
        let second_ids: Vec<_> = second.iter().map(|t| t.id).collect();
        assert_eq!(first_ids, second_ids);

        let types: Vec<_> = first.iter().map(|t| t.task_type).collect();
        assert_eq!(types, stage_order(ReleaseStage::Kickoff).to_vec());
    }

    #[test]
    fn foreign_types_sort_last_by_creation_order() {
        // A regression-stage type in a kickoff list has no table position.
        let mut stray_old = task(TaskType::NotifyRegressionStatus, TaskStatus::Pending);
        stray_old.created_at = Utc::now() - Duration::hours(1);
        let stray_new = task(TaskType::NotifyRegressionStatus, TaskStatus::Pending);
        let branch = task(TaskType::CreateReleaseBranch, TaskStatus::Pending);

        let ordered = order_tasks(
            vec![stray_new.clone(), branch.clone(), stray_old.clone()],
            ReleaseStage::Kickoff,
        );
        assert_eq!(ordered[0].id, branch.id);
        assert_eq!(ordered[1].id, stray_old.id);
        assert_eq!(ordered[2].id, stray_new.id);
    }

    #[test]
    fn ticket_task_not_required_without_project_management() {
        let integrations = IntegrationSet {
            project_management: false,
            ..IntegrationSet::all()
        };
        let policy = StagePolicy::new(
            ReleaseStage::Kickoff,
            integrations,
            CronConfig::default(),
            &[Platform::Ios],
        );
        assert!(!policy.is_required(TaskType::CreateProjectManagementTicket));
        assert!(policy.is_required(TaskType::CreateReleaseBranch));
    }

    #[test]
    fn test_flight_requires_ios_and_toggle() {
        let android_only = StagePolicy::new(
            ReleaseStage::PostRegression,
            IntegrationSet::all(),
            CronConfig::default(),
            &[Platform::Android],
        );
        assert!(!android_only.is_required(TaskType::TriggerTestFlightBuild));

        let toggled_off = StagePolicy::new(
            ReleaseStage::PostRegression,
            IntegrationSet::all(),
            CronConfig::default().with_test_flight_builds(false),
            &[Platform::Ios],
        );
        assert!(!toggled_off.is_required(TaskType::TriggerTestFlightBuild));

        let ios = StagePolicy::new(
            ReleaseStage::PostRegression,
            IntegrationSet::all(),
            CronConfig::default(),
            &[Platform::Ios],
        );
        assert!(ios.is_required(TaskType::CheckTestFlightBuild));
    }

    #[test]
    fn cannot_execute_unless_pending() {
        let policy = full_policy(ReleaseStage::PostRegression);
        let ordered = stage_tasks(ReleaseStage::PostRegression, TaskStatus::Completed);

        for t in &ordered {
            assert!(!can_execute_task(t, &ordered, &policy, |_| true));
        }
        for status in [TaskStatus::InProgress, TaskStatus::Failed, TaskStatus::Skipped] {
            let t = task(TaskType::CreateReleaseTag, status);
            assert!(!can_execute_task(&t, &ordered, &policy, |_| true));
        }
    }

    #[test]
    fn previous_required_tasks_gate_execution() {
        let policy = full_policy(ReleaseStage::Kickoff);
        let mut ordered = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Pending);

        // First task is eligible, second is blocked on the first.
        assert!(can_execute_task(&ordered[0], &ordered, &policy, |_| true));
        assert!(!can_execute_task(&ordered[1], &ordered, &policy, |_| true));

        ordered[0].status = TaskStatus::Completed;
        assert!(can_execute_task(&ordered[1], &ordered, &policy, |_| true));
    }

    #[test]
    fn optional_predecessors_do_not_gate() {
        let integrations = IntegrationSet {
            project_management: false,
            test_management: false,
            chat: false,
            ..IntegrationSet::all()
        };
        let policy = StagePolicy::new(
            ReleaseStage::Kickoff,
            integrations,
            CronConfig::default(),
            &[Platform::Ios],
        );
        let mut ordered = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Pending);
        ordered[0].status = TaskStatus::Completed; // branch created

        // Ticket/plan/reminder are optional, so the build trigger is next.
        let trigger = ordered
            .iter()
            .find(|t| t.task_type == TaskType::TriggerPreRegressionBuilds)
            .unwrap()
            .clone();
        assert!(can_execute_task(&trigger, &ordered, &policy, |_| true));
    }

    #[test]
    fn time_gate_blocks_execution() {
        let policy = full_policy(ReleaseStage::Kickoff);
        let ordered = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Pending);
        assert!(!can_execute_task(&ordered[0], &ordered, &policy, |_| false));
    }

    #[test]
    fn stage_with_all_tasks_optional_reports_complete() {
        let policy = StagePolicy::new(
            ReleaseStage::Kickoff,
            IntegrationSet::default(),
            CronConfig::default(),
            &[Platform::Web],
        );
        let tasks = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Pending);
        assert!(stage_complete(&tasks, &policy));
        assert_eq!(
            tasks.iter().filter(|t| t.status.is_completed()).count(),
            0
        );
    }

    #[test]
    fn failed_required_task_blocks_completion() {
        let policy = full_policy(ReleaseStage::PostRegression);
        let mut tasks = stage_tasks(ReleaseStage::PostRegression, TaskStatus::Completed);
        tasks[4].status = TaskStatus::Failed; // release tag
        assert!(!stage_complete(&tasks, &policy));

        tasks[4].status = TaskStatus::Completed;
        assert!(stage_complete(&tasks, &policy));
    }

    #[test]
    fn skipped_optional_tasks_never_block_completion() {
        let integrations = IntegrationSet {
            chat: false,
            ..IntegrationSet::all()
        };
        let policy = StagePolicy::new(
            ReleaseStage::Kickoff,
            integrations,
            CronConfig::default(),
            &[Platform::Ios],
        );
        let mut tasks = stage_tasks(ReleaseStage::Kickoff, TaskStatus::Completed);
        for t in &mut tasks {
            if matches!(
                t.task_type,
                TaskType::SendKickoffReminder | TaskType::NotifyKickoffComplete
            ) {
                t.status = TaskStatus::Skipped;
            }
        }
        assert!(stage_complete(&tasks, &policy));
    }
}
