//! Scripted provider doubles for tests and local runs.
//!
//! Each fake records the calls it received and lets the test script
//! external state (build status, failures) between poll ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    BuildPurpose, ChatProvider, CiProvider, ExternalRef, ExternalState, SourceControlProvider,
    StoreProvider, TestManagementProvider, TicketProvider,
};
use crate::errors::ExecutionError;
use crate::model::{Platform, Release};

fn next_id(counter: &AtomicU64, prefix: &str) -> String {
    format!("{prefix}-{}", counter.fetch_add(1, Ordering::SeqCst) + 1)
}

/// Source control double: records branches and tags.
#[derive(Default)]
pub struct FakeSourceControl {
    counter: AtomicU64,
    pub branches: RwLock<Vec<String>>,
    pub tags: RwLock<Vec<String>>,
}

impl FakeSourceControl {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceControlProvider for FakeSourceControl {
    async fn create_branch(&self, release: &Release) -> Result<ExternalRef, ExecutionError> {
        self.branches.write().await.push(release.branch.clone());
        Ok(ExternalRef::new(next_id(&self.counter, "branch")))
    }

    async fn create_tag(
        &self,
        _release: &Release,
        tag: &str,
    ) -> Result<ExternalRef, ExecutionError> {
        self.tags.write().await.push(tag.to_string());
        Ok(ExternalRef::new(next_id(&self.counter, "tag")))
    }
}

/// CI double with scriptable build statuses.
#[derive(Default)]
pub struct FakeCi {
    counter: AtomicU64,
    statuses: RwLock<HashMap<String, ExternalState>>,
    pub triggered: RwLock<Vec<(BuildPurpose, Vec<Platform>)>>,
}

impl FakeCi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the status reported for a build id.
    pub async fn set_status(&self, external_id: &str, state: ExternalState) {
        self.statuses
            .write()
            .await
            .insert(external_id.to_string(), state);
    }
}

#[async_trait]
impl CiProvider for FakeCi {
    async fn trigger_builds(
        &self,
        _release: &Release,
        platforms: &[Platform],
        purpose: BuildPurpose,
    ) -> Result<ExternalRef, ExecutionError> {
        self.triggered
            .write()
            .await
            .push((purpose, platforms.to_vec()));
        let id = next_id(&self.counter, "ci");
        // Fresh builds start queued unless the test scripts otherwise.
        self.statuses
            .write()
            .await
            .entry(id.clone())
            .or_insert(ExternalState::Queued);
        Ok(ExternalRef::new(id))
    }

    async fn build_status(&self, external_id: &str) -> Result<ExternalState, ExecutionError> {
        self.statuses
            .read()
            .await
            .get(external_id)
            .copied()
            .ok_or_else(|| ExecutionError::Transient {
                message: format!("unknown build {external_id}"),
            })
    }
}

/// Ticketing double.
#[derive(Default)]
pub struct FakeTickets {
    counter: AtomicU64,
    pub created: RwLock<Vec<String>>,
    pub closed: RwLock<Vec<String>>,
}

impl FakeTickets {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketProvider for FakeTickets {
    async fn create_release_ticket(
        &self,
        _release: &Release,
    ) -> Result<ExternalRef, ExecutionError> {
        let id = next_id(&self.counter, "REL");
        self.created.write().await.push(id.clone());
        Ok(ExternalRef::new(id))
    }

    async fn close_release_ticket(&self, external_id: &str) -> Result<(), ExecutionError> {
        self.closed.write().await.push(external_id.to_string());
        Ok(())
    }
}

/// Test-management double with scriptable run statuses.
#[derive(Default)]
pub struct FakeTestManagement {
    counter: AtomicU64,
    statuses: RwLock<HashMap<String, ExternalState>>,
}

impl FakeTestManagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_run_status(&self, external_id: &str, state: ExternalState) {
        self.statuses
            .write()
            .await
            .insert(external_id.to_string(), state);
    }
}

#[async_trait]
impl TestManagementProvider for FakeTestManagement {
    async fn create_plan(&self, _release: &Release) -> Result<ExternalRef, ExecutionError> {
        Ok(ExternalRef::new(next_id(&self.counter, "plan")))
    }

    async fn create_runs(
        &self,
        _release: &Release,
        _cycle_tag: &str,
    ) -> Result<ExternalRef, ExecutionError> {
        let id = next_id(&self.counter, "run");
        self.statuses
            .write()
            .await
            .entry(id.clone())
            .or_insert(ExternalState::Running);
        Ok(ExternalRef::new(id))
    }

    async fn run_status(&self, external_id: &str) -> Result<ExternalState, ExecutionError> {
        self.statuses
            .read()
            .await
            .get(external_id)
            .copied()
            .ok_or_else(|| ExecutionError::Transient {
                message: format!("unknown test run {external_id}"),
            })
    }
}

/// Chat double recording sent messages; can be scripted to fail.
#[derive(Default)]
pub struct FakeChat {
    pub messages: RwLock<Vec<String>>,
    fail_with: RwLock<Option<String>>,
}

impl FakeChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent notifications fail transiently.
    pub async fn fail_with(&self, message: &str) {
        *self.fail_with.write().await = Some(message.to_string());
    }

    /// Clear a scripted failure.
    pub async fn recover(&self) {
        *self.fail_with.write().await = None;
    }
}

#[async_trait]
impl ChatProvider for FakeChat {
    async fn notify(&self, _release: &Release, message: &str) -> Result<(), ExecutionError> {
        if let Some(failure) = self.fail_with.read().await.clone() {
            return Err(ExecutionError::Transient { message: failure });
        }
        self.messages.write().await.push(message.to_string());
        Ok(())
    }
}

/// Store-connect double with scriptable TestFlight processing states.
#[derive(Default)]
pub struct FakeStore {
    counter: AtomicU64,
    statuses: RwLock<HashMap<String, ExternalState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, external_id: &str, state: ExternalState) {
        self.statuses
            .write()
            .await
            .insert(external_id.to_string(), state);
    }
}

#[async_trait]
impl StoreProvider for FakeStore {
    async fn trigger_test_flight(
        &self,
        _release: &Release,
    ) -> Result<ExternalRef, ExecutionError> {
        let id = next_id(&self.counter, "tf");
        self.statuses
            .write()
            .await
            .entry(id.clone())
            .or_insert(ExternalState::Running);
        Ok(ExternalRef::new(id))
    }

    async fn test_flight_status(
        &self,
        external_id: &str,
    ) -> Result<ExternalState, ExecutionError> {
        self.statuses
            .read()
            .await
            .get(external_id)
            .copied()
            .ok_or_else(|| ExecutionError::Transient {
                message: format!("unknown TestFlight build {external_id}"),
            })
    }
}
