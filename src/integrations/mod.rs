//! Narrow contracts for the external systems tasks execute against.
//!
//! Wire formats, auth, and retries are the providers' concern; the
//! engine only sees these shapes. An absent provider makes its tasks
//! optional (see the policy module).

pub mod fakes;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;
use crate::model::{Platform, Release};
use crate::policy::IntegrationSet;

/// Reference to work started in an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Raw provider response payload, persisted as `external_data`.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ExternalRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// State of externally-running work, as reported by its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ExternalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// What a CI build batch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPurpose {
    PreRegression,
    Regression,
    ReleaseCandidate,
}

/// Source control (branch and tag management).
#[async_trait]
pub trait SourceControlProvider: Send + Sync {
    async fn create_branch(&self, release: &Release) -> Result<ExternalRef, ExecutionError>;

    async fn create_tag(&self, release: &Release, tag: &str)
        -> Result<ExternalRef, ExecutionError>;
}

/// CI/CD build triggering and status polling.
#[async_trait]
pub trait CiProvider: Send + Sync {
    async fn trigger_builds(
        &self,
        release: &Release,
        platforms: &[Platform],
        purpose: BuildPurpose,
    ) -> Result<ExternalRef, ExecutionError>;

    async fn build_status(&self, external_id: &str) -> Result<ExternalState, ExecutionError>;
}

/// Project-management ticketing.
#[async_trait]
pub trait TicketProvider: Send + Sync {
    async fn create_release_ticket(&self, release: &Release)
        -> Result<ExternalRef, ExecutionError>;

    async fn close_release_ticket(&self, external_id: &str) -> Result<(), ExecutionError>;
}

/// Test-management plans and runs.
#[async_trait]
pub trait TestManagementProvider: Send + Sync {
    async fn create_plan(&self, release: &Release) -> Result<ExternalRef, ExecutionError>;

    async fn create_runs(
        &self,
        release: &Release,
        cycle_tag: &str,
    ) -> Result<ExternalRef, ExecutionError>;

    async fn run_status(&self, external_id: &str) -> Result<ExternalState, ExecutionError>;
}

/// Chat notification.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn notify(&self, release: &Release, message: &str) -> Result<(), ExecutionError>;
}

/// App store distribution (TestFlight and friends).
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn trigger_test_flight(&self, release: &Release)
        -> Result<ExternalRef, ExecutionError>;

    async fn test_flight_status(
        &self,
        external_id: &str,
    ) -> Result<ExternalState, ExecutionError>;
}

/// The providers configured for a tenant. Absent entries make the
/// corresponding tasks optional rather than failing them.
#[derive(Default, Clone)]
pub struct Integrations {
    pub source_control: Option<Arc<dyn SourceControlProvider>>,
    pub ci: Option<Arc<dyn CiProvider>>,
    pub project_management: Option<Arc<dyn TicketProvider>>,
    pub test_management: Option<Arc<dyn TestManagementProvider>>,
    pub chat: Option<Arc<dyn ChatProvider>>,
    pub store_connect: Option<Arc<dyn StoreProvider>>,
}

impl Integrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_control(mut self, provider: Arc<dyn SourceControlProvider>) -> Self {
        self.source_control = Some(provider);
        self
    }

    pub fn with_ci(mut self, provider: Arc<dyn CiProvider>) -> Self {
        self.ci = Some(provider);
        self
    }

    pub fn with_project_management(mut self, provider: Arc<dyn TicketProvider>) -> Self {
        self.project_management = Some(provider);
        self
    }

    pub fn with_test_management(mut self, provider: Arc<dyn TestManagementProvider>) -> Self {
        self.test_management = Some(provider);
        self
    }

    pub fn with_chat(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.chat = Some(provider);
        self
    }

    pub fn with_store_connect(mut self, provider: Arc<dyn StoreProvider>) -> Self {
        self.store_connect = Some(provider);
        self
    }

    /// Availability flags fed into the sequencing policy.
    pub fn availability(&self) -> IntegrationSet {
        IntegrationSet {
            source_control: self.source_control.is_some(),
            ci: self.ci.is_some(),
            project_management: self.project_management.is_some(),
            test_management: self.test_management.is_some(),
            chat: self.chat.is_some(),
            store_connect: self.store_connect.is_some(),
        }
    }

    pub fn require_source_control(&self) -> Result<&dyn SourceControlProvider, ExecutionError> {
        self.source_control
            .as_deref()
            .ok_or(ExecutionError::NotConfigured {
                integration: "source control",
            })
    }

    pub fn require_ci(&self) -> Result<&dyn CiProvider, ExecutionError> {
        self.ci.as_deref().ok_or(ExecutionError::NotConfigured {
            integration: "ci",
        })
    }

    pub fn require_project_management(&self) -> Result<&dyn TicketProvider, ExecutionError> {
        self.project_management
            .as_deref()
            .ok_or(ExecutionError::NotConfigured {
                integration: "project management",
            })
    }

    pub fn require_test_management(
        &self,
    ) -> Result<&dyn TestManagementProvider, ExecutionError> {
        self.test_management
            .as_deref()
            .ok_or(ExecutionError::NotConfigured {
                integration: "test management",
            })
    }

    pub fn require_chat(&self) -> Result<&dyn ChatProvider, ExecutionError> {
        self.chat.as_deref().ok_or(ExecutionError::NotConfigured {
            integration: "chat",
        })
    }

    pub fn require_store_connect(&self) -> Result<&dyn StoreProvider, ExecutionError> {
        self.store_connect
            .as_deref()
            .ok_or(ExecutionError::NotConfigured {
                integration: "store connect",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_integrations_report_nothing_available() {
        let integrations = Integrations::new();
        assert_eq!(integrations.availability(), IntegrationSet::default());
        assert!(integrations.require_ci().is_err());
    }

    #[test]
    fn external_state_terminality() {
        assert!(ExternalState::Succeeded.is_terminal());
        assert!(ExternalState::Failed.is_terminal());
        assert!(!ExternalState::Queued.is_terminal());
        assert!(!ExternalState::Running.is_terminal());
    }
}
