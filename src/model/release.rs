//! The release being shipped and its platform targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant identifier. Every entity is tenant-scoped.
pub type TenantId = Uuid;

/// Release identifier.
pub type ReleaseId = Uuid;

/// Kind of release train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Major,
    Minor,
    Hotfix,
    Planned,
    Unplanned,
}

/// Lifecycle status of the release record itself.
///
/// Releases are never deleted; `Archived` is the terminal resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    #[default]
    Draft,
    Active,
    Done,
    Archived,
}

/// Platform a release ships on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

/// One deliverable of the release: a platform, the store/channel target,
/// and the version shipped there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub platform: Platform,
    /// Deliverable name, e.g. "app-store", "play-store", "web-prod".
    pub target: String,
    pub version: String,
}

/// The unit being shipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub tenant_id: TenantId,
    pub release_type: ReleaseType,
    pub status: ReleaseStatus,
    /// Release branch cut from `base_branch`.
    pub branch: String,
    pub base_branch: String,
    pub kick_off_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_release_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<Uuid>,
    /// Ordered set of deliverables for this release.
    pub platform_targets: Vec<PlatformTarget>,
}

impl Release {
    /// Create a release for the given tenant with sensible defaults.
    pub fn new(
        tenant_id: TenantId,
        release_type: ReleaseType,
        branch: &str,
        base_branch: &str,
        kick_off_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            release_type,
            status: ReleaseStatus::Active,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            kick_off_date,
            target_release_date: None,
            delay_reason: None,
            config_id: None,
            platform_targets: Vec::new(),
        }
    }

    /// Add a platform target.
    pub fn with_target(mut self, platform: Platform, target: &str, version: &str) -> Self {
        self.platform_targets.push(PlatformTarget {
            platform,
            target: target.to_string(),
            version: version.to_string(),
        });
        self
    }

    /// Set the target release date.
    pub fn with_target_release_date(mut self, date: DateTime<Utc>) -> Self {
        self.target_release_date = Some(date);
        self
    }

    /// Distinct platforms this release targets, in declaration order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut seen = Vec::new();
        for target in &self.platform_targets {
            if !seen.contains(&target.platform) {
                seen.push(target.platform);
            }
        }
        seen
    }

    /// Whether the release ships on the given platform.
    pub fn targets_platform(&self, platform: Platform) -> bool {
        self.platform_targets.iter().any(|t| t.platform == platform)
    }

    /// Tag name for the release, derived from the first target's version.
    pub fn tag_name(&self) -> String {
        self.platform_targets
            .first()
            .map(|t| format!("v{}", t.version))
            .unwrap_or_else(|| format!("v-{}", self.branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> Release {
        Release::new(
            Uuid::new_v4(),
            ReleaseType::Minor,
            "release/7.2.0",
            "main",
            Utc::now(),
        )
    }

    #[test]
    fn platforms_are_deduplicated_in_order() {
        let release = release()
            .with_target(Platform::Ios, "app-store", "7.2.0")
            .with_target(Platform::Android, "play-store", "7.2.0")
            .with_target(Platform::Ios, "testflight", "7.2.0");

        assert_eq!(release.platforms(), vec![Platform::Ios, Platform::Android]);
    }

    #[test]
    fn tag_name_uses_first_target_version() {
        let release = release().with_target(Platform::Android, "play-store", "7.2.0");
        assert_eq!(release.tag_name(), "v7.2.0");
    }

    #[test]
    fn tag_name_falls_back_to_branch() {
        assert_eq!(release().tag_name(), "v-release/7.2.0");
    }
}
