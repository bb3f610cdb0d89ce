//! Build and template persistence consumed by the snapshot orchestrator.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::types::{SandboxID, TeamID};
use sandplane_shared::constants::DEFAULT_TAG;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Status of a snapshot build artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Checkpoint requested, artifact not yet uploaded.
    Snapshotting,
    Uploaded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Snapshotting => "snapshotting",
            BuildStatus::Uploaded => "uploaded",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = SandplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshotting" => Ok(BuildStatus::Snapshotting),
            "uploaded" => Ok(BuildStatus::Uploaded),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(SandplaneError::Database(format!(
                "unknown build status '{}'",
                other
            ))),
        }
    }
}

/// Parameters for the pending build created at the start of a snapshot.
#[derive(Debug, Clone)]
pub struct NewSnapshotBuild {
    pub team_id: TeamID,
    pub sandbox_id: SandboxID,
    /// Template the sandbox was started from.
    pub base_template_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub build_id: Uuid,
    pub team_id: TeamID,
    pub sandbox_id: SandboxID,
    pub node_id: String,
    pub status: BuildStatus,
    /// Failure message for `Failed` builds.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BuildStatusUpdate {
    pub build_id: Uuid,
    pub status: BuildStatus,
    pub reason: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildStatusUpdate {
    pub fn uploaded(build_id: Uuid) -> Self {
        Self {
            build_id,
            status: BuildStatus::Uploaded,
            reason: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(build_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            build_id,
            status: BuildStatus::Failed,
            reason: Some(reason.into()),
            finished_at: Some(Utc::now()),
        }
    }
}

/// Parameters for a fresh snapshot template.
#[derive(Debug, Clone)]
pub struct NewSnapshotTemplate {
    pub team_id: TeamID,
    pub sandbox_id: SandboxID,
    pub build_id: Uuid,
    pub tag: String,
}

/// Build attached to a template under a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBuild {
    pub build_id: Uuid,
    pub tag: String,
}

/// Persistence for builds, templates and aliases.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Create a build in `Snapshotting` status and return its ID.
    async fn create_snapshot_build(&self, build: &NewSnapshotBuild) -> SandplaneResult<Uuid>;

    async fn get_build(&self, build_id: Uuid) -> SandplaneResult<Option<BuildRecord>>;

    async fn update_build_status(&self, update: &BuildStatusUpdate) -> SandplaneResult<()>;

    /// Create a template owning `build_id` under `tag`. Returns the template ID.
    async fn create_snapshot_template(
        &self,
        template: &NewSnapshotTemplate,
    ) -> SandplaneResult<String>;

    /// Attach a build to an existing template under `tag`.
    async fn assign_build(&self, template_id: &str, build_id: Uuid, tag: &str)
    -> SandplaneResult<()>;

    async fn create_alias(
        &self,
        namespace: &str,
        alias: &str,
        template_id: &str,
    ) -> SandplaneResult<()>;

    async fn find_template_by_alias(
        &self,
        namespace: &str,
        alias: &str,
    ) -> SandplaneResult<Option<String>>;

    async fn list_template_builds(&self, template_id: &str) -> SandplaneResult<Vec<TemplateBuild>>;
}

/// A parsed snapshot name: `alias` or `alias:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub alias: String,
    pub tag: String,
}

impl SnapshotName {
    pub fn parse(name: &str) -> SandplaneResult<Self> {
        let (alias, tag) = match name.split_once(':') {
            Some((alias, tag)) => (alias.trim(), tag.trim()),
            None => (name.trim(), DEFAULT_TAG),
        };

        if alias.is_empty() {
            return Err(SandplaneError::InvalidArgument(format!(
                "snapshot name '{}' has an empty alias",
                name
            )));
        }
        if tag.is_empty() || tag.contains(':') {
            return Err(SandplaneError::InvalidArgument(format!(
                "snapshot name '{}' has an invalid tag",
                name
            )));
        }
        if !alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(SandplaneError::InvalidArgument(format!(
                "snapshot alias '{}' may only contain letters, digits, '-', '_' and '.'",
                alias
            )));
        }

        Ok(Self {
            alias: alias.to_lowercase(),
            tag: tag.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_without_tag() {
        let name = SnapshotName::parse("My-Snap").unwrap();
        assert_eq!(name.alias, "my-snap");
        assert_eq!(name.tag, DEFAULT_TAG);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let name = SnapshotName::parse("snap:v2").unwrap();
        assert_eq!(name.alias, "snap");
        assert_eq!(name.tag, "v2");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(SnapshotName::parse("").is_err());
        assert!(SnapshotName::parse(":v1").is_err());
        assert!(SnapshotName::parse("snap:").is_err());
        assert!(SnapshotName::parse("snap:a:b").is_err());
        assert!(SnapshotName::parse("team/snap").is_err());
    }

    #[test]
    fn test_build_status_roundtrip() {
        for status in [
            BuildStatus::Snapshotting,
            BuildStatus::Uploaded,
            BuildStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
    }
}
