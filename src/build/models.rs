use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a build job.
///
/// Linear with a single fork: `pending → creatingEnvironment → building →
/// packaging → completed`, or `failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BuildStatus {
    Pending,
    CreatingEnvironment,
    Building,
    Packaging,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CreatingEnvironment => "creatingEnvironment",
            Self::Building => "building",
            Self::Packaging => "packaging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Position in the forward ordering. Both terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::CreatingEnvironment => 1,
            Self::Building => 2,
            Self::Packaging => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "creatingEnvironment" => Ok(Self::CreatingEnvironment),
            "building" => Ok(Self::Building),
            "packaging" => Ok(Self::Packaging),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Whether a job may move from `from` to `to`.
///
/// Only single forward steps are allowed, plus `failed` from any
/// non-terminal state. Terminal states never change.
pub fn is_valid_transition(from: &BuildStatus, to: &BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Pending, CreatingEnvironment)
            | (CreatingEnvironment, Building)
            | (Building, Packaging)
            | (Packaging, Completed)
            | (Pending | CreatingEnvironment | Building | Packaging, Failed)
    )
}

/// Snapshot of one build request and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub id: Uuid,
    pub project_name: String,
    pub sanitized_name: String,
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
    pub artifact_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl BuildJob {
    pub fn new(id: Uuid, project_name: &str, sanitized_name: &str) -> Self {
        Self {
            id,
            project_name: project_name.to_string(),
            sanitized_name: sanitized_name.to_string(),
            status: BuildStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            logs: Vec::new(),
            artifact_path: None,
            error_message: None,
        }
    }

    /// Filename offered to downloaders.
    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.sanitized_name)
    }
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub build_id: Uuid,
    pub status_url: String,
    pub download_url: String,
}

impl SubmitResponse {
    pub fn for_job(build_id: Uuid) -> Self {
        Self {
            build_id,
            status_url: format!("/api/build/status/{}", build_id),
            download_url: format!("/api/build/download/{}", build_id),
        }
    }
}
