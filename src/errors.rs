//! Typed error hierarchy for buildbox.
//!
//! Two top-level enums cover the two subsystems:
//! - `BuildError` - server-side materialize / build / package pipeline failures
//! - `ContainerError` - container session, dev server and terminal failures

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors from the server-side build pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Template directory not found: {}", path.display())]
    TemplateMissing { path: PathBuf },

    #[error("Failed to materialize workspace at {}: {source}", path.display())]
    MaterializationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn build command: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Build command exited with non-zero code {exit_code}")]
    BuildFailed { exit_code: i32 },

    #[error("Failed to package {}: {message}", path.display())]
    PackagingFailed { path: PathBuf, message: String },

    #[error("Artifact missing on disk: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    #[error("Build job {id} not found")]
    JobNotFound { id: Uuid },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the container orchestration layer.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container failed to boot: {0}")]
    BootFailed(String),

    #[error("Container is not booted")]
    NotBooted,

    #[error("Conflicting path in file tree: {path}")]
    ConflictingPath { path: String },

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Dependency install exited with non-zero code {exit_code}")]
    InstallFailed { exit_code: i32 },

    #[error("Dev server exited before becoming ready (exit code {exit_code:?})")]
    DevServerExited { exit_code: Option<i32> },

    #[error("Dev server is already starting")]
    AlreadyStarting,

    #[error("Dev server was stopped while starting")]
    StartCancelled,

    #[error("Terminal tab {id} not found")]
    UnknownTab { id: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_template_missing_mentions_path() {
        let err = BuildError::TemplateMissing {
            path: PathBuf::from("/srv/templates/react"),
        };
        assert!(err.to_string().contains("/srv/templates/react"));
    }

    #[test]
    fn build_error_build_failed_carries_exit_code() {
        let err = BuildError::BuildFailed { exit_code: 1 };
        match &err {
            BuildError::BuildFailed { exit_code } => assert_eq!(*exit_code, 1),
            _ => panic!("Expected BuildFailed"),
        }
        assert!(err.to_string().contains("non-zero code 1"));
    }

    #[test]
    fn build_error_materialization_failed_keeps_source() {
        use std::error::Error as _;
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = BuildError::MaterializationFailed {
            path: PathBuf::from("/tmp/ws"),
            source: io_err,
        };
        let source = err.source().expect("source should be preserved");
        assert!(source.to_string().contains("denied"));
    }

    #[test]
    fn container_error_converts_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ContainerError = io_err.into();
        assert!(matches!(err, ContainerError::Io(_)));
    }

    #[test]
    fn container_error_conflicting_path_is_matchable() {
        let err = ContainerError::ConflictingPath {
            path: "/src/main.ts".into(),
        };
        assert!(matches!(err, ContainerError::ConflictingPath { ref path } if path == "/src/main.ts"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BuildError::BuildFailed { exit_code: 2 });
        assert_std_error(&ContainerError::NotBooted);
    }
}
