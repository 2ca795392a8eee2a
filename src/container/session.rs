use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::OnceCell;

use super::filetree::{FileEntry, FileTreeConverter};
use super::runtime::ContainerRuntime;
use crate::errors::ContainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Empty,
    Initializing,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    current_server_url: Option<String>,
    last_error: Option<String>,
}

/// The one container session of a process.
///
/// Boot happens at most once. Concurrent `initialize` calls share the same
/// boot, and a failed boot is remembered: later calls report the stored
/// error instead of retrying.
pub struct ContainerSession {
    runtime: Arc<dyn ContainerRuntime>,
    boot: OnceCell<Result<(), String>>,
    state: Mutex<SessionState>,
}

impl ContainerSession {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            boot: OnceCell::new(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Empty,
                current_server_url: None,
                last_error: None,
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub async fn initialize(&self) -> Result<(), ContainerError> {
        let outcome = self
            .boot
            .get_or_init(|| async {
                self.set_status(SessionStatus::Initializing);
                match self.runtime.boot().await {
                    Ok(()) => {
                        self.set_status(SessionStatus::Running);
                        tracing::info!("container session running");
                        Ok(())
                    }
                    Err(e) => {
                        let message = match e {
                            ContainerError::BootFailed(message) => message,
                            other => other.to_string(),
                        };
                        self.mark_error(&message);
                        tracing::error!(error = %message, "container boot failed");
                        Err(message)
                    }
                }
            })
            .await;
        outcome.clone().map_err(ContainerError::BootFailed)
    }

    fn ensure_ready(&self) -> Result<(), ContainerError> {
        match self.boot.get() {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(ContainerError::BootFailed(message.clone())),
            None => Err(ContainerError::NotBooted),
        }
    }

    /// Sync a flat listing from the editor into the environment.
    pub async fn mount_files(&self, entries: &[FileEntry]) -> Result<(), ContainerError> {
        self.ensure_ready()?;
        let tree = FileTreeConverter::convert(entries)?;
        self.runtime.mount(&tree).await?;
        tracing::debug!(files = entries.len(), "mounted files");
        Ok(())
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ContainerError> {
        self.ensure_ready()?;
        self.runtime.write_file(path, contents).await
    }

    /// Dev server went away. Only meaningful while running.
    pub fn mark_stopped(&self) {
        let mut state = self.lock();
        if state.status == SessionStatus::Running {
            state.status = SessionStatus::Stopped;
            state.current_server_url = None;
        }
    }

    /// Dev server is serving at `url`. Ignored until a boot has succeeded;
    /// after that it also clears an earlier dev server error.
    pub fn mark_running(&self, url: &str) {
        let booted = matches!(self.boot.get(), Some(Ok(())));
        let mut state = self.lock();
        if booted {
            state.status = SessionStatus::Running;
            state.current_server_url = Some(url.to_string());
        } else {
            tracing::debug!(status = %state.status, "ignoring mark_running");
        }
    }

    pub fn mark_error(&self, message: &str) {
        let mut state = self.lock();
        state.status = SessionStatus::Error;
        state.last_error = Some(message.to_string());
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn current_server_url(&self) -> Option<String> {
        self.lock().current_server_url.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    fn set_status(&self, status: SessionStatus) {
        self.lock().status = status;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // State updates never panic mid-way, so a poisoned lock still holds
        // consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::filetree::MountTree;
    use crate::container::runtime::{LocalRuntime, ServerReady, SpawnedProcess};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// Counts boots; optionally fails them.
    struct CountingRuntime {
        boots: AtomicUsize,
        fail: bool,
        ready_tx: broadcast::Sender<ServerReady>,
    }

    impl CountingRuntime {
        fn new(fail: bool) -> Self {
            Self {
                boots: AtomicUsize::new(0),
                fail,
                ready_tx: broadcast::channel(1).0,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn boot(&self) -> Result<(), ContainerError> {
            self.boots.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail {
                Err(ContainerError::BootFailed("cross-origin isolation unavailable".into()))
            } else {
                Ok(())
            }
        }
        async fn mount(&self, _tree: &MountTree) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn write_file(&self, _path: &str, _contents: &[u8]) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, ContainerError> {
            Ok(Vec::new())
        }
        async fn spawn(&self, _command: &str, _args: &[String]) -> Result<SpawnedProcess, ContainerError> {
            Err(ContainerError::SpawnFailed("not supported".into()))
        }
        async fn snapshot(&self, _dir: &str) -> Result<MountTree, ContainerError> {
            Ok(MountTree::new())
        }
        async fn restore(&self, _dir: &str, _tree: &MountTree) -> Result<(), ContainerError> {
            Ok(())
        }
        fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
            self.ready_tx.subscribe()
        }
    }

    #[tokio::test]
    async fn test_initialize_boots_once_under_concurrency() {
        let runtime = Arc::new(CountingRuntime::new(false));
        let session = Arc::new(ContainerSession::new(runtime.clone()));
        assert_eq!(session.status(), SessionStatus::Empty);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.initialize().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        session.initialize().await.unwrap();
        assert_eq!(runtime.boots.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_boot_error_is_sticky() {
        let runtime = Arc::new(CountingRuntime::new(true));
        let session = ContainerSession::new(runtime.clone());

        let first = session.initialize().await.unwrap_err();
        assert!(first.to_string().contains("cross-origin isolation unavailable"));
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("cross-origin"));

        let second = session.initialize().await.unwrap_err();
        assert!(matches!(second, ContainerError::BootFailed(_)));
        assert_eq!(runtime.boots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mount_before_initialize_fails() {
        let session = ContainerSession::new(Arc::new(CountingRuntime::new(false)));
        let err = session
            .mount_files(&[FileEntry::file("/a.txt", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotBooted));
    }

    #[tokio::test]
    async fn test_mount_files_reaches_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(dir.path().join("root")));
        let session = ContainerSession::new(runtime.clone());
        session.initialize().await.unwrap();

        session
            .mount_files(&[
                FileEntry::file("/package.json", "{}"),
                FileEntry::file("/src/schema.json", r#"{"ROOT":{}}"#),
            ])
            .await
            .unwrap();
        session.write_file("/src/extra.ts", b"export {}").await.unwrap();

        assert!(runtime.root().join("package.json").exists());
        assert!(runtime.root().join("src/schema.json").exists());
        assert!(runtime.root().join("src/extra.ts").exists());
    }

    #[tokio::test]
    async fn test_mount_conflict_is_reported() {
        let session = ContainerSession::new(Arc::new(CountingRuntime::new(false)));
        session.initialize().await.unwrap();
        let err = session
            .mount_files(&[FileEntry::file("/src", "x"), FileEntry::file("/src/a", "y")])
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::ConflictingPath { .. }));
    }

    #[tokio::test]
    async fn test_running_stopped_transitions() {
        let session = ContainerSession::new(Arc::new(CountingRuntime::new(false)));
        session.mark_running("http://localhost:1");
        assert_eq!(session.status(), SessionStatus::Empty);

        session.initialize().await.unwrap();
        session.mark_running("http://localhost:5173");
        assert_eq!(session.current_server_url().as_deref(), Some("http://localhost:5173"));

        session.mark_stopped();
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.current_server_url().is_none());

        session.mark_running("http://localhost:5174");
        assert_eq!(session.status(), SessionStatus::Running);

        session.mark_error("dev server crashed");
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(session.last_error().as_deref(), Some("dev server crashed"));

        session.mark_running("http://localhost:5175");
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_mark_running_ignored_after_failed_boot() {
        let session = ContainerSession::new(Arc::new(CountingRuntime::new(true)));
        session.initialize().await.unwrap_err();
        session.mark_running("http://localhost:5173");
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.current_server_url().is_none());
    }
}
