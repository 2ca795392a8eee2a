use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use super::runtime::{ContainerRuntime, ProcessKiller, ServerReady};
use super::session::ContainerSession;
use crate::errors::ContainerError;

/// Default wait for a server-ready signal before assuming the fallback URL.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default URL used when the dev server never announces itself.
pub const DEFAULT_FALLBACK_URL: &str = "http://localhost:5173";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DevServerState {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Where the running URL came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadySource {
    Signal(ServerReady),
    Fallback,
    Exited(Option<i32>),
}

#[derive(Debug)]
struct Inner {
    state: DevServerState,
    url: Option<String>,
    killer: Option<ProcessKiller>,
    /// Bumped by every start and stop so stale tasks can tell they lost.
    generation: u64,
}

/// Runs the template's dev server inside the container runtime.
///
/// With a session attached, every state change the manager makes (running,
/// stopped, failed, exited on its own) is mirrored into the session under
/// the same lock, so the two never report different servers.
pub struct DevServerManager {
    runtime: Arc<dyn ContainerRuntime>,
    command: Vec<String>,
    ready_timeout: Duration,
    fallback_url: String,
    output_tx: broadcast::Sender<String>,
    session: Option<Arc<ContainerSession>>,
    inner: Arc<Mutex<Inner>>,
}

impl DevServerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, command: Vec<String>) -> Self {
        let (output_tx, _) = broadcast::channel(1024);
        Self {
            runtime,
            command,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            output_tx,
            session: None,
            inner: Arc::new(Mutex::new(Inner {
                state: DevServerState::Stopped,
                url: None,
                killer: None,
                generation: 0,
            })),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = url.into();
        self
    }

    /// Keep `session`'s running/stopped/error status in step with this server.
    pub fn with_session(mut self, session: Arc<ContainerSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> DevServerState {
        lock(&self.inner).state
    }

    pub fn current_url(&self) -> Option<String> {
        lock(&self.inner).url.clone()
    }

    /// Every output line of the dev server, in emission order.
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.output_tx.subscribe()
    }

    /// Start the dev server and resolve with its URL.
    ///
    /// The URL comes from the runtime's server-ready signal, or from the
    /// fallback when the signal does not arrive within the ready timeout and
    /// the process is still alive. A `stop()` issued before the server is
    /// ready kills whatever was spawned and fails this call with
    /// `StartCancelled`.
    pub async fn start(&self) -> Result<String, ContainerError> {
        let generation = {
            let mut inner = lock(&self.inner);
            match inner.state {
                DevServerState::Running => {
                    if let Some(url) = inner.url.clone() {
                        return Ok(url);
                    }
                }
                DevServerState::Starting => return Err(ContainerError::AlreadyStarting),
                DevServerState::Stopped | DevServerState::Error => {}
            }
            inner.state = DevServerState::Starting;
            inner.url = None;
            inner.generation += 1;
            inner.generation
        };

        let Some((program, args)) = self.command.split_first() else {
            let err = ContainerError::SpawnFailed("dev command is empty".to_string());
            self.fail(generation, &err);
            return Err(err);
        };

        // Subscribe before spawning so an early ready line is not missed.
        let mut ready_rx = self.runtime.subscribe_server_ready();
        let mut process = match self.runtime.spawn(program, args).await {
            Ok(process) => process,
            Err(e) => {
                self.fail(generation, &e);
                return Err(e);
            }
        };
        tracing::info!(command = %self.command.join(" "), "dev server starting");

        let current = {
            let mut inner = lock(&self.inner);
            let current = inner.generation == generation;
            if current {
                inner.killer = Some(process.killer.clone());
            }
            current
        };
        if !current {
            kill_superseded(&process.killer);
            return Err(ContainerError::StartCancelled);
        }

        let output_tx = self.output_tx.clone();
        let mut output = process.output;
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                let _ = output_tx.send(line);
            }
        });

        let source = tokio::select! {
            ready = wait_for_ready(&mut ready_rx) => ReadySource::Signal(ready),
            code = &mut process.exit => ReadySource::Exited(code.ok().flatten()),
            _ = tokio::time::sleep(self.ready_timeout) => match process.exit.try_recv() {
                Ok(code) => ReadySource::Exited(code),
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => ReadySource::Fallback,
                Err(tokio::sync::oneshot::error::TryRecvError::Closed) => ReadySource::Exited(None),
            },
        };

        let url = match source {
            ReadySource::Signal(ready) => ready.url,
            ReadySource::Fallback => {
                tracing::warn!(
                    timeout_secs = self.ready_timeout.as_secs(),
                    url = %self.fallback_url,
                    "no server-ready signal; assuming fallback URL"
                );
                self.fallback_url.clone()
            }
            ReadySource::Exited(exit_code) => {
                let err = ContainerError::DevServerExited { exit_code };
                if !self.fail(generation, &err) {
                    return Err(ContainerError::StartCancelled);
                }
                tracing::error!(?exit_code, "dev server exited before becoming ready");
                return Err(err);
            }
        };

        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                drop(inner);
                kill_superseded(&process.killer);
                return Err(ContainerError::StartCancelled);
            }
            inner.state = DevServerState::Running;
            inner.url = Some(url.clone());
            if let Some(session) = &self.session {
                session.mark_running(&url);
            }
        }
        tracing::info!(url = %url, "dev server running");

        let inner = Arc::clone(&self.inner);
        let session = self.session.clone();
        let exit = process.exit;
        tokio::spawn(async move {
            let exit_code = exit.await.ok().flatten();
            let mut inner = lock(&inner);
            if inner.generation == generation && inner.state == DevServerState::Running {
                tracing::warn!(?exit_code, "dev server exited");
                inner.state = DevServerState::Stopped;
                inner.url = None;
                inner.killer = None;
                if let Some(session) = &session {
                    session.mark_stopped();
                }
            }
        });

        Ok(url)
    }

    /// Kill the dev server. Always ends `stopped` with no URL.
    pub fn stop(&self) {
        let mut inner = lock(&self.inner);
        if let Some(killer) = inner.killer.take()
            && let Err(e) = killer.kill()
        {
            tracing::warn!(error = %e, "failed to kill dev server");
        }
        inner.state = DevServerState::Stopped;
        inner.url = None;
        inner.generation += 1;
        if let Some(session) = &self.session {
            session.mark_stopped();
        }
        tracing::info!("dev server stopped");
    }

    /// Record a failed start. Returns `false` if a later start or stop
    /// already owns the state.
    fn fail(&self, generation: u64, err: &ContainerError) -> bool {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        inner.state = DevServerState::Error;
        inner.url = None;
        inner.killer = None;
        if let Some(session) = &self.session {
            session.mark_error(&err.to_string());
        }
        true
    }
}

/// Kill a process whose start was overtaken by `stop()`.
fn kill_superseded(killer: &ProcessKiller) {
    tracing::info!("dev server stopped while starting; killing it");
    if let Err(e) = killer.kill() {
        tracing::debug!(error = %e, "superseded dev server already gone");
    }
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

async fn wait_for_ready(rx: &mut broadcast::Receiver<ServerReady>) -> ServerReady {
    loop {
        match rx.recv().await {
            Ok(ready) => return ready,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::container::filetree::MountTree;
    use crate::container::runtime::{LocalRuntime, SpawnedProcess};
    use crate::container::session::SessionStatus;
    use async_trait::async_trait;

    async fn manager(script: &str, timeout_ms: u64) -> (tempfile::TempDir, DevServerManager) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(dir.path().join("root")));
        runtime.boot().await.unwrap();
        let manager = DevServerManager::new(runtime, vec!["sh".into(), "-c".into(), script.into()])
            .with_ready_timeout(Duration::from_millis(timeout_ms))
            .with_fallback_url("http://localhost:5173");
        (dir, manager)
    }

    #[tokio::test]
    async fn test_start_uses_ready_signal() {
        let (_dir, manager) = manager("echo 'VITE ready'; echo 'Local: http://localhost:4567/'; sleep 10", 5_000).await;
        let url = manager.start().await.unwrap();
        assert_eq!(url, "http://localhost:4567");
        assert_eq!(manager.state(), DevServerState::Running);
        assert_eq!(manager.current_url().as_deref(), Some("http://localhost:4567"));
        manager.stop();
    }

    #[tokio::test]
    async fn test_start_falls_back_on_timeout() {
        let (_dir, manager) = manager("echo compiling; sleep 10", 200).await;
        let url = manager.start().await.unwrap();
        assert_eq!(url, "http://localhost:5173");
        assert_eq!(manager.state(), DevServerState::Running);
        manager.stop();
    }

    #[tokio::test]
    async fn test_early_exit_is_error() {
        let (_dir, manager) = manager("echo boom >&2; exit 2", 5_000).await;
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ContainerError::DevServerExited { exit_code: Some(2) }));
        assert_eq!(manager.state(), DevServerState::Error);
        assert!(manager.current_url().is_none());
    }

    #[tokio::test]
    async fn test_start_while_running_returns_url() {
        let (_dir, manager) = manager("echo http://localhost:4568; sleep 10", 5_000).await;
        let first = manager.start().await.unwrap();
        let second = manager.start().await.unwrap();
        assert_eq!(first, second);
        manager.stop();
    }

    #[tokio::test]
    async fn test_start_while_starting_is_rejected() {
        let (_dir, manager) = manager("sleep 10", 500).await;
        let manager = Arc::new(manager);

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start().await })
        };
        while manager.state() != DevServerState::Starting {
            tokio::task::yield_now().await;
        }
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyStarting));

        assert_eq!(background.await.unwrap().unwrap(), "http://localhost:5173");
        manager.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_state() {
        let (_dir, manager) = manager("echo http://localhost:4569; sleep 10", 5_000).await;
        manager.start().await.unwrap();
        manager.stop();
        assert_eq!(manager.state(), DevServerState::Stopped);
        assert!(manager.current_url().is_none());

        // Stopping again has nothing to kill and still ends stopped.
        manager.stop();
        assert_eq!(manager.state(), DevServerState::Stopped);
    }

    #[tokio::test]
    async fn test_output_is_forwarded_in_order() {
        let (_dir, manager) = manager("echo one; echo two; echo http://localhost:4570; sleep 10", 5_000).await;
        let mut output = manager.subscribe_output();
        manager.start().await.unwrap();

        let mut lines = Vec::new();
        while lines.len() < 3 {
            let line = tokio::time::timeout(Duration::from_secs(5), output.recv())
                .await
                .unwrap()
                .unwrap();
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "http://localhost:4570"]);
        manager.stop();
    }

    #[tokio::test]
    async fn test_exit_after_running_marks_stopped() {
        let (_dir, manager) = manager("echo http://localhost:4571; sleep 0.2", 5_000).await;
        manager.start().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.state() == DevServerState::Running && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.state(), DevServerState::Stopped);
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn manager_with_session(script: &str) -> (tempfile::TempDir, DevServerManager, Arc<ContainerSession>) {
        let dir = tempfile::tempdir().unwrap();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(LocalRuntime::new(dir.path().join("root")));
        let session = Arc::new(ContainerSession::new(Arc::clone(&runtime)));
        session.initialize().await.unwrap();
        let manager = DevServerManager::new(runtime, vec!["sh".into(), "-c".into(), script.into()])
            .with_ready_timeout(Duration::from_secs(5))
            .with_session(Arc::clone(&session));
        (dir, manager, session)
    }

    #[tokio::test]
    async fn test_session_follows_server_that_exits_on_its_own() {
        let (_dir, manager, session) = manager_with_session("echo http://localhost:4572; sleep 0.2").await;
        manager.start().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.current_server_url().as_deref(), Some("http://localhost:4572"));

        wait_until(|| session.status() != SessionStatus::Running).await;
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.current_server_url().is_none());
        assert_eq!(manager.state(), DevServerState::Stopped);
    }

    #[tokio::test]
    async fn test_session_follows_stop_and_failed_start() {
        let (_dir, manager, session) = manager_with_session("echo http://localhost:4573; sleep 10").await;
        manager.start().await.unwrap();
        manager.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.current_server_url().is_none());

        let (_dir, failing, session) = manager_with_session("exit 4").await;
        failing.start().await.unwrap_err();
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("Some(4)"));
    }

    /// Local runtime whose spawn takes a while, keeping the spawned killer.
    struct SlowSpawnRuntime {
        local: LocalRuntime,
        spawned: Mutex<Option<ProcessKiller>>,
    }

    #[async_trait]
    impl ContainerRuntime for SlowSpawnRuntime {
        async fn boot(&self) -> Result<(), ContainerError> {
            self.local.boot().await
        }
        async fn mount(&self, tree: &MountTree) -> Result<(), ContainerError> {
            self.local.mount(tree).await
        }
        async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ContainerError> {
            self.local.write_file(path, contents).await
        }
        async fn read_file(&self, path: &str) -> Result<Vec<u8>, ContainerError> {
            self.local.read_file(path).await
        }
        async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ContainerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let process = self.local.spawn(command, args).await?;
            *self.spawned.lock().unwrap() = Some(process.killer.clone());
            Ok(process)
        }
        async fn snapshot(&self, dir: &str) -> Result<MountTree, ContainerError> {
            self.local.snapshot(dir).await
        }
        async fn restore(&self, dir: &str, tree: &MountTree) -> Result<(), ContainerError> {
            self.local.restore(dir, tree).await
        }
        fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
            self.local.subscribe_server_ready()
        }
    }

    #[tokio::test]
    async fn test_stop_during_spawn_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(SlowSpawnRuntime {
            local: LocalRuntime::new(dir.path().join("root")),
            spawned: Mutex::new(None),
        });
        runtime.boot().await.unwrap();
        let manager = Arc::new(DevServerManager::new(
            runtime.clone(),
            vec!["sh".into(), "-c".into(), "sleep 30".into()],
        ));

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start().await })
        };
        while manager.state() != DevServerState::Starting {
            tokio::task::yield_now().await;
        }
        manager.stop();

        let err = background.await.unwrap().unwrap_err();
        assert!(matches!(err, ContainerError::StartCancelled));
        assert_eq!(manager.state(), DevServerState::Stopped);

        let killer = runtime.spawned.lock().unwrap().clone().unwrap();
        wait_until(|| killer.has_exited()).await;
        assert!(killer.has_exited());
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_ready_cancels_start() {
        let (_dir, manager) = manager("sleep 30", 10_000).await;
        let manager = Arc::new(manager);

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start().await })
        };
        wait_until(|| lock(&manager.inner).killer.is_some()).await;
        manager.stop();

        let err = tokio::time::timeout(Duration::from_secs(5), background)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ContainerError::StartCancelled));
        assert_eq!(manager.state(), DevServerState::Stopped);
    }
}
