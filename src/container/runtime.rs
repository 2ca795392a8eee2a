use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::filetree::{MountNode, MountTree};
use crate::errors::ContainerError;

/// A process inside the execution environment announced a listening server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Handle to a process started through [`ContainerRuntime::spawn`].
///
/// `output` carries stdout and stderr lines merged in arrival order and
/// closes once both streams end. `exit` resolves with the exit code, or
/// `None` when the process was killed by a signal.
pub struct SpawnedProcess {
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
    pub killer: ProcessKiller,
}

/// How long output is still collected after the process itself has exited.
/// Background children that inherited the pipes are not waited for.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

impl SpawnedProcess {
    /// Feed output lines to `on_line` until the process exits, then drain
    /// whatever is still buffered for at most [`OUTPUT_DRAIN_GRACE`].
    /// Returns the exit code, `None` when killed by a signal.
    pub async fn wait_with_output(&mut self, mut on_line: impl FnMut(String)) -> Option<i32> {
        let code = loop {
            tokio::select! {
                biased;
                line = self.output.recv() => match line {
                    Some(line) => on_line(line),
                    None => break (&mut self.exit).await.ok().flatten(),
                },
                code = &mut self.exit => break code.ok().flatten(),
            }
        };

        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, self.output.recv()).await {
            on_line(line);
        }
        code
    }
}

/// Cloneable kill switch for a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    token: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl ProcessKiller {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request termination. Fails if the process has already exited.
    pub fn kill(&self) -> Result<(), ContainerError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(ContainerError::Other(anyhow::anyhow!(
                "process has already exited"
            )));
        }
        self.token.cancel();
        Ok(())
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// The execution-environment boundary.
///
/// Paths are `/`-separated and relative to the environment root; a leading
/// `/` is allowed and means the same thing.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn boot(&self) -> Result<(), ContainerError>;

    async fn mount(&self, tree: &MountTree) -> Result<(), ContainerError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ContainerError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ContainerError>;

    async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ContainerError>;

    async fn snapshot(&self, dir: &str) -> Result<MountTree, ContainerError>;

    /// Replace `dir` with the contents of `tree`.
    async fn restore(&self, dir: &str, tree: &MountTree) -> Result<(), ContainerError>;

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

static SERVER_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https?://(?:localhost|127\.0\.0\.1):(\d{1,5}))").unwrap()
});

/// Find a local server URL in a line of process output.
pub fn detect_server_ready(line: &str) -> Option<ServerReady> {
    let caps = SERVER_URL_REGEX.captures(line)?;
    let port = caps.get(2)?.as_str().parse::<u16>().ok()?;
    Some(ServerReady {
        port,
        url: caps.get(1)?.as_str().to_string(),
    })
}

/// Reference runtime: a directory on the host plus child processes.
pub struct LocalRuntime {
    root: PathBuf,
    booted: AtomicBool,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            root: root.into(),
            booted: AtomicBool::new(false),
            ready_tx,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_booted(&self) -> Result<(), ContainerError> {
        if self.booted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ContainerError::NotBooted)
        }
    }

    /// Map an environment path onto the host, refusing anything that would
    /// leave the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, ContainerError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(ContainerError::Other(anyhow::anyhow!(
                        "path escapes container root: {}",
                        path
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn boot(&self) -> Result<(), ContainerError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ContainerError::BootFailed(format!("{}: {}", self.root.display(), e)))?;
        self.booted.store(true, Ordering::SeqCst);
        tracing::info!(root = %self.root.display(), "local runtime booted");
        Ok(())
    }

    async fn mount(&self, tree: &MountTree) -> Result<(), ContainerError> {
        self.ensure_booted()?;
        let root = self.root.clone();
        let tree = tree.clone();
        tokio::task::spawn_blocking(move || write_tree(&root, &tree))
            .await
            .map_err(|e| ContainerError::Other(anyhow::anyhow!("mount task panicked: {}", e)))??;
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ContainerError> {
        self.ensure_booted()?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ContainerError> {
        self.ensure_booted()?;
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ContainerError> {
        self.ensure_booted()?;
        let mut child = Command::new(command)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::SpawnFailed(format!("{}: {}", command, e)))?;
        tracing::debug!(command, ?args, "spawned process");

        let (out_tx, output) = mpsc::channel(1024);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, out_tx.clone(), self.ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, out_tx.clone(), self.ready_tx.clone()));
        }
        drop(out_tx);

        let killer = ProcessKiller::new();
        let (exit_tx, exit) = oneshot::channel();
        let supervisor = killer.clone();
        let name = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = supervisor.token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(command = %name, error = %e, "failed to kill process");
                    }
                    child.wait().await
                }
            };
            supervisor.exited.store(true, Ordering::SeqCst);
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(command = %name, error = %e, "failed to wait for process");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            output,
            exit,
            killer,
        })
    }

    async fn snapshot(&self, dir: &str) -> Result<MountTree, ContainerError> {
        self.ensure_booted()?;
        let base = self.resolve(dir)?;
        tokio::task::spawn_blocking(move || read_tree(&base))
            .await
            .map_err(|e| ContainerError::Other(anyhow::anyhow!("snapshot task panicked: {}", e)))?
    }

    async fn restore(&self, dir: &str, tree: &MountTree) -> Result<(), ContainerError> {
        self.ensure_booted()?;
        let base = self.resolve(dir)?;
        let tree = tree.clone();
        tokio::task::spawn_blocking(move || {
            if base.exists() {
                std::fs::remove_dir_all(&base)?;
            }
            std::fs::create_dir_all(&base)?;
            write_tree(&base, &tree)
        })
        .await
        .map_err(|e| ContainerError::Other(anyhow::anyhow!("restore task panicked: {}", e)))??;
        Ok(())
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

async fn forward_output<R>(
    reader: R,
    tx: mpsc::Sender<String>,
    ready_tx: broadcast::Sender<ServerReady>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(ready) = detect_server_ready(&line) {
            tracing::debug!(port = ready.port, url = %ready.url, "server ready");
            let _ = ready_tx.send(ready);
        }
        // Keep draining after the receiver is gone so the pipe never fills.
        let _ = tx.send(line).await;
    }
}

fn write_tree(base: &Path, tree: &MountTree) -> std::io::Result<()> {
    std::fs::create_dir_all(base)?;
    for (name, node) in tree {
        let target = base.join(name);
        match node {
            MountNode::File {
                contents,
                executable,
            } => {
                remove_if_symlink(&target)?;
                std::fs::write(&target, contents)?;
                set_executable(&target, *executable)?;
            }
            MountNode::Symlink { target: link } => {
                if std::fs::symlink_metadata(&target).is_ok() {
                    std::fs::remove_file(&target)?;
                }
                create_symlink(link, &target)?;
            }
            MountNode::Directory { children } => write_tree(&target, children)?,
        }
    }
    Ok(())
}

fn remove_if_symlink(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(path),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn create_symlink(link: &str, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(not(unix))]
fn create_symlink(link: &str, at: &Path) -> std::io::Result<()> {
    let source = at.parent().map(|p| p.join(link)).unwrap_or_else(|| PathBuf::from(link));
    std::fs::copy(source, at).map(|_| ())
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Capture `base` as a tree. Symlinks are recorded as links, never followed.
fn read_tree(base: &Path) -> Result<MountTree, ContainerError> {
    if !base.is_dir() {
        return Err(ContainerError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", base.display()),
        )));
    }

    let mut root = MountTree::new();
    for entry in WalkDir::new(base).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry.path().strip_prefix(base).map_err(std::io::Error::other)?;
        let names: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some((leaf, parents)) = names.split_last() else {
            continue;
        };

        let mut level = &mut root;
        for name in parents {
            let node = level.entry(name.clone()).or_insert_with(MountNode::empty_dir);
            level = match node {
                MountNode::Directory { children } => children,
                MountNode::File { .. } | MountNode::Symlink { .. } => {
                    return Err(ContainerError::ConflictingPath {
                        path: relative.display().to_string(),
                    });
                }
            };
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            level.insert(leaf.clone(), MountNode::symlink(link.to_string_lossy()));
        } else if file_type.is_dir() {
            level.entry(leaf.clone()).or_insert_with(MountNode::empty_dir);
        } else {
            let meta = entry.metadata().map_err(std::io::Error::other)?;
            let node = MountNode::File {
                contents: std::fs::read(entry.path())?,
                executable: is_executable(&meta),
            };
            level.insert(leaf.clone(), node);
        }
    }
    Ok(root)
}
