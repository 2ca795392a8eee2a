//! Out-of-process build execution with live log streaming.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::store::SharedJobStore;
use crate::container::runtime::OUTPUT_DRAIN_GRACE;
use crate::errors::BuildError;

/// Most lines taken off the channel per store append.
const LOG_BATCH: usize = 256;

type LogLine = (LogStream, String);

/// Which pipe a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn format(&self, line: &str) -> String {
        match self {
            Self::Stdout => line.to_string(),
            Self::Stderr => format!("[stderr] {}", line),
        }
    }
}

/// Runs the template's build command inside a workspace.
///
/// Every output line goes to `<log_dir>/<job_id>.log` and to the job's
/// in-memory log in the store, in the order the lines are read. The build is
/// over when the process exits; output still buffered at that point is kept
/// for a short grace period, after which pipes held open by leftover
/// background children are abandoned.
pub struct BuildRunner {
    command: Vec<String>,
    log_dir: PathBuf,
    store: SharedJobStore,
}

impl BuildRunner {
    pub fn new(command: Vec<String>, log_dir: impl Into<PathBuf>, store: SharedJobStore) -> Self {
        Self {
            command,
            log_dir: log_dir.into(),
            store,
        }
    }

    /// Path of the log file for a job.
    pub fn log_path(&self, job_id: &Uuid) -> PathBuf {
        self.log_dir.join(format!("{}.log", job_id))
    }

    /// Run the build. Resolves with `expected_output_path` on exit code 0.
    pub async fn run(
        &self,
        workspace_path: &Path,
        job_id: Uuid,
        expected_output_path: &Path,
    ) -> Result<PathBuf, BuildError> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            BuildError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "build command is empty",
            ))
        })?;

        tracing::info!(job_id = %job_id, command = %self.command.join(" "), "starting build");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BuildError::SpawnFailed)?;

        let (tx, mut rx) = mpsc::channel::<LogLine>(LOG_BATCH);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, LogStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, LogStream::Stderr, tx.clone())));
        }
        drop(tx);

        let mut log_file = self.open_log(&job_id).await;
        let mut exited = None;
        loop {
            tokio::select! {
                biased;
                first = rx.recv() => match first {
                    Some(first) => {
                        let batch = take_batch(first, &mut rx);
                        self.record(&job_id, &mut log_file, batch).await;
                    }
                    None => break,
                },
                status = child.wait() => {
                    exited = Some(status.map_err(BuildError::SpawnFailed)?);
                    break;
                }
            }
        }

        let status = match exited {
            Some(status) => {
                let deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
                while let Ok(Some(first)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                    let batch = take_batch(first, &mut rx);
                    self.record(&job_id, &mut log_file, batch).await;
                }
                status
            }
            None => child.wait().await.map_err(BuildError::SpawnFailed)?,
        };
        for reader in readers {
            reader.abort();
        }
        if let Some(mut file) = log_file
            && let Err(e) = file.flush().await
        {
            tracing::warn!(job_id = %job_id, error = %e, "failed to flush build log");
        }

        let exit_code = status.code().unwrap_or(-1);
        if status.success() {
            tracing::info!(job_id = %job_id, "build finished");
            Ok(expected_output_path.to_path_buf())
        } else {
            tracing::warn!(job_id = %job_id, exit_code, "build failed");
            Err(BuildError::BuildFailed { exit_code })
        }
    }

    /// Write a batch to the log file and the job's in-memory log.
    async fn record(&self, job_id: &Uuid, log_file: &mut Option<tokio::fs::File>, batch: Vec<LogLine>) {
        let entries: Vec<String> = batch.iter().map(|(stream, line)| stream.format(line)).collect();
        if let Some(file) = log_file.as_mut() {
            let mut text = entries.join("\n");
            text.push('\n');
            if let Err(e) = file.write_all(text.as_bytes()).await {
                tracing::warn!(job_id = %job_id, error = %e, "build log write failed; continuing without file log");
                *log_file = None;
            }
        }
        self.store.append_logs(job_id, &entries);
    }

    async fn open_log(&self, job_id: &Uuid) -> Option<tokio::fs::File> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            tracing::warn!(job_id = %job_id, error = %e, "cannot create build log directory");
            return None;
        }
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "cannot open build log file");
                None
            }
        }
    }
}

/// `first` plus whatever is already queued behind it, up to `LOG_BATCH`.
fn take_batch(first: LogLine, rx: &mut mpsc::Receiver<LogLine>) -> Vec<LogLine> {
    let mut batch = vec![first];
    while batch.len() < LOG_BATCH {
        match rx.try_recv() {
            Ok(next) => batch.push(next),
            Err(_) => break,
        }
    }
    batch
}

async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading build output");
                break;
            }
        }
    }
}
