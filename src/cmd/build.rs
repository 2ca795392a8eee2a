//! One-shot build command (`buildbox build`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use buildbox::build::models::BuildStatus;
use buildbox::build::orchestrator::JobOrchestrator;
use buildbox::build::store::{InMemoryJobStore, SharedJobStore};
use buildbox::buildbox_config::BuildboxConfig;

pub async fn cmd_build(project_dir: &Path, name: &str, schema_path: &Path, out: Option<&Path>) -> Result<()> {
    let config = BuildboxConfig::new(project_dir.to_path_buf())?;
    let schema_text = std::fs::read_to_string(schema_path)
        .with_context(|| format!("Failed to read schema file: {}", schema_path.display()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).context("Schema file is not valid JSON")?;

    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let orchestrator = JobOrchestrator::from_config(&config, store);
    let id = orchestrator.submit(name, schema);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .context("Invalid progress template")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut last_status = None;
    let job = loop {
        let job = orchestrator
            .get_status(&id)
            .with_context(|| format!("Build {} disappeared", id))?;
        if last_status != Some(job.status) {
            spinner.set_message(format!("{} ({})", job.status, id));
            last_status = Some(job.status);
        }
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    spinner.finish_and_clear();

    match (job.status, job.artifact_path.as_ref()) {
        (BuildStatus::Completed, Some(artifact)) => {
            let final_path = match out {
                Some(out) => {
                    std::fs::copy(artifact, out).with_context(|| {
                        format!("Failed to copy archive to {}", out.display())
                    })?;
                    out.to_path_buf()
                }
                None => artifact.clone(),
            };
            println!("{} {}", style("Build completed:").green().bold(), final_path.display());
            Ok(())
        }
        _ => {
            let reason = job
                .error_message
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("{} {}", style("Build failed:").red().bold(), reason);
            let tail: Vec<_> = job.logs.iter().rev().take(20).collect();
            for line in tail.into_iter().rev() {
                eprintln!("  {}", style(line).dim());
            }
            bail!("build {} failed", id)
        }
    }
}
