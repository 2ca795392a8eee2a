//! Local live preview command (`buildbox preview`).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use walkdir::WalkDir;

use buildbox::buildbox_config::BuildboxConfig;
use buildbox::container::dep_cache::{DependencyCache, InstallOutcome, install_dependencies};
use buildbox::container::dev_server::DevServerManager;
use buildbox::container::filetree::FileEntry;
use buildbox::container::preview::PreviewController;
use buildbox::container::runtime::{ContainerRuntime, LocalRuntime};
use buildbox::container::session::ContainerSession;

/// Read the template into a flat listing, leaving out the dependency dir.
fn template_entries(template: &Path, dependency_dir: &str) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(template)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != dependency_dir);
    for entry in walker {
        let entry = entry.context("Failed to walk template directory")?;
        let relative = entry.path().strip_prefix(template)?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            entries.push(FileEntry::symlink(path, target.to_string_lossy()));
        } else if entry.file_type().is_dir() {
            entries.push(FileEntry::directory(path));
        } else {
            let contents = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            entries.push(FileEntry::file(path, contents));
        }
    }
    Ok(entries)
}

pub async fn cmd_preview(project_dir: &Path, no_install: bool) -> Result<()> {
    let config = BuildboxConfig::new(project_dir.to_path_buf())?;
    let container = &config.toml.container;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(LocalRuntime::new(config.container_root()));
    let session = Arc::new(ContainerSession::new(Arc::clone(&runtime)));
    session.initialize().await?;

    let entries = template_entries(&config.template_dir(), &container.dependency_dir)?;
    session.mount_files(&entries).await?;
    println!("Mounted {} entries from {}", entries.len(), config.template_dir().display());

    if !no_install {
        let cache = DependencyCache::new();
        let outcome = install_dependencies(
            runtime.as_ref(),
            &cache,
            &container.manifest,
            &container.dependency_dir,
            &container.install_command,
        )
        .await?;
        match outcome {
            InstallOutcome::CacheHit { key } => println!("Dependencies restored from cache ({})", key),
            InstallOutcome::Installed { key } => println!("Dependencies installed ({})", key),
        }
    }

    let dev_server = DevServerManager::new(Arc::clone(&runtime), container.dev_command.clone())
        .with_ready_timeout(config.ready_timeout())
        .with_fallback_url(container.fallback_url.clone())
        .with_session(Arc::clone(&session));
    let mut output = dev_server.subscribe_output();
    tokio::spawn(async move {
        while let Ok(line) = output.recv().await {
            println!("{}", style(line).dim());
        }
    });

    let preview = PreviewController::new();
    let url = dev_server.start().await?;
    preview.set_url(Some(url.clone()));
    println!("{} {}", style("Preview running at").green().bold(), url);
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    dev_server.stop();
    tracing::info!(preview = ?preview.snapshot(), status = %session.status(), "preview stopped");
    println!("\nPreview stopped.");
    Ok(())
}
