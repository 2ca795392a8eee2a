//! Configuration view and validation commands (`buildbox config`).

use anyhow::{Context, Result};
use console::style;

use super::super::ConfigCommands;
use buildbox::buildbox_config::{BuildboxConfig, BuildboxToml, CONFIG_DIR, CONFIG_FILE};

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Buildbox Configuration").bold());
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No buildbox.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let config = BuildboxConfig::new(project_dir.to_path_buf())?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Resolved paths:");
            println!("  template_dir   = {}", config.template_dir().display());
            println!("  workspace_root = {}", config.workspace_root().display());
            println!("  artifact_root  = {}", config.artifact_root().display());
            println!("  log_dir        = {}", config.log_dir().display());
            println!("  selectors_dir  = {}", config.selectors_dir().display());
            println!("  container_root = {}", config.container_root().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = BuildboxConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", style(warning).yellow());
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("buildbox.toml already exists at {}", config_path.display());
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            BuildboxToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
