//! Unified configuration system for buildbox.
//!
//! Settings are read from `.buildbox/buildbox.toml` inside the project
//! directory and layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [build]
//! template_dir = "template"
//! workspace_root = ".buildbox/workspaces"
//! artifact_root = ".buildbox/artifacts"
//! log_dir = ".buildbox/logs"
//! selectors_dir = "selectors"
//! build_command = ["npm", "run", "build"]
//! output_dir = "dist"
//!
//! [container]
//! root = ".buildbox/container"
//! install_command = ["npm", "install"]
//! dev_command = ["npm", "run", "dev"]
//! manifest = "package.json"
//! dependency_dir = "node_modules"
//! ready_timeout_secs = 30
//! fallback_url = "http://localhost:5173"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project configuration directory.
pub const CONFIG_DIR: &str = ".buildbox";

/// Name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "buildbox.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a local editor dev server
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

/// Build pipeline settings. Relative paths resolve against the project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    /// Read-only template project copied into every workspace
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Parent directory of per-job workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Where packaged archives are kept for download
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Per-job build log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Shared component-selectors directory injected into the bundler config
    #[serde(default = "default_selectors_dir")]
    pub selectors_dir: PathBuf,
    /// Build command argv, run inside the workspace
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    /// Output directory produced by the build, relative to the workspace
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("template")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("workspaces")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("artifacts")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("logs")
}

fn default_selectors_dir() -> PathBuf {
    PathBuf::from("selectors")
}

fn default_build_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "build".into()]
}

fn default_output_dir() -> String {
    "dist".to_string()
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            workspace_root: default_workspace_root(),
            artifact_root: default_artifact_root(),
            log_dir: default_log_dir(),
            selectors_dir: default_selectors_dir(),
            build_command: default_build_command(),
            output_dir: default_output_dir(),
        }
    }
}

/// Container session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    /// Root directory of the local execution environment
    #[serde(default = "default_container_root")]
    pub root: PathBuf,
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    #[serde(default = "default_dev_command")]
    pub dev_command: Vec<String>,
    /// Dependency manifest whose bytes key the dependency cache
    #[serde(default = "default_manifest")]
    pub manifest: String,
    /// Installed dependency directory that gets snapshotted
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// URL assumed when the ready signal never arrives but the server is alive
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
}

fn default_container_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("container")
}

fn default_install_command() -> Vec<String> {
    vec!["npm".into(), "install".into()]
}

fn default_dev_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "dev".into()]
}

fn default_manifest() -> String {
    "package.json".to_string()
}

fn default_dependency_dir() -> String {
    "node_modules".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_fallback_url() -> String {
    "http://localhost:5173".to_string()
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            root: default_container_root(),
            install_command: default_install_command(),
            dev_command: default_dev_command(),
            manifest: default_manifest(),
            dependency_dir: default_dependency_dir(),
            ready_timeout_secs: default_ready_timeout_secs(),
            fallback_url: default_fallback_url(),
        }
    }
}

/// Root structure of `buildbox.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildboxToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub container: ContainerSection,
}

impl BuildboxToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildbox.toml")
    }

    /// Load configuration from `<config_dir>/buildbox.toml`.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize buildbox.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of the file values.
    ///
    /// `BUILDBOX_TEMPLATE_DIR`, `BUILDBOX_BUILD_CMD` (whitespace separated)
    /// and `BUILDBOX_PORT` are honoured.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("BUILDBOX_TEMPLATE_DIR")
            && !dir.trim().is_empty()
        {
            self.build.template_dir = PathBuf::from(dir);
        }
        if let Ok(cmd) = std::env::var("BUILDBOX_BUILD_CMD") {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                self.build.build_command = argv;
            }
        }
        if let Ok(port) = std::env::var("BUILDBOX_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid BUILDBOX_PORT"),
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.build.build_command.is_empty() {
            warnings.push("build.build_command is empty".to_string());
        }
        if self.build.output_dir.trim().is_empty() {
            warnings.push("build.output_dir is empty".to_string());
        }
        if self.container.install_command.is_empty() {
            warnings.push("container.install_command is empty".to_string());
        }
        if self.container.dev_command.is_empty() {
            warnings.push("container.dev_command is empty".to_string());
        }
        if self.container.ready_timeout_secs == 0 {
            warnings.push(
                "container.ready_timeout_secs is 0; the dev server will always use the fallback URL"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Resolved configuration: file settings, env overrides and CLI overrides,
/// with every path made absolute against the project directory.
#[derive(Debug, Clone)]
pub struct BuildboxConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .buildbox directory
    pub config_dir: PathBuf,
    /// Parsed (and env-overridden) buildbox.toml
    pub toml: BuildboxToml,
    /// CLI override for the server port
    pub cli_port: Option<u16>,
    /// CLI override for dev mode
    pub cli_dev_mode: bool,
}

impl BuildboxConfig {
    /// Create a BuildboxConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = BuildboxToml::load_or_default(&config_dir)?;
        toml.apply_env();

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            cli_port: None,
            cli_dev_mode: false,
        })
    }

    /// Create BuildboxConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, port: Option<u16>, dev_mode: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_port = port;
        config.cli_dev_mode = dev_mode;
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Server port (CLI → env → file → default).
    pub fn port(&self) -> u16 {
        self.cli_port.unwrap_or(self.toml.server.port)
    }

    pub fn host(&self) -> &str {
        &self.toml.server.host
    }

    pub fn dev_mode(&self) -> bool {
        self.cli_dev_mode || self.toml.server.dev_mode
    }

    pub fn template_dir(&self) -> PathBuf {
        self.resolve(&self.toml.build.template_dir)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(&self.toml.build.workspace_root)
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.resolve(&self.toml.build.artifact_root)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.toml.build.log_dir)
    }

    pub fn selectors_dir(&self) -> PathBuf {
        self.resolve(&self.toml.build.selectors_dir)
    }

    pub fn container_root(&self) -> PathBuf {
        self.resolve(&self.toml.container.root)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.container.ready_timeout_secs)
    }

    /// Path of the configuration file for this project.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Validate configuration and return warnings, including filesystem checks.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        let template = self.template_dir();
        if !template.is_dir() {
            warnings.push(format!(
                "Template directory does not exist: {}",
                template.display()
            ));
        }
        let selectors = self.selectors_dir();
        if !selectors.is_dir() {
            warnings.push(format!(
                "Selectors directory does not exist: {}",
                selectors.display()
            ));
        }
        warnings
    }
}
