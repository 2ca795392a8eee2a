//! Workspace materialization: template copy, schema injection and bundler
//! config generation.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::BuildError;

/// Schema location inside every workspace.
pub const SCHEMA_RELATIVE_PATH: &str = "src/schema.json";

/// Generated bundler config location inside every workspace.
pub const BUNDLER_CONFIG_FILE: &str = "vite.config.ts";

/// Paths produced by a successful materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedProject {
    pub workspace_path: PathBuf,
    pub expected_output_path: PathBuf,
}

/// Escape text for a single-quoted JavaScript/TypeScript string literal.
pub fn escape_for_string_literal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '`' => out.push_str("\\`"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Escape text so it matches itself literally inside a JavaScript regular
/// expression (including `/`, so the result is also safe in `/.../` form).
pub fn escape_for_regex_literal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(
            c,
            '\\' | '^' | '$' | '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '/'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render the bundler config for one workspace.
///
/// The selectors path appears twice: once as a string constant and once as
/// the source of an anchored `RegExp`, which needs regex escaping first and
/// string escaping second.
pub fn render_bundler_config(selectors_dir: &Path, output_dir: &str) -> String {
    let selectors = selectors_dir.to_string_lossy();
    let as_string = escape_for_string_literal(&selectors);
    let as_pattern = escape_for_string_literal(&escape_for_regex_literal(&selectors));
    let out_dir = escape_for_string_literal(output_dir);

    format!(
        r#"// Generated by buildbox. Do not edit.
import {{ defineConfig }} from 'vite';
import react from '@vitejs/plugin-react';

const selectorsDir = '{as_string}';
const selectorsPattern = new RegExp('^{as_pattern}');

export default defineConfig({{
  plugins: [react()],
  resolve: {{
    alias: {{
      '@selectors': selectorsDir,
    }},
  }},
  server: {{
    fs: {{
      allow: ['.', selectorsDir],
    }},
  }},
  optimizeDeps: {{
    exclude: [selectorsDir],
  }},
  build: {{
    outDir: '{out_dir}',
    emptyOutDir: true,
    commonjsOptions: {{
      include: [/node_modules/, selectorsPattern],
    }},
  }},
}});
"#
    )
}

/// Copies the template into a per-job workspace and injects the schema and
/// the generated bundler config.
#[derive(Debug, Clone)]
pub struct ProjectMaterializer {
    template_dir: PathBuf,
    workspace_root: PathBuf,
    selectors_dir: PathBuf,
    output_dir: String,
}

impl ProjectMaterializer {
    pub fn new(
        template_dir: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        selectors_dir: impl Into<PathBuf>,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            template_dir: template_dir.into(),
            workspace_root: workspace_root.into(),
            selectors_dir: selectors_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Workspace path for a job. Derived only from the job id.
    pub fn workspace_path(&self, job_id: &str) -> PathBuf {
        self.workspace_root.join(job_id)
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Materialize a workspace for `job_id` with `schema` injected.
    ///
    /// Runs on the blocking pool. On any I/O failure the partial workspace is
    /// removed before the error is returned.
    pub async fn materialize(
        &self,
        job_id: &str,
        schema: &serde_json::Value,
    ) -> Result<MaterializedProject, BuildError> {
        let this = self.clone();
        let job_id = job_id.to_string();
        let schema = schema.clone();
        tokio::task::spawn_blocking(move || this.materialize_blocking(&job_id, &schema))
            .await
            .map_err(|e| BuildError::Other(anyhow::anyhow!("materialize task panicked: {}", e)))?
    }

    fn materialize_blocking(
        &self,
        job_id: &str,
        schema: &serde_json::Value,
    ) -> Result<MaterializedProject, BuildError> {
        if !self.template_dir.is_dir() {
            return Err(BuildError::TemplateMissing {
                path: self.template_dir.clone(),
            });
        }

        let workspace = self.workspace_path(job_id);
        match self.populate(&workspace, schema) {
            Ok(()) => {
                tracing::debug!(job_id, workspace = %workspace.display(), "workspace materialized");
                Ok(MaterializedProject {
                    expected_output_path: workspace.join(&self.output_dir),
                    workspace_path: workspace,
                })
            }
            Err(source) => {
                if workspace.exists()
                    && let Err(e) = std::fs::remove_dir_all(&workspace)
                {
                    tracing::warn!(job_id, error = %e, "failed to remove partial workspace");
                }
                Err(BuildError::MaterializationFailed {
                    path: workspace,
                    source,
                })
            }
        }
    }

    fn populate(&self, workspace: &Path, schema: &serde_json::Value) -> io::Result<()> {
        if workspace.exists() {
            tracing::info!(workspace = %workspace.display(), "removing stale workspace");
            std::fs::remove_dir_all(workspace)?;
        }

        copy_dir_recursive(&self.template_dir, workspace)?;

        let schema_path = workspace.join(SCHEMA_RELATIVE_PATH);
        if let Some(parent) = schema_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let schema_json = serde_json::to_string_pretty(schema).map_err(io::Error::other)?;
        std::fs::write(&schema_path, schema_json)?;

        let selectors = std::path::absolute(&self.selectors_dir)?;
        let config = render_bundler_config(&selectors, &self.output_dir);
        std::fs::write(workspace.join(BUNDLER_CONFIG_FILE), config)?;

        Ok(())
    }
}

/// Recursively copy `src` into `dst`, creating `dst`. Symlinks are
/// recreated as symlinks on unix.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}
