//! Build job sequencing: materialize → build → package, with status
//! tracking and guaranteed workspace cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::materializer::ProjectMaterializer;
use super::models::{BuildJob, BuildStatus, is_valid_transition};
use super::packager::ArtifactPackager;
use super::runner::BuildRunner;
use super::sanitize::sanitize_project_name;
use super::store::SharedJobStore;
use crate::buildbox_config::BuildboxConfig;
use crate::errors::BuildError;

/// Everything the orchestrator needs to run jobs. Cheap to clone into tasks.
struct Pipeline {
    store: SharedJobStore,
    materializer: ProjectMaterializer,
    runner: BuildRunner,
    packager: ArtifactPackager,
    artifact_root: PathBuf,
}

/// Accepts build submissions and drives each job to a terminal state on a
/// background task.
#[derive(Clone)]
pub struct JobOrchestrator {
    pipeline: Arc<Pipeline>,
}

impl JobOrchestrator {
    pub fn new(
        store: SharedJobStore,
        materializer: ProjectMaterializer,
        runner: BuildRunner,
        packager: ArtifactPackager,
        artifact_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                materializer,
                runner,
                packager,
                artifact_root: artifact_root.into(),
            }),
        }
    }

    /// Wire up an orchestrator from resolved configuration.
    pub fn from_config(config: &BuildboxConfig, store: SharedJobStore) -> Self {
        let build = &config.toml.build;
        let materializer = ProjectMaterializer::new(
            config.template_dir(),
            config.workspace_root(),
            config.selectors_dir(),
            build.output_dir.clone(),
        );
        let runner = BuildRunner::new(build.build_command.clone(), config.log_dir(), Arc::clone(&store));
        Self::new(store, materializer, runner, ArtifactPackager::new(), config.artifact_root())
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.pipeline.store
    }

    /// Register a job and start it in the background. Returns immediately.
    pub fn submit(&self, project_name: &str, schema: serde_json::Value) -> Uuid {
        let id = Uuid::new_v4();
        let sanitized = sanitize_project_name(project_name);
        self.pipeline
            .store
            .put(BuildJob::new(id, project_name, &sanitized));
        tracing::info!(job_id = %id, project = %project_name, sanitized = %sanitized, "build submitted");

        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            pipeline.execute(id, schema).await;
        });
        id
    }

    pub fn get_status(&self, id: &Uuid) -> Option<BuildJob> {
        self.pipeline.store.get(id)
    }

    pub fn list_jobs(&self) -> Vec<BuildJob> {
        self.pipeline.store.list()
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_completion(&self, id: &Uuid) -> Result<BuildJob, BuildError> {
        loop {
            let job = self
                .get_status(id)
                .ok_or(BuildError::JobNotFound { id: *id })?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

impl Pipeline {
    /// Run one job to completion. The stages run on their own task so a
    /// panic is caught here; the workspace is removed exactly once below,
    /// whatever the outcome.
    async fn execute(self: Arc<Self>, id: Uuid, schema: serde_json::Value) {
        let workspace = self.materializer.workspace_path(&id.to_string());

        let stages = tokio::spawn({
            let pipeline = Arc::clone(&self);
            async move { pipeline.run_stages(id, &schema).await }
        });
        let outcome = match stages.await {
            Ok(result) => result,
            Err(join_err) => Err(BuildError::Other(anyhow::anyhow!(
                "build task panicked: {}",
                join_err
            ))),
        };

        cleanup_workspace(id, &workspace).await;

        match outcome {
            Ok(artifact) => {
                self.transition(id, BuildStatus::Completed, |job| {
                    job.artifact_path = Some(artifact.clone());
                    job.logs.push(format!("Build completed: {}", artifact.display()));
                });
                tracing::info!(job_id = %id, artifact = %artifact.display(), "build completed");
            }
            Err(e) => {
                let message = e.to_string();
                self.transition(id, BuildStatus::Failed, |job| {
                    job.artifact_path = None;
                    job.error_message = Some(message.clone());
                    job.logs.push(format!("Build failed: {}", message));
                });
                tracing::error!(job_id = %id, error = %message, "build failed");
            }
        }
    }

    async fn run_stages(&self, id: Uuid, schema: &serde_json::Value) -> Result<PathBuf, BuildError> {
        self.transition(id, BuildStatus::CreatingEnvironment, |job| {
            job.logs.push("Creating isolated build environment".to_string());
        });
        let project = self.materializer.materialize(&id.to_string(), schema).await?;

        self.transition(id, BuildStatus::Building, |job| {
            job.logs.push("Running build".to_string());
        });
        let output = self
            .runner
            .run(&project.workspace_path, id, &project.expected_output_path)
            .await?;

        self.transition(id, BuildStatus::Packaging, |job| {
            job.logs.push("Packaging build output".to_string());
        });
        let file_name = self
            .store
            .get(&id)
            .map(|job| job.archive_file_name())
            .ok_or(BuildError::JobNotFound { id })?;
        let archive = self.artifact_root.join(id.to_string()).join(file_name);
        self.packager.pack(&output, &archive).await
    }

    /// Copy-then-replace status update. Invalid transitions are ignored.
    fn transition(&self, id: Uuid, to: BuildStatus, mut extra: impl FnMut(&mut BuildJob)) {
        let mut rejected = None;
        self.store.update(&id, &mut |job| {
            if !is_valid_transition(&job.status, &to) {
                rejected = Some(job.status);
                return;
            }
            job.status = to;
            if to.is_terminal() {
                job.end_time = Some(Utc::now());
            }
            extra(job);
        });
        if let Some(from) = rejected {
            tracing::warn!(job_id = %id, from = %from, to = %to, "rejected invalid status transition");
        }
    }
}

async fn cleanup_workspace(id: Uuid, workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => tracing::debug!(job_id = %id, "workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(job_id = %id, workspace = %workspace.display(), error = %e, "workspace cleanup failed")
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::build::store::{InMemoryJobStore, JobStore};
    use std::fs;

    struct Fixture {
        dir: tempfile::TempDir,
        orchestrator: JobOrchestrator,
    }

    impl Fixture {
        fn workspace_root(&self) -> PathBuf {
            self.dir.path().join("workspaces")
        }

        fn workspace_count(&self) -> usize {
            fs::read_dir(self.workspace_root())
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    fn fixture(build_script: &str, with_template: bool) -> Fixture {
        fixture_with_store(build_script, with_template, Arc::new(InMemoryJobStore::new()))
    }

    fn fixture_with_store(build_script: &str, with_template: bool, store: SharedJobStore) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        if with_template {
            fs::create_dir_all(template.join("src")).unwrap();
            fs::write(template.join("package.json"), "{}").unwrap();
        }
        let materializer = ProjectMaterializer::new(
            &template,
            dir.path().join("workspaces"),
            dir.path().join("selectors"),
            "dist",
        );
        let runner = BuildRunner::new(
            vec!["sh".into(), "-c".into(), build_script.into()],
            dir.path().join("logs"),
            Arc::clone(&store),
        );
        let orchestrator = JobOrchestrator::new(
            store,
            materializer,
            runner,
            ArtifactPackager::new(),
            dir.path().join("artifacts"),
        );
        Fixture { dir, orchestrator }
    }

    const COPY_SCHEMA: &str = "mkdir -p dist && cp src/schema.json dist/schema.json && echo done";

    #[tokio::test]
    async fn test_successful_build_produces_archive_and_cleans_up() {
        let fx = fixture(COPY_SCHEMA, true);
        let id = fx
            .orchestrator
            .submit("demo", serde_json::json!({"ROOT": {}}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Completed, "{:?}", job.error_message);
        let artifact = job.artifact_path.clone().unwrap();
        assert!(artifact.ends_with(format!("{}/demo.zip", id)));
        assert!(fs::metadata(&artifact).unwrap().len() > 0);
        assert!(job.end_time.is_some());
        assert!(job.logs.iter().any(|l| l == "done"));
        assert_eq!(fx.workspace_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_template_fails_without_workspace() {
        let fx = fixture(COPY_SCHEMA, false);
        let id = fx.orchestrator.submit("demo", serde_json::json!({}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.contains("Template directory not found"), "{}", message);
        assert!(message.contains("template"));
        assert!(job.artifact_path.is_none());
        assert_eq!(fx.workspace_count(), 0);
    }

    #[tokio::test]
    async fn test_build_script_failure_reports_exit_code() {
        let fx = fixture("echo broken >&2; exit 1", true);
        let id = fx.orchestrator.submit("demo", serde_json::json!({}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.error_message.unwrap().contains("non-zero code 1"));
        assert!(job.artifact_path.is_none());
        assert!(job.logs.iter().any(|l| l == "[stderr] broken"));
        assert!(!fx.dir.path().join("artifacts").join(id.to_string()).join("demo.zip").exists());
        assert_eq!(fx.workspace_count(), 0);
    }

    #[tokio::test]
    async fn test_packaging_failure_cleans_up() {
        // Build succeeds but never creates dist/.
        let fx = fixture("echo nothing to see", true);
        let id = fx.orchestrator.submit("demo", serde_json::json!({}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.error_message.unwrap().contains("Failed to package"));
        assert!(job.artifact_path.is_none());
        assert_eq!(fx.workspace_count(), 0);
    }

    #[tokio::test]
    async fn test_materialization_failure_fails_job_and_cleans_up() {
        let fx = fixture(COPY_SCHEMA, true);
        // A directory where the schema file has to go.
        fs::create_dir_all(fx.dir.path().join("template/src/schema.json")).unwrap();
        let id = fx.orchestrator.submit("demo", serde_json::json!({"ROOT": {}}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.contains("Failed to materialize workspace"), "{}", message);
        assert!(job.artifact_path.is_none());
        assert!(!fx.dir.path().join("logs").join(format!("{}.log", id)).exists());
        assert_eq!(fx.workspace_count(), 0);
    }

    /// Panics when asked to move a job into packaging.
    struct PanicOnPackaging(InMemoryJobStore);

    impl JobStore for PanicOnPackaging {
        fn get(&self, id: &Uuid) -> Option<BuildJob> {
            self.0.get(id)
        }

        fn put(&self, job: BuildJob) {
            self.0.put(job)
        }

        fn update(&self, id: &Uuid, f: &mut dyn FnMut(&mut BuildJob)) -> Option<BuildJob> {
            self.0.update(id, &mut |job| {
                f(job);
                if job.status == BuildStatus::Packaging {
                    panic!("packaging refused");
                }
            })
        }

        fn append_logs(&self, id: &Uuid, lines: &[String]) -> bool {
            self.0.append_logs(id, lines)
        }

        fn list(&self) -> Vec<BuildJob> {
            self.0.list()
        }
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_job_and_cleans_up() {
        let fx = fixture_with_store(COPY_SCHEMA, true, Arc::new(PanicOnPackaging(InMemoryJobStore::new())));
        let id = fx.orchestrator.submit("demo", serde_json::json!({"ROOT": {}}));

        let job = fx.orchestrator.wait_for_completion(&id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.contains("build task panicked"), "{}", message);
        assert!(job.logs.iter().any(|l| l == "done"));
        assert!(job.end_time.is_some());
        assert!(!fx.dir.path().join("artifacts").join(id.to_string()).exists());
        assert_eq!(fx.workspace_count(), 0);
    }

    #[tokio::test]
    async fn test_status_never_regresses_while_polling() {
        let fx = fixture("sleep 0.2; mkdir -p dist && echo x > dist/a.txt", true);
        let id = fx.orchestrator.submit("demo", serde_json::json!({}));

        let mut seen = Vec::new();
        loop {
            let job = fx.orchestrator.get_status(&id).unwrap();
            if seen.last() != Some(&job.status) {
                seen.push(job.status);
            }
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        for pair in seen.windows(2) {
            assert!(pair[1].rank() > pair[0].rank(), "regressed: {:?}", seen);
        }
        assert_eq!(seen.last(), Some(&BuildStatus::Completed));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_are_isolated() {
        let fx = fixture(COPY_SCHEMA, true);
        let ids: Vec<Uuid> = (0..4)
            .map(|i| fx.orchestrator.submit(&format!("app {}", i), serde_json::json!({"n": i})))
            .collect();

        for (i, id) in ids.iter().enumerate() {
            let job = fx.orchestrator.wait_for_completion(id).await.unwrap();
            assert_eq!(job.status, BuildStatus::Completed);
            assert_eq!(job.sanitized_name, format!("app_{}", i));

            let file = fs::File::open(job.artifact_path.unwrap()).unwrap();
            let mut archive = zip::ZipArchive::new(file).unwrap();
            let mut schema = String::new();
            std::io::Read::read_to_string(&mut archive.by_name("schema.json").unwrap(), &mut schema)
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&schema).unwrap();
            assert_eq!(value["n"], i);
        }
        assert_eq!(fx.workspace_count(), 0);
        assert_eq!(fx.orchestrator.list_jobs().len(), 4);
    }

    #[test]
    fn test_transition_rejects_backwards_moves() {
        let fx = fixture(COPY_SCHEMA, true);
        let store = Arc::clone(fx.orchestrator.store());
        let job = BuildJob::new(Uuid::new_v4(), "demo", "demo");
        let id = job.id;
        store.put(job);

        let pipeline = &fx.orchestrator.pipeline;
        pipeline.transition(id, BuildStatus::CreatingEnvironment, |_| {});
        pipeline.transition(id, BuildStatus::Pending, |_| {});
        assert_eq!(store.get(&id).unwrap().status, BuildStatus::CreatingEnvironment);

        pipeline.transition(id, BuildStatus::Failed, |job| job.error_message = Some("x".into()));
        pipeline.transition(id, BuildStatus::Building, |_| {});
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let fx = fixture(COPY_SCHEMA, true);
        let err = fx.orchestrator.wait_for_completion(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BuildError::JobNotFound { .. }));
    }
}
