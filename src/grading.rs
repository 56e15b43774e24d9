mod docker_runner;
mod fetcher;
mod local_runner;
mod pipeline;
mod registry;
pub mod result;
mod runner;
mod workspace;

pub use docker_runner::DockerRunner;
pub use fetcher::{GitFetcher, RepositoryFetcher, validate_repository_url};
pub use local_runner::LocalRunner;
pub use pipeline::Grader;
pub use registry::{ExerciseKind, ExerciseRunner, RequiredChecksParser, ResultParser, RunnerRegistry};
pub use result::RawResultFile;
pub use runner::{
    CONTAINER_REPO_DIR, CONTAINER_RESULT_DIR, ENV_REPO_DIR, ENV_RESULT_DIR, ENV_RESULT_FILE,
    ENV_SUBMISSION_ID, Mount, ResourceLimits, SandboxOutcome, SandboxRunner, SandboxSpec,
};
pub use workspace::{Workspace, WorkspaceManager};

use std::sync::Arc;

use anyhow::bail;

use crate::config::Engine;

/// Creates the sandbox runner for the configured engine
///
/// The docker engine is checked for availability up front so that a missing
/// daemon is reported at startup rather than on every submission.
pub fn create_sandbox_runner(engine: Engine) -> anyhow::Result<Arc<dyn SandboxRunner>> {
    match engine {
        Engine::Docker => {
            let runner = DockerRunner::new();
            if !runner.is_available() {
                bail!("The docker engine is not available; start it or use the local engine");
            }
            log::info!("Creating DockerRunner (full isolation mode)");
            Ok(Arc::new(runner))
        }
        Engine::Local => {
            log::info!("Creating LocalRunner (no isolation mode)");
            Ok(Arc::new(LocalRunner::new()))
        }
    }
}
