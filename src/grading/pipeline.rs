use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::SqlitePool;

use crate::config::GradingConfig;
use crate::database::{self as db, StatusUpdate};
use crate::error::GradeError;
use crate::submission::{Submission, SubmissionStatus, TestResult};

use super::fetcher::RepositoryFetcher;
use super::registry::RunnerRegistry;
use super::result::read_raw_result;
use super::runner::{
    CONTAINER_REPO_DIR, CONTAINER_RESULT_DIR, ENV_REPO_DIR, ENV_RESULT_DIR, ENV_RESULT_FILE,
    ENV_SUBMISSION_ID, Mount, ResourceLimits, SandboxRunner, SandboxSpec,
};
use super::workspace::WorkspaceManager;

/// Drives one submission at a time through resolve, stage, fetch, run and
/// parse, persisting every status transition before the next stage begins.
///
/// Cheap to clone; every pipeline runs on its own clone.
#[derive(Clone)]
pub struct Grader {
    pool: Arc<SqlitePool>,
    registry: Arc<RunnerRegistry>,
    fetcher: Arc<dyn RepositoryFetcher>,
    sandbox: Arc<dyn SandboxRunner>,
    workspaces: WorkspaceManager,
    settings: Arc<GradingConfig>,
}

impl Grader {
    pub fn new(
        pool: Arc<SqlitePool>,
        registry: Arc<RunnerRegistry>,
        fetcher: Arc<dyn RepositoryFetcher>,
        sandbox: Arc<dyn SandboxRunner>,
        workspace_root: PathBuf,
        settings: GradingConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            fetcher,
            sandbox,
            workspaces: WorkspaceManager::new(workspace_root),
            settings: Arc::new(settings),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Grades one submission to a terminal state.
    ///
    /// Returns `Ok(None)` when the submission was not `pending`, i.e. another
    /// pipeline owns it or it is already finished. Errors only come from the
    /// backing store; every grading failure ends as a `failed` result.
    pub async fn grade(&self, submission_id: u32) -> anyhow::Result<Option<SubmissionStatus>> {
        match db::update_submission_status(submission_id, SubmissionStatus::Testing, self.pool.clone())
            .await?
        {
            StatusUpdate::Applied => {}
            other => {
                log::warn!("Submission {submission_id}: not pending ({other:?}), skipped");
                return Ok(None);
            }
        }
        let submission = match with_retries(submission_id, "loading the submission", || {
            db::fetch_submission(submission_id, self.pool.clone())
        })
        .await
        {
            Ok(submission) => submission,
            Err(e) => {
                log::error!("Submission {submission_id}: unable to load it after claiming it: {e}");
                return self.force_failed(submission_id).await;
            }
        };
        log::info!(
            "Submission {submission_id}: grading exercise {} for user {}",
            submission.exercise_id,
            submission.user_id
        );

        // A panic anywhere in the stages surfaces as a JoinError instead of
        // taking the worker down; the workspace guard still unwinds.
        let stages = {
            let grader = self.clone();
            let submission = submission.clone();
            tokio::spawn(async move { grader.run_stages(&submission).await })
        };
        let outcome = match stages.await {
            Ok(outcome) => outcome,
            Err(e) => Err(GradeError::Internal(format!("grading task aborted: {e}"))),
        };
        // Covers the case where the guard never got created or leaked
        self.workspaces.teardown(submission_id);

        let result = match outcome {
            Ok(result) => {
                log::info!(
                    "Submission {submission_id}: graded, passed={} score={}/{}",
                    result.passed,
                    result.score,
                    result.max_score
                );
                result
            }
            Err(e) => {
                log::error!("Submission {submission_id}: {} - {e}", e.class());
                TestResult::failure(&submission, &e, self.max_score_of(&submission))
            }
        };

        let status = result.status;
        let stored = with_retries(submission_id, "storing the result", || {
            db::finish_submission(&result, self.pool.clone())
        })
        .await;
        match stored {
            Ok(StatusUpdate::Applied) => Ok(Some(status)),
            Ok(other) => {
                log::error!("Submission {submission_id}: final status {status} not applied ({other:?})");
                Ok(None)
            }
            Err(e) => {
                log::error!("Submission {submission_id}: unable to store the result: {e}");
                self.force_failed(submission_id).await
            }
        }
    }

    /// Last resort when the result cannot be stored: the submission must not
    /// stay `testing`, so it is moved to `failed` without a result row.
    async fn force_failed(&self, submission_id: u32) -> anyhow::Result<Option<SubmissionStatus>> {
        let update = with_retries(submission_id, "marking it failed", || {
            db::update_submission_status(submission_id, SubmissionStatus::Failed, self.pool.clone())
        })
        .await
        .with_context(|| format!("Submission {submission_id} is stuck in testing"))?;

        match update {
            StatusUpdate::Applied => {
                log::warn!("Submission {submission_id}: marked failed without a stored result");
                Ok(Some(SubmissionStatus::Failed))
            }
            other => {
                log::warn!("Submission {submission_id}: not marked failed ({other:?})");
                Ok(None)
            }
        }
    }

    async fn run_stages(&self, submission: &Submission) -> Result<TestResult, GradeError> {
        let id = submission.id;
        let runner = self.registry.create_runner(submission)?;

        let workspace = self
            .workspaces
            .prepare(id)
            .map_err(|source| GradeError::Workspace { source })?;

        log::debug!("Submission {id}: cloning {}", submission.repository_url);
        self.fetcher
            .clone_repository(&submission.repository_url, workspace.repo_dir())
            .await?;

        let spec = SandboxSpec {
            submission_id: id,
            image: runner.image.clone(),
            command: runner.command.clone(),
            mounts: vec![
                Mount {
                    host: workspace.repo_dir().to_path_buf(),
                    container: CONTAINER_REPO_DIR.to_string(),
                    read_only: true,
                },
                Mount {
                    host: workspace.result_dir().to_path_buf(),
                    container: CONTAINER_RESULT_DIR.to_string(),
                    read_only: false,
                },
            ],
            env: vec![
                (ENV_REPO_DIR.to_string(), CONTAINER_REPO_DIR.to_string()),
                (ENV_RESULT_DIR.to_string(), CONTAINER_RESULT_DIR.to_string()),
                (ENV_RESULT_FILE.to_string(), self.settings.result_file.clone()),
                (ENV_SUBMISSION_ID.to_string(), id.to_string()),
            ],
            limits: ResourceLimits {
                memory_bytes: self.settings.memory_limit.0,
                cpus: self.settings.cpu_limit,
                pids: self.settings.pids_limit,
                wall_time: Duration::from(self.settings.sandbox_timeout),
            },
        };

        log::debug!("Submission {id}: starting sandbox image {}", spec.image);
        let outcome = self.sandbox.run(&spec).await?;
        log::info!(
            "Submission {id}: sandbox exited with {} after {:?}",
            outcome.exit_code,
            outcome.elapsed
        );
        if outcome.exit_code != 0 {
            return Err(GradeError::SandboxRuntime {
                code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }

        let raw = read_raw_result(
            &workspace.result_dir().join(&self.settings.result_file),
            self.settings.max_result_bytes.0,
            runner.exercise.result_schema_version,
        )?;
        runner.parse_result(raw, submission)
    }

    /// Fails submissions a previous process left in `testing` and returns the
    /// ids still `pending`, which can be queued again.
    pub async fn recover(&self) -> anyhow::Result<Vec<u32>> {
        for id in db::submission_ids_with_status(SubmissionStatus::Testing, self.pool.clone()).await? {
            let submission = db::fetch_submission(id, self.pool.clone()).await?;
            let result = TestResult::failure(
                &submission,
                &GradeError::Interrupted,
                self.max_score_of(&submission),
            );
            db::finish_submission(&result, self.pool.clone()).await?;
            self.workspaces.teardown(id);
            log::warn!("Submission {id}: interrupted by a restart, marked failed");
        }

        Ok(db::submission_ids_with_status(SubmissionStatus::Pending, self.pool.clone()).await?)
    }

    fn max_score_of(&self, submission: &Submission) -> f64 {
        self.registry
            .exercise(&submission.exercise_id)
            .map_or(100.0, |e| e.max_score)
    }
}

const DB_RETRY_ATTEMPTS: u32 = 3;
const DB_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Runs a database operation up to `DB_RETRY_ATTEMPTS` times with a doubling
/// backoff.
async fn with_retries<T, F, Fut>(submission_id: u32, what: &str, mut op: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut delay = DB_RETRY_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= DB_RETRY_ATTEMPTS => return Err(e),
            Err(e) => log::warn!(
                "Submission {submission_id}: {what} failed (attempt {attempt}/{DB_RETRY_ATTEMPTS}): {e}"
            ),
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}
