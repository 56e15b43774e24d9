use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GradeError;

/// Where payloads find the submitted repository inside the sandbox
pub const CONTAINER_REPO_DIR: &str = "/workspace/repo";
/// Where payloads must write their result file inside the sandbox
pub const CONTAINER_RESULT_DIR: &str = "/workspace/results";

pub const ENV_REPO_DIR: &str = "GRADER_REPO_DIR";
pub const ENV_RESULT_DIR: &str = "GRADER_RESULT_DIR";
pub const ENV_RESULT_FILE: &str = "GRADER_RESULT_FILE";
pub const ENV_SUBMISSION_ID: &str = "GRADER_SUBMISSION_ID";

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpus: f64,
    pub pids: u32,
    pub wall_time: Duration,
}

/// Everything needed to start one sandbox for one submission.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub submission_id: u32,
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub elapsed: Duration,
    /// Tail of the sandbox stderr, for diagnostics
    pub stderr: String,
}

/// Trait for the different ways of executing a grading payload
///
/// Implementations always return: either the payload ran to an exit code, or
/// the launch failed, or the wall-clock limit was hit and the process killed.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxOutcome, GradeError>;
}

const STDERR_CAPTURE_LIMIT: u64 = 64 * 1024;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Collects at most 64 KiB of the child's stderr and discards the rest, so a
/// chatty payload cannot exhaust host memory.
pub(super) fn capture_stderr(
    child: &mut tokio::process::Child,
) -> tokio::task::JoinHandle<String> {
    use tokio::io::AsyncReadExt;

    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return String::new();
        };

        let mut captured = Vec::new();
        let mut limited = stderr.take(STDERR_CAPTURE_LIMIT);
        if let Err(e) = limited.read_to_end(&mut captured).await {
            log::debug!("Failed to read sandbox stderr: {e}");
        }
        let mut rest = limited.into_inner();
        let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;

        super::fetcher::tail(&String::from_utf8_lossy(&captured), 2000)
    })
}

/// Waits briefly for the capture task once the sandbox process has exited.
///
/// A leftover process can keep the pipe open; the capture is then abandoned
/// instead of holding the run past its wall-clock limit.
pub(super) async fn collect_stderr(mut capture: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut capture).await {
        Ok(Ok(stderr)) => stderr,
        Ok(Err(e)) => {
            log::debug!("Sandbox stderr capture failed: {e}");
            String::new()
        }
        Err(_) => {
            log::warn!("Sandbox stderr still open after the process exited, dropping it");
            capture.abort();
            String::new()
        }
    }
}
