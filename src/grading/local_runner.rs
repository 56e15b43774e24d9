use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::GradeError;

use super::runner::{
    SandboxOutcome, SandboxRunner, SandboxSpec, capture_stderr, collect_stderr,
};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Host variables a payload may need to find its tools, e.g. `CHROME` for the browser
const PASSTHROUGH_ENV: [&str; 2] = ["HOME", "CHROME"];

/// A runner that executes the payload command directly on the host
///
/// LocalRunner keeps the wall-clock timeout and the environment contract of
/// the container engine but provides no network, memory, CPU or filesystem
/// isolation. This is intended for development and testing environments.
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        log::warn!("LocalRunner provides NO security isolation - use only in trusted environments");
        Self
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRunner for LocalRunner {
    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxOutcome, GradeError> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(GradeError::SandboxLaunch(format!(
                "the local engine needs a command for image `{}`",
                spec.image
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        // Container paths in the environment are rewritten to their host side
        for (key, value) in &spec.env {
            let value = spec
                .mounts
                .iter()
                .find(|m| &m.container == value)
                .map(|m| m.host.to_string_lossy().into_owned())
                .unwrap_or_else(|| value.clone());
            command.env(key, value);
        }
        if let Some(repo) = spec.mounts.iter().find(|m| m.read_only) {
            command.current_dir(&repo.host);
        }

        let start_time = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| GradeError::SandboxLaunch(format!("unable to start {program}: {e}")))?;
        let group = child.id();
        let stderr = capture_stderr(&mut child);

        let status = match timeout(spec.limits.wall_time, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                kill_group(group);
                stderr.abort();
                return Err(GradeError::Internal(format!("failed to wait for payload: {e}")));
            }
            Err(_) => {
                log::warn!(
                    "Submission {}: payload exceeded {:?}, killing it",
                    spec.submission_id,
                    spec.limits.wall_time
                );
                kill_group(group);
                let _ = child.kill().await;
                stderr.abort();
                return Err(GradeError::SandboxTimeout {
                    timeout: spec.limits.wall_time,
                });
            }
        };
        // Background processes the payload left behind go with it
        kill_group(group);

        Ok(SandboxOutcome {
            exit_code: status.code().unwrap_or(-1),
            elapsed: start_time.elapsed(),
            stderr: collect_stderr(stderr).await,
        })
    }
}

/// Sends SIGKILL to the process group led by the payload.
fn kill_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: kill has no memory preconditions; a negative pid addresses the
    // group created by `process_group(0)`, which only holds payload processes
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        log::debug!(
            "Process group {pgid} already gone: {}",
            std::io::Error::last_os_error()
        );
    }
}
