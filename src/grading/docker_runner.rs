use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::GradeError;

use super::runner::{
    SandboxOutcome, SandboxRunner, SandboxSpec, capture_stderr, collect_stderr,
};

/// Exit code docker itself uses when the container could not be created or started
const DOCKER_LAUNCH_FAILURE: i32 = 125;
const TMPFS_SIZE: &str = "256m";

static CONTAINER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runs grading payloads in throwaway docker containers
///
/// Each run gets its own container with networking disabled, hard memory,
/// CPU and process caps, no capabilities, a read-only root filesystem, the
/// repository mounted read-only and the results directory mounted read-write.
pub struct DockerRunner {
    docker: String,
}

impl DockerRunner {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }

    /// Uses a specific docker-compatible CLI, e.g. `podman`
    pub fn with_binary(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    /// Whether the container engine answers at all
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.docker)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(&self.docker)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => log::debug!("Killed container {name}"),
            Ok(status) => log::warn!("docker kill {name} exited with {status}"),
            Err(e) => log::warn!("Failed to run docker kill {name}: {e}"),
        }
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxOutcome, GradeError> {
        let name = container_name(spec.submission_id);
        let args = docker_run_args(spec, &name, host_user());
        log::debug!("Submission {}: docker {}", spec.submission_id, args.join(" "));

        let start_time = Instant::now();
        let mut child = Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GradeError::SandboxLaunch(format!("unable to start {}: {e}", self.docker)))?;
        let stderr = capture_stderr(&mut child);

        let status = match timeout(spec.limits.wall_time, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stderr.abort();
                return Err(GradeError::Internal(format!(
                    "failed to wait for container: {e}"
                )));
            }
            Err(_) => {
                log::warn!(
                    "Submission {}: container {name} exceeded {:?}, killing it",
                    spec.submission_id,
                    spec.limits.wall_time
                );
                self.kill(&name).await;
                let _ = child.kill().await;
                stderr.abort();
                return Err(GradeError::SandboxTimeout {
                    timeout: spec.limits.wall_time,
                });
            }
        };

        let stderr = collect_stderr(stderr).await;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code == DOCKER_LAUNCH_FAILURE {
            return Err(GradeError::SandboxLaunch(format!(
                "image `{}`: {stderr}",
                spec.image
            )));
        }

        Ok(SandboxOutcome {
            exit_code,
            elapsed: start_time.elapsed(),
            stderr,
        })
    }
}

fn container_name(submission_id: u32) -> String {
    let seq = CONTAINER_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("grader-{submission_id}-{}-{seq}", std::process::id())
}

/// Runs the container as the invoking user so the results it writes stay
/// owned by, and removable by, the grader.
fn host_user() -> (u32, u32) {
    // SAFETY: getuid and getgid have no preconditions and cannot fail
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn docker_run_args(spec: &SandboxSpec, name: &str, (uid, gid): (u32, u32)) -> Vec<String> {
    let limits = &spec.limits;
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        format!("--name={name}"),
        "--pull=never".into(),
        "--network=none".into(),
        format!("--memory={}b", limits.memory_bytes),
        format!("--memory-swap={}b", limits.memory_bytes),
        format!("--cpus={}", limits.cpus),
        format!("--pids-limit={}", limits.pids),
        "--cap-drop=ALL".into(),
        "--security-opt=no-new-privileges".into(),
        "--read-only".into(),
        format!("--tmpfs=/tmp:rw,nosuid,size={TMPFS_SIZE}"),
        format!("--user={uid}:{gid}"),
        // The host uid has no home in the image and the root filesystem is read-only
        "-e".into(),
        "HOME=/tmp".into(),
    ];

    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".into());
        args.push(format!("{}:{}:{mode}", mount.host.display(), mount.container));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::grading::runner::{Mount, ResourceLimits};

    fn spec() -> SandboxSpec {
        SandboxSpec {
            submission_id: 42,
            image: "grader/todo-app:latest".to_string(),
            command: vec![],
            mounts: vec![
                Mount {
                    host: PathBuf::from("/tmp/ws/42/repo"),
                    container: "/workspace/repo".to_string(),
                    read_only: true,
                },
                Mount {
                    host: PathBuf::from("/tmp/ws/42/results"),
                    container: "/workspace/results".to_string(),
                    read_only: false,
                },
            ],
            env: vec![("GRADER_RESULT_FILE".to_string(), "result.json".to_string())],
            limits: ResourceLimits {
                memory_bytes: 536870912,
                cpus: 0.5,
                pids: 128,
                wall_time: Duration::from_secs(120),
            },
        }
    }

    #[test]
    fn test_container_has_no_network() {
        let args = docker_run_args(&spec(), "grader-42", (1000, 1000));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--network=") && a != "--network=none"));
    }

    #[test]
    fn test_resource_caps_are_applied() {
        let args = docker_run_args(&spec(), "grader-42", (1000, 1000));
        for expected in [
            "--memory=536870912b",
            "--memory-swap=536870912b",
            "--cpus=0.5",
            "--pids-limit=128",
            "--cap-drop=ALL",
            "--read-only",
            "--pull=never",
            "--user=1000:1000",
        ] {
            assert!(args.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_repository_is_mounted_read_only() {
        let args = docker_run_args(&spec(), "grader-42", (1000, 1000));
        assert!(args.contains(&"/tmp/ws/42/repo:/workspace/repo:ro".to_string()));
        assert!(args.contains(&"/tmp/ws/42/results:/workspace/results:rw".to_string()));
    }

    #[test]
    fn test_image_and_command_come_last() {
        let mut spec = spec();
        spec.command = vec!["todo-payload".to_string(), "--verbose".to_string()];
        let args = docker_run_args(&spec, "grader-42", (0, 0));

        let n = args.len();
        assert_eq!(args[n - 3], "grader/todo-app:latest");
        assert_eq!(&args[n - 2..], &["todo-payload", "--verbose"]);
        assert_eq!(args[0], "run");
        assert!(args.contains(&"GRADER_RESULT_FILE=result.json".to_string()));
    }

    #[test]
    fn test_home_points_at_the_writable_tmpfs() {
        let args = docker_run_args(&spec(), "grader-42", (1000, 1000));
        let home = args.iter().position(|a| a == "HOME=/tmp").unwrap();
        assert_eq!(args[home - 1], "-e");
        assert!(args.iter().any(|a| a.starts_with("--tmpfs=/tmp:rw")));
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(container_name(1), container_name(1));
    }

    #[tokio::test]
    async fn test_missing_engine_is_a_launch_error() {
        let runner = DockerRunner::with_binary("/nonexistent/docker");
        let err = runner.run(&spec()).await.unwrap_err();
        assert_eq!(err.class(), "SandboxLaunchError");
    }
}
