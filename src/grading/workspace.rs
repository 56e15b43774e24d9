use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::anyhow;

const WORKSPACE_DIR_PERMISSIONS: u32 = 0o700;

/// Allocates per-submission scratch directories under a shared root.
///
/// Layout: `<root>/<submission id>/{repo,results}`.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Workspace root under the user cache directory
    pub fn default_root() -> anyhow::Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "grader")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        Ok(proj_dirs.cache_dir().join("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submission_dir(&self, submission_id: u32) -> PathBuf {
        self.root.join(submission_id.to_string())
    }

    /// Creates empty `repo` and `results` directories for a submission.
    ///
    /// Leftovers of an earlier crashed run with the same id are removed first.
    /// The returned guard tears the directories down when dropped.
    pub fn prepare(&self, submission_id: u32) -> std::io::Result<Workspace> {
        fs::create_dir_all(&self.root)?;

        let dir = self.submission_dir(submission_id);
        if dir.exists() {
            log::warn!(
                "Submission {submission_id}: removing stale workspace at {}",
                dir.display()
            );
            fs::remove_dir_all(&dir)?;
        }

        fs::create_dir(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(WORKSPACE_DIR_PERMISSIONS))?;

        let workspace = Workspace {
            submission_id,
            repo_dir: dir.join("repo"),
            result_dir: dir.join("results"),
            dir,
        };
        fs::create_dir(&workspace.repo_dir)?;
        fs::create_dir(&workspace.result_dir)?;

        log::debug!(
            "Submission {submission_id}: workspace prepared at {}",
            workspace.dir.display()
        );
        Ok(workspace)
    }

    /// Removes the workspace of a submission, if any.
    ///
    /// Best effort: a failure is logged and swallowed so that it never masks
    /// the grading outcome.
    pub fn teardown(&self, submission_id: u32) {
        remove_workspace_dir(submission_id, &self.submission_dir(submission_id));
    }
}

/// Scoped handle to one submission's directories.
#[derive(Debug)]
pub struct Workspace {
    submission_id: u32,
    dir: PathBuf,
    repo_dir: PathBuf,
    result_dir: PathBuf,
}

impl Workspace {
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        remove_workspace_dir(self.submission_id, &self.dir);
    }
}

fn remove_workspace_dir(submission_id: u32, dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => log::debug!("Submission {submission_id}: workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(
            "Submission {submission_id}: unable to remove workspace {}: {e}",
            dir.display()
        ),
    }
}
