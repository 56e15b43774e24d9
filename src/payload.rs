//! Support code for grading payloads, the programs that run inside the
//! sandbox and leave a result file behind.

pub mod browser;
pub mod static_server;
pub mod todo_app;

use std::fs;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crate::grading::result::RawResultFile;
use crate::grading::{
    CONTAINER_REPO_DIR, CONTAINER_RESULT_DIR, ENV_REPO_DIR, ENV_RESULT_DIR, ENV_RESULT_FILE,
};
use crate::submission::TestDetail;

use self::browser::PageUnresponsive;

/// Name of the single detail reported when the checks could not run
pub const FAULT_TEST_NAME: &str = "ページ読み込み";

/// Paths a payload works with, taken from the sandbox environment.
#[derive(Debug, Clone)]
pub struct PayloadEnv {
    pub repo_dir: PathBuf,
    pub result_path: PathBuf,
}

impl PayloadEnv {
    pub fn from_env() -> Self {
        let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());

        let repo_dir = PathBuf::from(var(ENV_REPO_DIR, CONTAINER_REPO_DIR));
        let result_dir = PathBuf::from(var(ENV_RESULT_DIR, CONTAINER_RESULT_DIR));
        let result_file = var(ENV_RESULT_FILE, "result.json");

        Self {
            repo_dir,
            result_path: result_dir.join(result_file),
        }
    }
}

/// Equal share per check on a 0-100 scale, rounded.
pub fn equal_share_score(details: &[TestDetail]) -> f64 {
    if details.is_empty() {
        return 0.0;
    }
    let passed = details.iter().filter(|d| d.passed).count();
    (passed as f64 * 100.0 / details.len() as f64).round()
}

/// Writes the result file through a temporary file and a rename, so the
/// grader never reads a half-written result.
pub fn write_result(path: &Path, result: &RawResultFile) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        serde_json::to_writer(&mut file, result)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

/// Why a payload ended without a result file.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error(transparent)]
    Unresponsive(#[from] PageUnresponsive),
    #[error("unable to write the result file: {0}")]
    Write(#[from] std::io::Error),
}

/// Runs a check suite and leaves exactly one result file for a page that
/// could be graded.
///
/// Errors and panics in the suite become a failing single-detail result. A
/// page that never finishes loading leaves no result at all, so the process
/// exits non-zero and the grader fails the submission as a runtime error.
pub fn run_payload<F>(env: &PayloadEnv, suite: F) -> Result<(), PayloadError>
where
    F: FnOnce(&Path) -> anyhow::Result<RawResultFile>,
{
    let result = match panic::catch_unwind(AssertUnwindSafe(|| suite(&env.repo_dir))) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => match e.downcast::<PageUnresponsive>() {
            Ok(hung) => return Err(hung.into()),
            Err(e) => RawResultFile::fault(FAULT_TEST_NAME, format!("{e:#}")),
        },
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "the grading payload panicked".to_string());
            RawResultFile::fault(FAULT_TEST_NAME, message)
        }
    };

    write_result(&env.result_path, &result)?;
    Ok(())
}
