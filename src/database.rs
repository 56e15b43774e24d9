use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::error::ValidationError;
use crate::submission::{NewSubmission, Submission, SubmissionStatus, TestDetail, TestResult};

const DATABASE_NAME: &str = "grader.sqlite3";

#[derive(Error, Debug)]
pub enum CreateSubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Outcome of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The submission already had the requested status
    Unchanged,
    /// The transition would move the lifecycle backwards or out of a terminal state
    Rejected { current: SubmissionStatus },
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    exercise_id: String,
    user_id: String,
    repository_url: String,
    status: String,
    submitted_at: String,
    updated_at: String,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = sqlx::Error;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        Ok(Submission {
            id: to_id(row.id)?,
            exercise_id: row.exercise_id,
            user_id: row.user_id,
            repository_url: row.repository_url,
            status: parse_status(&row.status)?,
            submitted_at: row.submitted_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TestResultRow {
    id: i64,
    submission_id: i64,
    exercise_id: String,
    user_id: String,
    passed: bool,
    score: f64,
    max_score: f64,
    details: String,
    feedback: String,
    completed_at: Option<String>,
    created_at: String,
    status: String,
}

impl TryFrom<TestResultRow> for TestResult {
    type Error = sqlx::Error;

    fn try_from(row: TestResultRow) -> Result<Self, Self::Error> {
        let details: Vec<TestDetail> =
            serde_json::from_str(&row.details).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(TestResult {
            id: Some(to_id(row.id)?),
            submission_id: to_id(row.submission_id)?,
            exercise_id: row.exercise_id,
            user_id: row.user_id,
            passed: row.passed,
            score: row.score,
            max_score: row.max_score,
            details,
            feedback: row.feedback,
            completed_at: row.completed_at,
            created_at: row.created_at,
            status: parse_status(&row.status)?,
        })
    }
}

/// SQLite rowids are i64; ids outside the u32 range are a decoding error.
fn to_id(value: i64) -> sqlx::Result<u32> {
    u32::try_from(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_status(text: &str) -> sqlx::Result<SubmissionStatus> {
    text.parse::<SubmissionStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "grader").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot be run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id              INTEGER  PRIMARY KEY AUTOINCREMENT,
            exercise_id     TEXT     NOT NULL,
            user_id         TEXT     NOT NULL,
            repository_url  TEXT     NOT NULL,
            status          TEXT     NOT NULL,
            submitted_at    TEXT     NOT NULL,
            updated_at      TEXT     NOT NULL
        );",
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);",
        r"
        CREATE TABLE IF NOT EXISTS test_results (
            id              INTEGER  PRIMARY KEY AUTOINCREMENT,
            submission_id   INTEGER  NOT NULL UNIQUE,
            exercise_id     TEXT     NOT NULL,
            user_id         TEXT     NOT NULL,
            passed          INTEGER  NOT NULL,
            score           REAL     NOT NULL,
            max_score       REAL     NOT NULL,
            details         TEXT     NOT NULL,
            feedback        TEXT     NOT NULL,
            completed_at    TEXT,
            created_at      TEXT     NOT NULL,
            status          TEXT     NOT NULL,
            FOREIGN KEY (submission_id)  REFERENCES submissions (id)
        );",
    ] {
        sqlx::query(sql).execute(&mut *tx).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Validates and stores a new submission in the `pending` state.
///
/// # Errors
///
/// - `Validation` if `exerciseId`, `repositoryUrl` or `userId` is empty; nothing is stored.
/// - `Database` if the insert fails.
pub async fn create_submission(
    input: &NewSubmission,
    pool: Arc<SqlitePool>,
) -> Result<Submission, CreateSubmissionError> {
    input.validate()?;
    let now = crate::create_timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO submissions (exercise_id, user_id, repository_url, status, submitted_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(input.exercise_id.trim())
    .bind(input.user_id.trim())
    .bind(input.repository_url.trim())
    .bind(SubmissionStatus::Pending.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool.as_ref())
    .await?;

    Ok(Submission {
        id: to_id(result.last_insert_rowid())?,
        exercise_id: input.exercise_id.trim().to_string(),
        user_id: input.user_id.trim().to_string(),
        repository_url: input.repository_url.trim().to_string(),
        status: SubmissionStatus::Pending,
        submitted_at: now.clone(),
        updated_at: now,
    })
}

pub async fn fetch_submission(id: u32, pool: Arc<SqlitePool>) -> sqlx::Result<Submission> {
    log::debug!("Trying to fetch submission {id} from database");

    let row = sqlx::query_as::<_, SubmissionRow>(
        r#"
        SELECT id, exercise_id, user_id, repository_url, status, submitted_at, updated_at
        FROM submissions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_one(pool.as_ref())
    .await?;

    row.try_into()
}

/// Moves a submission to `status` if the lifecycle allows it.
///
/// Idempotent: writing the current status again is a no-op. A backwards or
/// post-terminal transition is reported as `Rejected` and not applied.
pub async fn update_submission_status(
    id: u32,
    status: SubmissionStatus,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<StatusUpdate> {
    let mut tx = pool.begin().await?;
    let update = apply_status(id, status, &mut tx).await?;
    tx.commit().await?;

    if update == StatusUpdate::Applied {
        log::debug!("Submission {id}: status is now {status}");
    }
    Ok(update)
}

/// Stores the terminal result and moves the submission to the result's
/// status in one transaction, so a reader never sees one without the other.
pub async fn finish_submission(
    result: &TestResult,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<StatusUpdate> {
    let id = result.submission_id;
    let details =
        serde_json::to_string(&result.details).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let mut tx = pool.begin().await?;

    let update = apply_status(id, result.status, &mut tx).await?;
    if update != StatusUpdate::Applied {
        tx.rollback().await?;
        return Ok(update);
    }

    sqlx::query(
        r#"
        INSERT INTO test_results (submission_id, exercise_id, user_id, passed, score, max_score,
                                  details, feedback, completed_at, created_at, status)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&result.exercise_id)
    .bind(&result.user_id)
    .bind(result.passed)
    .bind(result.score)
    .bind(result.max_score)
    .bind(details)
    .bind(&result.feedback)
    .bind(&result.completed_at)
    .bind(&result.created_at)
    .bind(result.status.as_str())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    log::debug!("Submission {id}: result stored, status is now {}", result.status);
    Ok(update)
}

async fn apply_status(
    id: u32,
    status: SubmissionStatus,
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> sqlx::Result<StatusUpdate> {
    let current: String = sqlx::query_scalar("SELECT status FROM submissions WHERE id = ?")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    let current = parse_status(&current)?;

    if current == status {
        return Ok(StatusUpdate::Unchanged);
    }
    if !current.can_transition_to(status) {
        log::warn!("Submission {id}: refusing to move from {current} to {status}");
        return Ok(StatusUpdate::Rejected { current });
    }

    sqlx::query("UPDATE submissions SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(crate::create_timestamp())
        .bind(id)
        .execute(&mut **tx)
        .await?;

    Ok(StatusUpdate::Applied)
}

/// The stored result of a submission, or a placeholder while it is still
/// `pending` or `testing`.
///
/// Returns `RowNotFound` only when the submission itself does not exist.
pub async fn fetch_test_result(
    submission_id: u32,
    max_score: f64,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<TestResult> {
    let row = sqlx::query_as::<_, TestResultRow>(
        r#"
        SELECT id, submission_id, exercise_id, user_id, passed, score, max_score,
               details, feedback, completed_at, created_at, status
        FROM test_results
        WHERE submission_id = ?
        "#,
    )
    .bind(submission_id)
    .fetch_optional(pool.as_ref())
    .await?;

    match row {
        Some(row) => row.try_into(),
        None => {
            let submission = fetch_submission(submission_id, pool).await?;
            Ok(TestResult::placeholder(&submission, max_score))
        }
    }
}

pub async fn submission_ids_with_status(
    status: SubmissionStatus,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Vec<u32>> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM submissions WHERE status = ? ORDER BY id")
        .bind(status.as_str())
        .fetch_all(pool.as_ref())
        .await?;

    ids.into_iter().map(to_id).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn test_pool() -> (Arc<SqlitePool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("test.sqlite3")).await.unwrap();
        (Arc::new(pool), dir)
    }

    fn new_submission(user_id: &str) -> NewSubmission {
        NewSubmission {
            user_id: user_id.to_string(),
            exercise_id: "ex-001".to_string(),
            repository_url: "https://github.com/valid/todo-app".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_submission() {
        let (pool, _dir) = test_pool().await;

        let created = create_submission(&new_submission("alice"), pool.clone())
            .await
            .unwrap();
        assert_eq!(created.status, SubmissionStatus::Pending);

        let fetched = fetch_submission(created.id, pool.clone()).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_ids_outside_u32_are_rejected() {
        assert_eq!(to_id(7).unwrap(), 7);
        assert_eq!(to_id(i64::from(u32::MAX)).unwrap(), u32::MAX);
        assert!(matches!(to_id(-1), Err(sqlx::Error::Decode(_))));
        assert!(matches!(to_id(i64::from(u32::MAX) + 1), Err(sqlx::Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_oversized_rowid_is_a_decode_error() {
        let (pool, _dir) = test_pool().await;
        sqlx::query(
            "INSERT INTO submissions (id, exercise_id, user_id, repository_url, status, submitted_at, updated_at)
             VALUES (5000000000, 'ex-001', 'alice', 'https://github.com/a/b', 'pending', '', '')",
        )
        .execute(pool.as_ref())
        .await
        .unwrap();

        let err = submission_ids_with_status(SubmissionStatus::Pending, pool)
            .await
            .unwrap_err();
        assert!(matches!(err, sqlx::Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_invalid_submission_is_not_stored() {
        let (pool, _dir) = test_pool().await;

        let mut input = new_submission("alice");
        input.repository_url = "  ".to_string();
        let err = create_submission(&input, pool.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            CreateSubmissionError::Validation(ValidationError::MissingField("repositoryUrl"))
        ));

        let pending = submission_ids_with_status(SubmissionStatus::Pending, pool)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_status_updates_are_monotonic_and_idempotent() {
        let (pool, _dir) = test_pool().await;
        let id = create_submission(&new_submission("alice"), pool.clone())
            .await
            .unwrap()
            .id;

        let update = update_submission_status(id, SubmissionStatus::Testing, pool.clone())
            .await
            .unwrap();
        assert_eq!(update, StatusUpdate::Applied);

        let update = update_submission_status(id, SubmissionStatus::Testing, pool.clone())
            .await
            .unwrap();
        assert_eq!(update, StatusUpdate::Unchanged);

        let update = update_submission_status(id, SubmissionStatus::Pending, pool.clone())
            .await
            .unwrap();
        assert_eq!(
            update,
            StatusUpdate::Rejected {
                current: SubmissionStatus::Testing
            }
        );

        let submission = fetch_submission(id, pool).await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Testing);
    }

    #[tokio::test]
    async fn test_placeholder_until_finished() {
        let (pool, _dir) = test_pool().await;
        let submission = create_submission(&new_submission("alice"), pool.clone())
            .await
            .unwrap();

        let placeholder = fetch_test_result(submission.id, 100.0, pool.clone())
            .await
            .unwrap();
        assert_eq!(placeholder.status, SubmissionStatus::Pending);
        assert!(!placeholder.passed);
        assert_eq!(placeholder.score, 0.0);
        assert_eq!(placeholder.id, None);

        update_submission_status(submission.id, SubmissionStatus::Testing, pool.clone())
            .await
            .unwrap();
        let result = TestResult::graded(
            &submission,
            true,
            100.0,
            100.0,
            vec![TestDetail::new("初期表示", true, "ok")],
            "1/1 checks passed".to_string(),
        );
        let update = finish_submission(&result, pool.clone()).await.unwrap();
        assert_eq!(update, StatusUpdate::Applied);

        let stored = fetch_test_result(submission.id, 100.0, pool.clone())
            .await
            .unwrap();
        assert!(stored.id.is_some());
        assert_eq!(stored.status, SubmissionStatus::Completed);
        assert_eq!(stored.details, result.details);
        assert_eq!(
            fetch_submission(submission.id, pool).await.unwrap().status,
            SubmissionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_finished_submission_cannot_be_finished_again() {
        let (pool, _dir) = test_pool().await;
        let submission = create_submission(&new_submission("alice"), pool.clone())
            .await
            .unwrap();
        update_submission_status(submission.id, SubmissionStatus::Testing, pool.clone())
            .await
            .unwrap();

        let failure = TestResult::failure(
            &submission,
            &crate::error::GradeError::ResultMissing,
            100.0,
        );
        finish_submission(&failure, pool.clone()).await.unwrap();

        let graded = TestResult::graded(&submission, true, 100.0, 100.0, vec![], String::new());
        let update = finish_submission(&graded, pool.clone()).await.unwrap();
        assert_eq!(
            update,
            StatusUpdate::Rejected {
                current: SubmissionStatus::Failed
            }
        );

        let stored = fetch_test_result(submission.id, 100.0, pool).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Failed);
        assert_eq!(stored.details[0].test_name, "ResultMissingError");
    }

    #[tokio::test]
    async fn test_missing_submission_is_not_found() {
        let (pool, _dir) = test_pool().await;
        let err = fetch_test_result(99, 100.0, pool).await.unwrap_err();
        assert!(matches!(err, sqlx::Error::RowNotFound));
    }
}
