use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GradeError, ValidationError};

/// Lifecycle of a submission: `pending -> testing -> {completed | failed}`.
///
/// `completed` means "graded", regardless of whether the checks passed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Testing,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` walks forward through the lifecycle.
    /// Terminal states have no successors.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Testing)
                | (Self::Testing, Self::Completed)
                | (Self::Testing, Self::Failed)
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "testing" => Ok(Self::Testing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown submission status `{other}`")),
        }
    }
}

/// Input of `POST /submissions`; `user_id` always comes from the caller.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub user_id: String,
    pub exercise_id: String,
    pub repository_url: String,
}

impl NewSubmission {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.exercise_id.trim().is_empty() {
            return Err(ValidationError::MissingField("exerciseId"));
        }
        if self.repository_url.trim().is_empty() {
            return Err(ValidationError::MissingField("repositoryUrl"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("userId"));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: u32,
    pub exercise_id: String,
    pub user_id: String,
    pub repository_url: String,
    pub status: SubmissionStatus,
    pub submitted_at: String,
    pub updated_at: String,
}

/// One leaf assertion of a grading run.
///
/// This is also the element type of the `details` array in the result file
/// written by grading payloads, so the field names are part of that format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestDetail {
    pub test_name: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl TestDetail {
    pub fn new(test_name: impl Into<String>, passed: bool, message: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            passed,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// `None` until the result has been persisted
    pub id: Option<u32>,
    pub submission_id: u32,
    pub exercise_id: String,
    pub user_id: String,
    pub passed: bool,
    pub score: f64,
    pub max_score: f64,
    pub details: Vec<TestDetail>,
    pub feedback: String,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub status: SubmissionStatus,
}

impl TestResult {
    /// A graded result; `score` is clamped into `[0, max_score]`.
    pub fn graded(
        submission: &Submission,
        passed: bool,
        score: f64,
        max_score: f64,
        details: Vec<TestDetail>,
        feedback: String,
    ) -> Self {
        let now = crate::create_timestamp();
        Self {
            id: None,
            submission_id: submission.id,
            exercise_id: submission.exercise_id.clone(),
            user_id: submission.user_id.clone(),
            passed,
            score: clamp_score(score, max_score),
            max_score,
            details,
            feedback,
            completed_at: Some(now.clone()),
            created_at: now,
            status: SubmissionStatus::Completed,
        }
    }

    /// The terminal result of a run that could not be graded: exactly one
    /// detail naming the failure class.
    pub fn failure(submission: &Submission, error: &GradeError, max_score: f64) -> Self {
        let now = crate::create_timestamp();
        Self {
            id: None,
            submission_id: submission.id,
            exercise_id: submission.exercise_id.clone(),
            user_id: submission.user_id.clone(),
            passed: false,
            score: 0.0,
            max_score,
            details: vec![TestDetail::new(error.class(), false, error.to_string())],
            feedback: format!("Grading failed ({}): {error}", error.class()),
            completed_at: Some(now.clone()),
            created_at: now,
            status: SubmissionStatus::Failed,
        }
    }

    /// What a poller sees before grading has finished.
    pub fn placeholder(submission: &Submission, max_score: f64) -> Self {
        Self {
            id: None,
            submission_id: submission.id,
            exercise_id: submission.exercise_id.clone(),
            user_id: submission.user_id.clone(),
            passed: false,
            score: 0.0,
            max_score,
            details: Vec::new(),
            feedback: String::new(),
            completed_at: None,
            created_at: submission.submitted_at.clone(),
            status: submission.status,
        }
    }
}

pub fn clamp_score(score: f64, max_score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(0.0, max_score.max(0.0))
}
