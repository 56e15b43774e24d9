use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use parking_lot::RwLock;

use crate::config::{ExerciseConfig, RunnerConfig};
use crate::error::GradeError;
use crate::submission::{Submission, TestResult};

use super::result::RawResultFile;

/// Exercise-type specific mapping from a validated result file to a `TestResult`.
pub trait ResultParser: Send + Sync {
    fn parse_result(
        &self,
        raw: RawResultFile,
        submission: &Submission,
        exercise: &ExerciseConfig,
    ) -> Result<TestResult, GradeError>;
}

/// Passes a submission only when every required check was reported and passed.
///
/// With no required checks configured, every reported check is required and
/// at least one must be reported. The payload score is on a 0-100 scale and is
/// rescaled to the exercise's `max_score`.
pub struct RequiredChecksParser {
    required: Vec<String>,
}

impl RequiredChecksParser {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

impl ResultParser for RequiredChecksParser {
    fn parse_result(
        &self,
        raw: RawResultFile,
        submission: &Submission,
        exercise: &ExerciseConfig,
    ) -> Result<TestResult, GradeError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| !raw.details.iter().any(|d| &d.test_name == *name))
            .map(String::as_str)
            .collect();
        let failing: Vec<&str> = raw
            .details
            .iter()
            .filter(|d| !d.passed)
            .filter(|d| self.required.is_empty() || self.required.contains(&d.test_name))
            .map(|d| d.test_name.as_str())
            .collect();

        let passed = if self.required.is_empty() {
            !raw.details.is_empty() && failing.is_empty()
        } else {
            missing.is_empty() && failing.is_empty()
        };

        let max_score = exercise.max_score;
        let score = (raw.score.clamp(0.0, 100.0) * max_score / 100.0).round();
        let passed_count = raw.details.iter().filter(|d| d.passed).count();

        let mut feedback = format!("{passed_count}/{} checks passed", raw.details.len());
        if !failing.is_empty() {
            feedback.push_str(&format!("; failing: {}", failing.join(", ")));
        }
        if !missing.is_empty() {
            feedback.push_str(&format!("; not reported: {}", missing.join(", ")));
        }

        Ok(TestResult::graded(
            submission,
            passed,
            score,
            max_score,
            raw.details,
            feedback,
        ))
    }
}

/// How submissions of one exercise type are graded.
#[derive(Clone)]
pub struct ExerciseKind {
    pub image: String,
    pub command: Vec<String>,
    pub parser: Arc<dyn ResultParser>,
}

/// A resolved grading strategy for one submission.
#[derive(Clone)]
pub struct ExerciseRunner {
    pub exercise: ExerciseConfig,
    pub image: String,
    pub command: Vec<String>,
    parser: Arc<dyn ResultParser>,
}

impl ExerciseRunner {
    pub fn parse_result(
        &self,
        raw: RawResultFile,
        submission: &Submission,
    ) -> Result<TestResult, GradeError> {
        self.parser.parse_result(raw, submission, &self.exercise)
    }
}

/// Exercise configs by id, and grading strategies by exercise type.
///
/// New exercise types are added with [`RunnerRegistry::register`]; nothing
/// switches over the type name.
pub struct RunnerRegistry {
    exercises: HashMap<String, ExerciseConfig>,
    kinds: RwLock<HashMap<String, ExerciseKind>>,
}

impl RunnerRegistry {
    pub fn new(exercises: Vec<ExerciseConfig>) -> Self {
        Self {
            exercises: exercises.into_iter().map(|e| (e.id.clone(), e)).collect(),
            kinds: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the registry from config, registering one kind per runner entry
    pub fn from_config(
        exercises: Vec<ExerciseConfig>,
        runners: Vec<RunnerConfig>,
    ) -> anyhow::Result<Self> {
        for exercise in &exercises {
            if !exercise.max_score.is_finite() || exercise.max_score <= 0.0 {
                bail!(
                    "Exercise `{}` has max_score {}, it must be a positive number",
                    exercise.id,
                    exercise.max_score
                );
            }
        }
        let registry = Self::new(exercises);

        for runner in runners {
            if runner.image.trim().is_empty() {
                bail!("Runner for type `{}` has an empty image", runner.exercise_type);
            }
            if registry.kinds.read().contains_key(&runner.exercise_type) {
                bail!("Duplicate runner for type `{}`", runner.exercise_type);
            }
            registry.register(
                &runner.exercise_type,
                ExerciseKind {
                    image: runner.image,
                    command: runner.command,
                    parser: Arc::new(RequiredChecksParser::new(runner.required_checks)),
                },
            );
        }

        for exercise in registry.exercises.values() {
            if !registry.kinds.read().contains_key(&exercise.exercise_type) {
                log::warn!(
                    "Exercise {} has type `{}` with no registered runner",
                    exercise.id,
                    exercise.exercise_type
                );
            }
        }

        Ok(registry)
    }

    pub fn register(&self, exercise_type: &str, kind: ExerciseKind) {
        log::info!("Registered runner `{}` for type `{exercise_type}`", kind.image);
        self.kinds.write().insert(exercise_type.to_string(), kind);
    }

    pub fn exercise(&self, exercise_id: &str) -> Option<&ExerciseConfig> {
        self.exercises.get(exercise_id)
    }

    /// Resolves the config and grading strategy for a submission
    pub fn create_runner(&self, submission: &Submission) -> Result<ExerciseRunner, GradeError> {
        let exercise = self
            .exercises
            .get(&submission.exercise_id)
            .ok_or_else(|| GradeError::UnknownExercise(submission.exercise_id.clone()))?;

        let kinds = self.kinds.read();
        let kind = kinds
            .get(&exercise.exercise_type)
            .ok_or_else(|| GradeError::UnsupportedType(exercise.exercise_type.clone()))?;

        Ok(ExerciseRunner {
            exercise: exercise.clone(),
            image: kind.image.clone(),
            command: kind.command.clone(),
            parser: Arc::clone(&kind.parser),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::submission::{SubmissionStatus, TestDetail};

    const TODO_CHECKS: [&str; 4] = [
        "初期表示",
        "タスク追加機能",
        "タスク完了切り替え機能",
        "タスク削除機能",
    ];

    fn submission(exercise_id: &str) -> Submission {
        Submission {
            id: 1,
            exercise_id: exercise_id.to_string(),
            user_id: "alice".to_string(),
            repository_url: "https://github.com/valid/todo-app".to_string(),
            status: SubmissionStatus::Testing,
            submitted_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn exercise(id: &str, exercise_type: &str) -> ExerciseConfig {
        ExerciseConfig {
            id: id.to_string(),
            exercise_type: exercise_type.to_string(),
            result_schema_version: None,
            max_score: 100.0,
        }
    }

    fn registry() -> RunnerRegistry {
        RunnerRegistry::from_config(
            vec![exercise("ex-001", "todo-app"), exercise("ex-002", "quiz-app")],
            vec![RunnerConfig {
                exercise_type: "todo-app".to_string(),
                image: "grader/todo-app".to_string(),
                command: vec![],
                required_checks: TODO_CHECKS.iter().map(|s| s.to_string()).collect(),
            }],
        )
        .unwrap()
    }

    fn raw(results: &[(&str, bool)], score: f64) -> RawResultFile {
        RawResultFile {
            passed: results.iter().all(|(_, p)| *p),
            score,
            details: results
                .iter()
                .map(|(name, passed)| TestDetail::new(*name, *passed, ""))
                .collect(),
            schema_version: None,
        }
    }

    #[test]
    fn test_resolves_image_by_exercise_type() {
        let runner = registry().create_runner(&submission("ex-001")).unwrap();
        assert_eq!(runner.image, "grader/todo-app");
        assert_eq!(runner.exercise.exercise_type, "todo-app");
    }

    #[test]
    fn test_unknown_exercise_and_type() {
        let registry = registry();

        let err = registry.create_runner(&submission("ex-404")).err().unwrap();
        assert!(matches!(err, GradeError::UnknownExercise(id) if id == "ex-404"));

        let err = registry.create_runner(&submission("ex-002")).err().unwrap();
        assert!(matches!(err, GradeError::UnsupportedType(t) if t == "quiz-app"));
    }

    #[test]
    fn test_new_types_are_registered_not_switched() {
        let registry = registry();
        registry.register(
            "quiz-app",
            ExerciseKind {
                image: "grader/quiz-app".to_string(),
                command: vec![],
                parser: Arc::new(RequiredChecksParser::new(vec![])),
            },
        );

        let runner = registry.create_runner(&submission("ex-002")).unwrap();
        assert_eq!(runner.image, "grader/quiz-app");
    }

    #[test]
    fn test_rejects_bad_runner_config() {
        let runner = RunnerConfig {
            exercise_type: "todo-app".to_string(),
            image: "grader/todo-app".to_string(),
            command: vec![],
            required_checks: vec![],
        };

        let duplicate = RunnerRegistry::from_config(vec![], vec![runner.clone(), runner.clone()]);
        assert!(duplicate.is_err());

        let empty_image = RunnerRegistry::from_config(
            vec![],
            vec![RunnerConfig {
                image: " ".to_string(),
                ..runner
            }],
        );
        assert!(empty_image.is_err());
    }

    #[test]
    fn test_rejects_non_positive_max_score() {
        for max_score in [0.0, -10.0, f64::NAN] {
            let bad = ExerciseConfig {
                max_score,
                ..exercise("ex-001", "todo-app")
            };
            let result = RunnerRegistry::from_config(vec![bad], vec![]);
            assert!(result.is_err(), "max_score {max_score} should be rejected");
        }
    }

    #[test]
    fn test_all_checks_passing() {
        let runner = registry().create_runner(&submission("ex-001")).unwrap();
        let all: Vec<(&str, bool)> = TODO_CHECKS.iter().map(|n| (*n, true)).collect();

        let result = runner.parse_result(raw(&all, 100.0), &submission("ex-001")).unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 100.0);
        assert_eq!(result.feedback, "4/4 checks passed");
    }

    #[test]
    fn test_failing_required_check() {
        let runner = registry().create_runner(&submission("ex-001")).unwrap();
        let results = [
            (TODO_CHECKS[0], true),
            (TODO_CHECKS[1], true),
            (TODO_CHECKS[2], true),
            (TODO_CHECKS[3], false),
        ];

        let result = runner.parse_result(raw(&results, 75.0), &submission("ex-001")).unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 75.0);
        assert_eq!(result.feedback, "3/4 checks passed; failing: タスク削除機能");
    }

    #[test]
    fn test_payload_cannot_claim_a_pass() {
        let runner = registry().create_runner(&submission("ex-001")).unwrap();
        let mut only_one = raw(&[(TODO_CHECKS[0], true)], 100.0);
        only_one.passed = true;

        let result = runner.parse_result(only_one, &submission("ex-001")).unwrap();
        assert!(!result.passed);
        assert!(result.feedback.contains("not reported"));
    }

    #[test]
    fn test_score_is_bounded_and_rescaled() {
        let mut exercise = exercise("ex-001", "todo-app");
        exercise.max_score = 10.0;
        let parser = RequiredChecksParser::new(vec![]);

        let result = parser
            .parse_result(raw(&[("a", true)], 250.0), &submission("ex-001"), &exercise)
            .unwrap();
        assert_eq!(result.score, 10.0);
        assert_eq!(result.max_score, 10.0);

        let result = parser
            .parse_result(raw(&[("a", false)], -5.0), &submission("ex-001"), &exercise)
            .unwrap();
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
    }

    #[test]
    fn test_empty_details_never_pass_without_required_checks() {
        let parser = RequiredChecksParser::new(vec![]);
        let result = parser
            .parse_result(raw(&[], 100.0), &submission("ex-001"), &exercise("ex-001", "x"))
            .unwrap();
        assert!(!result.passed);
    }
}
