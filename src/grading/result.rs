use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GradeError;
use crate::submission::TestDetail;

const MAX_DETAILS: usize = 256;
const MAX_TEXT_CHARS: usize = 2000;

/// The JSON object a grading payload leaves in the results directory.
///
/// `{passed, score, details: [{testName, passed, message, expected?, actual?}]}`,
/// optionally tagged with a `schemaVersion`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawResultFile {
    pub passed: bool,
    pub score: f64,
    pub details: Vec<TestDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

impl RawResultFile {
    /// What a payload writes when it cannot run its checks at all
    pub fn fault(test_name: &str, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            details: vec![TestDetail::new(test_name, false, message)],
            schema_version: None,
        }
    }
}

/// Reads and validates the result file left behind by the sandbox.
///
/// The file is untrusted: its absence is an error in itself, and it is
/// size-capped, shape-checked and sanitized before anything else sees it.
pub fn read_raw_result(
    path: &Path,
    max_bytes: u64,
    expected_schema: Option<u32>,
) -> Result<RawResultFile, GradeError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(GradeError::ResultMissing),
        Err(e) => return Err(GradeError::ResultParse(format!("unable to stat result file: {e}"))),
    };
    if !metadata.is_file() {
        return Err(GradeError::ResultParse("result path is not a regular file".to_string()));
    }
    if metadata.len() > max_bytes {
        return Err(GradeError::ResultParse(format!(
            "result file is {} bytes, the limit is {max_bytes}",
            metadata.len()
        )));
    }

    let content = fs::read(path)
        .map_err(|e| GradeError::ResultParse(format!("unable to read result file: {e}")))?;
    parse_raw_result(&content, expected_schema)
}

pub fn parse_raw_result(
    content: &[u8],
    expected_schema: Option<u32>,
) -> Result<RawResultFile, GradeError> {
    let mut raw: RawResultFile =
        serde_json::from_slice(content).map_err(|e| GradeError::ResultParse(e.to_string()))?;

    if !raw.score.is_finite() {
        return Err(GradeError::ResultParse("score is not a finite number".to_string()));
    }
    if raw.details.len() > MAX_DETAILS {
        return Err(GradeError::ResultParse(format!(
            "{} details reported, the limit is {MAX_DETAILS}",
            raw.details.len()
        )));
    }
    if raw.details.iter().any(|d| d.test_name.trim().is_empty()) {
        return Err(GradeError::ResultParse("a detail has an empty testName".to_string()));
    }
    if let Some(expected) = expected_schema
        && raw.schema_version != Some(expected)
    {
        return Err(GradeError::ResultParse(format!(
            "schema version {:?} does not match the expected {expected}",
            raw.schema_version
        )));
    }

    for detail in &mut raw.details {
        truncate(&mut detail.test_name);
        truncate(&mut detail.message);
        if let Some(expected) = detail.expected.as_mut() {
            truncate(expected);
        }
        if let Some(actual) = detail.actual.as_mut() {
            truncate(actual);
        }
    }

    Ok(raw)
}

fn truncate(text: &mut String) {
    if let Some((idx, _)) = text.char_indices().nth(MAX_TEXT_CHARS) {
        text.truncate(idx);
        text.push('…');
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parses_payload_output() {
        let raw = parse_raw_result(
            r#"{
                "passed": false,
                "score": 75,
                "details": [
                    {"testName": "タスク追加機能", "passed": true, "message": "ok"},
                    {"testName": "タスク削除機能", "passed": false, "message": "delete button not found",
                     "expected": "a delete button", "actual": "none"}
                ]
            }"#
            .as_bytes(),
            None,
        )
        .unwrap();

        assert_eq!(raw.score, 75.0);
        assert_eq!(raw.details.len(), 2);
        assert_eq!(raw.details[1].expected.as_deref(), Some("a delete button"));
        assert_eq!(raw.schema_version, None);
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        for content in [
            "",
            "not json",
            "[]",
            r#"{"passed": "yes", "score": 1, "details": []}"#,
            r#"{"passed": true, "details": []}"#,
            r#"{"passed": true, "score": 1, "details": [{"testName": "", "passed": true, "message": ""}]}"#,
            r#"{"passed": true, "score": 1, "details": [{"passed": true, "message": ""}]}"#,
        ] {
            let err = parse_raw_result(content.as_bytes(), None).unwrap_err();
            assert!(matches!(err, GradeError::ResultParse(_)), "{content:?} should be rejected");
        }
    }

    #[test]
    fn test_schema_version_must_match_when_configured() {
        let content = br#"{"passed": true, "score": 100, "details": [], "schemaVersion": 1}"#;
        assert!(parse_raw_result(content, Some(1)).is_ok());
        assert!(parse_raw_result(content, None).is_ok());
        assert!(parse_raw_result(content, Some(2)).is_err());

        let unversioned = br#"{"passed": true, "score": 100, "details": []}"#;
        assert!(parse_raw_result(unversioned, Some(1)).is_err());
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let long = "x".repeat(5000);
        let content = serde_json::to_vec(&RawResultFile::fault("crash", long)).unwrap();
        let raw = parse_raw_result(&content, None).unwrap();
        assert_eq!(raw.details[0].message.chars().count(), MAX_TEXT_CHARS + 1);
    }

    #[test]
    fn test_missing_file_is_not_an_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_raw_result(&dir.path().join("result.json"), 1024, None).unwrap_err();
        assert!(matches!(err, GradeError::ResultMissing));
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        fs::write(&path, format!(r#"{{"passed":true,"score":1,"details":[],"pad":"{}"}}"#, "x".repeat(100))).unwrap();

        let err = read_raw_result(&path, 64, None).unwrap_err();
        assert!(matches!(err, GradeError::ResultParse(_)));
        assert!(read_raw_result(&path, 1024, None).is_ok());
    }

    #[test]
    fn test_symlinked_result_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("elsewhere.json");
        fs::write(&target, r#"{"passed":true,"score":100,"details":[]}"#).unwrap();
        let path = dir.path().join("result.json");
        std::os::unix::fs::symlink(&target, &path).unwrap();

        let err = read_raw_result(&path, 1024, None).unwrap_err();
        assert!(matches!(err, GradeError::ResultParse(_)));
    }
}
