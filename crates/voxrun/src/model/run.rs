use crate::model::{Case, Layer, PrintOutput, RunId};
use crate::runner::{ErrorCode, RunnerError, RunnerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Persisted outcome of executing a script against one case within one batch.
///
/// Exactly one of two states holds: a successful analysis (`output_error`
/// empty) or a failed one (`output_error` non-empty). Both are persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Batch identity, shared by every run of the same request.
    pub id: RunId,
    pub timestamp: DateTime<Utc>,
    pub case_path: String,
    /// The script as submitted, before placeholder substitution.
    pub script_content: String,
    #[serde(default)]
    pub output_print: Vec<PrintOutput>,
    #[serde(default)]
    pub output_layers: Vec<Layer>,
    #[serde(default)]
    pub output_log: String,
    #[serde(default)]
    pub output_error: String,
}

impl Run {
    pub fn is_failed(&self) -> bool {
        !self.output_error.is_empty()
    }
}

/// Input to the batch orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub workspace_id: String,
    pub script_content: String,
    pub cases: Vec<Case>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRunRequest {
    workspace_id: Option<String>,
    script_content: Option<String>,
    cases: Option<Value>,
}

impl RunRequest {
    /// Parse a request body, reporting shape problems as `E_INVALID_REQUEST`.
    pub fn from_json(body: &[u8]) -> RunnerResult<Self> {
        let raw: RawRunRequest = serde_json::from_slice(body).map_err(|err| {
            RunnerError::new(
                ErrorCode::InvalidRequest,
                "request body is not a valid run request",
                Some(serde_json::json!({ "parse_error": err.to_string() })),
            )
        })?;
        let (Some(workspace_id), Some(script_content)) = (raw.workspace_id, raw.script_content)
        else {
            return Err(RunnerError::invalid_request(
                "missing required fields: workspaceId, scriptContent or cases",
            ));
        };
        let cases = match raw.cases {
            Some(value @ Value::Array(_)) => {
                serde_json::from_value::<Vec<Case>>(value).map_err(|err| {
                    RunnerError::new(
                        ErrorCode::InvalidRequest,
                        "\"cases\" must be an array of {id, path} objects",
                        Some(serde_json::json!({ "parse_error": err.to_string() })),
                    )
                })?
            }
            Some(_) => return Err(RunnerError::invalid_request("\"cases\" must be an array")),
            None => {
                return Err(RunnerError::invalid_request(
                    "missing required fields: workspaceId, scriptContent or cases",
                ))
            }
        };
        Ok(Self {
            workspace_id,
            script_content,
            cases,
        })
    }

    /// Check the request before anything touches the filesystem.
    pub fn validate(&self) -> RunnerResult<()> {
        validate_path_component("workspaceId", &self.workspace_id)?;
        if self.script_content.trim().is_empty() {
            return Err(RunnerError::invalid_request("scriptContent must not be empty"));
        }
        if self.cases.is_empty() {
            return Err(RunnerError::invalid_request("cases must not be empty"));
        }
        let mut seen = HashSet::new();
        for case in &self.cases {
            validate_path_component("case id", &case.id)?;
            if !seen.insert(case.id.as_str()) {
                return Err(RunnerError::new(
                    ErrorCode::InvalidRequest,
                    "duplicate case in request",
                    Some(serde_json::json!({ "case_id": case.id })),
                ));
            }
        }
        Ok(())
    }
}

/// Reject identifiers that cannot be used as a single directory name.
pub fn validate_path_component(kind: &str, value: &str) -> RunnerResult<()> {
    let bad = value.trim().is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(RunnerError::new(
            ErrorCode::InvalidRequest,
            format!("{kind} is not a valid identifier"),
            Some(serde_json::json!({ "value": value })),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn request(cases: Vec<Case>) -> RunRequest {
        RunRequest {
            workspace_id: "ws1".to_string(),
            script_content: "print \"x\" 1".to_string(),
            cases,
        }
    }

    #[test]
    fn from_json_accepts_well_formed_body() {
        let body = br#"{
            "workspaceId": "ws1",
            "scriptContent": "load x = \"a\"",
            "cases": [{"id": "c1", "path": "/datasets/d/cases/c1"}]
        }"#;
        let req = RunRequest::from_json(body).unwrap();
        assert_eq!(req.workspace_id, "ws1");
        assert_eq!(req.cases.len(), 1);
    }

    #[test]
    fn from_json_rejects_missing_fields_and_non_array_cases() {
        let err = RunRequest::from_json(br#"{"scriptContent": "x", "cases": []}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let body = br#"{"workspaceId": "w", "scriptContent": "x", "cases": {}}"#;
        let err = RunRequest::from_json(body).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert!(err.message.contains("array"));

        let err = RunRequest::from_json(b"nonsense").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn validate_rejects_empty_cases_and_script() {
        assert_eq!(request(vec![]).validate().unwrap_err().code, ErrorCode::InvalidRequest);

        let mut req = request(vec![Case::in_dataset("d", "c1")]);
        req.script_content = "   ".to_string();
        assert_eq!(req.validate().unwrap_err().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn validate_rejects_traversal_and_duplicates() {
        let req = request(vec![Case::new("../etc", "/datasets/d/cases/x")]);
        assert!(req.validate().is_err());

        let req = request(vec![Case::in_dataset("d", "c1"), Case::in_dataset("d", "c1")]);
        assert!(req.validate().is_err());

        let mut req = request(vec![Case::in_dataset("d", "c1")]);
        req.workspace_id = "a/b".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn run_serializes_with_camel_case_keys() {
        let run = Run {
            id: RunId::new(),
            timestamp: Utc::now(),
            case_path: "/datasets/d/cases/c1".to_string(),
            script_content: "s".to_string(),
            output_print: Vec::new(),
            output_layers: Vec::new(),
            output_log: String::new(),
            output_error: "boom".to_string(),
        };
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["casePath"], "/datasets/d/cases/c1");
        assert_eq!(value["outputError"], "boom");
        assert!(run.is_failed());
    }

    #[test]
    fn run_without_optional_outputs_reads_as_success() {
        let value = serde_json::json!({
            "id": RunId::new(),
            "timestamp": "2024-05-01T10:00:00Z",
            "casePath": "/datasets/d/cases/c1",
            "scriptContent": "s",
        });
        let run: Run = serde_json::from_value(value).unwrap();
        assert!(!run.is_failed());
        assert!(run.output_layers.is_empty());
    }
}
