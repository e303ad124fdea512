//! Error taxonomy and progress reporting shared by every stage of a run.
//!
//! Every failure that crosses the library boundary is a [`RunnerError`]
//! carrying a stable [`ErrorCode`]. Per-case failures (timeouts, analysis
//! errors, malformed output) are normally converted into data on the
//! [`Run`](crate::model::Run) record instead; their codes still exist so the
//! record's cause can be classified and so the CLI can map them to exit codes.

pub mod progress;

pub use progress::{CollectingProgress, NoopProgress, ProgressCallback, ProgressEvent};

use miette::Diagnostic;
use serde_json::Value;
use std::fmt;

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Stable error codes for the run orchestration engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Request shape is invalid (missing fields, empty case list, unsafe ids).
    InvalidRequest,
    /// Analysis binary is missing, not executable, or failed to spawn.
    BinaryUnavailable,
    /// Analysis process exceeded its wall-clock budget.
    Timeout,
    /// Binary exited cleanly but reported an analysis error.
    AnalysisFailed,
    /// Binary exited with a non-zero status.
    ProcessExit,
    /// Binary stdout is not a valid result document.
    MalformedOutput,
    /// Script placeholders could not be resolved.
    Template,
    /// Configuration is invalid or unreadable.
    Config,
    /// Filesystem or other infrastructure I/O failed.
    Io,
    /// Requested run or layer does not exist.
    NotFound,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "E_INVALID_REQUEST",
            Self::BinaryUnavailable => "E_BINARY_UNAVAILABLE",
            Self::Timeout => "E_TIMEOUT",
            Self::AnalysisFailed => "E_ANALYSIS_FAILED",
            Self::ProcessExit => "E_PROCESS_EXIT",
            Self::MalformedOutput => "E_MALFORMED_OUTPUT",
            Self::Template => "E_TEMPLATE",
            Self::Config => "E_CONFIG",
            Self::Io => "E_IO",
            Self::NotFound => "E_NOT_FOUND",
            Self::Internal => "E_INTERNAL",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let parsed = match code {
            "E_INVALID_REQUEST" => Self::InvalidRequest,
            "E_BINARY_UNAVAILABLE" => Self::BinaryUnavailable,
            "E_TIMEOUT" => Self::Timeout,
            "E_ANALYSIS_FAILED" => Self::AnalysisFailed,
            "E_PROCESS_EXIT" => Self::ProcessExit,
            "E_MALFORMED_OUTPUT" => Self::MalformedOutput,
            "E_TEMPLATE" => Self::Template,
            "E_CONFIG" => Self::Config,
            "E_IO" => Self::Io,
            "E_NOT_FOUND" => Self::NotFound,
            "E_INTERNAL" => Self::Internal,
            _ => return None,
        };
        Some(parsed)
    }

    /// Process exit code used by the CLI when a command fails with this code.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::InvalidRequest => 2,
            Self::BinaryUnavailable => 3,
            Self::Timeout => 4,
            Self::AnalysisFailed => 5,
            Self::ProcessExit => 6,
            Self::MalformedOutput => 7,
            Self::Template => 8,
            Self::Config => 9,
            Self::Io => 10,
            Self::NotFound => 11,
            Self::Internal => 12,
        }
    }

    /// Whether the failure is the caller's fault (maps to a 4xx status).
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            Self::InvalidRequest | Self::BinaryUnavailable | Self::Template | Self::NotFound
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error payload for JSON output.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug)]
pub struct RunnerError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl RunnerError {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        context: impl Into<Option<Value>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, None)
    }

    pub fn binary_unavailable(
        message: impl Into<String>,
        context: impl Into<Option<Value>>,
    ) -> Self {
        Self::new(ErrorCode::BinaryUnavailable, message, context)
    }

    pub fn config(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Config, message, context)
    }

    pub fn not_found(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::NotFound, message, context)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            Some(serde_json::json!({ "source": err.to_string() })),
        )
    }

    /// I/O failure on a specific path.
    pub fn io_at(
        message: impl Into<String>,
        path: &std::path::Path,
        err: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            Some(serde_json::json!({
                "path": path.display().to_string(),
                "source": err.to_string(),
            })),
        )
    }

    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RunnerError {}

impl Diagnostic for RunnerError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let hint = match self.code {
            ErrorCode::BinaryUnavailable => {
                "set VOXLOGICA_BINARY_PATH or --binary to an executable VoxLogicA build"
            }
            ErrorCode::InvalidRequest => {
                "a run request needs workspaceId, scriptContent and a non-empty cases array"
            }
            ErrorCode::Config => "check the config file and VOXRUN_* environment variables",
            _ => return None,
        };
        Some(Box::new(hint))
    }
}
