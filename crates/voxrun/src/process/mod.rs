//! Process runner for the external analysis binary.
//!
//! The binary is invoked as `<binary> <script> --json` in its own process
//! group. Stdout and stderr are drained concurrently while the process runs.
//! A wall-clock timeout starts at spawn; on expiry the whole group receives
//! SIGKILL and the child is reaped before returning.

use crate::model::AnalysisOutput;
use crate::runner::{ErrorCode, RunnerError, RunnerResult};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cap on bytes retained per stream; anything beyond is read and dropped.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

/// How long stream readers may run on after the child has exited or been
/// killed. Grandchildren that inherited the pipes can keep them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start analysis binary {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("analysis exceeded the {timeout_ms}ms timeout")]
    Timeout { timeout_ms: u64 },
    #[error("analysis reported an error: {}", .output.error)]
    AnalysisError { output: AnalysisOutput },
    #[error("analysis binary exited with {}", describe_exit(.exit_code.as_ref().copied()))]
    ExecutionFailed {
        exit_code: Option<i32>,
        output: AnalysisOutput,
        stderr: String,
    },
    #[error(
        "analysis binary produced malformed output ({}): {reason}",
        describe_exit(.exit_code.as_ref().copied())
    )]
    MalformedOutput {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        reason: String,
    },
    #[error("failed to wait for analysis binary: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SpawnFailed { .. } => ErrorCode::BinaryUnavailable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::AnalysisError { .. } => ErrorCode::AnalysisFailed,
            Self::ExecutionFailed { .. } => ErrorCode::ProcessExit,
            Self::MalformedOutput { .. } => ErrorCode::MalformedOutput,
            Self::Wait { .. } => ErrorCode::Io,
        }
    }

    /// Output the binary managed to report before failing, if any.
    pub fn partial_output(&self) -> Option<&AnalysisOutput> {
        match self {
            Self::AnalysisError { output } | Self::ExecutionFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Captured stderr, when the failure kind keeps it.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ExecutionFailed { stderr, .. } | Self::MalformedOutput { stderr, .. } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(
        || "termination by signal".to_string(),
        |code| format!("exit code {code}"),
    )
}

/// Run `binary` on `script_path` and parse its JSON result document.
pub async fn run_analysis(
    binary: &Path,
    script_path: &Path,
    timeout: Duration,
) -> Result<AnalysisOutput, ProcessError> {
    let mut child = Command::new(binary)
        .arg(script_path)
        .arg("--json")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::SpawnFailed {
            binary: binary.display().to_string(),
            source,
        })?;
    debug!(pid = ?child.id(), script = %script_path.display(), "analysis started");

    let stdout_reader = tokio::spawn(capture(child.stdout.take()));
    let stderr_reader = tokio::spawn(capture(child.stderr.take()));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            kill_group(&mut child).await;
            return Err(ProcessError::Wait { source });
        }
        Err(_) => {
            warn!(pid = ?child.id(), timeout_ms = timeout.as_millis(), "analysis timed out");
            kill_group(&mut child).await;
            drain(stdout_reader).await;
            drain(stderr_reader).await;
            return Err(ProcessError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
    };

    let stdout = drain(stdout_reader).await;
    let stderr = drain(stderr_reader).await;
    debug!(exit_code = ?status.code(), stdout_bytes = stdout.bytes.len(), "analysis exited");
    if stderr.truncated {
        debug!(limit = MAX_CAPTURE_BYTES, "stderr truncated");
    }
    let result = classify(status, stdout.text(), stderr.text());
    if stdout.truncated {
        warn!(limit = MAX_CAPTURE_BYTES, "stdout truncated");
        return result.map_err(mark_stdout_truncated);
    }
    result
}

/// Bytes kept from one output stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    /// Set when the stream went past [`MAX_CAPTURE_BYTES`].
    truncated: bool,
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// A cut-off document cannot parse; say so in the failure reason.
fn mark_stdout_truncated(err: ProcessError) -> ProcessError {
    match err {
        ProcessError::MalformedOutput {
            exit_code,
            stdout,
            stderr,
            reason,
        } => ProcessError::MalformedOutput {
            exit_code,
            stdout,
            stderr,
            reason: format!("stdout truncated at {MAX_CAPTURE_BYTES} bytes; {reason}"),
        },
        other => other,
    }
}

fn classify(
    status: ExitStatus,
    stdout: String,
    stderr: String,
) -> Result<AnalysisOutput, ProcessError> {
    let exit_code = status.code();
    match AnalysisOutput::parse(&stdout) {
        Ok(output) if !status.success() => Err(ProcessError::ExecutionFailed {
            exit_code,
            output,
            stderr,
        }),
        Ok(output) if output.has_error() => Err(ProcessError::AnalysisError { output }),
        Ok(output) => Ok(output),
        Err(err) => Err(ProcessError::MalformedOutput {
            exit_code,
            stdout,
            stderr,
            reason: err.to_string(),
        }),
    }
}

async fn capture<R>(stream: Option<R>) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut stream) = stream else {
        return captured;
    };
    let mut chunk = [0_u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(captured.bytes.len());
                captured.truncated |= n > room;
                captured.bytes.extend(chunk.iter().take(n.min(room)));
            }
            Err(err) => {
                debug!(error = %err, "stream read failed");
                break;
            }
        }
    }
    captured
}

async fn drain(reader: JoinHandle<Captured>) -> Captured {
    let abort = reader.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, reader).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(err)) => {
            debug!(error = %err, "stream reader failed");
            Captured::default()
        }
        Err(_) => {
            abort.abort();
            debug!("stream still open after exit; output dropped");
            Captured::default()
        }
    }
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // Process IDs are always positive and fit in i32
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => warn!(error = %err, "failed to signal process group"),
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "failed to reap analysis process");
    }
}

/// Check that the analysis binary can be executed before any case starts.
///
/// A bare program name is looked up on `PATH` only, the way spawning it
/// would; other paths are taken as given. Returns the path to spawn.
pub fn verify_binary(binary: &Path) -> RunnerResult<PathBuf> {
    let path_var = std::env::var_os("PATH");
    let resolved = resolve_binary(binary, path_var.as_deref()).ok_or_else(|| {
        RunnerError::binary_unavailable(
            "analysis binary not found",
            Some(serde_json::json!({ "binary": binary.display().to_string() })),
        )
    })?;
    let metadata = std::fs::metadata(&resolved).map_err(|err| {
        RunnerError::binary_unavailable(
            "analysis binary is not accessible",
            Some(serde_json::json!({
                "binary": resolved.display().to_string(),
                "source": err.to_string(),
            })),
        )
    })?;
    if !metadata.is_file() {
        return Err(RunnerError::binary_unavailable(
            "analysis binary is not a regular file",
            Some(serde_json::json!({ "binary": resolved.display().to_string() })),
        ));
    }
    if !is_executable(&metadata) {
        return Err(RunnerError::binary_unavailable(
            "analysis binary is not executable",
            Some(serde_json::json!({ "binary": resolved.display().to_string() })),
        ));
    }
    Ok(resolved)
}

fn resolve_binary(binary: &Path, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let is_bare_name = binary.components().count() == 1 && !binary.is_absolute();
    if !is_bare_name {
        return binary.exists().then(|| binary.to_path_buf());
    }
    // The working directory is never searched for a bare name.
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(binary))
        .find(|candidate| {
            std::fs::metadata(candidate).is_ok_and(|m| m.is_file() && is_executable(&m))
        })
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}
