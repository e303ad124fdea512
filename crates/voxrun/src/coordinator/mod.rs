//! Case run coordinator: one case, one run directory, one run record.
//!
//! Per-case failures become data on the returned [`Run`]; only infrastructure
//! failures (the binary cannot be spawned, the record cannot be persisted)
//! are returned as errors.

use crate::model::{AnalysisOutput, Case, Layer, Run, RunId};
use crate::orchestrator::RunContext;
use crate::process::{run_analysis, ProcessError};
use crate::runner::{RunnerError, RunnerResult};
use crate::store::layer_url;
use crate::template::{substitute, TemplateError};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

/// Longest stderr excerpt copied into a failure message.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// Template, execute and persist `script` for one case of a batch.
///
/// `binary` is the resolved analysis binary, as returned by
/// [`verify_binary`](crate::process::verify_binary).
pub async fn process_case(
    ctx: &RunContext,
    binary: &Path,
    case: &Case,
    run_id: RunId,
    workspace_id: &str,
    script: &str,
) -> RunnerResult<Run> {
    let span = info_span!("case", case_id = %case.id, run_id = %run_id);
    async {
        let dir = ctx.store.run_dir(workspace_id, &case.id, run_id);
        let mut run = blank_run(run_id, case, script);

        if let Err(err) = ctx.store.ensure_run_dir(&dir).await {
            warn!(error = %err, "run directory unavailable; record not persisted");
            run.output_error = match &err.context {
                Some(context) => format!("{}: {context}", err.message),
                None => err.message.clone(),
            };
            return Ok(run);
        }

        match execute(ctx, binary, case, &dir, script).await {
            Ok(output) => {
                fill_outputs(&mut run, &output, workspace_id, case);
                info!(layers = run.output_layers.len(), "case completed");
            }
            Err(CaseFailure::Spawn(err)) => {
                return Err(RunnerError::binary_unavailable(
                    "failed to start analysis binary",
                    Some(serde_json::json!({
                        "binary": binary.display().to_string(),
                        "source": err.to_string(),
                    })),
                ));
            }
            Err(CaseFailure::Analysis(err)) => {
                warn!(code = %err.code(), error = %err, "case failed");
                if let Some(output) = err.partial_output() {
                    fill_outputs(&mut run, output, workspace_id, case);
                }
                if let ProcessError::MalformedOutput { stderr, .. } = &err {
                    run.output_log = excerpt(stderr).to_string();
                }
                run.output_error = failure_message(&err);
            }
            Err(CaseFailure::Template(err)) => {
                warn!(code = %err.code(), error = %err, "script templating failed");
                run.output_error = format!("script templating failed: {err}");
            }
            Err(CaseFailure::Prepare(message)) => {
                warn!(error = %message, "case failed before analysis");
                run.output_error = message;
            }
        }

        ctx.store.write_run(&dir, &run).await?;
        Ok(run)
    }
    .instrument(span)
    .await
}

enum CaseFailure {
    Template(TemplateError),
    Prepare(String),
    Spawn(ProcessError),
    Analysis(ProcessError),
}

async fn execute(
    ctx: &RunContext,
    binary: &Path,
    case: &Case,
    dir: &Path,
    script: &str,
) -> Result<AnalysisOutput, CaseFailure> {
    let concrete = template_script(ctx, case, dir, script).await?;
    let script_path = ctx
        .store
        .write_script(dir, &concrete)
        .await
        .map_err(|err| CaseFailure::Prepare(err.to_string()))?;
    match run_analysis(binary, &script_path, ctx.config.timeout()).await {
        Ok(output) => Ok(output),
        Err(err @ ProcessError::SpawnFailed { .. }) => Err(CaseFailure::Spawn(err)),
        Err(err) => Err(CaseFailure::Analysis(err)),
    }
}

/// Run [`substitute`] off the async workers; resolvers read the filesystem.
async fn template_script(
    ctx: &RunContext,
    case: &Case,
    dir: &Path,
    script: &str,
) -> Result<String, CaseFailure> {
    let resolver = Arc::clone(&ctx.resolver);
    let (case, dir, script) = (case.clone(), dir.to_path_buf(), script.to_string());
    tokio::task::spawn_blocking(move || substitute(&script, &case, &dir, resolver.as_ref()))
        .await
        .map_err(|err| CaseFailure::Prepare(format!("script templating aborted: {err}")))?
        .map_err(CaseFailure::Template)
}

fn blank_run(run_id: RunId, case: &Case, script: &str) -> Run {
    Run {
        id: run_id,
        timestamp: Utc::now(),
        case_path: case.path.clone(),
        script_content: script.to_string(),
        output_print: Vec::new(),
        output_layers: Vec::new(),
        output_log: String::new(),
        output_error: String::new(),
    }
}

fn fill_outputs(run: &mut Run, output: &AnalysisOutput, workspace_id: &str, case: &Case) {
    let run_id = run.id.to_string();
    run.output_print = output.print.clone();
    run.output_log = output.log.clone();
    run.output_layers = output
        .layers
        .iter()
        .map(|layer| Layer {
            name: layer.name.clone(),
            path: layer_url(workspace_id, &case.id, &run_id, &layer.name),
        })
        .collect();
}

/// Human-readable `outputError` for a failed analysis. Never empty.
fn failure_message(err: &ProcessError) -> String {
    match err {
        ProcessError::AnalysisError { output } => output.error.clone(),
        ProcessError::ExecutionFailed { output, stderr, .. } => {
            if output.has_error() {
                output.error.clone()
            } else {
                with_stderr(err.to_string(), stderr)
            }
        }
        ProcessError::MalformedOutput { stderr, .. } => with_stderr(err.to_string(), stderr),
        _ => err.to_string(),
    }
}

fn with_stderr(message: String, stderr: &str) -> String {
    let stderr = excerpt(stderr);
    if stderr.is_empty() {
        message
    } else {
        format!("{message}\n{stderr}")
    }
}

/// Trailing part of `text`, which is where tools print the fatal line.
fn excerpt(text: &str) -> &str {
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return text;
    }
    let skip = count - STDERR_EXCERPT_CHARS;
    text.char_indices()
        .nth(skip)
        .and_then(|(idx, _)| text.get(idx..))
        .unwrap_or(text)
}
