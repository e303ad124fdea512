//! Batch run orchestrator.
//!
//! Validates a [`RunRequest`], checks the analysis binary once, then fans the
//! cases out on a [`JoinSet`]. Every case of a batch shares one [`RunId`].
//! Results come back in request order regardless of completion order.

use crate::config::RunnerConfig;
use crate::coordinator::process_case;
use crate::datasets::{DatasetLayers, LayerResolver};
use crate::model::{Run, RunId, RunRequest};
use crate::process::verify_binary;
use crate::runner::{NoopProgress, ProgressCallback, ProgressEvent, RunnerError, RunnerResult};
use crate::store::RunStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

/// Read-only state shared by every case task of a batch.
pub struct RunContext {
    pub config: RunnerConfig,
    pub store: RunStore,
    pub resolver: Arc<dyn LayerResolver>,
    pub progress: Arc<dyn ProgressCallback>,
}

impl RunContext {
    /// Context over the configured workspaces and datasets roots.
    pub fn new(config: RunnerConfig) -> RunnerResult<Self> {
        config.validate()?;
        Ok(Self {
            store: RunStore::new(&config.workspaces_root),
            resolver: Arc::new(DatasetLayers::new(&config.datasets_root)),
            progress: Arc::new(NoopProgress),
            config,
        })
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn LayerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }
}

/// Execute `request` against every case and return one run per case.
///
/// Per-case failures are recorded on the runs. An error is returned only when
/// the request is invalid, the binary is unavailable, or a case hit an
/// infrastructure failure; in the last case the remaining cases are aborted.
pub async fn run_all(ctx: Arc<RunContext>, request: RunRequest) -> RunnerResult<Vec<Run>> {
    request.validate()?;
    let binary = verify_binary(&ctx.config.binary_path)?;

    let run_id = RunId::new();
    let span = info_span!(
        "batch",
        run_id = %run_id,
        workspace_id = %request.workspace_id,
        cases = request.cases.len()
    );
    let batch = Arc::new(Batch {
        request,
        run_id,
        binary,
    });
    dispatch(ctx, batch).instrument(span).await
}

/// Parse a raw request body and run it.
pub async fn run_json(ctx: Arc<RunContext>, body: &[u8]) -> RunnerResult<Vec<Run>> {
    let request = RunRequest::from_json(body)?;
    run_all(ctx, request).await
}

/// One validated request bound to its batch id and resolved binary.
struct Batch {
    request: RunRequest,
    run_id: RunId,
    binary: PathBuf,
}

async fn dispatch(ctx: Arc<RunContext>, batch: Arc<Batch>) -> RunnerResult<Vec<Run>> {
    let started = Instant::now();
    let run_id = batch.run_id;
    let total = batch.request.cases.len();
    info!("batch started");
    ctx.progress.on_progress(&ProgressEvent::BatchStarted {
        run_id,
        total_cases: total,
    });

    let limiter = ctx
        .config
        .max_concurrent_cases
        .map(|limit| Arc::new(Semaphore::new(limit)));
    let mut tasks = JoinSet::new();
    for index in 0..total {
        let ctx = Arc::clone(&ctx);
        let batch = Arc::clone(&batch);
        let limiter = limiter.clone();
        tasks.spawn(
            async move {
                let _permit = match limiter {
                    Some(limiter) => Some(
                        limiter
                            .acquire_owned()
                            .await
                            .map_err(|_| RunnerError::internal("case limiter closed"))?,
                    ),
                    None => None,
                };
                run_case(&ctx, &batch, index).await
            }
            .in_current_span(),
        );
    }

    let mut slots: Vec<Option<Run>> = vec![None; total];
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|err| {
                error!(error = %err, "case task did not complete");
                RunnerError::internal(format!("case task did not complete: {err}"))
            })
            .and_then(|result| result);
        match outcome {
            Ok((index, run)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(run);
                }
            }
            Err(err) => {
                error!(code = %err.code, error = %err, "batch aborted");
                tasks.abort_all();
                return Err(err);
            }
        }
    }

    let runs: Vec<Run> = slots
        .into_iter()
        .collect::<Option<_>>()
        .ok_or_else(|| RunnerError::internal("a case finished without a run record"))?;
    let failed_cases = runs.iter().filter(|run| run.is_failed()).count();
    info!(failed_cases, "batch completed");
    ctx.progress.on_progress(&ProgressEvent::BatchCompleted {
        run_id,
        failed_cases,
        duration_ms: elapsed_ms(started),
    });
    Ok(runs)
}

async fn run_case(ctx: &RunContext, batch: &Batch, index: usize) -> RunnerResult<(usize, Run)> {
    let request = &batch.request;
    let case = request
        .cases
        .get(index)
        .ok_or_else(|| RunnerError::internal("case index out of range"))?;
    let started = Instant::now();
    ctx.progress.on_progress(&ProgressEvent::CaseStarted {
        index,
        case_id: case.id.clone(),
    });
    let run = process_case(
        ctx,
        &batch.binary,
        case,
        batch.run_id,
        &request.workspace_id,
        &request.script_content,
    )
    .await?;
    ctx.progress.on_progress(&ProgressEvent::CaseCompleted {
        index,
        case_id: case.id.clone(),
        failed: run.is_failed(),
        duration_ms: elapsed_ms(started),
    });
    Ok((index, run))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
