// CLI binary - relaxed lint rules for CLI-specific patterns
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI must exit with specific codes
#![allow(clippy::fn_params_excessive_bools)] // CLI handlers mirror flag structs

mod progress;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voxrun::config::{load_config_file, ConfigOverrides, RunnerConfig};
use voxrun::orchestrator::{run_all, RunContext};
use voxrun::runner::RunnerError;
use voxrun::store::RunStore;
use voxrun::{Run, RunRequest};

use crate::progress::VerboseProgress;

/// Color output mode.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env var
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Parser, Debug)]
#[command(
    name = "voxrun",
    version,
    about = "Batch VoxLogicA analyses over imaging cases"
)]
struct Cli {
    /// Color output mode: auto, always, never
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Settings layered over defaults, environment, and the config file.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// JSON or YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to the VoxLogicA binary
    #[arg(long, global = true)]
    binary: Option<PathBuf>,
    /// Root directory for run outputs
    #[arg(long, global = true)]
    workspaces: Option<PathBuf>,
    /// Root directory of the datasets tree
    #[arg(long, global = true)]
    datasets: Option<PathBuf>,
    /// Per-case timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Upper bound on cases analysed at once
    #[arg(long, global = true)]
    max_concurrent_cases: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one script over every case of a request
    Run {
        /// Request file (JSON), or `-` for stdin
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        json: bool,
        /// Show per-case progress on stderr
        #[arg(long)]
        verbose: bool,
    },
    /// List persisted runs of a workspace
    Runs {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        json: bool,
    },
    /// List layers produced by one run of one case
    Layers {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        case: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn configure_colors(mode: ColorMode) -> bool {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };

    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
    use_color
}

fn init_tracing(use_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(use_color)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let use_color = configure_colors(cli.color);
    init_tracing(use_color);
    match cli.command {
        Commands::Run {
            request,
            json,
            verbose,
        } => cmd_run(&cli.config, &request, json, verbose),
        Commands::Runs { workspace, json } => cmd_runs(&cli.config, &workspace, json),
        Commands::Layers {
            workspace,
            case,
            run,
            json,
        } => cmd_layers(&cli.config, &workspace, &case, &run, json),
        Commands::Serve { listen } => cmd_serve(&cli.config, listen),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn cmd_run(args: &ConfigArgs, request: &Path, json: bool, verbose: bool) -> Result<()> {
    let result = load_config(args).and_then(|config| {
        let body = read_request(request)?;
        let request = RunRequest::from_json(&body)?;
        let mut ctx = RunContext::new(config)?;
        if verbose {
            ctx = ctx.with_progress(Arc::new(VerboseProgress::new()));
        }
        block_on(run_all(Arc::new(ctx), request))?
    });
    emit_runs(json, result)
}

fn cmd_runs(args: &ConfigArgs, workspace: &str, json: bool) -> Result<()> {
    let result = load_config(args).and_then(|config| {
        let store = RunStore::new(config.workspaces_root);
        block_on(store.list_runs(workspace))?
    });
    match result {
        Ok(runs) => {
            if json {
                let payload = serde_json::to_string(&runs).into_diagnostic()?;
                println!("{payload}");
            } else if runs.is_empty() {
                eprintln!("no runs in workspace {workspace}");
            } else {
                for run in &runs {
                    println!(
                        "{}  {}  {}  {}",
                        run.timestamp.to_rfc3339(),
                        run.id,
                        run.case_path,
                        run_status(run)
                    );
                }
            }
            Ok(())
        }
        Err(err) => emit_error(json, &err),
    }
}

fn cmd_layers(
    args: &ConfigArgs,
    workspace: &str,
    case: &str,
    run: &str,
    json: bool,
) -> Result<()> {
    let result = load_config(args).and_then(|config| {
        let store = RunStore::new(config.workspaces_root);
        block_on(store.list_layers(workspace, case, run))?
    });
    match result {
        Ok(layers) => {
            if json {
                let payload = serde_json::to_string(&layers).into_diagnostic()?;
                println!("{payload}");
            } else {
                for layer in &layers {
                    println!("{}\t{}", layer.name, layer.path);
                }
            }
            Ok(())
        }
        Err(err) => emit_error(json, &err),
    }
}

fn cmd_serve(args: &ConfigArgs, listen: SocketAddr) -> Result<()> {
    let result = load_config(args).and_then(|config| {
        let ctx = Arc::new(RunContext::new(config)?);
        block_on(async move {
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .map_err(|err| RunnerError::io("failed to bind listener", err))?;
            let addr = listener
                .local_addr()
                .map_err(|err| RunnerError::io("failed to read listener address", err))?;
            info!(%addr, "voxrun listening");
            voxrun::server::serve(listener, ctx, shutdown_signal())
                .await
                .map_err(|err| RunnerError::io("server failed", err))
        })?
    });
    match result {
        Ok(()) => {
            info!("server stopped");
            Ok(())
        }
        Err(err) => emit_error(false, &err),
    }
}

#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config(args: &ConfigArgs) -> Result<RunnerConfig, RunnerError> {
    let mut config = RunnerConfig::from_env()?;
    if let Some(path) = &args.config {
        config.apply(load_config_file(path)?);
    }
    config.apply(ConfigOverrides {
        binary_path: args.binary.clone(),
        workspaces_root: args.workspaces.clone(),
        datasets_root: args.datasets.clone(),
        timeout_ms: args.timeout_ms,
        max_concurrent_cases: args.max_concurrent_cases,
    });
    config.validate()?;
    Ok(config)
}

fn read_request(path: &Path) -> Result<Vec<u8>, RunnerError> {
    if path.as_os_str() == "-" {
        let mut body = Vec::new();
        io::stdin()
            .read_to_end(&mut body)
            .map_err(|err| RunnerError::io("failed to read request from stdin", err))?;
        return Ok(body);
    }
    std::fs::read(path).map_err(|err| RunnerError::io_at("failed to read request file", path, err))
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, RunnerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| RunnerError::io("failed to start async runtime", err))?;
    Ok(runtime.block_on(future))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn run_status(run: &Run) -> String {
    if run.is_failed() {
        let first = run.output_error.lines().next().unwrap_or_default();
        format!("failed: {first}")
    } else {
        format!("ok ({} layers)", run.output_layers.len())
    }
}

fn emit_runs(json: bool, result: Result<Vec<Run>, RunnerError>) -> Result<()> {
    match result {
        Ok(runs) => {
            if json {
                let payload = serde_json::to_string(&runs).into_diagnostic()?;
                println!("{payload}");
            } else {
                for run in &runs {
                    println!("{}: {}", run.case_path, run_status(run));
                }
                let failed = runs.iter().filter(|run| run.is_failed()).count();
                if let Some(first) = runs.first() {
                    let total = runs.len();
                    eprintln!("run {} completed: {failed} of {total} cases failed", first.id);
                }
            }
            Ok(())
        }
        Err(err) => emit_error(json, &err),
    }
}

fn emit_error(json: bool, err: &RunnerError) -> Result<()> {
    if json {
        let payload = serde_json::to_string(&err.to_error_info()).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!("error: {err}");
    }
    std::process::exit(err.exit_code());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::run_status;
    use voxrun::runner::{ErrorCode, RunnerError};
    use voxrun::{Run, RunId};

    fn sample_run(error: &str) -> Run {
        serde_json::from_value(serde_json::json!({
            "id": RunId::new(),
            "timestamp": "2024-05-01T10:00:00Z",
            "casePath": "/datasets/brats/cases/c1",
            "scriptContent": "",
            "outputPrint": [],
            "outputLayers": [],
            "outputLog": "",
            "outputError": error,
        }))
        .unwrap()
    }

    #[test]
    fn exit_code_maps_invalid_request() {
        let err = RunnerError::invalid_request("cases must not be empty");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn exit_code_maps_binary_unavailable() {
        let err = RunnerError::new(ErrorCode::BinaryUnavailable, "missing", None);
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn exit_code_maps_not_found() {
        let err = RunnerError::new(ErrorCode::NotFound, "run not found", None);
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn status_shows_first_error_line() {
        let run = sample_run("process exited with exit code 3\nstderr: boom");
        assert_eq!(run_status(&run), "failed: process exited with exit code 3");
        assert_eq!(run_status(&sample_run("")), "ok (0 layers)");
    }
}
