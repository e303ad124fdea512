//! Verbose progress output using indicatif.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Mutex;
use voxrun::runner::{ProgressCallback, ProgressEvent};

/// Progress callback that reports case-by-case progress to stderr.
pub struct VerboseProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl VerboseProgress {
    /// Create a new verbose progress callback.
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bar) = self.bar.lock() {
            if let Some(bar) = bar.as_ref() {
                f(bar);
            }
        }
    }
}

impl Default for VerboseProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for VerboseProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::BatchStarted {
                run_id,
                total_cases,
            } => {
                let _ = writeln!(
                    std::io::stderr(),
                    "batch started: {run_id} ({total_cases} cases)"
                );
                let bar = ProgressBar::new(*total_cases as u64);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.cyan} [{elapsed_precise}] {pos}/{len} cases {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.enable_steady_tick(std::time::Duration::from_millis(100));
                if let Ok(mut slot) = self.bar.lock() {
                    *slot = Some(bar);
                }
            }
            ProgressEvent::CaseStarted { case_id, .. } => {
                self.with_bar(|bar| bar.set_message(case_id.clone()));
            }
            ProgressEvent::CaseCompleted {
                case_id,
                failed,
                duration_ms,
                ..
            } => {
                let icon = if *failed {
                    "\x1b[31m✗\x1b[0m"
                } else {
                    "\x1b[32m✓\x1b[0m"
                };
                self.with_bar(|bar| {
                    bar.suspend(|| {
                        let _ = writeln!(
                            std::io::stderr(),
                            "  {icon} {case_id} ({duration_ms}ms)"
                        );
                    });
                    bar.inc(1);
                });
            }
            ProgressEvent::BatchCompleted {
                failed_cases,
                duration_ms,
                ..
            } => {
                if let Ok(mut slot) = self.bar.lock() {
                    if let Some(bar) = slot.take() {
                        bar.finish_and_clear();
                    }
                }
                let status = if *failed_cases == 0 {
                    "\x1b[32mall cases succeeded\x1b[0m".to_string()
                } else {
                    format!("\x1b[31m{failed_cases} failed\x1b[0m")
                };
                let _ = writeln!(
                    std::io::stderr(),
                    "batch finished: {status}, {duration_ms}ms total"
                );
            }
        }
    }
}
