//! Common test helper functions.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Analysis binary that runs scripts built by [`FakeAnalysis`](crate::FakeAnalysis).
pub const FAKE_BINARY: &str = "/bin/sh";

/// A binary path that never exists.
pub const MISSING_BINARY: &str = "/nonexistent/voxlogica";

/// Create a unique temporary directory for a test.
///
/// The name carries the prefix, the process id and a timestamp so parallel
/// tests never collide.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "voxrun-{prefix}-{}-{stamp}",
        std::process::id()
    ));

    #[allow(clippy::expect_used)]
    fs::create_dir_all(&dir).expect("failed to create temp directory");

    dir
}

/// Lay out `<datasets_root>/<dataset>/<case>/<case>_<layer>.nii.gz` files.
///
/// Returns the case directory.
///
/// # Panics
///
/// Panics if the files cannot be written.
pub fn write_dataset_case(
    datasets_root: &Path,
    dataset: &str,
    case: &str,
    layers: &[&str],
) -> PathBuf {
    let dir = datasets_root.join(dataset).join(case);

    #[allow(clippy::expect_used)]
    fs::create_dir_all(&dir).expect("failed to create case directory");

    for layer in layers {
        #[allow(clippy::expect_used)]
        fs::write(dir.join(format!("{case}_{layer}.nii.gz")), layer.as_bytes())
            .expect("failed to write layer file");
    }
    dir
}

/// Build a run request body for `cases` given as `(dataset, case)` pairs.
pub fn request_json(workspace_id: &str, script: &str, cases: &[(&str, &str)]) -> serde_json::Value {
    let cases: Vec<_> = cases
        .iter()
        .map(|(dataset, case)| {
            serde_json::json!({
                "id": case,
                "path": format!("/datasets/{dataset}/cases/{case}"),
            })
        })
        .collect();
    serde_json::json!({
        "workspaceId": workspace_id,
        "scriptContent": script,
        "cases": cases,
    })
}

/// Pids written by [`FakeAnalysis::hang_with_child`](crate::FakeAnalysis::hang_with_child).
///
/// # Panics
///
/// Panics if the file is missing or holds anything but whitespace-separated pids.
#[must_use]
pub fn read_pids(pidfile: &Path) -> Vec<u32> {
    #[allow(clippy::expect_used)]
    let text = fs::read_to_string(pidfile).expect("pid file was not written");
    #[allow(clippy::expect_used)]
    text.split_whitespace()
        .map(|pid| pid.parse().expect("pid file holds a non-numeric entry"))
        .collect()
}

/// Whether `pid` names a live process: `/proc/<pid>/stat` exists and its
/// state is anything but zombie.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces; the state follows its closing paren.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    state != Some("Z")
}

/// Poll until none of `pids` is alive. Returns the survivors at `deadline`.
#[must_use]
pub fn wait_until_gone(pids: &[u32], deadline: Duration) -> Vec<u32> {
    let started = Instant::now();
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|pid| is_alive(*pid)).collect();
        if alive.is_empty() || started.elapsed() >= deadline {
            return alive;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
