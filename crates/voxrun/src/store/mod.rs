//! File-tree persistence of run records.
//!
//! Layout: `<root>/<workspace>/<case>/<run>/{script.imgql, run.json, *.nii.gz}`.
//! A run directory is created before its process starts and is never removed
//! by the store. `run.json` is replaced atomically.

use crate::model::{
    validate_path_component, Layer, Run, RunId, LAYER_EXTENSION, RUN_RECORD_FILE_NAME,
    SCRIPT_FILE_NAME,
};
use crate::runner::{RunnerError, RunnerResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, workspace_id: &str, case_id: &str, run_id: RunId) -> PathBuf {
        self.root
            .join(workspace_id)
            .join(case_id)
            .join(run_id.to_string())
    }

    /// Create the run directory and its parents; succeeds if it exists.
    pub async fn ensure_run_dir(&self, dir: &Path) -> RunnerResult<()> {
        fs::create_dir_all(dir)
            .await
            .map_err(|err| RunnerError::io_at("failed to create run directory", dir, err))
    }

    /// Write the substituted script and return its path.
    pub async fn write_script(&self, dir: &Path, script: &str) -> RunnerResult<PathBuf> {
        let path = dir.join(SCRIPT_FILE_NAME);
        fs::write(&path, script)
            .await
            .map_err(|err| RunnerError::io_at("failed to write script", &path, err))?;
        Ok(path)
    }

    /// Persist `run` as `run.json` via temp file, fsync and rename.
    pub async fn write_run(&self, dir: &Path, run: &Run) -> RunnerResult<PathBuf> {
        let data = serde_json::to_vec_pretty(run)
            .map_err(|err| RunnerError::io("failed to serialize run record", err))?;
        let path = dir.join(RUN_RECORD_FILE_NAME);
        let tmp = dir.join(format!(".{RUN_RECORD_FILE_NAME}.{}.tmp", RunId::new()));

        if let Err(err) = write_synced(&tmp, &data).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                debug!(error = %cleanup, path = %tmp.display(), "temp record cleanup failed");
            }
            return Err(RunnerError::io_at("failed to write run record", &tmp, err));
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| RunnerError::io_at("failed to commit run record", &path, err))?;
        Ok(path)
    }

    pub async fn read_run(&self, dir: &Path) -> RunnerResult<Run> {
        let path = dir.join(RUN_RECORD_FILE_NAME);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RunnerError::not_found(
                    "run record not found",
                    Some(serde_json::json!({ "path": path.display().to_string() })),
                ));
            }
            Err(err) => return Err(RunnerError::io_at("failed to read run record", &path, err)),
        };
        serde_json::from_slice(&data)
            .map_err(|err| RunnerError::io_at("failed to parse run record", &path, err))
    }

    /// Every readable run of a workspace, oldest first.
    ///
    /// Entries that are not directories, directories without a record and
    /// unreadable records are skipped. A missing workspace has no runs.
    pub async fn list_runs(&self, workspace_id: &str) -> RunnerResult<Vec<Run>> {
        validate_path_component("workspaceId", workspace_id)?;
        let workspace_dir = self.root.join(workspace_id);
        let mut runs = Vec::new();
        for case_dir in subdirectories(&workspace_dir).await? {
            for run_dir in subdirectories(&case_dir).await? {
                if !fs::try_exists(run_dir.join(RUN_RECORD_FILE_NAME))
                    .await
                    .unwrap_or(false)
                {
                    continue;
                }
                match self.read_run(&run_dir).await {
                    Ok(run) => runs.push(run),
                    Err(err) => {
                        warn!(dir = %run_dir.display(), error = %err, "skipping unreadable run");
                    }
                }
            }
        }
        runs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.case_path.cmp(&b.case_path))
        });
        Ok(runs)
    }

    /// Layers a run produced, addressed by their retrieval URLs.
    pub async fn list_layers(
        &self,
        workspace_id: &str,
        case_id: &str,
        run_id: &str,
    ) -> RunnerResult<Vec<Layer>> {
        let dir = self.existing_run_dir(workspace_id, case_id, run_id).await?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| RunnerError::io_at("failed to list run directory", &dir, err))?;
        let mut layers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| RunnerError::io_at("failed to list run directory", &dir, err))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(LAYER_EXTENSION))
            else {
                continue;
            };
            if name.is_empty() || name.starts_with('.') {
                continue;
            }
            layers.push(Layer {
                name: name.to_string(),
                path: layer_url(workspace_id, case_id, run_id, name),
            });
        }
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    /// Raw bytes of a produced layer; `layer` may carry the `.nii.gz` suffix.
    pub async fn read_layer(
        &self,
        workspace_id: &str,
        case_id: &str,
        run_id: &str,
        layer: &str,
    ) -> RunnerResult<Vec<u8>> {
        let dir = self.existing_run_dir(workspace_id, case_id, run_id).await?;
        let name = layer.strip_suffix(LAYER_EXTENSION).unwrap_or(layer);
        validate_path_component("layer", name)?;
        let path = dir.join(format!("{name}{LAYER_EXTENSION}"));
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(RunnerError::not_found(
                "layer not found",
                Some(serde_json::json!({ "layer": name, "run_id": run_id })),
            )),
            Err(err) => Err(RunnerError::io_at("failed to read layer", &path, err)),
        }
    }

    async fn existing_run_dir(
        &self,
        workspace_id: &str,
        case_id: &str,
        run_id: &str,
    ) -> RunnerResult<PathBuf> {
        validate_path_component("workspaceId", workspace_id)?;
        validate_path_component("case id", case_id)?;
        validate_path_component("run id", run_id)?;
        let dir = self.root.join(workspace_id).join(case_id).join(run_id);
        if fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            Ok(dir)
        } else {
            Err(RunnerError::not_found(
                "run not found",
                Some(serde_json::json!({
                    "workspace_id": workspace_id,
                    "case_id": case_id,
                    "run_id": run_id,
                })),
            ))
        }
    }
}

/// Retrieval URL of a produced layer.
pub fn layer_url(workspace_id: &str, case_id: &str, run_id: &str, layer: &str) -> String {
    format!("/workspaces/{workspace_id}/{case_id}/{run_id}/layers/{layer}{LAYER_EXTENSION}")
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn subdirectories(dir: &Path) -> RunnerResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(RunnerError::io_at("failed to list directory", dir, err)),
    };
    let mut dirs = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    dirs.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(err) => return Err(RunnerError::io_at("failed to list directory", dir, err)),
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::runner::ErrorCode;
    use chrono::Utc;

    fn run(id: RunId, case_path: &str, error: &str) -> Run {
        Run {
            id,
            timestamp: Utc::now(),
            case_path: case_path.to_string(),
            script_content: "print \"n\" 1".to_string(),
            output_print: Vec::new(),
            output_layers: Vec::new(),
            output_log: String::new(),
            output_error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn write_then_read_run_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path());
        let id = RunId::new();
        let dir = store.run_dir("ws", "c1", id);
        store.ensure_run_dir(&dir).await.unwrap();
        store.ensure_run_dir(&dir).await.unwrap();

        let written = run(id, "/datasets/d/cases/c1", "");
        let path = store.write_run(&dir, &written).await.unwrap();
        assert!(path.ends_with(RUN_RECORD_FILE_NAME));
        assert_eq!(store.read_run(&dir).await.unwrap(), written);

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_workspace_lists_no_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path());
        assert!(store.list_runs("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn layers_of_missing_run_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path());
        let err = store.list_layers("ws", "c1", "r1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        let err = store.read_layer("ws", "c1", "..", "x").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn produced_layers_are_listed_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path());
        let id = RunId::new();
        let dir = store.run_dir("ws", "c1", id);
        store.ensure_run_dir(&dir).await.unwrap();
        std::fs::write(dir.join("mask.nii.gz"), b"voxels").unwrap();
        std::fs::write(dir.join(SCRIPT_FILE_NAME), b"script").unwrap();

        let run_id = id.to_string();
        let layers = store.list_layers("ws", "c1", &run_id).await.unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "mask");
        assert_eq!(layers[0].path, format!("/workspaces/ws/c1/{run_id}/layers/mask.nii.gz"));

        let bytes = store.read_layer("ws", "c1", &run_id, "mask.nii.gz").await.unwrap();
        assert_eq!(bytes, b"voxels");
        let bytes = store.read_layer("ws", "c1", &run_id, "mask").await.unwrap();
        assert_eq!(bytes, b"voxels");
        let err = store.read_layer("ws", "c1", &run_id, "other").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
