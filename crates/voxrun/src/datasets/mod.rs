//! Dataset layer listing.
//!
//! A dataset tree looks like `<root>/<dataset>/<case>/<patient>_<layer>.nii.gz`.
//! The templating engine only sees the [`LayerResolver`] trait so tests and
//! embedders can supply their own listing.

use crate::model::{Case, Layer, LAYER_EXTENSION};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("case path {case_path} does not name a dataset")]
    MissingDatasetId { case_path: String },
    #[error("case directory {path} does not exist")]
    CaseNotFound { path: String },
    #[error("failed to list layers in {path}: {source}")]
    List {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lists the raw image layers available for a case.
pub trait LayerResolver: Send + Sync {
    fn layers(&self, case: &Case) -> Result<Vec<Layer>, DatasetError>;
}

/// Filesystem-backed resolver over a datasets root.
#[derive(Clone, Debug)]
pub struct DatasetLayers {
    root: PathBuf,
}

impl DatasetLayers {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the case's layer files.
    pub fn case_dir(&self, case: &Case) -> Result<PathBuf, DatasetError> {
        let dataset = case
            .dataset_id()
            .ok_or_else(|| DatasetError::MissingDatasetId {
                case_path: case.path.clone(),
            })?;
        Ok(self.root.join(dataset).join(&case.id))
    }
}

impl LayerResolver for DatasetLayers {
    fn layers(&self, case: &Case) -> Result<Vec<Layer>, DatasetError> {
        let dir = self.case_dir(case)?;
        if !dir.is_dir() {
            return Err(DatasetError::CaseNotFound {
                path: dir.display().to_string(),
            });
        }
        let dir = fs::canonicalize(&dir).map_err(|source| list_error(&dir, source))?;
        let entries = fs::read_dir(&dir).map_err(|source| list_error(&dir, source))?;

        let mut layers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| list_error(&dir, source))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(name) = layer_name(file_name) else {
                continue;
            };
            if !entry.path().is_file() {
                continue;
            }
            layers.push(Layer {
                name: name.to_string(),
                path: entry.path().display().to_string(),
            });
        }
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }
}

fn list_error(dir: &Path, source: std::io::Error) -> DatasetError {
    DatasetError::List {
        path: dir.display().to_string(),
        source,
    }
}

/// Layer name of a `<patient>_<layer>.nii.gz` file: the part after the last
/// underscore, or the whole stem when there is none.
pub fn layer_name(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(LAYER_EXTENSION)?;
    let name = stem.rsplit_once('_').map_or(stem, |(_, suffix)| suffix);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
