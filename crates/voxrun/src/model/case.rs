use serde::{Deserialize, Serialize};

/// One imaging subject within a dataset.
///
/// `path` encodes dataset membership as `/datasets/<dataset>/cases/<case>`;
/// `id` is the case directory name and names the case's run directories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    #[serde(alias = "name")]
    pub id: String,
    pub path: String,
}

impl Case {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Build a case from its dataset and case directory names.
    pub fn in_dataset(dataset: &str, case_id: &str) -> Self {
        Self::new(case_id, format!("/datasets/{dataset}/cases/{case_id}"))
    }

    /// Dataset identifier: the path segment that follows `datasets`.
    pub fn dataset_id(&self) -> Option<&str> {
        let mut segments = self.path.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if segment == "datasets" {
                return segments.next();
            }
        }
        None
    }
}

/// A named image volume, either stored in a dataset or produced by a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub path: String,
}

/// One `print` statement result reported by the analysis binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrintOutput {
    pub name: String,
    #[serde(default)]
    pub vltype: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::Case;

    #[test]
    fn dataset_id_follows_datasets_segment() {
        let case = Case::new("case-01", "/datasets/brats/cases/case-01");
        assert_eq!(case.dataset_id(), Some("brats"));
        assert_eq!(Case::in_dataset("isles", "p7").dataset_id(), Some("isles"));
    }

    #[test]
    fn dataset_id_missing_without_datasets_prefix() {
        assert_eq!(Case::new("c", "/cases/c").dataset_id(), None);
        assert_eq!(Case::new("c", "/datasets").dataset_id(), None);
    }

    #[test]
    fn name_is_accepted_as_case_id() {
        let case: Case =
            serde_json::from_str(r#"{"name":"p1","path":"/datasets/d/cases/p1"}"#).unwrap();
        assert_eq!(case.id, "p1");
    }
}
