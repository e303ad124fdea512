//! Result document printed by the analysis binary when run with `--json`.

use crate::model::PrintOutput;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Parsed stdout of one analysis invocation.
///
/// Missing or `null` fields default to empty; unknown fields are ignored.
/// Anything that is not a JSON object of this shape is rejected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub print: Vec<PrintOutput>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub layers: Vec<ProducedLayer>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub log: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
}

impl AnalysisOutput {
    pub fn parse(stdout: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(stdout)
    }

    pub fn has_error(&self) -> bool {
        !self.error.trim().is_empty()
    }
}

/// A layer the binary saved; only `name` is interpreted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProducedLayer {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
