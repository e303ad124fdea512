pub mod analysis;
pub mod case;
pub mod ids;
pub mod run;

pub use analysis::{AnalysisOutput, ProducedLayer};
pub use case::{Case, Layer, PrintOutput};
pub use ids::RunId;
pub use run::{validate_path_component, Run, RunRequest};

/// File extension of raw image volumes, both in datasets and in run output.
pub const LAYER_EXTENSION: &str = ".nii.gz";

/// Name of the substituted script written into each run directory.
pub const SCRIPT_FILE_NAME: &str = "script.imgql";

/// Name of the persisted run record inside each run directory.
pub const RUN_RECORD_FILE_NAME: &str = "run.json";
