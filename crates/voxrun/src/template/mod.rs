//! Script templating: binds a generic script to one case and one run
//! directory.
//!
//! Two rewrites are applied to the script text:
//!
//! - `${LAYER_PATH:<name>}` becomes the absolute path of the case's layer.
//! - `save "<path>"` is redirected into the run output directory. Paths that
//!   mention an output-dir token (`${OUTPUT_DIR}`, `$OUTPUT_DIR`,
//!   `${OUTPUTDIR}`, `$OUTPUTDIR`) get the directory spliced in; any other
//!   path is joined onto the directory.
//!
//! The output is a terminal artifact; applying [`substitute`] to its own
//! output is not supported.

use crate::datasets::{DatasetError, LayerResolver};
use crate::model::Case;
use crate::runner::ErrorCode;
use regex::{Captures, NoExpand, Regex};
use std::collections::HashMap;
use std::path::{Path, MAIN_SEPARATOR};

const LAYER_PLACEHOLDER: &str = r"\$\{LAYER_PATH:([^}]+)\}";
const SAVE_STATEMENT: &str = r#"save\s+"([^"]+)""#;
const OUTPUT_DIR_TOKEN: &str = r"\$\{?OUTPUT_?DIR\}?";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to list layers for case: {0}")]
    Layers(#[from] DatasetError),
    #[error("layer {layer} has no file name in path {path}")]
    InvalidLayerPath { layer: String, path: String },
    #[error("layer {layer} is not available for case {case_id}")]
    UnknownLayer { layer: String, case_id: String },
    #[error("save path {path} escapes the run output directory")]
    PathEscapesOutput { path: String },
    #[error("invalid template pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl TemplateError {
    /// Every templating failure is classified as [`ErrorCode::Template`].
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Template
    }
}

/// Produce the concrete script for `case`, saving into `output_dir`.
///
/// The resolver is only consulted when the script references a layer.
pub fn substitute(
    script: &str,
    case: &Case,
    output_dir: &Path,
    resolver: &dyn LayerResolver,
) -> Result<String, TemplateError> {
    let with_layers = substitute_layers(script, case, resolver)?;
    redirect_saves(&with_layers, output_dir)
}

fn substitute_layers(
    script: &str,
    case: &Case,
    resolver: &dyn LayerResolver,
) -> Result<String, TemplateError> {
    let placeholder = Regex::new(LAYER_PLACEHOLDER)?;
    if !placeholder.is_match(script) {
        return Ok(script.to_string());
    }

    let mut paths = HashMap::new();
    for layer in resolver.layers(case)? {
        if Path::new(&layer.path).file_name().is_none() {
            return Err(TemplateError::InvalidLayerPath {
                layer: layer.name,
                path: layer.path,
            });
        }
        paths.insert(layer.name, layer.path);
    }

    if let Some(missing) = placeholder
        .captures_iter(script)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|name| !paths.contains_key(*name))
    {
        return Err(TemplateError::UnknownLayer {
            layer: missing.to_string(),
            case_id: case.id.clone(),
        });
    }

    let replaced = placeholder.replace_all(script, |caps: &Captures<'_>| {
        caps.get(1)
            .and_then(|name| paths.get(name.as_str()))
            .cloned()
            .unwrap_or_default()
    });
    Ok(replaced.into_owned())
}

fn redirect_saves(script: &str, output_dir: &Path) -> Result<String, TemplateError> {
    let save = Regex::new(SAVE_STATEMENT)?;
    let token = Regex::new(OUTPUT_DIR_TOKEN)?;
    let output = output_dir.display().to_string();

    let mut failure = None;
    let rewritten = save.replace_all(script, |caps: &Captures<'_>| {
        let raw = caps.get(1).map_or("", |m| m.as_str());
        let target = if has_parent_segment(raw) {
            failure.get_or_insert(TemplateError::PathEscapesOutput {
                path: raw.to_string(),
            });
            raw.to_string()
        } else if token.is_match(raw) {
            normalize_separators(&token.replace_all(raw, NoExpand(&output)))
        } else {
            join_relative(output_dir, raw)
        };
        format!("save \"{target}\"")
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(rewritten.into_owned()),
    }
}

/// Whether any `/` or `\\` separated segment of `raw` is `..`.
fn has_parent_segment(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

fn join_relative(output_dir: &Path, raw: &str) -> String {
    let relative = raw.trim_start_matches(['/', '\\']);
    output_dir.join(relative).display().to_string()
}

fn normalize_separators(path: &str) -> String {
    path.chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Layer;

    struct FixedLayers(Vec<Layer>);

    impl LayerResolver for FixedLayers {
        fn layers(&self, _case: &Case) -> Result<Vec<Layer>, DatasetError> {
            Ok(self.0.clone())
        }
    }

    fn layers() -> FixedLayers {
        FixedLayers(vec![Layer {
            name: "flair".to_string(),
            path: "/data/brats/c1/c1_flair.nii.gz".to_string(),
        }])
    }

    fn case() -> Case {
        Case::in_dataset("brats", "c1")
    }

    #[test]
    fn layer_placeholders_become_paths() {
        let out = substitute(
            "load img = \"${LAYER_PATH:flair}\"\nload again = \"${LAYER_PATH:flair}\"",
            &case(),
            Path::new("/ws/w/c1/r1"),
            &layers(),
        )
        .unwrap();
        assert!(!out.contains("LAYER_PATH"));
        assert_eq!(out.matches("/data/brats/c1/c1_flair.nii.gz").count(), 2);
    }

    #[test]
    fn unknown_layer_is_rejected() {
        let err = substitute(
            "load x = \"${LAYER_PATH:t2}\"",
            &case(),
            Path::new("/out"),
            &layers(),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownLayer { ref layer, .. } if layer == "t2"));
        assert_eq!(err.code(), ErrorCode::Template);
    }

    #[test]
    fn layer_without_file_name_is_rejected() {
        let resolver = FixedLayers(vec![Layer {
            name: "flair".to_string(),
            path: "/".to_string(),
        }]);
        let err = substitute("${LAYER_PATH:flair}", &case(), Path::new("/out"), &resolver)
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidLayerPath { .. }));
    }

    #[test]
    fn resolver_untouched_without_placeholders() {
        struct Failing;
        impl LayerResolver for Failing {
            fn layers(&self, case: &Case) -> Result<Vec<Layer>, DatasetError> {
                Err(DatasetError::MissingDatasetId {
                    case_path: case.path.clone(),
                })
            }
        }
        let out = substitute("print \"n\" 1", &case(), Path::new("/out"), &Failing).unwrap();
        assert_eq!(out, "print \"n\" 1");
    }

    #[cfg(unix)]
    #[test]
    fn relative_save_is_joined_onto_output_dir() {
        let dir = Path::new("/ws/r1");
        let out = substitute("save \"out.nii.gz\" img", &case(), dir, &layers()).unwrap();
        assert_eq!(out, "save \"/ws/r1/out.nii.gz\" img");

        let out = substitute("save  \"/abs/out.nii.gz\" img", &case(), dir, &layers()).unwrap();
        assert_eq!(out, "save \"/ws/r1/abs/out.nii.gz\" img");
    }

    #[cfg(unix)]
    #[test]
    fn output_dir_tokens_are_spliced() {
        for token in ["${OUTPUT_DIR}", "$OUTPUT_DIR", "${OUTPUTDIR}", "$OUTPUTDIR"] {
            let script = format!("save \"{token}\\mask.nii.gz\" m");
            let out = substitute(&script, &case(), Path::new("/ws/r1"), &layers()).unwrap();
            assert_eq!(out, "save \"/ws/r1/mask.nii.gz\" m", "token {token}");
        }
    }

    #[test]
    fn parent_components_cannot_escape() {
        let err = substitute("save \"../../etc/x\" m", &case(), Path::new("/ws/r1"), &layers())
            .unwrap_err();
        assert!(matches!(err, TemplateError::PathEscapesOutput { .. }));
    }

    #[test]
    fn parent_components_after_output_token_cannot_escape() {
        for script in [
            "save \"$OUTPUT_DIR/../../escape.nii.gz\" m",
            "save \"${OUTPUT_DIR}\\..\\escape.nii.gz\" m",
        ] {
            let err = substitute(script, &case(), Path::new("/ws/w/c/r"), &layers()).unwrap_err();
            assert!(
                matches!(err, TemplateError::PathEscapesOutput { .. }),
                "accepted {script}"
            );
        }
    }

    #[test]
    fn text_outside_save_statements_is_untouched() {
        let script = "// save nothing here\nlet x = 1\nprint \"x\" x";
        let out = substitute(script, &case(), Path::new("/ws/r1"), &layers()).unwrap();
        assert_eq!(out, script);
    }
}
