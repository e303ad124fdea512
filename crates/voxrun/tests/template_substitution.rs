// Test module - relaxed lint rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Templating against a real dataset tree.

use std::path::Path;

use voxrun::datasets::DatasetLayers;
use voxrun::template::{substitute, TemplateError};
use voxrun::Case;
use voxrun_fixtures::{temp_dir, write_dataset_case};

#[test]
fn placeholders_become_existing_absolute_paths() {
    let root = temp_dir("template-layers");
    write_dataset_case(&root, "brats", "p01", &["flair", "t1ce", "seg"]);
    let resolver = DatasetLayers::new(&root);
    let case = Case::in_dataset("brats", "p01");
    let out_dir = root.join("out");

    let script = "load a = \"${LAYER_PATH:flair}\"\nload b = \"${LAYER_PATH:seg}\"\n";
    let out = substitute(script, &case, &out_dir, &resolver).unwrap();

    assert!(!out.contains("${LAYER_PATH"));
    for line in out.lines() {
        let path = line.split('"').nth(1).unwrap();
        assert!(Path::new(path).is_absolute(), "not absolute: {path}");
        assert!(Path::new(path).is_file(), "missing: {path}");
    }
}

#[test]
fn missing_case_directory_is_a_template_error() {
    let root = temp_dir("template-missing");
    let resolver = DatasetLayers::new(&root);
    let case = Case::in_dataset("brats", "ghost");
    let err = substitute("${LAYER_PATH:flair}", &case, &root, &resolver).unwrap_err();
    assert!(matches!(err, TemplateError::Layers(_)));
}

#[test]
fn full_script_binds_inputs_and_outputs() {
    let root = temp_dir("template-full");
    write_dataset_case(&root, "brats", "p02", &["flair"]);
    let resolver = DatasetLayers::new(&root);
    let case = Case::in_dataset("brats", "p02");
    let out_dir = root.join("workspaces").join("ws").join("p02").join("run");

    let script = concat!(
        "load img = \"${LAYER_PATH:flair}\"\n",
        "let mask = intensity(img) > 0.5\n",
        "save \"mask.nii.gz\" mask\n",
        "save \"${OUTPUT_DIR}/copy.nii.gz\" img\n",
    );
    let out = substitute(script, &case, &out_dir, &resolver).unwrap();

    assert!(out.contains("let mask = intensity(img) > 0.5"));
    assert!(out.contains(&format!(
        "save \"{}\" mask",
        out_dir.join("mask.nii.gz").display()
    )));
    assert!(out.contains(&format!(
        "save \"{}\" img",
        out_dir.join("copy.nii.gz").display()
    )));
}
