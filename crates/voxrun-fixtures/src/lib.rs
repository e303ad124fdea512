//! Test fixtures for voxrun.
//!
//! Integration tests use `/bin/sh` as the analysis binary: the runner passes
//! the script path as the first argument, so the shell executes the
//! substituted script directly. [`FakeAnalysis`] writes such scripts.

#![allow(missing_docs)]

pub mod helpers;
pub mod script;

pub use helpers::{
    is_alive, read_pids, request_json, temp_dir, wait_until_gone, write_dataset_case,
    FAKE_BINARY, MISSING_BINARY,
};
pub use script::FakeAnalysis;
