//! voxrun: run orchestration for VoxLogicA spatial-logic analyses.
//!
//! A run request pairs one analysis script with a set of dataset cases. For
//! every case the script is bound to the case's image layers and to a fresh
//! run directory, the VoxLogicA binary is executed under a timeout, and the
//! outcome is persisted as `run.json` inside
//! `<workspaces>/<workspace>/<case>/<run>/`.

#![forbid(unsafe_code)]
// Public API types have docs; internal helpers are documented where the
// behavior is not obvious from the signature.
#![allow(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod datasets;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod runner;
pub mod server;
pub mod store;
pub mod template;

pub use crate::model::*;
