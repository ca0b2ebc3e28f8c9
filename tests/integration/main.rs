//! Integration tests driving the reconcilers against the in-memory store.
//!
//! Each submodule tests one controller. The shared fixtures and helpers live
//! in `common.rs`. There is no executor, so Workspace progress is faked by
//! writing its status directly.
//!
//! Run with: `cargo test --test integration`

mod common;

mod apply_request;
mod machine_deployment;
mod machine_set;
