//! Workspace provisioning core for a CTF-style teaching platform.
//!
//! `dojod` turns an authenticated "start this challenge" request into a
//! running, isolated workspace container: it tracks the asynchronous start
//! as a job in a shared cache, builds and starts the container, installs
//! challenge material and a per-user flag, waits for the in-container init
//! process to signal readiness, and publishes a signed URL through which
//! the user's browser reaches the workspace.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod engine;
pub mod events;
pub mod flag;
pub mod jobs;
pub mod provision;
pub mod server;
