//! Version-control abstraction for VaultSync.
//!
//! The sync engine only reasons about three outcomes of a pull or push:
//! success, conflict and transport failure. This crate defines the
//! [`VersionControlClient`] capability, a [`GitClient`] adapter that drives the
//! `git` executable, and a [`ScriptedClient`] for tests and dry runs.

pub mod client;
pub mod git;
pub mod scripted;

pub use client::VersionControlClient;
pub use git::GitClient;
pub use scripted::{ScriptedClient, VcsCall};
