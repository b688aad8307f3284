// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use byte_store::{ByteStore, FetchError};
use bytes::Bytes;
use fs::RelativePath;
use hashing::{Digest, Hasher};
use log::debug;
use remexec::ActionResult;

mod downloads;
mod inject;
mod layout;
mod plan;
mod tree;

pub use crate::downloads::BulkTransferError;
pub use crate::layout::OutputLayout;
pub use crate::plan::{plan_downloads, DownloadPlan, FileDownload, SymlinkOutput, TreeDownload};
pub use crate::tree::{expand_tree, TreeContents, TreeFile, TreeSymlink};

#[cfg(test)]
mod tree_tests;

///
/// Execution-info key naming one output path whose bytes are fetched into memory and returned
/// to the caller instead of landing on disk.
///
pub const REMOTE_EXECUTION_INLINE_OUTPUTS: &str = "REMOTE_EXECUTION_INLINE_OUTPUTS";

/// Version stamped into injected metadata records.
pub const METADATA_LOCATOR_VERSION: u32 = 1;

///
/// Which outputs of a remote action land on disk, as opposed to being registered with the
/// build graph as metadata only.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum RemoteOutputsMode {
    /// Download every output.
    All,
    /// Download only outputs declared top-level by the build; inject the rest.
    TopLevel,
    /// Inject everything; nothing lands on disk.
    Minimal,
}

#[derive(Clone, Debug)]
pub struct RemoteOutputsOptions {
    pub mode: RemoteOutputsMode,
    /// Consulted only in top-level mode.
    pub top_level_outputs: HashSet<RelativePath>,
}

impl Default for RemoteOutputsOptions {
    fn default() -> Self {
        RemoteOutputsOptions {
            mode: RemoteOutputsMode::All,
            top_level_outputs: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Spawn {
    /// Human-readable description; also the basis of the action identifier.
    pub description: String,
    /// Declared outputs, relative to the execution root.
    pub output_paths: Vec<RelativePath>,
    /// Per-spawn execution-info keys (e.g. `REMOTE_EXECUTION_INLINE_OUTPUTS`).
    pub execution_info: BTreeMap<String, String>,
}

///
/// A spawn bound to the location its outputs materialize into. Immutable once built; the
/// `action_id` is stamped into injected metadata so downstream consumers can tie a remote file
/// back to the producing action.
///
#[derive(Clone, Debug)]
pub struct RemoteAction {
    pub action_id: String,
    pub exec_root: PathBuf,
    pub layout: OutputLayout,
    pub spawn: Spawn,
}

/// An output returned to the caller in memory rather than (only) on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InMemoryOutput {
    pub path: RelativePath,
    pub contents: Bytes,
}

/// Record registered with the build graph in lieu of a downloaded file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFileMetadata {
    pub digest: Digest,
    pub locator_version: u32,
    pub action_id: String,
}

impl RemoteFileMetadata {
    pub fn new(digest: Digest, action_id: &str) -> RemoteFileMetadata {
        RemoteFileMetadata {
            digest,
            locator_version: METADATA_LOCATOR_VERSION,
            action_id: action_id.to_owned(),
        }
    }
}

/// Record registered for a tree output that stayed off disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTreeMetadata {
    /// Expanded files, keyed by path relative to the tree root.
    pub children: Vec<(RelativePath, RemoteFileMetadata)>,
}

///
/// The build graph's metadata store, as consumed by this crate. Called only after all
/// downloads have settled, so per-action the calls are serialized.
///
pub trait MetadataInjector: Send + Sync {
    fn inject_file(&self, output: &RelativePath, metadata: RemoteFileMetadata);
    fn inject_tree(&self, output: &RelativePath, tree: RemoteTreeMetadata);
}

/// Child stdout/stderr destinations owned by the spawn context.
#[derive(Clone, Debug)]
pub struct OutErr {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutErr {
    /// Drop any prior contents. The destinations remain writable afterwards.
    pub fn clear(&self) -> io::Result<()> {
        for path in [&self.stdout, &self.stderr] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The surrounding spawn machinery, as consumed by this crate.
pub trait SpawnContext: Send + Sync {
    /// The child stdout/stderr destinations for this action.
    fn out_err(&self) -> OutErr;
    /// Advisory claim that output materialization completed. Taken only on success.
    fn lock_output_files(&self);
    fn metadata_injector(&self) -> &dyn MetadataInjector;
}

/// Why materializing an action's outputs failed.
#[derive(Debug)]
pub enum MaterializeError {
    /// A symlink in the `ActionResult` had an absolute target; nothing was fetched.
    AbsoluteSymlinkTarget { wire_path: String, target: String },
    /// An output wire path did not resolve to a location inside the execution root.
    InvalidOutputPath(String),
    /// The `ActionResult` omitted a digest it is required to carry.
    MissingDigest(String),
    /// A `Tree` manifest could not be decoded or did not carry a `Directory` it references.
    MalformedTree(String),
    /// One or more fetches failed; every cause is attached.
    BulkTransfer(BulkTransferError),
    /// The action was interrupted while fetches were outstanding.
    Interrupted,
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::AbsoluteSymlinkTarget { wire_path, target } => write!(
                f,
                "Symlink {wire_path} has an absolute target {target}, which is not supported"
            ),
            MaterializeError::InvalidOutputPath(msg) => write!(f, "{msg}"),
            MaterializeError::MissingDigest(msg) => write!(f, "{msg}"),
            MaterializeError::MalformedTree(msg) => write!(f, "Malformed tree: {msg}"),
            MaterializeError::BulkTransfer(err) => write!(f, "{err}"),
            MaterializeError::Interrupted => {
                write!(f, "Interrupted while downloading action outputs")
            }
        }
    }
}

impl std::error::Error for MaterializeError {}

///
/// The client half of remote execution: binds spawns to `RemoteAction`s and materializes
/// `ActionResult`s under the execution root per the configured materialization mode.
///
#[derive(Clone, Debug)]
pub struct RemoteExecutionService {
    store: ByteStore,
    options: RemoteOutputsOptions,
    layout: OutputLayout,
}

impl RemoteExecutionService {
    pub fn new(
        store: ByteStore,
        options: RemoteOutputsOptions,
        layout: OutputLayout,
    ) -> RemoteExecutionService {
        RemoteExecutionService {
            store,
            options,
            layout,
        }
    }

    pub fn store(&self) -> &ByteStore {
        &self.store
    }

    /// Bind `spawn` to the execution root its outputs will materialize under.
    pub fn build_remote_action(&self, spawn: Spawn, exec_root: PathBuf) -> RemoteAction {
        let mut hasher = Hasher::new();
        hasher.update(spawn.description.as_bytes());
        for path in &spawn.output_paths {
            hasher.update(b"\0");
            hasher.update(path.to_str().unwrap_or_default().as_bytes());
        }
        let action_id = hasher.finish().hash.to_hex();
        RemoteAction {
            action_id,
            exec_root,
            layout: self.layout.clone(),
            spawn,
        }
    }

    ///
    /// Materialize the outputs of `result` for `action`.
    ///
    /// Plans per the materialization mode, executes every fetch to settlement, and on success
    /// injects metadata for the outputs that stayed off disk and takes the output-tree lock via
    /// `context`. On any failure the lock is not taken and staged downloads are discarded;
    /// directories created for tree outputs are retained for diagnosis.
    ///
    /// Returns the designated in-memory output, when one was both requested via
    /// `REMOTE_EXECUTION_INLINE_OUTPUTS` and present in `result`.
    ///
    pub async fn download_outputs(
        &self,
        action: &RemoteAction,
        result: &ActionResult,
        context: &dyn SpawnContext,
    ) -> Result<Option<InMemoryOutput>, MaterializeError> {
        let plan = plan::plan_downloads(action, result, &self.options)?;

        let out_err = context.out_err();
        out_err.clear().map_err(|e| {
            MaterializeError::BulkTransfer(BulkTransferError::new(Arc::new(FetchError::Io(e))))
        })?;

        let downloaded =
            downloads::download_outputs(&self.store, &action.exec_root, &plan, &out_err).await?;

        inject::inject_metadata(
            action,
            &plan,
            &downloaded.injected_trees,
            context.metadata_injector(),
        );

        context.lock_output_files();
        debug!(
            "materialized outputs for action {}: {} file(s), {} tree(s), {} injected",
            action.action_id,
            plan.files.len(),
            plan.trees.len(),
            plan.inject_files.len() + plan.inject_trees.len(),
        );
        Ok(downloaded.inline)
    }
}
