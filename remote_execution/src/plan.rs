// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use fs::RelativePath;
use hashing::Digest;
use remexec::{require_digest, ActionResult};

use crate::{
    MaterializeError, RemoteAction, RemoteOutputsMode, RemoteOutputsOptions,
    REMOTE_EXECUTION_INLINE_OUTPUTS,
};

/// One file blob to land on disk (or, for injections, to register as metadata).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileDownload {
    pub path: RelativePath,
    pub digest: Digest,
    pub is_executable: bool,
}

/// One symlink to materialize verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymlinkOutput {
    pub path: RelativePath,
    pub target: String,
}

/// One tree output. The manifest blob itself still needs fetching before expansion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeDownload {
    pub path: RelativePath,
    pub tree_digest: Digest,
}

///
/// The planner's product: the materialization mode resolved into per-output decisions up
/// front, so the downloader executes a uniform schedule. Paths are exec-root relative and
/// already validated.
///
#[derive(Clone, Debug, Default)]
pub struct DownloadPlan {
    pub files: Vec<FileDownload>,
    pub symlinks: Vec<SymlinkOutput>,
    pub trees: Vec<TreeDownload>,
    /// Non-empty stdout/stderr blobs. Zero-length streams stay cleared without a fetch.
    pub stdout: Option<Digest>,
    pub stderr: Option<Digest>,
    /// Outputs whose bytes must not land on disk: registered as metadata only.
    pub inject_files: Vec<FileDownload>,
    pub inject_trees: Vec<TreeDownload>,
    /// One output additionally fetched into memory and returned to the caller.
    pub inline: Option<FileDownload>,
}

///
/// Walk `result` and decide, per output, whether it downloads, injects, or returns inline.
///
/// Validation happens here, before any I/O: symlinks with absolute targets and wire paths that
/// escape the execution root short-circuit the whole action.
///
pub fn plan_downloads(
    action: &RemoteAction,
    result: &ActionResult,
    options: &RemoteOutputsOptions,
) -> Result<DownloadPlan, MaterializeError> {
    let mut plan = DownloadPlan::default();

    let relativize = |wire_path: &str| -> Result<RelativePath, MaterializeError> {
        action
            .layout
            .relativize(&action.exec_root, wire_path)
            .map_err(MaterializeError::InvalidOutputPath)
    };

    let inline_path = action
        .spawn
        .execution_info
        .get(REMOTE_EXECUTION_INLINE_OUTPUTS)
        .map(|path| relativize(path))
        .transpose()?;
    // An inline designation overrides the configured mode for the whole spawn.
    let mode = if inline_path.is_some() {
        RemoteOutputsMode::Minimal
    } else {
        options.mode
    };
    let downloads = |path: &RelativePath| -> bool {
        match mode {
            RemoteOutputsMode::All => true,
            RemoteOutputsMode::TopLevel => options.top_level_outputs.contains(path),
            RemoteOutputsMode::Minimal => false,
        }
    };

    // Symlinks materialize in every mode, and validate before anything is scheduled.
    for symlink in result
        .output_file_symlinks
        .iter()
        .chain(result.output_directory_symlinks.iter())
    {
        if symlink.target.starts_with('/') {
            return Err(MaterializeError::AbsoluteSymlinkTarget {
                wire_path: symlink.path.clone(),
                target: symlink.target.clone(),
            });
        }
        plan.symlinks.push(SymlinkOutput {
            path: relativize(&symlink.path)?,
            target: symlink.target.clone(),
        });
    }

    for file in &result.output_files {
        let path = relativize(&file.path)?;
        let digest =
            require_digest(file.digest.as_ref()).map_err(MaterializeError::MissingDigest)?;
        let download = FileDownload {
            path: path.clone(),
            digest,
            is_executable: file.is_executable,
        };
        if inline_path.as_ref() == Some(&path) {
            plan.inline = Some(download.clone());
        }
        if downloads(&path) {
            plan.files.push(download);
        } else {
            plan.inject_files.push(download);
        }
    }

    for directory in &result.output_directories {
        let path = relativize(&directory.path)?;
        let tree_digest =
            require_digest(directory.tree_digest.as_ref()).map_err(MaterializeError::MissingDigest)?;
        let download = TreeDownload { path, tree_digest };
        if downloads(&download.path) {
            plan.trees.push(download);
        } else {
            plan.inject_trees.push(download);
        }
    }

    // stdout/stderr download in every mode.
    plan.stdout = stream_digest(result.stdout_digest.as_ref())?;
    plan.stderr = stream_digest(result.stderr_digest.as_ref())?;

    Ok(plan)
}

fn stream_digest(wire: Option<&remexec::Digest>) -> Result<Option<Digest>, MaterializeError> {
    let digest = wire
        .map(Digest::try_from)
        .transpose()
        .map_err(MaterializeError::MissingDigest)?;
    Ok(digest.filter(|d| d.size_bytes > 0))
}
