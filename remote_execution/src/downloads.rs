// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byte_store::{ByteStore, FetchError};
use bytes::Bytes;
use fs::safe_create_dir_all;
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use tempfile::NamedTempFile;

use crate::plan::{DownloadPlan, TreeDownload};
use crate::tree::{self, TreeContents};
use crate::{InMemoryOutput, MaterializeError, OutErr};

///
/// Aggregate of every fetch failure behind a failed materialization.
///
/// The first failure is the primary cause; the rest attach as suppressed. Suppression is keyed
/// by pointer identity of the underlying error, so one failure fanned out to several requests
/// is reported once.
///
#[derive(Debug)]
pub struct BulkTransferError {
    primary: Arc<FetchError>,
    suppressed: Vec<Arc<FetchError>>,
}

impl BulkTransferError {
    pub(crate) fn new(primary: Arc<FetchError>) -> BulkTransferError {
        BulkTransferError {
            primary,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn attach(&mut self, error: Arc<FetchError>) {
        let already_held = Arc::ptr_eq(&self.primary, &error)
            || self.suppressed.iter().any(|e| Arc::ptr_eq(e, &error));
        if !already_held {
            self.suppressed.push(error);
        }
    }

    pub fn primary(&self) -> &FetchError {
        &self.primary
    }

    pub fn suppressed(&self) -> &[Arc<FetchError>] {
        &self.suppressed
    }
}

impl fmt::Display for BulkTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (and {} further failures)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for BulkTransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.primary.as_ref())
    }
}

/// One settled fetch's failure.
enum Failure {
    Fetch(Arc<FetchError>),
    MalformedTree(String),
}

/// What one settled fetch produced.
enum Fetched {
    File(StagedFile),
    Symlinks(Vec<(PathBuf, String)>),
    Stdout(Bytes),
    Stderr(Bytes),
    Inline(InMemoryOutput),
    TreeMetadata(fs::RelativePath, TreeContents),
}

type TaskResult = (Vec<Fetched>, Vec<Failure>);

pub(crate) struct DownloadedOutputs {
    pub inline: Option<InMemoryOutput>,
    /// Expansions of the inject-only trees, for the metadata post-pass.
    pub injected_trees: Vec<(fs::RelativePath, TreeContents)>,
}

///
/// A file staged beside its destination. Committed (renamed into place, with the executable
/// bit applied) only once every fetch in the action has succeeded; dropping it erases the temp.
///
struct StagedFile {
    destination: PathBuf,
    temp: NamedTempFile,
    is_executable: bool,
}

impl StagedFile {
    fn commit(self) -> io::Result<()> {
        let mode = if self.is_executable { 0o755 } else { 0o644 };
        self.temp
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
        self.temp.persist(&self.destination).map_err(|e| e.error)?;
        Ok(())
    }
}

pub(crate) fn io_failure(message: String) -> MaterializeError {
    MaterializeError::BulkTransfer(BulkTransferError::new(Arc::new(FetchError::Io(
        io::Error::new(io::ErrorKind::Other, message),
    ))))
}

///
/// Execute `plan`: materialize every selected output under `exec_root`, or fail with an error
/// carrying every underlying cause.
///
/// Launches every fetch, waits for all of them to settle (a failed fetch never cancels its
/// siblings), and only then either commits the staged files, symlinks and streams, or discards
/// the staged state. Directories created for tree outputs are retained on failure; recovery
/// semantics are the caller's concern.
///
pub(crate) async fn download_outputs(
    store: &ByteStore,
    exec_root: &Path,
    plan: &DownloadPlan,
    out_err: &OutErr,
) -> Result<DownloadedOutputs, MaterializeError> {
    // Parent directories exist before any fetch is issued, so staged temps always have a home.
    for path in plan
        .files
        .iter()
        .map(|f| &f.path)
        .chain(plan.symlinks.iter().map(|s| &s.path))
    {
        if let Some(parent) = exec_root.join(path).parent() {
            safe_create_dir_all(parent).map_err(io_failure)?;
        }
    }

    // Launch phase.
    let mut tasks: Vec<BoxFuture<'static, TaskResult>> = Vec::new();

    for file in &plan.files {
        let store = store.clone();
        let destination = exec_root.join(&file.path);
        let (digest, is_executable) = (file.digest, file.is_executable);
        tasks.push(
            async move {
                match fetch_file(&store, destination, digest, is_executable).await {
                    Ok(staged) => (vec![Fetched::File(staged)], vec![]),
                    Err(failure) => (vec![], vec![failure]),
                }
            }
            .boxed(),
        );
    }

    for download in &plan.trees {
        let store = store.clone();
        let exec_root = exec_root.to_path_buf();
        let download = download.clone();
        tasks.push(async move { fetch_tree(&store, &exec_root, &download).await }.boxed());
    }

    for download in &plan.inject_trees {
        let store = store.clone();
        let download = download.clone();
        tasks.push(
            async move {
                match expand_manifest(&store, download.tree_digest).await {
                    Ok(contents) => (
                        vec![Fetched::TreeMetadata(download.path.clone(), contents)],
                        vec![],
                    ),
                    Err(failure) => (vec![], vec![failure]),
                }
            }
            .boxed(),
        );
    }

    if let Some(digest) = plan.stdout {
        let store = store.clone();
        tasks.push(
            async move {
                match store.load_bytes(digest).await {
                    Ok(bytes) => (vec![Fetched::Stdout(bytes)], vec![]),
                    Err(error) => (vec![], vec![Failure::Fetch(error)]),
                }
            }
            .boxed(),
        );
    }
    if let Some(digest) = plan.stderr {
        let store = store.clone();
        tasks.push(
            async move {
                match store.load_bytes(digest).await {
                    Ok(bytes) => (vec![Fetched::Stderr(bytes)], vec![]),
                    Err(error) => (vec![], vec![Failure::Fetch(error)]),
                }
            }
            .boxed(),
        );
    }

    if let Some(inline) = &plan.inline {
        let store = store.clone();
        let inline = inline.clone();
        tasks.push(
            async move {
                match store.load_bytes(inline.digest).await {
                    Ok(contents) => (
                        vec![Fetched::Inline(InMemoryOutput {
                            path: inline.path.clone(),
                            contents,
                        })],
                        vec![],
                    ),
                    Err(error) => (vec![], vec![Failure::Fetch(error)]),
                }
            }
            .boxed(),
        );
    }

    // Join phase: every launched fetch settles before anything is judged, so no work is
    // outstanding once this call returns.
    let settled = futures::future::join_all(tasks).await;
    let mut fetched = Vec::new();
    let mut failures = Vec::new();
    for (mut products, mut errors) in settled {
        fetched.append(&mut products);
        failures.append(&mut errors);
    }

    if !failures.is_empty() {
        debug!(
            "discarding staged outputs: {} of the action's fetches failed",
            failures.len()
        );
        // Dropping `fetched` erases the staged temps; directories created for trees remain.
        return Err(aggregate(failures));
    }

    // Commit phase: rename staged files into place, then create symlinks and write streams.
    let mut outputs = DownloadedOutputs {
        inline: None,
        injected_trees: Vec::new(),
    };
    let mut symlinks: Vec<(PathBuf, String)> = plan
        .symlinks
        .iter()
        .map(|s| (exec_root.join(&s.path), s.target.clone()))
        .collect();
    for item in fetched {
        match item {
            Fetched::File(staged) => {
                let destination = staged.destination.clone();
                staged.commit().map_err(|e| {
                    io_failure(format!("Failed to move {destination:?} into place: {e}"))
                })?;
            }
            Fetched::Symlinks(mut links) => symlinks.append(&mut links),
            Fetched::Stdout(bytes) => write_stream(&out_err.stdout, &bytes)?,
            Fetched::Stderr(bytes) => write_stream(&out_err.stderr, &bytes)?,
            Fetched::Inline(output) => outputs.inline = Some(output),
            Fetched::TreeMetadata(path, contents) => outputs.injected_trees.push((path, contents)),
        }
    }
    for (path, target) in symlinks {
        create_symlink(&path, &target)
            .map_err(|e| io_failure(format!("Failed to create symlink {path:?}: {e}")))?;
    }

    Ok(outputs)
}

/// Collapse per-fetch failures into the action-level error.
fn aggregate(failures: Vec<Failure>) -> MaterializeError {
    // An interrupt wins over transfer errors, and is reported once however many fetches saw it.
    let interrupted = failures
        .iter()
        .any(|f| matches!(f, Failure::Fetch(e) if e.is_interrupt()));
    if interrupted {
        return MaterializeError::Interrupted;
    }

    // A malformed manifest is fatal in its own right.
    let malformed = failures.iter().find_map(|f| match f {
        Failure::MalformedTree(message) => Some(message.clone()),
        Failure::Fetch(_) => None,
    });
    if let Some(message) = malformed {
        return MaterializeError::MalformedTree(message);
    }

    let mut causes = failures.into_iter().map(|f| match f {
        Failure::Fetch(error) => error,
        Failure::MalformedTree(_) => unreachable!("handled above"),
    });
    let mut error = BulkTransferError::new(causes.next().expect("aggregate of no failures"));
    for cause in causes {
        error.attach(cause);
    }
    MaterializeError::BulkTransfer(error)
}

async fn fetch_file(
    store: &ByteStore,
    destination: PathBuf,
    digest: hashing::Digest,
    is_executable: bool,
) -> Result<StagedFile, Failure> {
    let bytes = store.load_bytes(digest).await.map_err(Failure::Fetch)?;
    stage_file(destination, bytes, is_executable)
        .await
        .map_err(|e| Failure::Fetch(Arc::new(FetchError::Io(e))))
}

/// Write `bytes` to a temp sibling of `destination`, leaving the rename for the commit phase.
async fn stage_file(
    destination: PathBuf,
    bytes: Bytes,
    is_executable: bool,
) -> io::Result<StagedFile> {
    tokio::task::spawn_blocking(move || {
        let parent = destination.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("{} has no parent directory", destination.display()),
            )
        })?;
        let mut temp = NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut temp, &bytes)?;
        Ok(StagedFile {
            destination,
            temp,
            is_executable,
        })
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("staging task failed: {e}")))?
}

///
/// Materialize one tree output: create its root (even an empty tree owns its root directory),
/// fetch and expand the manifest, create the expanded directories, then fetch every file into a
/// staged temp. Inner fetches settle independently; a failed file does not cancel its siblings.
///
async fn fetch_tree(store: &ByteStore, exec_root: &Path, download: &TreeDownload) -> TaskResult {
    let root = exec_root.join(&download.path);
    if let Err(message) = safe_create_dir_all(&root) {
        return (
            vec![],
            vec![Failure::Fetch(Arc::new(FetchError::Io(io::Error::new(
                io::ErrorKind::Other,
                message,
            ))))],
        );
    }

    let contents = match expand_manifest(store, download.tree_digest).await {
        Ok(contents) => contents,
        Err(failure) => return (vec![], vec![failure]),
    };

    for directory in &contents.directories {
        if let Err(message) = safe_create_dir_all(&root.join(directory)) {
            return (
                vec![],
                vec![Failure::Fetch(Arc::new(FetchError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    message,
                ))))],
            );
        }
    }

    let inner = futures::future::join_all(contents.files.iter().map(|file| {
        fetch_file(
            store,
            root.join(&file.path),
            file.digest,
            file.is_executable,
        )
    }))
    .await;

    let mut fetched = Vec::new();
    let mut failures = Vec::new();
    for result in inner {
        match result {
            Ok(staged) => fetched.push(Fetched::File(staged)),
            Err(failure) => failures.push(failure),
        }
    }
    fetched.push(Fetched::Symlinks(
        contents
            .symlinks
            .iter()
            .map(|s| (root.join(&s.path), s.target.clone()))
            .collect(),
    ));
    (fetched, failures)
}

async fn expand_manifest(
    store: &ByteStore,
    tree_digest: hashing::Digest,
) -> Result<TreeContents, Failure> {
    let bytes = store.load_bytes(tree_digest).await.map_err(Failure::Fetch)?;
    tree::expand_tree(&bytes).map_err(|e| match e {
        MaterializeError::MalformedTree(message) => Failure::MalformedTree(message),
        other => Failure::MalformedTree(other.to_string()),
    })
}

fn write_stream(destination: &Path, bytes: &[u8]) -> Result<(), MaterializeError> {
    if let Some(parent) = destination.parent() {
        safe_create_dir_all(parent).map_err(io_failure)?;
    }
    byte_store::write_file_atomic(destination, bytes, false)
        .map_err(|e| io_failure(format!("Failed to write {destination:?}: {e}")))
}

fn create_symlink(destination: &Path, target: &str) -> io::Result<()> {
    match std::fs::remove_file(destination) {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, destination)
}
