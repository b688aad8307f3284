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
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashing::{Digest, EMPTY_DIGEST};
use parking_lot::Mutex;

pub mod memory;


///
/// A single blob fetch failure.
///
/// Failures travel as `Arc<FetchError>` so that one underlying failure shared by several
/// requests (an interned fetch feeding many destinations) keeps its identity through
/// aggregation.
///
#[derive(Debug)]
pub enum FetchError {
    /// The store holds no blob for the digest.
    NotFound(Digest),
    /// The transport failed to deliver the blob.
    Transport(String),
    /// Local filesystem failure while landing fetched bytes.
    Io(io::Error),
    /// The fetch observed an interrupt before completing.
    Interrupted,
}

impl FetchError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, FetchError::Interrupted)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound(digest) => write!(
                f,
                "Blob not found: {} ({} bytes)",
                digest.hash, digest.size_bytes
            ),
            FetchError::Transport(msg) => write!(f, "{msg}"),
            FetchError::Io(err) => write!(f, "{err}"),
            FetchError::Interrupted => write!(f, "Fetch interrupted"),
        }
    }
}

impl std::error::Error for FetchError {}

///
/// An abstract source of blob bytes, addressed by digest.
///
/// The transport (and any retry policy) lives behind this trait; `memory::Provider` backs the
/// test suites.
///
#[async_trait]
pub trait ByteStoreProvider: Send + Sync + 'static {
    /// Load the blob for `digest` into memory.
    async fn load(&self, digest: Digest) -> Result<Bytes, Arc<FetchError>>;
}

/// Running totals of provider fetches made through a `ByteStore`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FetchCounts {
    pub succeeded: usize,
    pub failed: usize,
}

type InternedFetch = Shared<BoxFuture<'static, Result<Bytes, Arc<FetchError>>>>;

///
/// A content-addressed byte store client.
///
/// Fetches are interned per digest: concurrent and repeated loads of one digest subscribe to a
/// single provider fetch, which is what bounds a digest appearing at many output paths to one
/// round trip. Completed fetches stay interned for the life of the store, which is scoped to
/// one build invocation.
///
#[derive(Clone)]
pub struct ByteStore {
    provider: Arc<dyn ByteStoreProvider>,
    fetches: Arc<Mutex<HashMap<Digest, InternedFetch>>>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl fmt::Debug for ByteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteStore(fetches={:?})", self.fetch_counts())
    }
}

impl ByteStore {
    pub fn new(provider: Arc<dyn ByteStoreProvider>) -> ByteStore {
        ByteStore {
            provider,
            fetches: Arc::new(Mutex::new(HashMap::new())),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Load the blob for `digest` into memory.
    pub async fn load_bytes(&self, digest: Digest) -> Result<Bytes, Arc<FetchError>> {
        if digest == EMPTY_DIGEST {
            // The empty blob needs no round trip.
            return Ok(Bytes::new());
        }

        let fetch = {
            let mut fetches = self.fetches.lock();
            fetches
                .entry(digest)
                .or_insert_with(|| {
                    let provider = self.provider.clone();
                    let succeeded = self.succeeded.clone();
                    let failed = self.failed.clone();
                    async move {
                        let result = provider.load(digest).await;
                        let counter = if result.is_ok() { &succeeded } else { &failed };
                        counter.fetch_add(1, Ordering::SeqCst);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        fetch.await
    }

    ///
    /// Fetch the blob for `digest` and write it to `destination` with `is_executable` applied.
    ///
    /// Bytes land in a temporary sibling and are renamed into place, so a failed or interrupted
    /// fetch never leaves a partial file at `destination`.
    ///
    pub async fn load_file(
        &self,
        digest: Digest,
        destination: PathBuf,
        is_executable: bool,
    ) -> Result<(), Arc<FetchError>> {
        let bytes = self.load_bytes(digest).await?;
        tokio::task::spawn_blocking(move || write_file_atomic(&destination, &bytes, is_executable))
            .await
            .map_err(|e| {
                Arc::new(FetchError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("writer task failed: {e}"),
                )))
            })?
            .map_err(|e| Arc::new(FetchError::Io(e)))
    }

    pub fn fetch_counts(&self) -> FetchCounts {
        FetchCounts {
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

///
/// Write `bytes` at `destination` via a temporary sibling and an atomic rename, applying the
/// 0o755/0o644 mode per `is_executable`. An existing file at `destination` is replaced.
///
pub fn write_file_atomic(destination: &Path, bytes: &[u8], is_executable: bool) -> io::Result<()> {
    let parent = destination.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{} has no parent directory", destination.display()),
        )
    })?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut temp, bytes)?;
    let mode = if is_executable { 0o755 } else { 0o644 };
    temp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;
    temp.persist(destination).map_err(|e| e.error)?;
    Ok(())
}
