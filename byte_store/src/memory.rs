// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;

use crate::{ByteStoreProvider, FetchError};

///
/// An in-memory `ByteStoreProvider`.
///
/// Backs the test suites: holds blobs in a map, counts requests per digest, and can be primed
/// to fail particular digests with a caller-supplied error instance (the same `Arc` is handed
/// back on every request, so error-identity aggregation is exercisable).
///
pub struct Provider {
    blobs: Mutex<HashMap<Fingerprint, Bytes>>,
    errors: Mutex<HashMap<Fingerprint, Arc<FetchError>>>,
    request_counts: Mutex<HashMap<Fingerprint, usize>>,
}

impl Provider {
    pub fn new() -> Provider {
        Provider {
            blobs: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            request_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `bytes`, keyed by their own digest, and return that digest.
    pub fn add(&self, bytes: Bytes) -> Digest {
        let digest = Digest::of_bytes(&bytes);
        self.blobs.lock().insert(digest.hash, bytes);
        digest
    }

    /// Insert content under an arbitrary digest, without verification.
    pub fn insert(&self, digest: Digest, bytes: Bytes) {
        self.blobs.lock().insert(digest.hash, bytes);
    }

    /// All subsequent loads of `digest` fail with (shared clones of) exactly `error`.
    pub fn error_for(&self, digest: Digest, error: Arc<FetchError>) {
        self.errors.lock().insert(digest.hash, error);
    }

    pub fn request_count(&self, digest: Digest) -> usize {
        *self.request_counts.lock().get(&digest.hash).unwrap_or(&0)
    }
}

#[async_trait]
impl ByteStoreProvider for Provider {
    async fn load(&self, digest: Digest) -> Result<Bytes, Arc<FetchError>> {
        *self.request_counts.lock().entry(digest.hash).or_insert(0) += 1;

        if let Some(error) = self.errors.lock().get(&digest.hash) {
            return Err(error.clone());
        }
        match self.blobs.lock().get(&digest.hash) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(Arc::new(FetchError::NotFound(digest))),
        }
    }
}
