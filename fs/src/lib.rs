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

use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

///
/// A normalized root-relative path.
///
/// Wire paths arrive as forward-slash POSIX strings; parsing them through `RelativePath` is
/// what keeps every materialized output inside the execution root. `.` segments drop out,
/// `..` segments unwind within the path, and anything absolute or unwinding past the root is
/// refused.
///
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let candidate = path.as_ref();
        let mut segments: Vec<&OsStr> = Vec::new();
        for component in candidate.components() {
            match component {
                Component::Normal(segment) => segments.push(segment),
                Component::CurDir => {}
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(format!("Path {candidate:?} would escape its root"));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!(
                        "Path {candidate:?} is absolute; only root-relative paths are accepted"
                    ));
                }
            }
        }
        Ok(RelativePath(segments.into_iter().collect()))
    }

    pub fn join(&self, other: RelativePath) -> RelativePath {
        RelativePath(self.0.join(other.0))
    }

    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<RelativePath> for PathBuf {
    fn from(path: RelativePath) -> PathBuf {
        path.0
    }
}

///
/// Create `path` and any missing ancestors, walking root-to-leaf.
///
/// Unlike `std::fs::create_dir_all`, a directory appearing concurrently (another thread or
/// process materializing a sibling output) is not an error at any level.
///
pub fn safe_create_dir_all(path: &Path) -> Result<(), String> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        // Only named segments need creating; the root and dot components already exist.
        if let Component::Normal(_) = component {
            match std::fs::create_dir(&current) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(format!("Failed to create directory {current:?}: {e}")),
            }
        }
    }
    Ok(())
}
