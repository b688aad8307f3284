// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};

use fs::RelativePath;

///
/// How wire paths map onto the local execution root. Pure mapping; no I/O.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputLayout {
    /// Wire paths are relative to the execution root.
    Default,
    /// Wire paths carry a leading workspace segment naming the execution root, which is
    /// stripped when present: `execroot/outputs/foo` lands at `<exec_root>/outputs/foo`.
    SiblingRepository,
}

impl OutputLayout {
    /// The exec-root-relative form of `wire_path`.
    pub fn relativize(&self, exec_root: &Path, wire_path: &str) -> Result<RelativePath, String> {
        let stripped = match self {
            OutputLayout::Default => wire_path,
            OutputLayout::SiblingRepository => {
                let workspace = exec_root.file_name().and_then(|n| n.to_str()).unwrap_or("");
                match wire_path.split_once('/') {
                    Some((first, rest)) if first == workspace => rest,
                    _ => wire_path,
                }
            }
        };
        RelativePath::new(stripped)
    }

    /// Where `wire_path` lands under `exec_root`.
    pub fn resolve(&self, exec_root: &Path, wire_path: &str) -> Result<PathBuf, String> {
        Ok(exec_root.join(self.relativize(exec_root, wire_path)?))
    }
}
