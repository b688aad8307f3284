// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{HashMap, VecDeque};

use fs::RelativePath;
use hashing::Digest;
use prost::Message;
use remexec::{Directory, MessageExt, Tree};

use crate::MaterializeError;

/// One file within an expanded tree, relative to the tree root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeFile {
    pub path: RelativePath,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeSymlink {
    pub path: RelativePath,
    pub target: String,
}

///
/// A `Tree` manifest flattened into the entries to materialize under its root.
///
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeContents {
    pub files: Vec<TreeFile>,
    pub symlinks: Vec<TreeSymlink>,
    /// Every directory in the walk, the root included. A directory with no children still
    /// needs to exist on disk.
    pub directories: Vec<RelativePath>,
}

///
/// Expand an encoded `Tree` manifest breadth-first.
///
/// Child directories are indexed by the digest of their canonical encoding. The same child
/// digest may legally appear more than once (shared subdirectories); duplicates collapse in the
/// index, since content-addressing makes them byte-identical. References are by content hash,
/// so cycles are impossible; sibling duplicates expand independently, each to its own path.
///
pub fn expand_tree(tree_bytes: &[u8]) -> Result<TreeContents, MaterializeError> {
    let tree = Tree::decode(tree_bytes)
        .map_err(|e| MaterializeError::MalformedTree(format!("failed to decode manifest: {e}")))?;
    let root = tree
        .root
        .as_ref()
        .ok_or_else(|| MaterializeError::MalformedTree("manifest has no root".to_owned()))?;

    let mut children_by_digest: HashMap<Digest, &Directory> = HashMap::new();
    for child in &tree.children {
        children_by_digest.insert(Digest::of_bytes(&child.to_bytes()), child);
    }

    let malformed = MaterializeError::MalformedTree;
    let mut contents = TreeContents::default();
    let mut to_visit: VecDeque<(RelativePath, &Directory)> = VecDeque::new();
    to_visit.push_back((RelativePath::empty(), root));

    while let Some((prefix, directory)) = to_visit.pop_front() {
        contents.directories.push(prefix.clone());

        for file in &directory.files {
            let digest = remexec::require_digest(file.digest.as_ref()).map_err(malformed)?;
            let path = prefix.join(RelativePath::new(&file.name).map_err(malformed)?);
            contents.files.push(TreeFile {
                path,
                digest,
                is_executable: file.is_executable,
            });
        }

        for symlink in &directory.symlinks {
            let path = prefix.join(RelativePath::new(&symlink.name).map_err(malformed)?);
            contents.symlinks.push(TreeSymlink {
                path,
                target: symlink.target.clone(),
            });
        }

        for dir_node in &directory.directories {
            let digest = remexec::require_digest(dir_node.digest.as_ref()).map_err(malformed)?;
            let child = children_by_digest.get(&digest).copied().ok_or_else(|| {
                MaterializeError::MalformedTree(format!(
                    "manifest does not carry child directory {} (digest {})",
                    dir_node.name, digest.hash
                ))
            })?;
            let path = prefix.join(RelativePath::new(&dir_node.name).map_err(malformed)?);
            to_visit.push_back((path, child));
        }
    }

    Ok(contents)
}
