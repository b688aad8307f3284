// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use remexec::MessageExt;

#[derive(Clone)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn foo() -> TestData {
        TestData::new("foo-contents")
    }

    pub fn bar() -> TestData {
        TestData::new("bar-contents")
    }

    pub fn qux() -> TestData {
        TestData::new("qux-contents")
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn bytes(&self) -> bytes::Bytes {
        bytes::Bytes::from(self.string.clone())
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(self.string.as_bytes())
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

/// A `FileNode` for `data`, ready to hang off a `Directory`.
pub fn file_node(name: &str, data: &TestData, is_executable: bool) -> remexec::FileNode {
    remexec::FileNode {
        name: name.to_owned(),
        digest: Some((&data.digest()).into()),
        is_executable,
    }
}

pub fn symlink_node(name: &str, target: &str) -> remexec::SymlinkNode {
    remexec::SymlinkNode {
        name: name.to_owned(),
        target: target.to_owned(),
    }
}

pub struct TestDirectory {
    directory: remexec::Directory,
}

impl TestDirectory {
    pub fn new(directory: remexec::Directory) -> TestDirectory {
        TestDirectory { directory }
    }

    pub fn empty() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory::default(),
        }
    }

    // Directory structure:
    //
    // /qux
    pub fn containing_qux() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory {
                files: vec![file_node("qux", &TestData::qux(), false)],
                ..Default::default()
            },
        }
    }

    // Directory structure:
    //
    // /qux (executable)
    pub fn containing_qux_executable() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory {
                files: vec![file_node("qux", &TestData::qux(), true)],
                ..Default::default()
            },
        }
    }

    /// A `DirectoryNode` naming this directory as a child.
    pub fn node(&self, name: &str) -> remexec::DirectoryNode {
        remexec::DirectoryNode {
            name: name.to_owned(),
            digest: Some((&self.digest()).into()),
        }
    }

    pub fn directory(&self) -> remexec::Directory {
        self.directory.clone()
    }

    pub fn bytes(&self) -> bytes::Bytes {
        self.directory.to_bytes()
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(&self.bytes())
    }
}

pub struct TestTree {
    tree: remexec::Tree,
}

impl TestTree {
    pub fn new(root: &TestDirectory, children: &[&TestDirectory]) -> TestTree {
        TestTree {
            tree: remexec::Tree {
                root: Some(root.directory()),
                children: children.iter().map(|c| c.directory()).collect(),
            },
        }
    }

    /// A tree of just `root`, with no children.
    pub fn from_root(root: &TestDirectory) -> TestTree {
        TestTree::new(root, &[])
    }

    pub fn tree(&self) -> remexec::Tree {
        self.tree.clone()
    }

    pub fn bytes(&self) -> bytes::Bytes {
        self.tree.to_bytes()
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(&self.bytes())
    }
}
