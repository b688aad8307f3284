// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use fs::RelativePath;
use remexec::MessageExt;
use testutil::data::{file_node, symlink_node, TestData, TestDirectory, TestTree};

use crate::tree::expand_tree;
use crate::MaterializeError;

fn relative(path: &str) -> RelativePath {
    RelativePath::new(path).unwrap()
}

#[test]
fn empty_root_expands_to_just_the_root() {
    let tree = TestTree::from_root(&TestDirectory::empty());

    let contents = expand_tree(&tree.bytes()).unwrap();
    assert_eq!(contents.directories, vec![RelativePath::empty()]);
    assert!(contents.files.is_empty());
    assert!(contents.symlinks.is_empty());
}

#[test]
fn nested_directories_expand_breadth_first() {
    let wobble = TestDirectory::containing_qux();
    let root = TestDirectory::new(remexec::Directory {
        files: vec![file_node("qux", &TestData::qux(), true)],
        directories: vec![wobble.node("wobble")],
        ..Default::default()
    });
    let tree = TestTree::new(&root, &[&wobble]);

    let contents = expand_tree(&tree.bytes()).unwrap();
    assert_eq!(
        contents.directories,
        vec![RelativePath::empty(), relative("wobble")]
    );
    let mut files = contents
        .files
        .iter()
        .map(|f| (f.path.clone(), f.is_executable))
        .collect::<Vec<_>>();
    files.sort();
    assert_eq!(
        files,
        vec![(relative("qux"), true), (relative("wobble/qux"), false)]
    );
    for file in &contents.files {
        assert_eq!(file.digest, TestData::qux().digest());
    }
}

#[test]
fn shared_child_digests_expand_to_distinct_paths() {
    // foo/ is referenced both at the root and under bar/, and listed twice among the
    // children.
    let foo = TestDirectory::new(remexec::Directory {
        files: vec![file_node("file", &TestData::foo(), false)],
        ..Default::default()
    });
    let bar = TestDirectory::new(remexec::Directory {
        directories: vec![foo.node("foo")],
        ..Default::default()
    });
    let root = TestDirectory::new(remexec::Directory {
        directories: vec![bar.node("bar"), foo.node("foo")],
        ..Default::default()
    });
    let tree = TestTree::new(&root, &[&foo, &bar, &foo]);

    let contents = expand_tree(&tree.bytes()).unwrap();
    let mut files = contents
        .files
        .iter()
        .map(|f| f.path.clone())
        .collect::<Vec<_>>();
    files.sort();
    assert_eq!(files, vec![relative("bar/foo/file"), relative("foo/file")]);
    for file in &contents.files {
        assert_eq!(file.digest, TestData::foo().digest());
    }
}

#[test]
fn symlinks_expand_with_their_targets() {
    let root = TestDirectory::new(remexec::Directory {
        symlinks: vec![symlink_node("link", "../sibling/qux")],
        ..Default::default()
    });
    let tree = TestTree::from_root(&root);

    let contents = expand_tree(&tree.bytes()).unwrap();
    assert_eq!(contents.symlinks.len(), 1);
    assert_eq!(contents.symlinks[0].path, relative("link"));
    assert_eq!(contents.symlinks[0].target, "../sibling/qux");
}

#[test]
fn missing_child_is_malformed() {
    let child = TestDirectory::containing_qux();
    let root = TestDirectory::new(remexec::Directory {
        directories: vec![child.node("child")],
        ..Default::default()
    });
    // The child directory is referenced but not carried.
    let tree = TestTree::from_root(&root);

    match expand_tree(&tree.bytes()).unwrap_err() {
        MaterializeError::MalformedTree(message) => {
            assert!(
                message.contains("does not carry child directory child"),
                "Bad message: {message}"
            );
        }
        other => panic!("Want MalformedTree, got {other:?}"),
    }
}

#[test]
fn manifest_without_root_is_malformed() {
    let tree = remexec::Tree::default();

    match expand_tree(&tree.to_bytes()).unwrap_err() {
        MaterializeError::MalformedTree(message) => {
            assert!(message.contains("no root"), "Bad message: {message}");
        }
        other => panic!("Want MalformedTree, got {other:?}"),
    }
}

#[test]
fn undecodable_manifest_is_malformed() {
    match expand_tree(&[0xff, 0xff, 0xff]).unwrap_err() {
        MaterializeError::MalformedTree(message) => {
            assert!(
                message.contains("failed to decode"),
                "Bad message: {message}"
            );
        }
        other => panic!("Want MalformedTree, got {other:?}"),
    }
}
