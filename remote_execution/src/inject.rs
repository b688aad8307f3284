// Copyright 2024 Girder project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use fs::RelativePath;

use crate::plan::DownloadPlan;
use crate::tree::TreeContents;
use crate::{MetadataInjector, RemoteAction, RemoteFileMetadata, RemoteTreeMetadata};

///
/// Register records for every output that stayed off disk with the build graph's metadata
/// store. Runs strictly after all downloads have settled, so the injector sees a consistent
/// view and is never called concurrently for one action.
///
/// An inline output that was absent from the `ActionResult` never reaches the plan, so nothing
/// is injected for it and the surrounding build treats it as missing.
///
pub(crate) fn inject_metadata(
    action: &RemoteAction,
    plan: &DownloadPlan,
    injected_trees: &[(RelativePath, TreeContents)],
    injector: &dyn MetadataInjector,
) {
    for file in &plan.inject_files {
        injector.inject_file(
            &file.path,
            RemoteFileMetadata::new(file.digest, &action.action_id),
        );
    }

    for (path, contents) in injected_trees {
        let children = contents
            .files
            .iter()
            .map(|file| {
                (
                    file.path.clone(),
                    RemoteFileMetadata::new(file.digest, &action.action_id),
                )
            })
            .collect();
        injector.inject_tree(path, RemoteTreeMetadata { children });
    }
}
