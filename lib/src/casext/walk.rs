//! Depth-first walks over the Merkle DAG of descriptors.

use std::collections::HashSet;

use anyhow::Result;
use fn_error_context::context;
use oci_spec::image::{Descriptor, MediaType};

use super::{descriptor_digest, DescriptorPath, Engine, ParsedBlob};
use crate::digest::Digest;

/// Child descriptors referenced by a parsed blob.
///
/// Diff-IDs in a configuration are digests but not descriptors, so a
/// config has no children.
pub(crate) fn parsed_children(parsed: &ParsedBlob) -> Vec<Descriptor> {
    match parsed {
        ParsedBlob::Manifest(m) => {
            let mut children = vec![m.config().clone()];
            children.extend(m.layers().iter().cloned());
            children
        }
        ParsedBlob::Index(i) => i.manifests().clone(),
        ParsedBlob::Config(_) | ParsedBlob::Raw(_) => Vec::new(),
    }
}

impl Engine {
    /// Walk the DAG rooted at `root` depth-first, invoking `visitor` with
    /// the descriptor path of every reachable blob.
    ///
    /// JSON blobs are fetched (and thereby verified) to discover their
    /// children; other blobs are only checked for existence. Each digest
    /// is visited at most once.
    #[context("Walking DAG from {}", root.digest())]
    pub fn walk(
        &self,
        root: &Descriptor,
        visitor: &mut dyn FnMut(&DescriptorPath) -> Result<()>,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        self.walk_inner(vec![root.clone()], &mut visited, visitor)
    }

    fn walk_inner(
        &self,
        path: Vec<Descriptor>,
        visited: &mut HashSet<Digest>,
        visitor: &mut dyn FnMut(&DescriptorPath) -> Result<()>,
    ) -> Result<()> {
        let desc = path.last().expect("walk paths are non-empty").clone();
        let digest = descriptor_digest(&desc)?;
        if !visited.insert(digest.clone()) {
            return Ok(());
        }
        let children = match desc.media_type() {
            MediaType::ImageManifest | MediaType::ImageIndex | MediaType::ImageConfig => {
                parsed_children(&self.blob(&desc)?.parsed)
            }
            _ => {
                self.cas().stat_blob(&digest)?;
                Vec::new()
            }
        };
        visitor(&DescriptorPath::new(path.clone())?)?;
        for child in children {
            let mut child_path = path.clone();
            child_path.push(child);
            self.walk_inner(child_path, visited, visitor)?;
        }
        Ok(())
    }
}
