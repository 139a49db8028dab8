//! Reference resolution: mapping reference names to descriptor paths.
//!
//! Reference names live as `org.opencontainers.image.ref.name` annotations
//! on the top-level index entries. Resolution follows nested indexes, so a
//! resolved target comes with the full ancestor chain ("descriptor path")
//! that was taken to reach it; mutation rewrites that chain bottom-up.

use std::collections::HashSet;

use anyhow::{Context, Result};
use fn_error_context::context;
use oci_spec::image::{Descriptor, MediaType};

use super::{descriptor_digest, refname, Engine};
use crate::digest::Digest;
use crate::Error;

/// The standard annotation carrying a reference name.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An ordered chain of descriptors: the first element appears in the
/// top-level index, each subsequent element is reachable from its
/// predecessor's blob, and the last element is the resolution target.
#[derive(Debug, Clone)]
pub struct DescriptorPath {
    walk: Vec<Descriptor>,
}

impl DescriptorPath {
    /// Build a path from a non-empty descriptor chain.
    pub fn new(walk: Vec<Descriptor>) -> Result<Self> {
        if walk.is_empty() {
            anyhow::bail!("internal error: empty descriptor path");
        }
        Ok(Self { walk })
    }

    /// The descriptor recorded in the top-level index.
    pub fn root(&self) -> &Descriptor {
        self.walk.first().expect("paths are non-empty")
    }

    /// The resolution target.
    pub fn target(&self) -> &Descriptor {
        self.walk.last().expect("paths are non-empty")
    }

    /// The whole chain, root first.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.walk
    }

    /// Consume the path, yielding the chain.
    pub fn into_descriptors(self) -> Vec<Descriptor> {
        self.walk
    }
}

/// The reference name annotated on a descriptor, if any.
pub fn descriptor_ref_name(desc: &Descriptor) -> Option<&str> {
    desc.annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

fn annotate_ref_name(mut desc: Descriptor, name: &str) -> Descriptor {
    let mut annotations = desc.annotations().clone().unwrap_or_default();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
    desc.set_annotations(Some(annotations));
    desc
}

impl Engine {
    /// Resolve a reference name to every descriptor path it reaches.
    ///
    /// An unknown name yields an empty list, not an error; callers that
    /// need exactly one match use [`Engine::resolve_reference_unique`].
    #[context("Resolving reference {name:?}")]
    pub fn resolve_reference(&self, name: &str) -> Result<Vec<DescriptorPath>> {
        refname::validate(name)?;
        let index = self.cas().get_index()?;
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        for desc in index.manifests() {
            if descriptor_ref_name(desc) == Some(name) {
                self.descend(desc, Vec::new(), name, &mut visited, &mut out)?;
            }
        }
        Ok(out)
    }

    fn descend(
        &self,
        desc: &Descriptor,
        mut path: Vec<Descriptor>,
        name: &str,
        visited: &mut HashSet<Digest>,
        out: &mut Vec<DescriptorPath>,
    ) -> Result<()> {
        path.push(desc.clone());
        match desc.media_type() {
            MediaType::ImageIndex => {
                // Digests are hashes, so a visited-set is a sound cycle
                // guard.
                if !visited.insert(descriptor_digest(desc)?) {
                    return Ok(());
                }
                let index = self.index_blob(desc)?;
                for child in index.manifests() {
                    match descriptor_ref_name(child) {
                        Some(n) if n != name => continue,
                        _ => self.descend(child, path.clone(), name, visited, out)?,
                    }
                }
            }
            _ => out.push(DescriptorPath { walk: path }),
        }
        Ok(())
    }

    /// Resolve a reference that must have exactly one target.
    pub fn resolve_reference_unique(&self, name: &str) -> Result<DescriptorPath> {
        let mut paths = self.resolve_reference(name)?;
        match paths.len() {
            0 => Err(Error::not_found(format!("reference {name:?}"))
                .into()),
            1 => Ok(paths.remove(0)),
            count => Err(Error::Ambiguous {
                name: name.to_string(),
                count,
            }
            .into()),
        }
    }

    /// Point `name` at `descriptor`, removing any previous entries for the
    /// name. Last writer wins.
    #[context("Updating reference {name:?}")]
    pub fn update_reference(&self, name: &str, descriptor: Descriptor) -> Result<()> {
        refname::validate(name)?;
        let mut index = self.cas().get_index()?;
        let mut manifests = index.manifests().clone();
        manifests.retain(|d| descriptor_ref_name(d) != Some(name));
        manifests.push(annotate_ref_name(descriptor, name));
        index.set_manifests(manifests);
        self.cas().put_index(&index).context("writing index")
    }

    /// Remove every entry for `name`. Removing an unknown name is success.
    #[context("Deleting reference {name:?}")]
    pub fn delete_reference(&self, name: &str) -> Result<()> {
        refname::validate(name)?;
        let mut index = self.cas().get_index()?;
        let mut manifests = index.manifests().clone();
        let before = manifests.len();
        manifests.retain(|d| descriptor_ref_name(d) != Some(name));
        if manifests.len() != before {
            index.set_manifests(manifests);
            self.cas().put_index(&index)?;
        }
        Ok(())
    }

    /// Enumerate all named entries in the top-level index.
    pub fn list_references(&self) -> Result<Vec<(String, Descriptor)>> {
        let index = self.cas().get_index()?;
        Ok(index
            .manifests()
            .iter()
            .filter_map(|d| descriptor_ref_name(d).map(|n| (n.to_string(), d.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::new_engine;
    use super::*;
    use oci_spec::image::DescriptorBuilder;
    use tokio_util::sync::CancellationToken;

    fn dummy_descriptor(engine: &Engine, payload: &[u8]) -> Descriptor {
        let cancel = CancellationToken::new();
        let (digest, size) = engine.cas().put_blob(payload, &cancel).unwrap();
        DescriptorBuilder::default()
            .media_type(MediaType::Other("application/x-test".into()))
            .digest(digest.to_string())
            .size(size as i64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_resolve_remove() -> Result<()> {
        let (_td, engine) = new_engine();
        let desc = dummy_descriptor(&engine, b"target");

        assert!(engine.resolve_reference("foo")?.is_empty());
        engine.update_reference("foo", desc.clone())?;
        let paths = engine.resolve_reference("foo")?;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].target().digest(), desc.digest());
        assert_eq!(paths[0].descriptors().len(), 1);

        // Updating replaces rather than accumulates
        let desc2 = dummy_descriptor(&engine, b"target2");
        engine.update_reference("foo", desc2.clone())?;
        let paths = engine.resolve_reference("foo")?;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].target().digest(), desc2.digest());

        engine.delete_reference("foo")?;
        assert!(engine.resolve_reference("foo")?.is_empty());
        // Idempotent
        engine.delete_reference("foo")?;
        Ok(())
    }

    #[test]
    fn test_invalid_names_rejected() -> Result<()> {
        let (_td, engine) = new_engine();
        assert!(engine.resolve_reference("bad name").is_err());
        assert!(engine.delete_reference("-bad").is_err());
        Ok(())
    }

    #[test]
    fn test_ambiguity_refused() -> Result<()> {
        let (_td, engine) = new_engine();
        // Forge an index with two entries for the same name, which
        // update_reference would never produce.
        let d1 = annotate_ref_name(dummy_descriptor(&engine, b"one"), "dup");
        let d2 = annotate_ref_name(dummy_descriptor(&engine, b"two"), "dup");
        let mut index = engine.cas().get_index()?;
        index.set_manifests(vec![d1, d2]);
        engine.cas().put_index(&index)?;

        assert_eq!(engine.resolve_reference("dup")?.len(), 2);
        let err = engine.resolve_reference_unique("dup").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Ambiguous { count: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_nested_index_resolution() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();

        // A manifest-ish leaf blob
        let leaf = dummy_descriptor(&engine, b"leaf");

        // An index blob whose child carries no ref name (candidate)
        let inner = oci_spec::image::ImageIndexBuilder::default()
            .schema_version(oci_spec::image::SCHEMA_VERSION)
            .manifests(vec![leaf.clone()])
            .build()?;
        let (digest, size) = engine.put_blob_json(&inner, &cancel)?;
        let inner_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(digest.to_string())
            .size(size as i64)
            .build()?;

        engine.update_reference("nested", inner_desc)?;
        let path = engine.resolve_reference_unique("nested")?;
        assert_eq!(path.descriptors().len(), 2);
        assert_eq!(path.root().media_type(), &MediaType::ImageIndex);
        assert_eq!(path.target().digest(), leaf.digest());
        Ok(())
    }
}
