//! Mark-and-sweep garbage collection.
//!
//! Everything reachable from the top-level index is live; any other blob
//! is removed, unless a policy vetoes the deletion. Stale writer scratch
//! directories are removed in the same pass.

use std::collections::HashSet;

use anyhow::Result;
use fn_error_context::context;

use super::{descriptor_digest, Engine};
use crate::digest::Digest;

/// A garbage-collection policy: returns `true` to retain an otherwise
/// unreferenced blob.
pub type Policy<'a> = &'a dyn Fn(&Digest) -> bool;

/// What a garbage-collection pass did.
#[derive(Debug, Default)]
pub struct GcSummary {
    /// Blobs that were deleted.
    pub removed: Vec<Digest>,
    /// Unreferenced blobs kept alive by a policy.
    pub vetoed: usize,
}

impl Engine {
    /// Garbage-collect with no retention policies.
    pub fn gc(&self) -> Result<GcSummary> {
        self.gc_with_policies(&[])
    }

    /// Garbage-collect, consulting `policies` before each deletion.
    ///
    /// Requires a write handle; the writer lock is what makes the
    /// mark-and-sweep race-free against concurrent mutation.
    #[context("Garbage collecting")]
    pub fn gc_with_policies(&self, policies: &[Policy<'_>]) -> Result<GcSummary> {
        anyhow::ensure!(
            self.cas().is_writable(),
            "internal error: gc requires a write handle"
        );
        let index = self.cas().get_index()?;
        let mut reachable = HashSet::new();
        for desc in index.manifests() {
            self.walk(desc, &mut |path| {
                reachable.insert(descriptor_digest(path.target())?);
                Ok(())
            })?;
        }
        tracing::debug!("{} blobs reachable", reachable.len());

        let mut summary = GcSummary::default();
        for digest in self.cas().list_blobs()? {
            if reachable.contains(&digest) {
                continue;
            }
            if policies.iter().any(|policy| policy(&digest)) {
                tracing::debug!("gc: policy retained {digest}");
                summary.vetoed += 1;
                continue;
            }
            tracing::info!("gc: removing unreferenced blob {digest}");
            self.cas().delete_blob(&digest)?;
            summary.removed.push(digest);
        }
        self.cas().clean()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::new_engine;
    use super::*;
    use oci_spec::image::{DescriptorBuilder, MediaType};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_gc_sweeps_unreferenced() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();

        let (live_digest, live_size) = engine.cas().put_blob(&b"live"[..], &cancel)?;
        let live = DescriptorBuilder::default()
            .media_type(MediaType::Other("application/x-test".into()))
            .digest(live_digest.to_string())
            .size(live_size as i64)
            .build()?;
        engine.update_reference("keep", live)?;

        let (dead_digest, _) = engine.cas().put_blob(&b"dead"[..], &cancel)?;

        let summary = engine.gc()?;
        assert_eq!(summary.removed, vec![dead_digest]);
        assert!(engine.cas().get_blob(&live_digest).is_ok());

        // A second pass is a no-op, and every reference still walks.
        let summary = engine.gc()?;
        assert!(summary.removed.is_empty());
        for (_, desc) in engine.list_references()? {
            engine.walk(&desc, &mut |_| Ok(()))?;
        }
        Ok(())
    }

    #[test]
    fn test_gc_policy_veto() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();
        let (dead_digest, _) = engine.cas().put_blob(&b"precious"[..], &cancel)?;

        let keep_all = |_d: &Digest| true;
        let summary = engine.gc_with_policies(&[&keep_all])?;
        assert!(summary.removed.is_empty());
        assert_eq!(summary.vetoed, 1);
        assert!(engine.cas().get_blob(&dead_digest).is_ok());

        let summary = engine.gc()?;
        assert_eq!(summary.removed, vec![dead_digest]);
        Ok(())
    }
}
