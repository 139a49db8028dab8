//! The unpack operation: image → runtime bundle.

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use oci_spec::image::ImageManifest;

use crate::bundle::{self, BundleMeta, SavedMapOptions};
use crate::casext::{descriptor_digest, DescriptorPath, Engine};
use crate::digest::HashingReader;
use crate::fstree::FsTree;
use crate::layer;
use crate::layer::unpack::{TarExtractor, UnpackOptions};
use crate::Error;

/// Extract the layers of the image at `path` into `rootfs` (which is
/// replaced if it exists), verifying blob digests and diff-IDs as the
/// streams go by. Returns the manifest that was applied.
#[context("Unpacking rootfs to {rootfs}")]
pub fn unpack_rootfs(
    engine: &Engine,
    path: &DescriptorPath,
    rootfs: &Utf8Path,
    opts: &UnpackOptions,
) -> Result<ImageManifest> {
    let manifest = engine.manifest(path.target())?;
    let config = engine.config(manifest.config())?;
    let diff_ids = config.rootfs().diff_ids();
    if manifest.layers().len() != diff_ids.len() {
        bail!(Error::corrupt(
            &descriptor_digest(path.target())?,
            format!(
                "manifest has {} layers but config lists {} diff-ids",
                manifest.layers().len(),
                diff_ids.len()
            ),
        ));
    }

    if rootfs.try_exists()? {
        std::fs::remove_dir_all(rootfs).with_context(|| format!("replacing {rootfs}"))?;
    }
    let mut extractor = TarExtractor::new(rootfs, opts.clone())?;
    for (layer_desc, diff_id) in manifest.layers().iter().zip(diff_ids) {
        let layer_digest = descriptor_digest(layer_desc)?;
        tracing::debug!("applying layer {layer_digest}");
        let expected_diff: crate::digest::Digest = diff_id
            .parse()
            .map_err(|_| Error::corrupt(&layer_digest, format!("bad diff-id {diff_id:?}")))?;

        let raw = engine.cas().get_blob(&layer_digest)?;
        let mut compressed = HashingReader::new(raw, layer_digest.algorithm())?;
        {
            let decompressed = layer::decompress(&mut compressed)?;
            let mut diff_hasher = HashingReader::new(decompressed, expected_diff.algorithm())?;
            extractor
                .apply_layer(&mut diff_hasher)
                .with_context(|| format!("applying layer {layer_digest}"))?;
            // Drain tar terminator blocks so the hash covers the whole
            // stream.
            std::io::copy(&mut diff_hasher, &mut std::io::sink())?;
            let (found, _) = diff_hasher.finish()?;
            if found != expected_diff {
                bail!(Error::corrupt(
                    &layer_digest,
                    format!("diff-id mismatch: expected {expected_diff}, got {found}"),
                ));
            }
        }
        std::io::copy(&mut compressed, &mut std::io::sink())?;
        let (found, size) = compressed.finish()?;
        if found != layer_digest || size != crate::casext::descriptor_size(layer_desc)? {
            bail!(Error::corrupt(
                &layer_digest,
                format!("blob mismatch: got {found} with size {size}"),
            ));
        }
    }
    Ok(manifest)
}

/// Unpack `tag` into a bundle directory: extract the rootfs, snapshot it
/// into the filesystem-manifest sidecar, and record provenance in
/// `umoci.json`.
///
/// On failure the bundle is left as-is for inspection; no cleanup of a
/// partially-extracted rootfs is attempted.
#[context("Unpacking {tag:?} into {bundle}")]
pub fn unpack(
    engine: &Engine,
    tag: &str,
    bundle: &Utf8Path,
    opts: &UnpackOptions,
) -> Result<()> {
    let path = engine.resolve_reference_unique(tag)?;
    std::fs::create_dir_all(bundle).with_context(|| format!("creating {bundle}"))?;
    let rootfs = bundle::rootfs_path(bundle);
    let _manifest = unpack_rootfs(engine, &path, &rootfs, opts)?;

    // Any sidecar from a previous unpack is stale now.
    for ent in bundle.read_dir_utf8()? {
        let ent = ent?;
        if ent.file_name().ends_with(".mtree") {
            std::fs::remove_file(ent.path())?;
        }
    }
    let manifest_digest = descriptor_digest(path.target())?;
    let tree = FsTree::scan(&rootfs)?;
    let mtree_path = bundle.join(bundle::mtree_name(&manifest_digest));
    let f = std::fs::File::create(&mtree_path)
        .with_context(|| format!("creating {mtree_path}"))?;
    tree.to_writer(std::io::BufWriter::new(f))?;

    BundleMeta {
        umoci_version: BundleMeta::current_version(),
        from_descriptor_path: path.descriptors().to_vec(),
        map_options: SavedMapOptions {
            uid_mappings: opts.map.uid_mappings.clone(),
            gid_mappings: opts.map.gid_mappings.clone(),
            rootless: opts.map.rootless,
            keep_dirlinks: opts.keep_dirlinks,
        },
    }
    .write(bundle)?;
    tracing::info!("unpacked {tag} into {bundle}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casext::test_helpers::new_engine;
    use crate::image::new_image;
    use crate::layer::idmap::MapOptions;
    use crate::layer::Compression;
    use crate::mutate::Mutator;
    use camino::Utf8PathBuf;
    use oci_spec::image::HistoryBuilder;
    use tokio_util::sync::CancellationToken;

    fn rootless_opts() -> UnpackOptions {
        UnpackOptions {
            map: MapOptions {
                rootless: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tar_with(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut h = tar::Header::new_gnu();
            h.set_mode(if content.is_some() { 0o644 } else { 0o755 });
            h.set_uid(0);
            h.set_gid(0);
            h.set_mtime(42);
            match content {
                Some(data) => {
                    h.set_entry_type(tar::EntryType::Regular);
                    h.set_size(data.len() as u64);
                    b.append_data(&mut h, name, *data).unwrap();
                }
                None => {
                    h.set_entry_type(tar::EntryType::Directory);
                    h.set_size(0);
                    b.append_data(&mut h, name, std::io::empty()).unwrap();
                }
            }
        }
        b.into_inner().unwrap()
    }

    fn add_tar_layer(engine: &crate::casext::Engine, tag: &str, tar: &[u8]) {
        let cancel = CancellationToken::new();
        let path = engine.resolve_reference_unique(tag).unwrap();
        let mut mutator = Mutator::new(engine, path).unwrap();
        let history = HistoryBuilder::default()
            .created_by("test layer".to_string())
            .build()
            .unwrap();
        mutator
            .add_layer_from_reader(Compression::Gzip, None, Some(history), tar, &cancel)
            .unwrap();
        let new_path = mutator.commit(&cancel).unwrap();
        engine.update_reference(tag, new_path.root().clone()).unwrap();
    }

    #[test]
    fn test_unpack_bundle_layout() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();
        new_image(&engine, "v1", &cancel)?;
        add_tar_layer(
            &engine,
            "v1",
            &tar_with(&[("etc", None), ("etc/hostname", Some(b"darkstar\n"))]),
        );

        let td = tempfile::tempdir()?;
        let bundle = Utf8PathBuf::try_from(td.path().join("bundle"))?;
        unpack(&engine, "v1", &bundle, &rootless_opts())?;

        assert_eq!(
            std::fs::read(bundle.join("rootfs/etc/hostname"))?,
            b"darkstar\n"
        );
        let meta = BundleMeta::read(&bundle)?;
        assert!(meta.map_options.rootless);
        assert_eq!(meta.from_descriptor_path.len(), 1);
        let digest = descriptor_digest(&meta.from_descriptor_path[0])?;
        assert!(bundle.join(bundle::mtree_name(&digest)).is_file());

        // The sidecar parses back to the same snapshot.
        let saved = FsTree::from_reader(std::fs::File::open(
            bundle.join(bundle::mtree_name(&digest)),
        )?)?;
        let current = FsTree::scan(&bundle.join("rootfs"))?;
        assert!(saved.diff(&current).is_empty());
        Ok(())
    }

    #[test]
    fn test_unpack_delete_and_recreate_across_layers() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();
        new_image(&engine, "v1", &cancel)?;
        // L1 adds the file, L2 whites it out, L3 recreates it.
        add_tar_layer(
            &engine,
            "v1",
            &tar_with(&[("a", None), ("a/f", Some(b"first"))]),
        );
        add_tar_layer(&engine, "v1", &tar_with(&[("a/.wh.f", Some(b""))]));
        add_tar_layer(&engine, "v1", &tar_with(&[("a/f", Some(b"third"))]));

        let td = tempfile::tempdir()?;
        let bundle = Utf8PathBuf::try_from(td.path().join("bundle"))?;
        unpack(&engine, "v1", &bundle, &rootless_opts())?;
        assert_eq!(std::fs::read(bundle.join("rootfs/a/f"))?, b"third");

        // And with only the first two layers the file is gone; check via
        // a fresh two-layer image.
        let (_td2, engine2) = new_engine();
        new_image(&engine2, "v1", &cancel)?;
        add_tar_layer(
            &engine2,
            "v1",
            &tar_with(&[("a", None), ("a/f", Some(b"first"))]),
        );
        add_tar_layer(&engine2, "v1", &tar_with(&[("a/.wh.f", Some(b""))]));
        let bundle2 = Utf8PathBuf::try_from(td.path().join("bundle2"))?;
        unpack(&engine2, "v1", &bundle2, &rootless_opts())?;
        assert!(!bundle2.join("rootfs/a/f").exists());
        assert!(bundle2.join("rootfs/a").is_dir());
        Ok(())
    }

    #[test]
    fn test_unpack_detects_corruption() -> Result<()> {
        let (_td, engine) = new_engine();
        let cancel = CancellationToken::new();
        new_image(&engine, "v1", &cancel)?;
        add_tar_layer(&engine, "v1", &tar_with(&[("f", Some(b"payload"))]));

        // Corrupt the layer blob in place.
        let path = engine.resolve_reference_unique("v1")?;
        let manifest = engine.manifest(path.target())?;
        let layer_digest = descriptor_digest(&manifest.layers()[0])?;
        let blob_path = engine
            .cas()
            .root()
            .join(format!("blobs/sha256/{}", layer_digest.hex()));
        let mut bytes = std::fs::read(&blob_path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&blob_path, bytes)?;

        let td = tempfile::tempdir()?;
        let bundle = Utf8PathBuf::try_from(td.path().join("bundle"))?;
        assert!(unpack(&engine, "v1", &bundle, &rootless_opts()).is_err());
        Ok(())
    }
}
