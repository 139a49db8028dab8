//! The repack operation: bundle changes → new layer + new manifest.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use oci_spec::image::History;
use tokio_util::sync::CancellationToken;

use crate::bundle::{self, BundleMeta};
use crate::casext::{descriptor_digest, DescriptorPath, Engine};
use crate::fstree::FsTree;
use crate::layer::idmap::MapOptions;
use crate::layer::pack::{self, PackOptions};
use crate::layer::Compression;
use crate::mutate::Mutator;
use crate::timeutil;

/// Configuration for repack.
#[derive(Debug, Clone, Default)]
pub struct RepackOptions {
    /// History entry for the new layer; `None` suppresses history
    /// entirely.
    pub history: Option<History>,
    /// Extra paths to mask out of the layer.
    pub mask_paths: Vec<Utf8PathBuf>,
    /// Do not mask the config's volume paths.
    pub no_mask_volumes: bool,
    /// Rewrite the bundle's sidecar metadata to match the new image.
    pub refresh_bundle: bool,
    /// Layer compression; `None` follows the image's existing top layer.
    pub compression: Option<Compression>,
    /// Cancellation token.
    pub cancel: CancellationToken,
}

/// Pack the changes in `bundle` into a new layer and commit a new
/// manifest under `tag`. The source image is the one recorded in the
/// bundle's provenance, not whatever `tag` currently points at.
#[context("Repacking {bundle} into {tag:?}")]
pub fn repack(engine: &Engine, tag: &str, bundle: &Utf8Path, opts: RepackOptions) -> Result<()> {
    let meta = BundleMeta::read(bundle)?;
    let path = DescriptorPath::new(meta.from_descriptor_path.clone())
        .context("bundle metadata has an empty descriptor path")?;
    let manifest_digest = descriptor_digest(path.target())?;

    let mtree_path = bundle.join(bundle::mtree_name(&manifest_digest));
    let saved = FsTree::from_reader(
        std::fs::File::open(&mtree_path)
            .with_context(|| format!("opening snapshot {mtree_path}"))?,
    )?;
    let rootfs = bundle::rootfs_path(bundle);
    let current = FsTree::scan(&rootfs)?;
    let delta = saved.diff(&current);
    tracing::debug!("{} changed paths", delta.len());

    let mut mutator = Mutator::new(engine, path)?;

    let mut masked_paths = opts.mask_paths.clone();
    if !opts.no_mask_volumes {
        if let Some(volumes) = mutator.config()?.volumes() {
            masked_paths.extend(volumes.iter().map(Utf8PathBuf::from));
        }
    }
    let compression = match opts.compression {
        Some(c) => c,
        None => mutator
            .manifest()?
            .layers()
            .last()
            .and_then(|l| Compression::from_media_type(l.media_type()))
            .unwrap_or_default(),
    };

    let effective: usize = delta
        .iter()
        .filter(|d| !pack::is_masked(&d.path, &masked_paths))
        .count();
    if effective == 0 {
        tracing::info!("no changes to repack");
        if let Some(history) = opts.history.clone() {
            let config = mutator.config()?;
            let image_meta = mutator.meta()?;
            mutator.set(config, image_meta, None, Some(history))?;
        }
    } else {
        let pack_opts = PackOptions {
            map: MapOptions {
                uid_mappings: meta.map_options.uid_mappings.clone(),
                gid_mappings: meta.map_options.gid_mappings.clone(),
                rootless: meta.map_options.rootless,
            },
            epoch: timeutil::source_date_epoch()?,
            masked_paths,
            cancel: opts.cancel.clone(),
        };
        mutator.add_layer(compression, None, opts.history.clone(), |w| {
            pack::pack_delta(&rootfs, &delta, w, &pack_opts)
        })?;
    }

    let new_path = mutator.commit(&opts.cancel)?;
    engine.update_reference(tag, new_path.root().clone())?;
    tracing::info!("repacked {bundle} as {tag}");

    if opts.refresh_bundle {
        for ent in bundle.read_dir_utf8()? {
            let ent = ent?;
            if ent.file_name().ends_with(".mtree") {
                std::fs::remove_file(ent.path())?;
            }
        }
        let new_digest = descriptor_digest(new_path.target())?;
        let f = std::fs::File::create(bundle.join(bundle::mtree_name(&new_digest)))?;
        current.to_writer(std::io::BufWriter::new(f))?;
        BundleMeta {
            umoci_version: BundleMeta::current_version(),
            from_descriptor_path: new_path.descriptors().to_vec(),
            map_options: meta.map_options,
        }
        .write(bundle)?;
    }
    Ok(())
}
