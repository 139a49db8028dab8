//! The image mutator: staged edits to one image's config and manifest,
//! committed as new blobs with the ancestor chain rewritten.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use oci_spec::image::{
    Arch, Config, ConfigBuilder, Descriptor, DescriptorBuilder, History, ImageConfiguration,
    ImageManifest, MediaType, Os,
};
use tokio_util::sync::CancellationToken;

use crate::casext::{DescriptorPath, Engine};
use crate::digest::{Algorithm, Digest, HashingWriter};
use crate::layer::Compression;
use crate::timeutil;
use crate::Error;

/// The non-config image metadata a mutation can replace.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Image creation time.
    pub created: Option<DateTime<Utc>>,
    /// Image author.
    pub author: Option<String>,
    /// Target architecture.
    pub architecture: Arch,
    /// Target operating system.
    pub os: Os,
}

/// A stateful editor for the image a descriptor path points at.
///
/// Reads are lazy and cached; nothing is written until
/// [`Mutator::commit`], which produces a fresh descriptor path rooted at
/// the rewritten ancestors. The mutator borrows the engine, it does not
/// own it.
#[derive(Debug)]
pub struct Mutator<'a> {
    engine: &'a Engine,
    path: DescriptorPath,
    manifest: Option<ImageManifest>,
    config: Option<ImageConfiguration>,
    dirty: bool,
}

// A rewritten node keeps the annotations and platform of the descriptor
// it replaces (the reference-name annotation must survive the rewrite).
fn replace_descriptor(
    old: &Descriptor,
    media_type: MediaType,
    digest: &Digest,
    size: u64,
) -> Result<Descriptor> {
    let mut builder = DescriptorBuilder::default()
        .media_type(media_type)
        .digest(digest.to_string())
        .size(size as i64);
    if let Some(annotations) = old.annotations() {
        builder = builder.annotations(annotations.clone());
    }
    if let Some(platform) = old.platform() {
        builder = builder.platform(platform.clone());
    }
    Ok(builder.build()?)
}

impl<'a> Mutator<'a> {
    /// Start mutating the image at the end of `path`, which must point at
    /// a manifest.
    pub fn new(engine: &'a Engine, path: DescriptorPath) -> Result<Self> {
        if path.target().media_type() != &MediaType::ImageManifest {
            return Err(
                Error::UnsupportedMediaType(path.target().media_type().to_string()).into(),
            );
        }
        Ok(Self {
            engine,
            path,
            manifest: None,
            config: None,
            dirty: false,
        })
    }

    /// The descriptor path this mutator currently points at (updated by
    /// commit).
    pub fn descriptor_path(&self) -> &DescriptorPath {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        if self.manifest.is_none() {
            let manifest = self.engine.manifest(self.path.target())?;
            let config = self.engine.config(manifest.config())?;
            self.manifest = Some(manifest);
            self.config = Some(config);
        }
        Ok(())
    }

    /// The manifest being edited.
    pub fn manifest(&mut self) -> Result<&ImageManifest> {
        self.load()?;
        Ok(self.manifest.as_ref().expect("loaded above"))
    }

    /// The full image configuration being edited.
    pub fn configuration(&mut self) -> Result<&ImageConfiguration> {
        self.load()?;
        Ok(self.config.as_ref().expect("loaded above"))
    }

    /// The application config section (empty if absent).
    pub fn config(&mut self) -> Result<Config> {
        match self.configuration()?.config() {
            Some(c) => Ok(c.clone()),
            None => Ok(ConfigBuilder::default().build()?),
        }
    }

    /// The non-config metadata.
    pub fn meta(&mut self) -> Result<Meta> {
        let c = self.configuration()?;
        Ok(Meta {
            created: c
                .created()
                .as_deref()
                .map(timeutil::parse_rfc3339)
                .transpose()
                .context("parsing config creation time")?,
            author: c.author().clone(),
            architecture: c.architecture().clone(),
            os: c.os().clone(),
        })
    }

    /// The manifest annotations.
    pub fn annotations(&mut self) -> Result<HashMap<String, String>> {
        Ok(self.manifest()?.annotations().clone().unwrap_or_default())
    }

    /// Replace config, metadata and (optionally) manifest annotations,
    /// staging one history entry for the operation. The history entry
    /// must not claim a layer (`empty_layer` is forced on).
    #[context("Staging config mutation")]
    pub fn set(
        &mut self,
        config: Config,
        meta: Meta,
        annotations: Option<HashMap<String, String>>,
        history: Option<History>,
    ) -> Result<()> {
        self.load()?;
        let c = self.config.as_mut().expect("loaded above");
        c.set_config(Some(config));
        c.set_created(meta.created.map(|d| timeutil::format_rfc3339(&d)));
        c.set_author(meta.author);
        c.set_architecture(meta.architecture);
        c.set_os(meta.os);
        if let Some(annotations) = annotations {
            let m = self.manifest.as_mut().expect("loaded above");
            m.set_annotations(Some(annotations));
        }
        if let Some(mut history) = history {
            if history.empty_layer() == Some(false) {
                bail!("internal error: config-only mutation with a non-empty-layer history entry");
            }
            history.set_empty_layer(Some(true));
            self.config
                .as_mut()
                .expect("loaded above")
                .history_mut()
                .push(history);
        }
        self.dirty = true;
        Ok(())
    }

    /// Append a layer produced by `producer`, which writes an
    /// uncompressed tar stream. The stream is hashed (yielding the
    /// diff-ID), compressed, and stored; manifest, diff-IDs and history
    /// are updated together. Returns the diff-ID.
    #[context("Adding layer")]
    pub fn add_layer(
        &mut self,
        compression: Compression,
        annotations: Option<HashMap<String, String>>,
        history: Option<History>,
        producer: impl FnOnce(&mut dyn Write) -> Result<()>,
    ) -> Result<Digest> {
        self.load()?;

        let blob_writer = self.engine.cas().blob_writer()?;
        let compressor = compression.wrap(blob_writer)?;
        let mut tar_writer = HashingWriter::new(compressor, Algorithm::Sha256)?;
        producer(&mut tar_writer)?;
        let (diff_id, _, compressor) = tar_writer.finish()?;
        let (digest, size) = compressor.finish()?.complete()?;

        let mut builder = DescriptorBuilder::default()
            .media_type(compression.media_type())
            .digest(digest.to_string())
            .size(size as i64);
        if let Some(annotations) = annotations {
            builder = builder.annotations(annotations);
        }
        let descriptor = builder.build()?;

        let manifest = self.manifest.as_mut().expect("loaded above");
        manifest.layers_mut().push(descriptor);
        let config = self.config.as_mut().expect("loaded above");
        let mut rootfs = config.rootfs().clone();
        rootfs.diff_ids_mut().push(diff_id.to_string());
        config.set_rootfs(rootfs);
        if let Some(mut history) = history {
            if history.empty_layer() == Some(true) {
                bail!("internal error: layer addition with an empty-layer history entry");
            }
            history.set_empty_layer(Some(false));
            config.history_mut().push(history);
        }
        self.dirty = true;
        tracing::debug!("added layer {digest} (diff-id {diff_id})");
        Ok(diff_id)
    }

    /// Like [`Mutator::add_layer`] but copying an existing uncompressed
    /// tar stream.
    pub fn add_layer_from_reader(
        &mut self,
        compression: Compression,
        annotations: Option<HashMap<String, String>>,
        history: Option<History>,
        mut reader: impl Read,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        self.add_layer(compression, annotations, history, |w| {
            crate::ioutil::copy_cancellable(&mut reader, w, cancel)?;
            Ok(())
        })
    }

    /// Write out the staged edits: config blob first, then the manifest,
    /// then each rewritten ancestor up the chain. Returns the new
    /// descriptor path (the caller updates the reference index).
    #[context("Committing image mutation")]
    pub fn commit(&mut self, cancel: &CancellationToken) -> Result<DescriptorPath> {
        if !self.dirty {
            // Nothing staged; the existing manifest is the result.
            return Ok(self.path.clone());
        }
        self.load()?;
        let config = self.config.as_ref().expect("loaded above");
        let mut manifest = self.manifest.as_ref().expect("loaded above").clone();

        // A history entry claiming a layer that does not exist is a
        // programming error; images missing entries for real layers do
        // exist in the wild, so that direction only warns.
        let non_empty = config
            .history()
            .iter()
            .filter(|h| !h.empty_layer().unwrap_or(false))
            .count();
        let diff_ids = config.rootfs().diff_ids().len();
        if non_empty > diff_ids {
            bail!(
                "internal error: {non_empty} non-empty history entries for {diff_ids} layers"
            );
        }
        if non_empty < diff_ids {
            tracing::warn!("image has {diff_ids} layers but only {non_empty} history entries");
        }

        let (config_digest, config_size) = self.engine.put_blob_json(config, cancel)?;
        let new_config_desc = replace_descriptor(
            manifest.config(),
            MediaType::ImageConfig,
            &config_digest,
            config_size,
        )?;
        manifest.set_config(new_config_desc);

        let (manifest_digest, manifest_size) = self.engine.put_blob_json(&manifest, cancel)?;
        let mut new_child = replace_descriptor(
            self.path.target(),
            MediaType::ImageManifest,
            &manifest_digest,
            manifest_size,
        )?;
        let mut old_child = self.path.target().clone();

        let ancestors = self.path.descriptors();
        let mut new_chain = vec![new_child.clone()];
        for ancestor in ancestors[..ancestors.len() - 1].iter().rev() {
            if ancestor.media_type() != &MediaType::ImageIndex {
                return Err(Error::UnsupportedMediaType(format!(
                    "cannot rewrite through {}",
                    ancestor.media_type()
                ))
                .into());
            }
            let mut index = self.engine.index_blob(ancestor)?;
            let mut manifests = index.manifests().clone();
            let slot = manifests
                .iter_mut()
                .find(|d| d.digest() == old_child.digest())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "internal error: stale descriptor path ({} not in ancestor index)",
                        old_child.digest()
                    )
                })?;
            *slot = new_child.clone();
            index.set_manifests(manifests);
            let (digest, size) = self.engine.put_blob_json(&index, cancel)?;
            let rewritten =
                replace_descriptor(ancestor, MediaType::ImageIndex, &digest, size)?;
            old_child = ancestor.clone();
            new_child = rewritten.clone();
            new_chain.insert(0, rewritten);
        }

        self.manifest = Some(manifest);
        self.path = DescriptorPath::new(new_chain)?;
        self.dirty = false;
        Ok(self.path.clone())
    }
}
