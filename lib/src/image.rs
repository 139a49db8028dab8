//! Whole-image operations that do not involve a filesystem bundle:
//! creating fresh images and describing existing ones.

use anyhow::{Context, Result};
use fn_error_context::context;
use oci_spec::image::{
    Arch, DescriptorBuilder, History, ImageConfigurationBuilder, ImageManifestBuilder, MediaType,
    Os, RootFsBuilder,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::casext::{DescriptorPath, Engine};
use crate::timeutil;

/// Map the value of `std::env::consts::ARCH` to the Go-style architecture
/// names images use.
fn host_arch() -> Arch {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        "loongarch64" => "loong64",
        other => other,
    };
    Arch::from(arch)
}

/// Create a fresh, empty image (no layers, host architecture and OS) and
/// point `tag` at it.
#[context("Creating new image {tag:?}")]
pub fn new_image(engine: &Engine, tag: &str, cancel: &CancellationToken) -> Result<DescriptorPath> {
    let created = timeutil::now()?;
    let config = ImageConfigurationBuilder::default()
        .created(timeutil::format_rfc3339(&created))
        .architecture(host_arch())
        .os(Os::from(std::env::consts::OS))
        .rootfs(
            RootFsBuilder::default()
                .typ("layers".to_string())
                .diff_ids(Vec::<String>::new())
                .build()?,
        )
        .history(Vec::<History>::new())
        .build()?;
    let (config_digest, config_size) = engine.put_blob_json(&config, cancel)?;
    let manifest = ImageManifestBuilder::default()
        .schema_version(oci_spec::image::SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageConfig)
                .digest(config_digest.to_string())
                .size(config_size as i64)
                .build()?,
        )
        .layers(Vec::new())
        .build()?;
    let (digest, size) = engine.put_blob_json(&manifest, cancel)?;
    let descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(digest.to_string())
        .size(size as i64)
        .build()?;
    engine.update_reference(tag, descriptor)?;
    engine.resolve_reference_unique(tag)
}

/// One layer of a [`Stat`].
#[derive(Debug, Serialize)]
pub struct LayerStat {
    /// Blob digest of the (possibly compressed) layer.
    pub digest: String,
    /// Stored size in bytes.
    pub size: i64,
    /// Media type of the stored blob.
    pub media_type: String,
    /// The history entry describing this layer, if the config has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<History>,
}

/// The observable shape of an image: its layers joined with history.
#[derive(Debug, Serialize)]
pub struct Stat {
    /// The manifest digest the tag resolved to.
    pub digest: String,
    /// Per-layer rows, in application order.
    pub layers: Vec<LayerStat>,
    /// History entries that do not correspond to a layer.
    pub empty_history: Vec<History>,
}

/// Describe the image `tag` resolves to.
#[context("Stating image {tag:?}")]
pub fn stat(engine: &Engine, tag: &str) -> Result<Stat> {
    let path = engine.resolve_reference_unique(tag)?;
    let manifest = engine.manifest(path.target())?;
    let config = engine
        .config(manifest.config())
        .context("reading image configuration")?;

    let mut layer_history = Vec::new();
    let mut empty_history = Vec::new();
    for entry in config.history() {
        if entry.empty_layer().unwrap_or(false) {
            empty_history.push(entry.clone());
        } else {
            layer_history.push(entry.clone());
        }
    }
    let mut layer_history = layer_history.into_iter();
    let layers = manifest
        .layers()
        .iter()
        .map(|l| LayerStat {
            digest: l.digest().clone(),
            size: l.size(),
            media_type: l.media_type().to_string(),
            history: layer_history.next(),
        })
        .collect();
    Ok(Stat {
        digest: path.target().digest().clone(),
        layers,
        empty_history,
    })
}
