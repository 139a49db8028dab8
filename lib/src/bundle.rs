//! Runtime bundle layout: the extracted rootfs plus sidecar metadata.
//!
//! ```text
//! <bundle>/
//!   rootfs/               # the extracted filesystem
//!   sha256_<hex>.mtree    # filesystem manifest at unpack time
//!   umoci.json            # provenance: descriptor path + map options
//! ```

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use oci_spec::image::Descriptor;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::layer::idmap::IdMapping;
use crate::Error;

/// Name of the rootfs directory inside a bundle.
pub const ROOTFS_NAME: &str = "rootfs";
/// Name of the bundle metadata file.
pub const META_NAME: &str = "umoci.json";

/// The map options recorded in bundle metadata (a superset of
/// [`crate::layer::idmap::MapOptions`]: unpack-only settings ride along).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedMapOptions {
    /// uid ranges used at unpack time.
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    /// gid ranges used at unpack time.
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    /// Whether the bundle was extracted without privileges.
    #[serde(default)]
    pub rootless: bool,
    /// Whether directory symlinks were preserved.
    #[serde(default)]
    pub keep_dirlinks: bool,
}

/// The provenance record tying a bundle back to its source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Version of the tool that produced the bundle.
    pub umoci_version: String,
    /// The descriptor path the source tag resolved to.
    pub from_descriptor_path: Vec<Descriptor>,
    /// How ownership was translated.
    pub map_options: SavedMapOptions,
}

impl BundleMeta {
    /// The current tool version, for freshly written bundles.
    pub fn current_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Read the metadata from a bundle directory.
    #[context("Reading bundle metadata from {bundle}")]
    pub fn read(bundle: &Utf8Path) -> Result<Self> {
        let path = bundle.join(META_NAME);
        let f = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                anyhow::anyhow!(Error::not_found(format!("bundle metadata {path}")))
            }
            _ => anyhow::anyhow!(e),
        })?;
        serde_json::from_reader(std::io::BufReader::new(f)).context("parsing umoci.json")
    }

    /// Write the metadata into a bundle directory.
    #[context("Writing bundle metadata to {bundle}")]
    pub fn write(&self, bundle: &Utf8Path) -> Result<()> {
        let f = std::fs::File::create(bundle.join(META_NAME))?;
        serde_json::to_writer(f, self).context("serializing umoci.json")
    }
}

/// The rootfs directory of a bundle.
pub fn rootfs_path(bundle: &Utf8Path) -> Utf8PathBuf {
    bundle.join(ROOTFS_NAME)
}

/// The filesystem-manifest sidecar name for a given manifest digest.
pub fn mtree_name(manifest_digest: &Digest) -> String {
    format!("{}_{}.mtree", manifest_digest.algorithm(), manifest_digest.hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let bundle = Utf8PathBuf::try_from(td.path().to_owned())?;
        let meta = BundleMeta {
            umoci_version: BundleMeta::current_version(),
            from_descriptor_path: Vec::new(),
            map_options: SavedMapOptions {
                rootless: true,
                keep_dirlinks: false,
                uid_mappings: vec!["0:1000:1".parse().unwrap()],
                gid_mappings: Vec::new(),
            },
        };
        meta.write(&bundle)?;
        let read = BundleMeta::read(&bundle)?;
        assert!(read.map_options.rootless);
        assert_eq!(read.map_options.uid_mappings, meta.map_options.uid_mappings);
        assert_eq!(read.umoci_version, meta.umoci_version);
        Ok(())
    }

    #[test]
    fn test_mtree_name() {
        let d: Digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(
            mtree_name(&d),
            "sha256_e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855.mtree"
        );
    }

    #[test]
    fn test_missing_meta_is_not_found() {
        let td = tempfile::tempdir().unwrap();
        let bundle = Utf8PathBuf::try_from(td.path().to_owned()).unwrap();
        let err = BundleMeta::read(&bundle).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NotFound(_))
        ));
    }
}
