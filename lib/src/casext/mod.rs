//! Typed extensions over the raw blob store: media-typed blob access with
//! verification, reference resolution, Merkle walks and garbage
//! collection.

use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use oci_spec::image::{
    Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cas::CasDir;
use crate::digest::{Digest, VerifyingReader};
use crate::Error;

pub mod gc;
pub mod refname;
pub mod resolve;
pub mod walk;

pub use resolve::DescriptorPath;

/// Parse the digest out of a descriptor.
pub(crate) fn descriptor_digest(desc: &Descriptor) -> Result<Digest> {
    Digest::from_str(desc.digest()).map_err(Into::into)
}

/// Parse the size out of a descriptor.
pub(crate) fn descriptor_size(desc: &Descriptor) -> Result<u64> {
    u64::try_from(desc.size())
        .map_err(|_| Error::invalid(format!("descriptor size {} is negative", desc.size())).into())
}

/// The parsed payload of a fetched blob, keyed by its media type.
#[derive(Debug, Clone)]
pub enum ParsedBlob {
    /// `application/vnd.oci.image.manifest.v1+json`
    Manifest(ImageManifest),
    /// `application/vnd.oci.image.index.v1+json`
    Index(ImageIndex),
    /// `application/vnd.oci.image.config.v1+json`
    Config(ImageConfiguration),
    /// Any other media type; the raw bytes.
    Raw(Vec<u8>),
}

/// A verified, parsed blob together with the descriptor naming it.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The descriptor this blob was fetched through.
    pub descriptor: Descriptor,
    /// The parsed payload.
    pub parsed: ParsedBlob,
}

/// The typed engine wrapping a [`CasDir`].
#[derive(Debug)]
pub struct Engine {
    cas: CasDir,
}

impl Engine {
    /// Open an image layout read-only.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            cas: CasDir::open(path)?,
        })
    }

    /// Open an image layout for writing.
    pub fn open_rw(path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            cas: CasDir::open_rw(path)?,
        })
    }

    /// Wrap an already-opened store.
    pub fn from_cas(cas: CasDir) -> Self {
        Self { cas }
    }

    /// Access the underlying store.
    pub fn cas(&self) -> &CasDir {
        &self.cas
    }

    /// Serialize `value` as JSON and store it, returning digest and size.
    #[context("Writing JSON blob")]
    pub fn put_blob_json<S: Serialize>(
        &self,
        value: &S,
        cancel: &CancellationToken,
    ) -> Result<(Digest, u64)> {
        let buf = serde_json::to_vec(value).context("serializing blob")?;
        self.cas.put_blob(&buf[..], cancel)
    }

    /// Open a blob through a descriptor, verifying digest and size as the
    /// stream is drained.
    pub fn verified_reader(&self, desc: &Descriptor) -> Result<VerifyingReader<std::fs::File>> {
        let digest = descriptor_digest(desc)?;
        let size = descriptor_size(desc)?;
        let f = self.cas.get_blob(&digest)?;
        VerifyingReader::new(f, digest, size)
    }

    /// Fetch a blob, verify it against its descriptor, and parse it
    /// according to its media type. Unknown media types yield the raw
    /// bytes.
    #[context("Fetching blob {}", desc.digest())]
    pub fn blob(&self, desc: &Descriptor) -> Result<Blob> {
        let digest = descriptor_digest(desc)?;
        let mut buf = Vec::with_capacity(desc.size().max(0) as usize);
        self.verified_reader(desc)?
            .read_to_end(&mut buf)
            .with_context(|| format!("reading blob {digest}"))?;
        let parsed = match desc.media_type() {
            MediaType::ImageManifest => ParsedBlob::Manifest(
                serde_json::from_slice(&buf)
                    .map_err(|e| Error::corrupt(&digest, format!("parsing manifest: {e}")))?,
            ),
            MediaType::ImageIndex => ParsedBlob::Index(
                serde_json::from_slice(&buf)
                    .map_err(|e| Error::corrupt(&digest, format!("parsing index: {e}")))?,
            ),
            MediaType::ImageConfig => ParsedBlob::Config(
                serde_json::from_slice(&buf)
                    .map_err(|e| Error::corrupt(&digest, format!("parsing config: {e}")))?,
            ),
            _ => ParsedBlob::Raw(buf),
        };
        Ok(Blob {
            descriptor: desc.clone(),
            parsed,
        })
    }

    /// Fetch a blob that must be a manifest.
    pub fn manifest(&self, desc: &Descriptor) -> Result<ImageManifest> {
        match self.blob(desc)?.parsed {
            ParsedBlob::Manifest(m) => Ok(m),
            _ => Err(Error::UnsupportedMediaType(desc.media_type().to_string()).into()),
        }
    }

    /// Fetch a blob that must be an index.
    pub fn index_blob(&self, desc: &Descriptor) -> Result<ImageIndex> {
        match self.blob(desc)?.parsed {
            ParsedBlob::Index(i) => Ok(i),
            _ => Err(Error::UnsupportedMediaType(desc.media_type().to_string()).into()),
        }
    }

    /// Fetch a blob that must be an image configuration.
    pub fn config(&self, desc: &Descriptor) -> Result<ImageConfiguration> {
        match self.blob(desc)?.parsed {
            ParsedBlob::Config(c) => Ok(c),
            _ => Err(Error::UnsupportedMediaType(desc.media_type().to_string()).into()),
        }
    }
}
