//! Content-addressed blob storage over an OCI image layout directory.
//!
//! The on-disk layout is fixed by the image-layout specification:
//!
//! ```text
//! <root>/
//!   oci-layout          # {"imageLayoutVersion": "1.0.0"}
//!   index.json          # top-level image index
//!   blobs/<algo>/<hex>  # one file per blob, named by its digest
//!   .umoci-*/           # writer scratch directories
//! ```
//!
//! Blobs are written into a per-writer scratch directory while being
//! hashed, then renamed into place, so a blob file is always complete.
//! A writer holds a non-blocking exclusive `flock` on the image root for
//! its lifetime; a second concurrent writer fails at open time. Readers
//! take no locks.

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use oci_spec::image::{ImageIndex, ImageIndexBuilder, OciLayout, OciLayoutBuilder};
use rustix::fs::FlockOperation;
use tokio_util::sync::CancellationToken;

use crate::digest::{Algorithm, Digest, HashingWriter};
use crate::ioutil;
use crate::Error;

/// Name of the layout version file.
pub const OCI_LAYOUT: &str = "oci-layout";
/// Name of the top-level index.
pub const INDEX_JSON: &str = "index.json";
/// Directory holding all blobs.
pub const BLOBS_DIR: &str = "blobs";
/// Prefix reserved for writer scratch directories.
pub const SCRATCH_PREFIX: &str = ".umoci-";

const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug)]
struct Writer {
    scratch: tempfile::TempDir,
    // Lock order matters on drop: the scratch dir is removed while its
    // lock is still held, then both locks are released.
    _scratch_lock: std::fs::File,
    _root_lock: std::fs::File,
}

/// A handle onto an OCI layout directory.
///
/// Opened either read-only ([`CasDir::open`]) or read-write
/// ([`CasDir::open_rw`]); mutation on a read-only handle is a programming
/// error and fails.
#[derive(Debug)]
pub struct CasDir {
    root: Utf8PathBuf,
    dir: Dir,
    writer: Option<Writer>,
}

fn lock_file(path: &Utf8Path) -> Result<std::fs::File> {
    let f = std::fs::File::open(path).with_context(|| format!("opening {path} for locking"))?;
    match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
        Ok(()) => Ok(f),
        Err(e) if e == rustix::io::Errno::WOULDBLOCK => Err(Error::LockHeld.into()),
        Err(e) => Err(anyhow!(e).context(format!("locking {path}"))),
    }
}

impl CasDir {
    /// Create a fresh, empty image layout at `path`, which must not exist.
    #[context("Creating image layout at {path}")]
    pub fn create(path: &Utf8Path) -> Result<()> {
        std::fs::create_dir(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                anyhow!(Error::invalid(format!("{path} already exists")))
            }
            _ => anyhow!(e),
        })?;
        std::fs::create_dir_all(path.join(BLOBS_DIR).join("sha256"))?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        let layout = OciLayoutBuilder::default()
            .image_layout_version(LAYOUT_VERSION)
            .build()?;
        dir.atomic_replace_with(OCI_LAYOUT, |w| -> Result<()> {
            serde_json::to_writer(w, &layout).map_err(Into::into)
        })?;
        let index = ImageIndexBuilder::default()
            .schema_version(oci_spec::image::SCHEMA_VERSION)
            .manifests(Vec::new())
            .build()?;
        dir.atomic_replace_with(INDEX_JSON, |w| -> Result<()> {
            serde_json::to_writer(w, &index).map_err(Into::into)
        })?;
        Ok(())
    }

    /// Open an existing layout read-only.
    #[context("Opening image layout at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .map_err(|_| Error::not_found(format!("image layout {path}")))?;
        for required in [OCI_LAYOUT, INDEX_JSON, BLOBS_DIR] {
            if !dir.try_exists(required)? {
                bail!(Error::invalid(format!(
                    "{path} is not an image layout: missing {required}"
                )));
            }
        }
        let layout: OciLayout = serde_json::from_reader(dir.open(OCI_LAYOUT)?.into_std())
            .context("parsing oci-layout")?;
        let version = layout.image_layout_version();
        if !(version == LAYOUT_VERSION || version.starts_with("1.")) {
            bail!(Error::invalid(format!(
                "unsupported image layout version {version}"
            )));
        }
        Ok(Self {
            root: path.to_owned(),
            dir,
            writer: None,
        })
    }

    /// Open an existing layout for writing, acquiring the writer lock and
    /// a scratch directory. Fails fast with [`Error::LockHeld`] if another
    /// writer is active.
    #[context("Opening image layout at {path} for writing")]
    pub fn open_rw(path: &Utf8Path) -> Result<Self> {
        let mut this = Self::open(path)?;
        let root_lock = lock_file(&this.root)?;
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&this.root)
            .context("creating scratch directory")?;
        let scratch_path: Utf8PathBuf = scratch
            .path()
            .to_owned()
            .try_into()
            .context("scratch path is not UTF-8")?;
        let scratch_lock = lock_file(&scratch_path)?;
        this.writer = Some(Writer {
            scratch,
            _scratch_lock: scratch_lock,
            _root_lock: root_lock,
        });
        Ok(this)
    }

    /// The layout root path.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Whether this handle can mutate the layout.
    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    fn writer(&self) -> Result<&Writer> {
        self.writer
            .as_ref()
            .ok_or_else(|| anyhow!("internal error: image not opened for writing"))
    }

    fn blob_rel(digest: &Digest) -> String {
        format!("{}/{}/{}", BLOBS_DIR, digest.algorithm(), digest.hex())
    }

    /// Start streaming a new blob into the scratch directory. The blob
    /// materializes when [`BlobWriter::complete`] is called; dropping the
    /// writer discards the partial data.
    #[context("Creating blob writer")]
    pub fn blob_writer(&self) -> Result<BlobWriter<'_>> {
        let writer = self.writer()?;
        let tmp = tempfile::NamedTempFile::new_in(writer.scratch.path())
            .context("creating scratch file")?;
        Ok(BlobWriter {
            cas: self,
            inner: HashingWriter::new(tmp, Algorithm::Sha256)?,
        })
    }

    /// Stream `reader` into a new blob, returning its digest and size.
    ///
    /// Writing the same bytes twice yields the same digest and no
    /// observable change.
    #[context("Writing blob")]
    pub fn put_blob(&self, reader: impl Read, cancel: &CancellationToken) -> Result<(Digest, u64)> {
        let mut w = self.blob_writer()?;
        ioutil::copy_cancellable(reader, &mut w, cancel)?;
        w.complete()
    }

    /// Open a blob for reading. No integrity verification is performed
    /// here; callers wanting verification wrap the result (the typed
    /// engine always does).
    pub fn get_blob(&self, digest: &Digest) -> Result<std::fs::File> {
        let rel = Self::blob_rel(digest);
        match self.dir.open(&rel) {
            Ok(f) => Ok(f.into_std()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {digest}")).into())
            }
            Err(e) => Err(anyhow!(e).context(format!("opening blob {digest}"))),
        }
    }

    /// Size of a stored blob.
    pub fn stat_blob(&self, digest: &Digest) -> Result<u64> {
        let rel = Self::blob_rel(digest);
        match self.dir.metadata(&rel) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {digest}")).into())
            }
            Err(e) => Err(anyhow!(e).context(format!("stat blob {digest}"))),
        }
    }

    /// Delete a blob. Deleting an absent blob is success.
    #[context("Deleting blob {digest}")]
    pub fn delete_blob(&self, digest: &Digest) -> Result<()> {
        let _ = self.writer()?;
        match self.dir.remove_file(Self::blob_rel(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate all stored blobs. Files that do not parse as digests are
    /// skipped with a warning.
    #[context("Listing blobs")]
    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut ret = Vec::new();
        for algo in self.dir.read_dir(BLOBS_DIR)? {
            let algo = algo?;
            if !algo.file_type()?.is_dir() {
                continue;
            }
            let Ok(algo_name) = algo.file_name().into_string() else {
                tracing::warn!("skipping non-UTF-8 entry in {BLOBS_DIR}");
                continue;
            };
            for ent in self
                .dir
                .read_dir(Utf8Path::new(BLOBS_DIR).join(&algo_name))?
            {
                let ent = ent?;
                let Ok(name) = ent.file_name().into_string() else {
                    tracing::warn!("skipping non-UTF-8 blob name in {algo_name}");
                    continue;
                };
                match Digest::from_str(&format!("{algo_name}:{name}")) {
                    Ok(d) => ret.push(d),
                    Err(_) => {
                        tracing::warn!("skipping unparseable blob entry {algo_name}/{name}")
                    }
                }
            }
        }
        Ok(ret)
    }

    /// Read the top-level index.
    #[context("Reading index")]
    pub fn get_index(&self) -> Result<ImageIndex> {
        let f = self.dir.open(INDEX_JSON).context("opening index.json")?;
        serde_json::from_reader(std::io::BufReader::new(f.into_std()))
            .context("parsing index.json")
    }

    /// Replace the top-level index via an atomic rename.
    #[context("Writing index")]
    pub fn put_index(&self, index: &ImageIndex) -> Result<()> {
        let _ = self.writer()?;
        self.dir
            .atomic_replace_with(INDEX_JSON, |w| -> Result<()> {
                serde_json::to_writer(w, index).map_err(Into::into)
            })?;
        Ok(())
    }

    /// Remove scratch directories left behind by crashed writers.
    ///
    /// A scratch dir whose lock can be stolen has no live owner.
    #[context("Cleaning scratch directories")]
    pub fn clean(&self) -> Result<()> {
        let own = self
            .writer
            .as_ref()
            .and_then(|w| w.scratch.path().file_name())
            .map(|n| n.to_os_string());
        for ent in self.dir.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            if Some(&name) == own.as_ref() {
                continue;
            }
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(SCRATCH_PREFIX) {
                continue;
            }
            let path = self.root.join(name);
            if ent.file_type()?.is_dir() {
                match lock_file(&path) {
                    Ok(_lock) => {
                        tracing::debug!("removing stale scratch dir {path}");
                        std::fs::remove_dir_all(&path)
                            .with_context(|| format!("removing {path}"))?;
                    }
                    Err(_) => tracing::debug!("skipping live scratch dir {path}"),
                }
            } else {
                std::fs::remove_file(&path).with_context(|| format!("removing {path}"))?;
            }
        }
        Ok(())
    }
}

/// An in-progress blob write; see [`CasDir::blob_writer`].
pub struct BlobWriter<'a> {
    cas: &'a CasDir,
    inner: HashingWriter<tempfile::NamedTempFile>,
}

impl std::fmt::Debug for BlobWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobWriter")
            .field("size", &self.inner.size())
            .finish()
    }
}

impl BlobWriter<'_> {
    /// Finish the write, installing the blob under its digest.
    #[context("Completing blob")]
    pub fn complete(self) -> Result<(Digest, u64)> {
        let (digest, size, mut tmp) = self.inner.finish()?;
        tmp.flush()?;
        let dest = self.cas.root.join(CasDir::blob_rel(&digest));
        if !dest.try_exists()? {
            tmp.persist(&dest)
                .map_err(|e| anyhow!(e.error).context(format!("installing blob {digest}")))?;
        }
        tracing::debug!("wrote blob {digest} ({size} bytes)");
        Ok((digest, size))
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
