//! Applying tar-stream layers to an on-disk directory tree.
//!
//! Entries are applied strictly in stream order. Every name is cleaned
//! and resolved inside the extraction root (see [`super::scoped`]), so a
//! hostile archive cannot write or delete outside it. Whiteout markers
//! from earlier layers are applied as deletions, ownership is translated
//! through the configured id mappings, and in rootless mode privileged
//! operations are emulated.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use fn_error_context::context;
use rustix::fs::{AtFlags, FileType, Mode, OFlags, XattrFlags, CWD};
use rustix::process::{Gid, Uid};
use tar::EntryType;
use tokio_util::sync::CancellationToken;

use super::idmap::MapOptions;
use super::scoped::{clean_entry_name, resolve_in_root};
use super::{rootless, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::ioutil;

/// What to do with whiteout markers found in a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDiskFormat {
    /// Apply whiteouts as deletions, producing a plain rootfs.
    #[default]
    DirRootfs,
    /// Keep whiteout markers as files, for inspecting intermediate
    /// layers.
    OciWhiteout,
}

/// Configuration for layer extraction.
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Ownership translation and rootless emulation.
    pub map: MapOptions,
    /// Keep existing symlinks to directories when a layer carries a
    /// directory entry at the same name (rsync `--keep-dirlinks`).
    pub keep_dirlinks: bool,
    /// Whiteout handling.
    pub on_disk_format: OnDiskFormat,
    /// Cancellation token, checked between entries and during file
    /// content copies.
    pub cancel: CancellationToken,
}

/// Metadata collected from one tar entry before its content is consumed.
#[derive(Debug)]
struct EntryMeta {
    kind: EntryType,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: Timestamp,
    atime: Option<Timestamp>,
    link: Option<Utf8PathBuf>,
    dev: (u32, u32),
    xattrs: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy)]
struct Timestamp {
    secs: i64,
    nsecs: u32,
}

impl Timestamp {
    fn to_filetime(self) -> FileTime {
        FileTime::from_unix_time(self.secs, self.nsecs)
    }
}

// Parse a pax time value ("seconds[.fraction]").
fn parse_pax_time(v: &str) -> Option<Timestamp> {
    let (sec, frac) = match v.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (v, None),
    };
    let secs: i64 = sec.parse().ok()?;
    let nsecs = match frac {
        Some(f) => {
            let digits: String = f.chars().filter(|c| c.is_ascii_digit()).take(9).collect();
            let padded = format!("{digits:0<9}");
            padded.parse().ok()?
        }
        None => 0,
    };
    Some(Timestamp { secs, nsecs })
}

const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

fn read_entry_meta<R: Read>(entry: &mut tar::Entry<R>) -> Result<EntryMeta> {
    let header = entry.header();
    let mut meta = EntryMeta {
        kind: header.entry_type(),
        mode: header.mode()? & 0o7777,
        uid: header.uid()?.try_into().context("uid out of range")?,
        gid: header.gid()?.try_into().context("gid out of range")?,
        mtime: Timestamp {
            secs: header.mtime()?.try_into().unwrap_or(i64::MAX),
            nsecs: 0,
        },
        atime: None,
        link: None,
        dev: (
            header.device_major()?.unwrap_or(0),
            header.device_minor()?.unwrap_or(0),
        ),
        xattrs: Vec::new(),
    };
    if let Some(link) = entry.link_name()? {
        let link = link
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-UTF-8 link name"))?;
        meta.link = Some(Utf8PathBuf::from(link));
    }
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext?;
            let Ok(key) = ext.key() else { continue };
            if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
                meta.xattrs.push((name.to_string(), ext.value_bytes().to_vec()));
            } else if key == "mtime" {
                if let Some(t) = ext.value().ok().and_then(parse_pax_time) {
                    meta.mtime = t;
                }
            } else if key == "atime" {
                meta.atime = ext.value().ok().and_then(parse_pax_time);
            }
        }
    }
    Ok(meta)
}

/// Streams tar layers into a target directory.
#[derive(Debug)]
pub struct TarExtractor {
    root: Utf8PathBuf,
    opts: UnpackOptions,
    // Directory timestamps to reapply once the current layer is done, so
    // child creation does not perturb them. Keyed by resolved relative
    // path; reverse iteration yields children before parents.
    dir_times: BTreeMap<Utf8PathBuf, (Timestamp, Timestamp)>,
}

impl TarExtractor {
    /// Create an extractor writing into `root` (created if missing).
    pub fn new(root: &Utf8Path, opts: UnpackOptions) -> Result<Self> {
        std::fs::create_dir_all(root).with_context(|| format!("creating {root}"))?;
        Ok(Self {
            root: root.to_owned(),
            opts,
            dir_times: BTreeMap::new(),
        })
    }

    /// Apply one (already decompressed) layer.
    #[context("Applying layer")]
    pub fn apply_layer(&mut self, reader: impl Read) -> Result<()> {
        self.dir_times.clear();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            if self.opts.cancel.is_cancelled() {
                bail!("operation cancelled");
            }
            let mut entry = entry?;
            let raw = entry.path()?;
            let Some(name) = raw.to_str().map(str::to_owned) else {
                bail!("non-UTF-8 entry name {raw:?}");
            };
            self.apply_entry(&mut entry, &name)
                .with_context(|| format!("unpacking entry {name:?}"))?;
        }
        // Deepest-first so restoring a parent is not undone by a child.
        for (rel, (atime, mtime)) in std::mem::take(&mut self.dir_times).iter().rev() {
            self.set_times(rel, *atime, *mtime)?;
        }
        Ok(())
    }

    fn abs(&self, rel: &Utf8Path) -> Utf8PathBuf {
        self.root.join(rel)
    }

    fn apply_entry<R: Read>(&mut self, entry: &mut tar::Entry<R>, name: &str) -> Result<()> {
        let Some(cleaned) = clean_entry_name(name) else {
            tracing::trace!("skipping root-level entry {name:?}");
            return Ok(());
        };
        let meta = read_entry_meta(entry)?;

        let base = cleaned.file_name().unwrap_or_default();
        if self.opts.on_disk_format == OnDiskFormat::DirRootfs && base.starts_with(WHITEOUT_PREFIX)
        {
            return self.apply_whiteout(&cleaned, base);
        }

        let resolved = resolve_in_root(&self.root, &cleaned)?;
        let parent = match resolved.parent() {
            Some(p) if !p.as_str().is_empty() => p.to_owned(),
            _ => Utf8PathBuf::from("."),
        };
        std::fs::create_dir_all(self.abs(&parent))
            .with_context(|| format!("creating parent directory {parent}"))?;
        self.save_dir_times(&parent)?;

        let skip_metadata = match meta.kind {
            EntryType::Directory => self.unpack_dir(&resolved, &meta)?,
            EntryType::Regular | EntryType::Continuous => {
                self.unpack_file(&resolved, entry)?;
                false
            }
            EntryType::Symlink => {
                self.unpack_symlink(&resolved, &meta)?;
                false
            }
            EntryType::Link => {
                self.unpack_hardlink(&resolved, &meta)?;
                // The target inode already carries the metadata.
                true
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                self.unpack_special(&resolved, &meta)?
            }
            other => {
                tracing::warn!("skipping unsupported tar entry type {other:?} for {cleaned}");
                true
            }
        };
        if !skip_metadata {
            self.apply_metadata(&resolved, &meta)?;
        }
        Ok(())
    }

    #[context("Applying whiteout {cleaned}")]
    fn apply_whiteout(&mut self, cleaned: &Utf8Path, base: &str) -> Result<()> {
        let parent = cleaned.parent().unwrap_or(Utf8Path::new(""));
        let parent = if parent.as_str().is_empty() {
            Utf8PathBuf::from(".")
        } else {
            resolve_in_root(&self.root, parent)?
        };
        self.save_dir_times(&parent)?;

        if base == OPAQUE_WHITEOUT {
            // Wipe the directory's children, keep the directory itself.
            let dir = self.abs(&parent);
            match std::fs::read_dir(&dir) {
                Ok(entries) => {
                    for ent in entries {
                        let ent = ent?;
                        if ent.file_type()?.is_dir() {
                            std::fs::remove_dir_all(ent.path())?;
                        } else {
                            std::fs::remove_file(ent.path())?;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let target = &base[WHITEOUT_PREFIX.len()..];
        if target.is_empty() {
            bail!("malformed whiteout {cleaned:?}");
        }
        let victim = self.abs(&parent.join(target));
        match std::fs::symlink_metadata(&victim) {
            Ok(m) if m.is_dir() => std::fs::remove_dir_all(&victim)?,
            Ok(_) => std::fs::remove_file(&victim)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!("whiteout for non-existent {victim}");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // Returns true when metadata application should be skipped.
    fn unpack_dir(&mut self, rel: &Utf8Path, _meta: &EntryMeta) -> Result<bool> {
        let abs = self.abs(rel);
        match std::fs::symlink_metadata(&abs) {
            Ok(m) if m.is_dir() => {}
            Ok(m) if m.file_type().is_symlink() => {
                let is_dirlink = std::fs::metadata(&abs).map(|t| t.is_dir()).unwrap_or(false);
                if self.opts.keep_dirlinks && is_dirlink {
                    return Ok(true);
                }
                std::fs::remove_file(&abs)?;
                std::fs::create_dir(&abs)?;
            }
            Ok(_) => {
                std::fs::remove_file(&abs)?;
                std::fs::create_dir(&abs)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&abs)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(false)
    }

    fn remove_conflicting(&self, abs: &Utf8Path) -> Result<()> {
        match std::fs::symlink_metadata(abs) {
            Ok(m) if m.is_dir() => std::fs::remove_dir_all(abs)?,
            Ok(_) => std::fs::remove_file(abs)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn unpack_file<R: Read>(&self, rel: &Utf8Path, entry: &mut tar::Entry<R>) -> Result<()> {
        let abs = self.abs(rel);
        match std::fs::symlink_metadata(&abs) {
            Ok(m) if !m.is_file() => self.remove_conflicting(&abs)?,
            _ => {}
        }
        let fd = rustix::fs::open(
            abs.as_std_path(),
            OFlags::CREATE | OFlags::WRONLY | OFlags::TRUNC | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )
        .with_context(|| format!("creating {abs}"))?;
        let file = std::fs::File::from(fd);
        ioutil::copy_cancellable(entry, file, &self.opts.cancel)?;
        Ok(())
    }

    fn unpack_symlink(&self, rel: &Utf8Path, meta: &EntryMeta) -> Result<()> {
        let target = meta
            .link
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("symlink without target"))?;
        let abs = self.abs(rel);
        self.remove_conflicting(&abs)?;
        // The link content is preserved verbatim; it is only interpreted
        // (scoped to the root) when resolved.
        std::os::unix::fs::symlink(target.as_std_path(), abs.as_std_path())
            .with_context(|| format!("creating symlink {abs}"))?;
        Ok(())
    }

    fn unpack_hardlink(&self, rel: &Utf8Path, meta: &EntryMeta) -> Result<()> {
        let target = meta
            .link
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("hardlink without target"))?;
        let Some(target) = clean_entry_name(target.as_str()) else {
            bail!("invalid hardlink target {target:?}");
        };
        let target = resolve_in_root(&self.root, &target)?;
        let abs = self.abs(rel);
        self.remove_conflicting(&abs)?;
        // std::fs::hard_link does not follow a symlink at the source.
        std::fs::hard_link(self.abs(&target).as_std_path(), abs.as_std_path())
            .with_context(|| format!("hardlinking {abs} -> {target}"))?;
        Ok(())
    }

    // Returns true when metadata application should be skipped.
    fn unpack_special(&self, rel: &Utf8Path, meta: &EntryMeta) -> Result<bool> {
        let file_type = match meta.kind {
            EntryType::Char => FileType::CharacterDevice,
            EntryType::Block => FileType::BlockDevice,
            EntryType::Fifo => FileType::Fifo,
            _ => unreachable!(),
        };
        if self.opts.map.rootless
            && matches!(file_type, FileType::CharacterDevice | FileType::BlockDevice)
        {
            tracing::debug!("rootless: skipping device node {rel}");
            return Ok(true);
        }
        let abs = self.abs(rel);
        self.remove_conflicting(&abs)?;
        let dev = rustix::fs::makedev(meta.dev.0, meta.dev.1);
        rustix::fs::mknodat(
            CWD,
            abs.as_std_path(),
            file_type,
            Mode::from_raw_mode(meta.mode),
            dev,
        )
        .with_context(|| format!("mknod {abs}"))?;
        Ok(false)
    }

    fn save_dir_times(&mut self, rel: &Utf8Path) -> Result<()> {
        if self.dir_times.contains_key(rel) {
            return Ok(());
        }
        let abs = self.abs(rel);
        let meta = match std::fs::symlink_metadata(&abs) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        use std::os::unix::fs::MetadataExt;
        self.dir_times.insert(
            rel.to_owned(),
            (
                Timestamp {
                    secs: meta.atime(),
                    nsecs: meta.atime_nsec() as u32,
                },
                Timestamp {
                    secs: meta.mtime(),
                    nsecs: meta.mtime_nsec() as u32,
                },
            ),
        );
        Ok(())
    }

    fn set_times(&self, rel: &Utf8Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        filetime::set_symlink_file_times(
            self.abs(rel).as_std_path(),
            atime.to_filetime(),
            mtime.to_filetime(),
        )
        .with_context(|| format!("setting times on {rel}"))?;
        Ok(())
    }

    // Application order: owner, mode, xattrs, then times last so the
    // earlier steps do not bump mtime.
    fn apply_metadata(&mut self, rel: &Utf8Path, meta: &EntryMeta) -> Result<()> {
        let abs = self.abs(rel);
        let is_symlink = std::fs::symlink_metadata(&abs)?.file_type().is_symlink();
        let is_dir = !is_symlink && std::fs::symlink_metadata(&abs)?.is_dir();

        let uid = self.opts.map.uid_to_host(meta.uid)?;
        let gid = self.opts.map.gid_to_host(meta.gid)?;
        if self.opts.map.rootless {
            let euid = rustix::process::geteuid().as_raw();
            let egid = rustix::process::getegid().as_raw();
            if uid != euid || gid != egid {
                let payload = rootless::encode(Some(uid), Some(gid));
                if let Err(e) = rustix::fs::lsetxattr(
                    abs.as_std_path(),
                    rootless::ROOTLESS_XATTR,
                    &payload,
                    XattrFlags::empty(),
                ) {
                    tracing::warn!("cannot record ownership of {rel} ({uid}:{gid}): {e}");
                }
            } else if let Err(e) = rustix::fs::lremovexattr(abs.as_std_path(), rootless::ROOTLESS_XATTR)
            {
                if e != rustix::io::Errno::NODATA && e != rustix::io::Errno::NOTSUP {
                    tracing::debug!("clearing ownership emulation on {rel}: {e}");
                }
            }
        } else {
            #[allow(unsafe_code)]
            // Safety: `uid`/`gid` are valid Unix IDs resolved above.
            let (owner, group) = unsafe { (Uid::from_raw(uid), Gid::from_raw(gid)) };
            rustix::fs::chownat(
                CWD,
                abs.as_std_path(),
                Some(owner),
                Some(group),
                AtFlags::SYMLINK_NOFOLLOW,
            )
            .with_context(|| format!("chown {rel} to {uid}:{gid}"))?;
        }

        if !is_symlink {
            rustix::fs::chmod(abs.as_std_path(), Mode::from_raw_mode(meta.mode))
                .with_context(|| format!("chmod {rel}"))?;
        }

        for (name, value) in &meta.xattrs {
            if let Err(e) =
                rustix::fs::lsetxattr(abs.as_std_path(), name, value, XattrFlags::empty())
            {
                let ignorable = e == rustix::io::Errno::NOTSUP
                    || ((self.opts.map.rootless || is_symlink || name.starts_with("security."))
                        && (e == rustix::io::Errno::PERM || e == rustix::io::Errno::ACCESS));
                if ignorable {
                    tracing::warn!("ignoring failure to set xattr {name} on {rel}: {e}");
                } else {
                    return Err(anyhow::anyhow!(e).context(format!("setting xattr {name} on {rel}")));
                }
            }
        }

        let atime = meta.atime.unwrap_or(meta.mtime);
        if is_dir {
            // Deferred to the end of the layer.
            self.dir_times.insert(rel.to_owned(), (atime, meta.mtime));
        } else {
            self.set_times(rel, atime, meta.mtime)?;
        }
        Ok(())
    }
}
