//! Generating tar-stream layers from a directory tree.
//!
//! Pack input is either a delta description (changed paths against a
//! previous snapshot) or an ad-hoc subtree to insert. Output is
//! deterministic: entries are emitted in lexicographic name order, and
//! timestamps are clamped when `SOURCE_DATE_EPOCH` is configured.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use tar::EntryType;
use tokio_util::sync::CancellationToken;

use super::idmap::MapOptions;
use super::{rootless, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::ioutil;

/// The kind of change a delta entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Path exists now and did not before.
    Added,
    /// Path exists in both but differs.
    Modified,
    /// Path existed before and is gone.
    Deleted,
}

/// One changed path, relative to the rootfs.
#[derive(Debug, Clone)]
pub struct DeltaEntry {
    /// Relative path inside the rootfs.
    pub path: Utf8PathBuf,
    /// What happened to it.
    pub kind: DeltaKind,
}

/// Configuration for layer generation.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Ownership translation back into container ids.
    pub map: MapOptions,
    /// Clamp for all emitted timestamps (`SOURCE_DATE_EPOCH`).
    pub epoch: Option<DateTime<Utc>>,
    /// Paths whose contents must not leak into layers (volume mount
    /// points and `--mask-path` arguments).
    pub masked_paths: Vec<Utf8PathBuf>,
    /// Cancellation token, honored while streaming file contents.
    pub cancel: CancellationToken,
}

/// Whether `path` falls under one of the masked prefixes.
pub fn is_masked(path: &Utf8Path, masked: &[Utf8PathBuf]) -> bool {
    masked.iter().any(|m| {
        let m = m.as_str().trim_start_matches('/');
        path.starts_with(m)
    })
}

fn whiteout_name(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let base = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("cannot whiteout {path:?}"))?;
    Ok(match path.parent() {
        Some(p) if !p.as_str().is_empty() => p.join(format!("{WHITEOUT_PREFIX}{base}")),
        _ => Utf8PathBuf::from(format!("{WHITEOUT_PREFIX}{base}")),
    })
}

struct Packer<'a, W: Write> {
    builder: tar::Builder<W>,
    opts: &'a PackOptions,
    // First-seen path per inode, for emitting hardlinks.
    inodes: HashMap<(u64, u64), Utf8PathBuf>,
}

impl<W: Write> fmt::Debug for Packer<'_, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packer").finish()
    }
}

impl<'a, W: Write> Packer<'a, W> {
    fn new(out: W, opts: &'a PackOptions) -> Self {
        Self {
            builder: tar::Builder::new(out),
            opts,
            inodes: HashMap::new(),
        }
    }

    fn clamp(&self, secs: i64) -> u64 {
        crate::timeutil::clamp_secs(secs, self.opts.epoch.as_ref()).max(0) as u64
    }

    fn epoch_secs(&self) -> u64 {
        self.opts
            .epoch
            .as_ref()
            .map(|e| e.timestamp().max(0) as u64)
            .unwrap_or(0)
    }

    fn append_whiteout(&mut self, name: &Utf8Path) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(self.epoch_secs());
        self.builder
            .append_data(&mut header, name, std::io::empty())
            .with_context(|| format!("appending whiteout {name}"))?;
        Ok(())
    }

    // The ownership a tar entry should carry for the file at `abs`:
    // rootless emulation xattrs win, then the inverse id mapping applies.
    fn tar_owner(&self, abs: &Utf8Path, meta: &std::fs::Metadata) -> Result<(u32, u32)> {
        use std::os::unix::fs::MetadataExt;
        let (mut uid, mut gid) = (meta.uid(), meta.gid());
        if self.opts.map.rootless {
            if let Some(payload) =
                ioutil::get_xattr(abs.as_std_path(), rootless::ROOTLESS_XATTR)?
            {
                let (xuid, xgid) = rootless::decode(&payload)
                    .with_context(|| format!("bad ownership emulation xattr on {abs}"))?;
                uid = xuid.unwrap_or(uid);
                gid = xgid.unwrap_or(gid);
            }
        }
        Ok((
            self.opts.map.uid_to_container(uid)?,
            self.opts.map.gid_to_container(gid)?,
        ))
    }

    fn append_xattrs(&mut self, abs: &Utf8Path) -> Result<()> {
        let mut names = ioutil::list_xattrs(abs.as_std_path())?;
        names.sort();
        let mut extensions: Vec<(String, Vec<u8>)> = Vec::new();
        for name in names {
            if name == rootless::ROOTLESS_XATTR {
                continue;
            }
            let Some(value) = ioutil::get_xattr(abs.as_std_path(), &name)? else {
                continue;
            };
            extensions.push((format!("SCHILY.xattr.{name}"), value));
        }
        if !extensions.is_empty() {
            self.builder
                .append_pax_extensions(extensions.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .with_context(|| format!("appending xattrs for {abs}"))?;
        }
        Ok(())
    }

    /// Append the filesystem object at `abs` under the tar name `name`.
    #[context("Packing {name}")]
    fn append_path(&mut self, abs: &Utf8Path, name: &Utf8Path) -> Result<()> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        let meta = std::fs::symlink_metadata(abs)
            .with_context(|| format!("stat {abs} (stale delta?)"))?;
        let file_type = meta.file_type();

        if file_type.is_socket() {
            // Sockets have no tar representation; other tools skip them
            // too.
            tracing::warn!("skipping socket {name}");
            return Ok(());
        }

        let (uid, gid) = self.tar_owner(abs, &meta)?;
        let mut header = tar::Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(uid as u64);
        header.set_gid(gid as u64);
        header.set_mtime(self.clamp(meta.mtime()));
        header.set_size(0);

        self.append_xattrs(abs)?;

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            let name = format!("{name}/");
            self.builder
                .append_data(&mut header, name, std::io::empty())?;
        } else if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            let target = std::fs::read_link(abs)?;
            self.builder.append_link(&mut header, name, target)?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.inodes.get(&key) {
                    header.set_entry_type(EntryType::Link);
                    let first = first.clone();
                    self.builder.append_link(&mut header, name, first)?;
                    return Ok(());
                }
                self.inodes.insert(key, name.to_owned());
            }
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = std::fs::File::open(abs)?;
            let reader = ioutil::CancellableReader::new(file, &self.opts.cancel);
            self.builder.append_data(&mut header, name, reader)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                EntryType::Char
            } else {
                EntryType::Block
            });
            let rdev = meta.rdev();
            header.set_device_major(rustix::fs::major(rdev))?;
            header.set_device_minor(rustix::fs::minor(rdev))?;
            self.builder
                .append_data(&mut header, name, std::io::empty())?;
        } else if file_type.is_fifo() {
            header.set_entry_type(EntryType::Fifo);
            self.builder
                .append_data(&mut header, name, std::io::empty())?;
        } else {
            bail!("unsupported file type for {abs}");
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.builder.into_inner()?.flush()?;
        Ok(())
    }
}

/// Generate a layer from a delta against `rootfs`, writing the
/// uncompressed tar stream to `out`.
#[context("Packing layer delta")]
pub fn pack_delta(
    rootfs: &Utf8Path,
    delta: &[DeltaEntry],
    out: impl Write,
    opts: &PackOptions,
) -> Result<()> {
    enum Action {
        Whiteout,
        Emit(Utf8PathBuf),
    }
    let mut items: Vec<(Utf8PathBuf, Action)> = Vec::new();
    for entry in delta {
        if is_masked(&entry.path, &opts.masked_paths) {
            tracing::debug!("masking {} from layer", entry.path);
            continue;
        }
        match entry.kind {
            DeltaKind::Deleted => items.push((whiteout_name(&entry.path)?, Action::Whiteout)),
            DeltaKind::Added | DeltaKind::Modified => {
                items.push((entry.path.clone(), Action::Emit(entry.path.clone())))
            }
        }
    }
    items.sort_by(|a, b| a.0.cmp(&b.0));

    let mut packer = Packer::new(out, opts);
    for (name, action) in &items {
        match action {
            Action::Whiteout => packer.append_whiteout(name)?,
            Action::Emit(rel) => packer.append_path(&rootfs.join(rel), name)?,
        }
    }
    packer.finish()
}

/// Generate a one-layer stream containing `source` rewritten under
/// `target` (a path inside the image), optionally preceded by an opaque
/// marker shadowing earlier contents of `target`.
#[context("Packing insert layer for {target}")]
pub fn insert_layer(
    source: &Utf8Path,
    target: &Utf8Path,
    opaque: bool,
    out: impl Write,
    opts: &PackOptions,
) -> Result<()> {
    let target = target.as_str().trim_matches('/');
    if target.is_empty() {
        bail!(crate::Error::invalid("insert target must not be the root"));
    }
    let target = Utf8Path::new(target);
    let mut packer = Packer::new(out, opts);
    if opaque {
        packer.append_whiteout(&target.join(OPAQUE_WHITEOUT))?;
    }
    let meta = std::fs::symlink_metadata(source).with_context(|| format!("stat {source}"))?;
    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let abs: &Utf8Path = entry
                .path()
                .try_into()
                .context("non-UTF-8 path in source tree")?;
            let rel = abs
                .strip_prefix(source)
                .expect("walkdir stays under its root");
            let name = if rel.as_str().is_empty() {
                target.to_owned()
            } else {
                target.join(rel)
            };
            packer.append_path(abs, &name)?;
        }
    } else {
        packer.append_path(source, target)?;
    }
    packer.finish()
}

/// Generate a layer containing only a whiteout for `target`.
#[context("Packing whiteout layer for {target}")]
pub fn whiteout_layer(target: &Utf8Path, out: impl Write, opts: &PackOptions) -> Result<()> {
    let target = target.as_str().trim_matches('/');
    if target.is_empty() {
        bail!(crate::Error::invalid("whiteout target must not be the root"));
    }
    let mut packer = Packer::new(out, opts);
    packer.append_whiteout(&whiteout_name(Utf8Path::new(target))?)?;
    packer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn read_entries(tar_bytes: &[u8]) -> Vec<(String, EntryType, Vec<u8>)> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_str().unwrap().to_string();
                let kind = e.header().entry_type();
                let mut content = Vec::new();
                e.read_to_end(&mut content).unwrap();
                (name, kind, content)
            })
            .collect()
    }

    fn setup_rootfs() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().join("rootfs")).unwrap();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/hostname"), b"darkstar\n").unwrap();
        std::os::unix::fs::symlink("hostname", root.join("etc/alias")).unwrap();
        (td, root)
    }

    fn delta(entries: &[(&str, DeltaKind)]) -> Vec<DeltaEntry> {
        entries
            .iter()
            .map(|(p, k)| DeltaEntry {
                path: Utf8PathBuf::from(*p),
                kind: *k,
            })
            .collect()
    }

    #[test]
    fn test_pack_delta_sorted_with_whiteouts() {
        let (_td, root) = setup_rootfs();
        let delta = delta(&[
            ("etc/hostname", DeltaKind::Modified),
            ("etc", DeltaKind::Modified),
            ("etc/gone", DeltaKind::Deleted),
            ("etc/alias", DeltaKind::Added),
        ]);
        let mut out = Vec::new();
        pack_delta(&root, &delta, &mut out, &PackOptions::default()).unwrap();
        let entries = read_entries(&out);
        let names: Vec<_> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["etc/", "etc/.wh.gone", "etc/alias", "etc/hostname"]
        );
        assert_eq!(entries[1].1, EntryType::Regular);
        assert!(entries[1].2.is_empty());
        assert_eq!(entries[2].1, EntryType::Symlink);
        assert_eq!(entries[3].2, b"darkstar\n");
    }

    #[test]
    fn test_masking() {
        let (_td, root) = setup_rootfs();
        let delta = delta(&[
            ("etc/hostname", DeltaKind::Modified),
            ("volume/data", DeltaKind::Added),
        ]);
        let opts = PackOptions {
            masked_paths: vec![Utf8PathBuf::from("/volume")],
            ..Default::default()
        };
        let mut out = Vec::new();
        pack_delta(&root, &delta, &mut out, &opts).unwrap();
        let names: Vec<_> = read_entries(&out)
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert_eq!(names, ["etc/hostname"]);
    }

    #[test]
    fn test_epoch_determinism() {
        let (_td, root) = setup_rootfs();
        let delta = delta(&[("etc/hostname", DeltaKind::Modified)]);
        let opts = PackOptions {
            epoch: Some(chrono::TimeZone::timestamp_opt(&Utc, 100, 0).single().unwrap()),
            ..Default::default()
        };
        let mut a = Vec::new();
        pack_delta(&root, &delta, &mut a, &opts).unwrap();
        let mut b = Vec::new();
        pack_delta(&root, &delta, &mut b, &opts).unwrap();
        assert_eq!(a, b);
        let entries = read_entries(&a);
        let mut archive = tar::Archive::new(&a[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mtime().unwrap(), 100);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_hardlink_grouping() {
        let (_td, root) = setup_rootfs();
        std::fs::hard_link(root.join("etc/hostname"), root.join("etc/hostname2")).unwrap();
        let delta = delta(&[
            ("etc/hostname", DeltaKind::Added),
            ("etc/hostname2", DeltaKind::Added),
        ]);
        let mut out = Vec::new();
        pack_delta(&root, &delta, &mut out, &PackOptions::default()).unwrap();
        let entries = read_entries(&out);
        assert_eq!(entries[0].1, EntryType::Regular);
        assert_eq!(entries[1].1, EntryType::Link);
    }

    #[test]
    fn test_insert_layer() {
        let td = tempfile::tempdir().unwrap();
        let src = Utf8PathBuf::try_from(td.path().join("src")).unwrap();
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("sub/file"), b"inserted").unwrap();

        let mut out = Vec::new();
        insert_layer(
            &src,
            Utf8Path::new("/opt/payload"),
            true,
            &mut out,
            &PackOptions::default(),
        )
        .unwrap();
        let entries = read_entries(&out);
        let names: Vec<_> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "opt/payload/.wh..wh..opq",
                "opt/payload/",
                "opt/payload/sub/",
                "opt/payload/sub/file",
            ]
        );
    }

    #[test]
    fn test_whiteout_layer() {
        let mut out = Vec::new();
        whiteout_layer(Utf8Path::new("etc/passwd"), &mut out, &PackOptions::default()).unwrap();
        let entries = read_entries(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "etc/.wh.passwd");
    }

    #[test]
    fn test_rootless_ownership_reemitted() {
        let (_td, root) = setup_rootfs();
        let payload = super::rootless::encode(Some(0), Some(0));
        if rustix::fs::lsetxattr(
            root.join("etc/hostname").as_std_path(),
            super::rootless::ROOTLESS_XATTR,
            &payload,
            rustix::fs::XattrFlags::empty(),
        )
        .is_err()
        {
            // No user-xattr support on this filesystem; nothing to test.
            return;
        }

        let delta = delta(&[("etc/hostname", DeltaKind::Added)]);
        let opts = PackOptions {
            map: MapOptions {
                rootless: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut out = Vec::new();
        pack_delta(&root, &delta, &mut out, &opts).unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 0);
        assert_eq!(entry.header().gid().unwrap(), 0);
        // The bookkeeping xattr itself must not leak into the layer.
        if let Some(extensions) = entry.pax_extensions().unwrap() {
            for ext in extensions {
                let key = ext.unwrap().key().unwrap_or_default().to_string();
                assert!(!key.contains("rootlesscontainers"), "{key} leaked");
            }
        }
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let (_td, root) = setup_rootfs();
        let delta = delta(&[
            ("etc", DeltaKind::Added),
            ("etc/hostname", DeltaKind::Added),
            ("etc/alias", DeltaKind::Added),
        ]);
        let mut out = Vec::new();
        pack_delta(&root, &delta, &mut out, &PackOptions::default()).unwrap();

        let td2 = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::try_from(td2.path().join("rootfs")).unwrap();
        let opts = super::super::unpack::UnpackOptions {
            map: MapOptions {
                rootless: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut extractor = super::super::unpack::TarExtractor::new(&dest, opts).unwrap();
        extractor.apply_layer(&out[..]).unwrap();

        assert_eq!(std::fs::read(dest.join("etc/hostname")).unwrap(), b"darkstar\n");
        let link = std::fs::read_link(dest.join("etc/alias")).unwrap();
        assert_eq!(link.to_str().unwrap(), "hostname");

        // Source and destination agree on metadata that survives rootless
        // extraction.
        let mut expected = BTreeMap::new();
        for name in ["etc/hostname", "etc/alias"] {
            use std::os::unix::fs::MetadataExt;
            let m = std::fs::symlink_metadata(root.join(name)).unwrap();
            expected.insert(name, (m.mode(), m.mtime()));
            let d = std::fs::symlink_metadata(dest.join(name)).unwrap();
            assert_eq!((d.mode(), d.mtime()), expected[&name], "{name}");
        }
    }
}
