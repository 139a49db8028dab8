//! Filesystem manifests: the change detector behind repack.
//!
//! At unpack time the extracted rootfs is snapshotted into a manifest
//! sidecar (`sha256_<hex>.mtree`); at repack time the saved manifest is
//! compared against the current tree to produce the delta that becomes
//! the new layer. The file format is a line-oriented keyword list in the
//! spirit of mtree(8): one escaped relative path followed by `key=value`
//! pairs.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, Read, Write};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::digest::{Algorithm, Digest, HashingReader};
use crate::ioutil;
use crate::layer::pack::{DeltaEntry, DeltaKind};
use crate::layer::rootless;

const HEADER: &str = "#mtree v1.0 (umoci)";

/// The kind of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Link,
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// Named pipe.
    Fifo,
    /// Unix socket.
    Socket,
}

impl EntryKind {
    fn keyword(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Link => "link",
            EntryKind::Char => "char",
            EntryKind::Block => "block",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "socket",
        }
    }

    fn from_keyword(s: &str) -> Option<Self> {
        Some(match s {
            "file" => EntryKind::File,
            "dir" => EntryKind::Dir,
            "link" => EntryKind::Link,
            "char" => EntryKind::Char,
            "block" => EntryKind::Block,
            "fifo" => EntryKind::Fifo,
            "socket" => EntryKind::Socket,
            _ => return None,
        })
    }
}

/// Everything we compare about one filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Object kind.
    pub kind: EntryKind,
    /// Permission bits (including suid/sgid/sticky).
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Size in bytes (regular files only; zero otherwise).
    pub size: u64,
    /// Modification time, whole seconds.
    pub mtime: i64,
    /// Symlink target.
    pub link: Option<String>,
    /// Content digest (regular files only).
    pub digest: Option<Digest>,
    /// xattrs, hex-encoded values keyed by name.
    pub xattrs: BTreeMap<String, String>,
}

/// A manifest of a directory tree: relative path to entry metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FsTree {
    entries: BTreeMap<Utf8PathBuf, FsEntry>,
}

// Escape a string for single-token storage: everything outside the
// printable ASCII range, plus space, '#', '=' and backslash, becomes
// \ooo.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'!'..=b'~' if b != b'\\' && b != b'#' && b != b'=' => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let mut v = 0u32;
        for _ in 0..3 {
            let d = chars
                .next()
                .and_then(|c| (c as char).to_digit(8))
                .ok_or_else(|| anyhow::anyhow!("bad escape in {s:?}"))?;
            v = v * 8 + d;
        }
        out.push(u8::try_from(v).context("escape out of range")?);
    }
    String::from_utf8(out).context("unescaped value is not UTF-8")
}

fn entry_from_path(abs: &Utf8Path) -> Result<FsEntry> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::symlink_metadata(abs).with_context(|| format!("stat {abs}"))?;
    let file_type = meta.file_type();
    let kind = {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            EntryKind::Link
        } else if file_type.is_char_device() {
            EntryKind::Char
        } else if file_type.is_block_device() {
            EntryKind::Block
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else if file_type.is_socket() {
            EntryKind::Socket
        } else {
            bail!("unsupported file type at {abs}");
        }
    };
    let digest = if kind == EntryKind::File {
        let f = std::fs::File::open(abs).with_context(|| format!("opening {abs}"))?;
        let mut r = HashingReader::new(std::io::BufReader::new(f), Algorithm::Sha256)?;
        std::io::copy(&mut r, &mut std::io::sink())?;
        Some(r.finish()?.0)
    } else {
        None
    };
    let link = if kind == EntryKind::Link {
        let t = std::fs::read_link(abs)?;
        Some(
            t.into_os_string()
                .into_string()
                .map_err(|_| anyhow::anyhow!("non-UTF-8 symlink target at {abs}"))?,
        )
    } else {
        None
    };
    let mut xattrs = BTreeMap::new();
    for name in ioutil::list_xattrs(abs.as_std_path())? {
        // The ownership emulation xattr is bookkeeping, not content.
        if name == rootless::ROOTLESS_XATTR {
            continue;
        }
        if let Some(value) = ioutil::get_xattr(abs.as_std_path(), &name)? {
            xattrs.insert(name, hex::encode(value));
        }
    }
    Ok(FsEntry {
        kind,
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        mtime: meta.mtime(),
        link,
        digest,
        xattrs,
    })
}

impl FsTree {
    /// Snapshot the tree rooted at `root`.
    #[context("Scanning {root}")]
    pub fn scan(root: &Utf8Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let abs: &Utf8Path = entry
                .path()
                .try_into()
                .context("non-UTF-8 path in rootfs")?;
            let rel = abs
                .strip_prefix(root)
                .expect("walkdir stays under its root")
                .to_owned();
            entries.insert(rel, entry_from_path(abs)?);
        }
        Ok(Self { entries })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the changes that turn `self` (the saved snapshot) into
    /// `current`. Deletions under a deleted ancestor are collapsed into
    /// the topmost path; the result is sorted by path.
    pub fn diff(&self, current: &FsTree) -> Vec<DeltaEntry> {
        let mut out = Vec::new();
        let mut deleted: Vec<&Utf8Path> = Vec::new();
        for (path, entry) in &self.entries {
            match current.entries.get(path) {
                Some(now) if now == entry => {}
                Some(_) => out.push(DeltaEntry {
                    path: path.clone(),
                    kind: DeltaKind::Modified,
                }),
                None => {
                    // BTreeMap order means any deleted ancestor was seen
                    // first.
                    if deleted.iter().any(|d| path.starts_with(d)) {
                        continue;
                    }
                    deleted.push(path);
                    out.push(DeltaEntry {
                        path: path.clone(),
                        kind: DeltaKind::Deleted,
                    });
                }
            }
        }
        for path in current.entries.keys() {
            if !self.entries.contains_key(path) {
                out.push(DeltaEntry {
                    path: path.clone(),
                    kind: DeltaKind::Added,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Serialize the manifest.
    #[context("Writing filesystem manifest")]
    pub fn to_writer(&self, mut w: impl Write) -> Result<()> {
        writeln!(w, "{HEADER}")?;
        for (path, e) in &self.entries {
            let mut line = format!(
                "{} type={} mode={:04o} uid={} gid={} time={}",
                escape(path.as_str()),
                e.kind.keyword(),
                e.mode,
                e.uid,
                e.gid,
                e.mtime
            );
            if e.kind == EntryKind::File {
                let _ = write!(line, " size={}", e.size);
            }
            if let Some(d) = &e.digest {
                let _ = write!(line, " sha256digest={}", d.hex());
            }
            if let Some(l) = &e.link {
                let _ = write!(line, " link={}", escape(l));
            }
            for (name, value) in &e.xattrs {
                let _ = write!(line, " xattr.{}={}", escape(name), value);
            }
            writeln!(w, "{line}")?;
        }
        Ok(())
    }

    /// Parse a manifest previously written by [`FsTree::to_writer`].
    #[context("Parsing filesystem manifest")]
    pub fn from_reader(r: impl Read) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for line in std::io::BufReader::new(r).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_ascii_whitespace();
            let path = unescape(tokens.next().expect("split of non-empty line"))?;
            let mut entry = FsEntry {
                kind: EntryKind::File,
                mode: 0,
                uid: 0,
                gid: 0,
                size: 0,
                mtime: 0,
                link: None,
                digest: None,
                xattrs: BTreeMap::new(),
            };
            for token in tokens {
                let (key, value) = token
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("malformed keyword {token:?}"))?;
                match key {
                    "type" => {
                        entry.kind = EntryKind::from_keyword(value)
                            .ok_or_else(|| anyhow::anyhow!("unknown type {value:?}"))?
                    }
                    "mode" => entry.mode = u32::from_str_radix(value, 8)?,
                    "uid" => entry.uid = value.parse()?,
                    "gid" => entry.gid = value.parse()?,
                    "size" => entry.size = value.parse()?,
                    "time" => entry.mtime = value.parse()?,
                    "sha256digest" => {
                        entry.digest = Some(format!("sha256:{value}").parse()?)
                    }
                    "link" => entry.link = Some(unescape(value)?),
                    _ => {
                        if let Some(name) = key.strip_prefix("xattr.") {
                            entry.xattrs.insert(unescape(name)?, value.to_string());
                        } else {
                            tracing::warn!("ignoring unknown manifest keyword {key:?}");
                        }
                    }
                }
            }
            entries.insert(Utf8PathBuf::from(path), entry);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().join("root")).unwrap();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/hostname"), b"darkstar\n").unwrap();
        std::os::unix::fs::symlink("hostname", root.join("etc/alias")).unwrap();
        (td, root)
    }

    #[test]
    fn test_escape_roundtrip() {
        for s in ["plain", "with space", "tab\there", "näme", "back\\slash", "a=b#c"] {
            assert_eq!(unescape(&escape(s)).unwrap(), s, "{s:?}");
        }
        assert_eq!(escape("a b"), "a\\040b");
    }

    #[test]
    fn test_scan_and_serialize_roundtrip() -> Result<()> {
        let (_td, root) = setup();
        let tree = FsTree::scan(&root)?;
        assert_eq!(tree.len(), 3);

        let mut buf = Vec::new();
        tree.to_writer(&mut buf)?;
        let parsed = FsTree::from_reader(&buf[..])?;
        similar_asserts::assert_eq!(parsed, tree);
        Ok(())
    }

    #[test]
    fn test_diff_empty() -> Result<()> {
        let (_td, root) = setup();
        let a = FsTree::scan(&root)?;
        let b = FsTree::scan(&root)?;
        assert!(a.diff(&b).is_empty());
        Ok(())
    }

    fn set_mtime(path: &Utf8Path, secs: i64) {
        let t = filetime::FileTime::from_unix_time(secs, 0);
        filetime::set_symlink_file_times(path.as_std_path(), t, t).unwrap();
    }

    #[test]
    fn test_diff_kinds() -> Result<()> {
        let (_td, root) = setup();
        // Pin the directory mtime so the later mutations move it for sure
        // (scans in the same second would otherwise tie).
        set_mtime(&root.join("etc"), 1000);
        let saved = FsTree::scan(&root)?;

        std::fs::write(root.join("etc/hostname"), b"renamed\n")?;
        std::fs::remove_file(root.join("etc/alias"))?;
        std::fs::write(root.join("etc/new"), b"fresh")?;
        let current = FsTree::scan(&root)?;

        let diff = saved.diff(&current);
        let as_pairs: Vec<_> = diff
            .iter()
            .map(|d| (d.path.as_str(), d.kind))
            .collect();
        // "etc" itself changed (mtime) because children were altered.
        assert!(as_pairs.contains(&("etc", DeltaKind::Modified)));
        assert!(as_pairs.contains(&("etc/alias", DeltaKind::Deleted)));
        assert!(as_pairs.contains(&("etc/hostname", DeltaKind::Modified)));
        assert!(as_pairs.contains(&("etc/new", DeltaKind::Added)));
        Ok(())
    }

    #[test]
    fn test_diff_collapses_deleted_subtrees() -> Result<()> {
        let (_td, root) = setup();
        std::fs::create_dir_all(root.join("opt/deep/deeper"))?;
        std::fs::write(root.join("opt/deep/deeper/file"), b"x")?;
        let saved = FsTree::scan(&root)?;

        std::fs::remove_dir_all(root.join("opt"))?;
        let current = FsTree::scan(&root)?;

        let deleted: Vec<_> = saved
            .diff(&current)
            .into_iter()
            .filter(|d| d.kind == DeltaKind::Deleted)
            .map(|d| d.path)
            .collect();
        assert_eq!(deleted, vec![Utf8PathBuf::from("opt")]);
        Ok(())
    }

    #[test]
    fn test_diff_is_sorted() -> Result<()> {
        let (_td, root) = setup();
        let empty = FsTree::default();
        let current = FsTree::scan(&root)?;
        let diff = empty.diff(&current);
        let mut sorted = diff.iter().map(|d| d.path.clone()).collect::<Vec<_>>();
        sorted.sort();
        assert_eq!(
            diff.iter().map(|d| d.path.clone()).collect::<Vec<_>>(),
            sorted
        );
        Ok(())
    }
}
