//! Small I/O helpers shared by the streaming paths.

use std::io::{Read, Write};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Buffer size for streaming copies.
pub(crate) const COPY_BUF_SIZE: usize = 32 * 1024;

/// Copy `reader` to `writer`, checking the cancellation token at every
/// buffer boundary.
pub(crate) fn copy_cancellable(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// A reader that fails once its cancellation token fires.
pub(crate) struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub(crate) fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

/// List xattr names on a path (not following a final symlink). A
/// filesystem without xattr support reports none.
pub(crate) fn list_xattrs(path: &std::path::Path) -> Result<Vec<String>> {
    let mut buf = vec![0u8; 1024];
    let n = loop {
        match rustix::fs::llistxattr(path, &mut buf) {
            Ok(n) => break n,
            Err(e) if e == rustix::io::Errno::RANGE => buf.resize(buf.len() * 2, 0),
            Err(e) if e == rustix::io::Errno::NOTSUP => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::anyhow!(e).context(format!("llistxattr {path:?}"))),
        }
    };
    Ok(buf[..n]
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

/// Read one xattr value (not following a final symlink).
pub(crate) fn get_xattr(path: &std::path::Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; 1024];
    loop {
        match rustix::fs::lgetxattr(path, name, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(Some(buf));
            }
            Err(e) if e == rustix::io::Errno::RANGE => buf.resize(buf.len() * 2, 0),
            Err(e)
                if e == rustix::io::Errno::NODATA || e == rustix::io::Errno::NOTSUP =>
            {
                return Ok(None)
            }
            Err(e) => return Err(anyhow::anyhow!(e).context(format!("lgetxattr {name} on {path:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy() {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let n = copy_cancellable(&b"abc"[..], &mut out, &cancel).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        assert!(copy_cancellable(&b"abc"[..], &mut out, &cancel).is_err());
    }
}
