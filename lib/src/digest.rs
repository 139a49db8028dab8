//! Content digests in the canonical `algorithm:hex` form.
//!
//! Identity in the blob store is string equality on this form. The writer
//! only ever produces SHA-256; SHA-512 is accepted when reading layouts
//! produced by other tools.

use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use openssl::hash::MessageDigest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256, the default (and only) algorithm the writer produces.
    Sha256,
    /// SHA-512, accepted on read.
    Sha512,
}

impl Algorithm {
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Algorithm::Sha256 => MessageDigest::sha256(),
            Algorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        })
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            o => Err(Error::invalid(format!("unknown digest algorithm {o:?}"))),
        }
    }
}

/// A content digest, e.g. `sha256:e3b0c44298fc...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// The algorithm component.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex component.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compute the SHA-256 digest of a byte slice.
    pub fn sha256_of(buf: &[u8]) -> Result<Self> {
        let mut h = Hasher::new(Algorithm::Sha256)?;
        h.write_all(buf)?;
        h.finish()
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid(format!("invalid digest {s:?}")))?;
        let algorithm = Algorithm::from_str(algo)?;
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::invalid(format!("invalid digest {s:?}")));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An incremental hasher producing a [`Digest`].
pub struct Hasher {
    algorithm: Algorithm,
    inner: openssl::hash::Hasher,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Hasher {
    /// Create a hasher for the given algorithm.
    pub fn new(algorithm: Algorithm) -> Result<Self> {
        Ok(Self {
            algorithm,
            inner: openssl::hash::Hasher::new(algorithm.message_digest())?,
        })
    }

    /// Consume the hasher, returning the digest of everything written.
    pub fn finish(mut self) -> Result<Digest> {
        let bytes = self.inner.finish()?;
        Ok(Digest {
            algorithm: self.algorithm,
            hex: hex::encode(bytes),
        })
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.update(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A writer that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    size: u64,
}

impl<W> fmt::Debug for HashingWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashingWriter")
            .field("size", &self.size)
            .finish()
    }
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`, hashing with `algorithm`.
    pub fn new(inner: W, algorithm: Algorithm) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: Hasher::new(algorithm)?,
            size: 0,
        })
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Unwrap, returning the digest, the byte count and the inner writer.
    pub fn finish(self) -> Result<(Digest, u64, W)> {
        Ok((self.hasher.finish()?, self.size, self.inner))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.inner.update(&buf[..n])?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that hashes and counts everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    size: u64,
}

impl<R> fmt::Debug for HashingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashingReader")
            .field("size", &self.size)
            .finish()
    }
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`, hashing with `algorithm`.
    pub fn new(inner: R, algorithm: Algorithm) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: Hasher::new(algorithm)?,
            size: 0,
        })
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consume the reader, returning the digest and size of what was read.
    pub fn finish(self) -> Result<(Digest, u64)> {
        Ok((self.hasher.finish()?, self.size))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.inner.update(&buf[..n])?;
        self.size += n as u64;
        Ok(n)
    }
}

/// A reader that verifies digest and size against a descriptor's claims
/// once the stream is exhausted.
///
/// The check fires on the first read returning end-of-stream; callers must
/// drain the stream (e.g. with [`std::io::copy`]) for verification to
/// happen. Short reads stay undetected if the caller stops early, which is
/// the same contract the underlying store has.
pub struct VerifyingReader<R> {
    inner: HashingReader<R>,
    expected: Digest,
    expected_size: u64,
    verified: bool,
}

impl<R> fmt::Debug for VerifyingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyingReader")
            .field("expected", &self.expected)
            .field("expected_size", &self.expected_size)
            .finish()
    }
}

impl<R: Read> VerifyingReader<R> {
    /// Wrap `inner`, expecting it to yield exactly `size` bytes hashing to
    /// `digest`.
    pub fn new(inner: R, digest: Digest, size: u64) -> Result<Self> {
        Ok(Self {
            inner: HashingReader::new(inner, digest.algorithm())?,
            expected: digest,
            expected_size: size,
            verified: false,
        })
    }

    fn verify(&mut self) -> std::io::Result<()> {
        if self.verified {
            return Ok(());
        }
        self.verified = true;
        let size = self.inner.size();
        // The openssl hasher resets itself on finish(), so we can hash
        // in place without consuming self.
        let bytes = self.inner.hasher.inner.finish().map_err(std::io::Error::other)?;
        let found = hex::encode(bytes);
        if size != self.expected_size || found != self.expected.hex() {
            let e = Error::corrupt(
                &self.expected,
                format!(
                    "got digest {}:{} with size {} (expected size {})",
                    self.expected.algorithm(),
                    found,
                    size,
                    self.expected_size
                ),
            );
            return Err(std::io::Error::other(anyhow!(e)));
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.verify()?;
        }
        Ok(n)
    }
}
