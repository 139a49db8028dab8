//! The layer codec: translating between tar-stream layer blobs and
//! on-disk directory trees.

use std::fmt;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use oci_spec::image::MediaType;

pub mod idmap;
pub mod pack;
pub mod rootless;
pub(crate) mod scoped;
pub mod unpack;

/// Prefix marking a whiteout entry: `d/.wh.x` deletes `d/x` from earlier
/// layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Basename of an opaque whiteout: shadows every earlier entry in its
/// directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression applied to a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store the raw tar stream.
    None,
    /// gzip (the most interoperable default).
    #[default]
    Gzip,
    /// zstd.
    Zstd,
}

impl Compression {
    /// The layer media type corresponding to this compression.
    pub fn media_type(&self) -> MediaType {
        match self {
            Compression::None => MediaType::ImageLayer,
            Compression::Gzip => MediaType::ImageLayerGzip,
            Compression::Zstd => MediaType::ImageLayerZstd,
        }
    }

    /// The compression implied by a layer media type.
    pub fn from_media_type(media_type: &MediaType) -> Option<Self> {
        match media_type {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => {
                Some(Compression::None)
            }
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
                Some(Compression::Gzip)
            }
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
                Some(Compression::Zstd)
            }
            _ => None,
        }
    }

    /// Wrap `inner` in the corresponding encoder.
    ///
    /// The gzip header carries no filename and a zero mtime, so output
    /// depends only on the input bytes.
    pub fn wrap<W: Write>(&self, inner: W) -> Result<CompressingWriter<W>> {
        Ok(match self {
            Compression::None => CompressingWriter::Plain(inner),
            Compression::Gzip => CompressingWriter::Gzip(GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            Compression::Zstd => CompressingWriter::Zstd(
                zstd::stream::write::Encoder::new(inner, zstd::DEFAULT_COMPRESSION_LEVEL)
                    .context("initializing zstd encoder")?,
            ),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

/// A layer encoder over an arbitrary writer; see [`Compression::wrap`].
pub enum CompressingWriter<W: Write> {
    /// Pass-through.
    Plain(W),
    /// gzip encoding.
    Gzip(GzEncoder<W>),
    /// zstd encoding.
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> fmt::Debug for CompressingWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressingWriter::Plain(_) => "CompressingWriter::Plain",
            CompressingWriter::Gzip(_) => "CompressingWriter::Gzip",
            CompressingWriter::Zstd(_) => "CompressingWriter::Zstd",
        })
    }
}

impl<W: Write> CompressingWriter<W> {
    /// Flush any buffered compressed data and return the inner writer.
    pub fn finish(self) -> Result<W> {
        match self {
            CompressingWriter::Plain(w) => Ok(w),
            CompressingWriter::Gzip(enc) => enc.finish().context("finishing gzip stream"),
            CompressingWriter::Zstd(enc) => enc.finish().context("finishing zstd stream"),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CompressingWriter::Plain(w) => w.write(buf),
            CompressingWriter::Gzip(w) => w.write(buf),
            CompressingWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CompressingWriter::Plain(w) => w.flush(),
            CompressingWriter::Gzip(w) => w.flush(),
            CompressingWriter::Zstd(w) => w.flush(),
        }
    }
}

/// Wrap `reader` in a decompressor chosen by sniffing its magic bytes:
/// gzip, zstd, or raw pass-through.
pub fn decompress<'a>(mut reader: impl Read + 'a) -> Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = reader.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let head = std::io::Cursor::new(magic).take(filled as u64);
    let chained = head.chain(reader);
    Ok(if filled >= 2 && magic[..2] == GZIP_MAGIC {
        Box::new(flate2::read::GzDecoder::new(chained))
    } else if filled >= 4 && magic == ZSTD_MAGIC {
        Box::new(zstd::stream::read::Decoder::new(chained).context("initializing zstd decoder")?)
    } else {
        Box::new(chained)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: Compression, data: &[u8]) -> Vec<u8> {
        let mut enc = compression.wrap(Vec::new()).unwrap();
        enc.write_all(data).unwrap();
        let compressed = enc.finish().unwrap();
        let mut out = Vec::new();
        decompress(&compressed[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let data = b"some layer bytes some layer bytes some layer bytes";
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            assert_eq!(roundtrip(compression, data), data, "{compression}");
        }
    }

    #[test]
    fn test_short_stream_passthrough() {
        // Shorter than any magic; must come back verbatim.
        let mut out = Vec::new();
        decompress(&b"x"[..]).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"x");
        let mut out = Vec::new();
        decompress(&b""[..]).unwrap().read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_media_types() {
        assert_eq!(Compression::Gzip.media_type(), MediaType::ImageLayerGzip);
        assert_eq!(
            Compression::from_media_type(&MediaType::ImageLayerZstd),
            Some(Compression::Zstd)
        );
        assert_eq!(Compression::from_media_type(&MediaType::ImageConfig), None);
    }
}
