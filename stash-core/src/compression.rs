/*!
Stream compression for archive data.

Archives are written and read as streams, so instead of compressing whole
buffers the adapter wraps a writer or reader. Gzip is used for `.tar.gz`
archives; plain tar streams pass through untouched.
*/

use crate::key::ArchiveFormat;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{self, Read, Write};

/// Default gzip level (matches `flate2::Compression::default()`)
pub const DEFAULT_LEVEL: u32 = 6;

/// Compression applied around an archive stream
///
/// # Example
/// ```rust
/// use stash_core::compression::StreamCompression;
/// use std::io::{Read, Write};
///
/// let compression = StreamCompression::gzip();
/// let mut encoder = compression.encoder(Vec::new());
/// encoder.write_all(b"archive bytes").unwrap();
/// let compressed = encoder.finish().unwrap();
///
/// let mut restored = Vec::new();
/// compression.decoder(&compressed[..]).read_to_end(&mut restored).unwrap();
/// assert_eq!(restored, b"archive bytes");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompression {
    /// Pass-through
    None,
    /// Gzip with the given level (0-9)
    Gzip { level: u32 },
}

impl StreamCompression {
    /// Gzip with the default compression level
    pub fn gzip() -> Self {
        Self::Gzip { level: DEFAULT_LEVEL }
    }

    /// Create gzip compression with the specified level
    ///
    /// Levels above 9 are clamped to 9.
    pub fn with_level(level: u32) -> Self {
        Self::Gzip { level: level.min(9) }
    }

    /// Compression matching an archive format
    pub fn for_format(format: ArchiveFormat, level: u32) -> Self {
        match format {
            ArchiveFormat::TarGz => Self::with_level(level),
            ArchiveFormat::Tar => Self::None,
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        match self {
            Self::None => ArchiveFormat::Tar,
            Self::Gzip { .. } => ArchiveFormat::TarGz,
        }
    }

    /// Get the name of the compression algorithm
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip { .. } => "gzip",
        }
    }

    pub fn encoder<W: Write>(&self, inner: W) -> Encoder<W> {
        match *self {
            Self::None => Encoder::Plain(inner),
            Self::Gzip { level } => Encoder::Gzip(GzEncoder::new(inner, Compression::new(level))),
        }
    }

    pub fn decoder<R: Read>(&self, inner: R) -> Decoder<R> {
        match self {
            Self::None => Decoder::Plain(inner),
            Self::Gzip { .. } => Decoder::Gzip(GzDecoder::new(inner)),
        }
    }
}

impl Default for StreamCompression {
    fn default() -> Self {
        Self::gzip()
    }
}

/// Writer half of [`StreamCompression`]. Call [`Encoder::finish`] to flush
/// the trailer; dropping without finishing may truncate gzip output.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Flush all pending output and return the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Reader half of [`StreamCompression`]
pub enum Decoder<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.read(buf),
            Self::Gzip(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: StreamCompression, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut encoder = compression.encoder(Vec::new());
        encoder.write_all(data).unwrap();
        let encoded = encoder.finish().unwrap();

        let mut decoded = Vec::new();
        compression.decoder(&encoded[..]).read_to_end(&mut decoded).unwrap();
        (encoded, decoded)
    }

    #[test]
    fn test_gzip_stream_roundtrip() {
        let original =
            b"This is some test data that should compress well because it has repetitive patterns. "
                .repeat(10);

        let (encoded, decoded) = roundtrip(StreamCompression::gzip(), &original);

        assert!(encoded.len() < original.len());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_gzip_compression_levels() {
        let data = b"Some test data to compress with different levels".repeat(20);

        let (fast, fast_decoded) = roundtrip(StreamCompression::with_level(1), &data);
        let (max, max_decoded) = roundtrip(StreamCompression::with_level(9), &data);

        assert!(max.len() <= fast.len());
        assert_eq!(fast_decoded, data);
        assert_eq!(max_decoded, data);
        assert_eq!(StreamCompression::with_level(42), StreamCompression::Gzip { level: 9 });
    }

    #[test]
    fn test_no_compression_passes_through() {
        let (encoded, decoded) = roundtrip(StreamCompression::None, b"test data");
        assert_eq!(encoded, b"test data");
        assert_eq!(decoded, b"test data");
        assert_eq!(StreamCompression::None.algorithm_name(), "none");
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(StreamCompression::gzip().format(), ArchiveFormat::TarGz);
        assert_eq!(StreamCompression::None.format(), ArchiveFormat::Tar);
        assert_eq!(StreamCompression::for_format(ArchiveFormat::Tar, 9), StreamCompression::None);
        assert_eq!(
            StreamCompression::for_format(ArchiveFormat::TarGz, 3),
            StreamCompression::Gzip { level: 3 }
        );
    }

    #[test]
    fn test_gzip_invalid_data() {
        let mut decoded = Vec::new();
        let result = StreamCompression::gzip()
            .decoder(&b"this is not compressed gzip data"[..])
            .read_to_end(&mut decoded);
        assert!(result.is_err());
    }
}
