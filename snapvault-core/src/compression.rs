/*!
Compression algorithms and codecs for snapshot artifacts.

Every algorithm snapvault knows about is a variant of [`CompressionAlgorithm`],
and each variant owns exactly one filename suffix. Name resolution, the
snapshot file filter, and the codecs all read from the same table, so adding
an algorithm is a compile-checked change rather than a new string to match.
*/

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use flate2::{read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, SnapvaultError};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Raw, uncompressed artifact
    None,
    Gzip,
    Bzip2,
    Lz4,
    /// Default for newly ingested snapshots
    #[default]
    Zstd,
}

impl CompressionAlgorithm {
    /// Every algorithm, uncompressed first
    pub const ALL: [CompressionAlgorithm; 5] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Bzip2,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
    ];

    /// Algorithms that change the filename, in lookup priority order
    pub const COMPRESSED: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Bzip2,
    ];

    /// Filename suffix appended by this algorithm
    pub const fn suffix(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "",
            CompressionAlgorithm::Gzip => ".gz",
            CompressionAlgorithm::Bzip2 => ".bz2",
            CompressionAlgorithm::Lz4 => ".lz4",
            CompressionAlgorithm::Zstd => ".zst",
        }
    }

    /// Canonical lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Bzip2 => "bzip2",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, CompressionAlgorithm::None)
    }

    /// Detect the algorithm from a filename's suffix
    ///
    /// Names without a known compressed suffix are reported as `None`.
    pub fn from_filename(name: &str) -> Self {
        Self::COMPRESSED
            .into_iter()
            .find(|algorithm| name.ends_with(algorithm.suffix()))
            .unwrap_or(CompressionAlgorithm::None)
    }

    /// Strip this algorithm's suffix from `name`, if present
    pub fn strip_suffix(self, name: &str) -> &str {
        if self.is_none() {
            return name;
        }
        name.strip_suffix(self.suffix()).unwrap_or(name)
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = SnapvaultError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Ok(CompressionAlgorithm::None);
        }
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name() == wanted)
            .ok_or_else(|| SnapvaultError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// True if `name` ends with any known compressed suffix
pub fn is_compressed(name: &str) -> bool {
    !CompressionAlgorithm::from_filename(name).is_none()
}

/// Streaming codec abstraction
///
/// Codecs move bytes from a reader to a writer so multi-gigabyte snapshots
/// never have to be held in memory.
pub trait CompressionAdapter {
    /// Compress everything from `input` into `output`, returning bytes read
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64>;

    /// Decompress everything from `input` into `output`, returning bytes written
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64>;

    /// The algorithm this codec implements
    fn algorithm(&self) -> CompressionAlgorithm;
}

fn codec_error(algorithm: CompressionAlgorithm, stage: &str, e: impl fmt::Display) -> SnapvaultError {
    SnapvaultError::compression(format!("{algorithm} {stage} failed: {e}"))
}

/// Gzip codec (DEFLATE)
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl GzipCompressor {
    pub fn new() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }

    /// Compression level 0-9
    pub fn with_level(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut encoder = GzEncoder::new(output, self.level);
        let read = io::copy(input, &mut encoder).map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        encoder
            .finish()
            .map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        Ok(read)
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut decoder = GzDecoder::new(input);
        io::copy(&mut decoder, output).map_err(|e| codec_error(self.algorithm(), "decompression", e))
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Gzip
    }
}

/// Bzip2 codec
#[derive(Debug, Clone, Default)]
pub struct Bzip2Compressor;

impl CompressionAdapter for Bzip2Compressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut encoder = bzip2::write::BzEncoder::new(output, bzip2::Compression::default());
        let read = io::copy(input, &mut encoder).map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        encoder
            .finish()
            .map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        Ok(read)
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut decoder = bzip2::read::MultiBzDecoder::new(input);
        io::copy(&mut decoder, output).map_err(|e| codec_error(self.algorithm(), "decompression", e))
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Bzip2
    }
}

/// LZ4 codec using the standard frame format
#[derive(Debug, Clone, Default)]
pub struct Lz4Compressor;

impl CompressionAdapter for Lz4Compressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
        let read = io::copy(input, &mut encoder).map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        encoder
            .finish()
            .map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        Ok(read)
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(input);
        io::copy(&mut decoder, output).map_err(|e| codec_error(self.algorithm(), "decompression", e))
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }
}

/// Zstandard codec
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for ZstdCompressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut encoder = zstd::stream::write::Encoder::new(output, self.level)
            .map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        let read = io::copy(input, &mut encoder).map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        encoder
            .finish()
            .map_err(|e| codec_error(self.algorithm(), "compression", e))?;
        Ok(read)
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut decoder = zstd::stream::read::Decoder::new(input)
            .map_err(|e| codec_error(self.algorithm(), "decompression", e))?;
        io::copy(&mut decoder, output).map_err(|e| codec_error(self.algorithm(), "decompression", e))
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }
}

/// Passthrough codec for raw artifacts
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        Ok(io::copy(input, output)?)
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        Ok(io::copy(input, output)?)
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }
}

/// Codec for `algorithm`
pub fn codec_for(algorithm: CompressionAlgorithm) -> Box<dyn CompressionAdapter + Send + Sync> {
    match algorithm {
        CompressionAlgorithm::None => Box::new(NoCompression),
        CompressionAlgorithm::Gzip => Box::new(GzipCompressor::new()),
        CompressionAlgorithm::Bzip2 => Box::new(Bzip2Compressor),
        CompressionAlgorithm::Lz4 => Box::new(Lz4Compressor),
        CompressionAlgorithm::Zstd => Box::new(ZstdCompressor::new()),
    }
}

/// Compress `src` into `dst` with `algorithm`
///
/// Output is staged in a temporary file next to `dst` and renamed into place,
/// so a failed run never leaves a truncated artifact behind.
pub fn compress_file(src: &Path, dst: &Path, algorithm: CompressionAlgorithm) -> Result<u64> {
    let codec = codec_for(algorithm);
    transcode(src, dst, |input, output| codec.compress(input, output))
}

/// Decompress `src` into `dst`, detecting the algorithm from `src`'s suffix
///
/// An uncompressed `src` is copied as-is.
pub fn decompress_file(src: &Path, dst: &Path) -> Result<CompressionAlgorithm> {
    let algorithm = CompressionAlgorithm::from_filename(&src.to_string_lossy());
    let codec = codec_for(algorithm);
    transcode(src, dst, |input, output| codec.decompress(input, output))?;
    Ok(algorithm)
}

fn transcode<F>(src: &Path, dst: &Path, run: F) -> Result<u64>
where
    F: FnOnce(&mut dyn Read, &mut dyn Write) -> Result<u64>,
{
    let parent = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| {
        SnapvaultError::storage(format!("Failed to create directory {}: {e}", parent.display()))
    })?;

    let source = File::open(src)
        .map_err(|e| SnapvaultError::storage(format!("Failed to open {}: {e}", src.display())))?;
    let mut reader = BufReader::new(source);

    let staged = tempfile::NamedTempFile::new_in(parent)?;
    let mut writer = BufWriter::new(staged);
    let processed = run(&mut reader as &mut dyn Read, &mut writer as &mut dyn Write)?;

    let staged = writer
        .into_inner()
        .map_err(|e| SnapvaultError::storage(format!("Failed to flush {}: {e}", dst.display())))?;
    staged
        .persist(dst)
        .map_err(|e| SnapvaultError::storage(format!("Failed to write {}: {}", dst.display(), e.error)))?;

    debug!(src = %src.display(), dst = %dst.display(), bytes = processed, "Transcoded snapshot file");
    Ok(processed)
}
