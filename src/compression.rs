// Gzip file compression - runs on the blocking pool, streams through flate2

use crate::{BackupError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Suffix appended to compressed artifacts
pub const GZIP_SUFFIX: &str = ".gz";

/// Highest gzip level
pub const MAX_LEVEL: u32 = 9;

fn compress_blocking(input: &Path, output: &Path, level: u32) -> std::io::Result<u64> {
    let mut reader = BufReader::new(File::open(input)?);
    let writer = BufWriter::new(File::create(output)?);
    let mut encoder = GzEncoder::new(writer, Compression::new(level.min(MAX_LEVEL)));
    std::io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(std::fs::metadata(output)?.len())
}

fn decompress_blocking(input: &Path, output: &Path) -> std::io::Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(input)?));
    let mut writer = BufWriter::new(File::create(output)?);
    let written = std::io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(written)
}

/// Gzip `input` into `output` at `level` (clamped to 0-9); returns the compressed size
pub async fn compress_file(input: &Path, output: &Path, level: u32) -> Result<u64> {
    let (input, output) = (input.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || compress_blocking(&input, &output, level))
        .await
        .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))?
        .map_err(|e| BackupError::Compression(format!("Failed to compress: {}", e)))
}

/// Gunzip `input` into `output`; returns the decompressed size
pub async fn decompress_file(input: &Path, output: &Path) -> Result<u64> {
    let (input, output) = (input.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || decompress_blocking(&input, &output))
        .await
        .map_err(|e| BackupError::Compression(format!("decompression task failed: {}", e)))?
        .map_err(|e| BackupError::Compression(format!("Failed to decompress: {}", e)))
}

/// `path` with `.gz` appended
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(GZIP_SUFFIX);
    PathBuf::from(name)
}

/// `path` with a trailing `.gz` removed, if present
pub fn decompressed_path(path: &Path) -> Option<PathBuf> {
    let name = path.to_str()?;
    name.strip_suffix(GZIP_SUFFIX).map(PathBuf::from)
}
