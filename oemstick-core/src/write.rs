//! Streams the installer image onto the removable device.
//!
//! The write is split in two so the capacity gate can sit between them:
//! 1.  [`prepare`] decompresses the image if needed (`.gz`, `.xz`, `.zst`)
//!     and reports its final byte size without touching the device.
//! 2.  [`run`] wipes old filesystem signatures (best effort), writes the
//!     image raw, flushes it fully, then forces the kernel to re-read the
//!     partition table and waits for udev to settle. Only after that may the
//!     device's geometry be queried again.

use crate::cmd;
use crate::error::{Error, Result};
use crate::platform;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// An image ready to be written raw: decompressed if it was compressed, with
/// a known byte size. If decompression produced a temp file, the handle keeps
/// it alive and deletes it on drop.
pub struct PreparedImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    _temp_handle: Option<TempPath>,
}

/// True if the path's extension names a compression format [`prepare`]
/// understands.
pub fn is_compressed(image_path: &Path) -> bool {
    image_path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            matches!(
                e.to_lowercase().as_str(),
                "gz" | "gzip" | "xz" | "zst" | "zstd"
            )
        })
}

/// Decompresses `image_path` to a temp file if it is compressed, and returns
/// it with its final size. Uncompressed images are passed through untouched.
pub fn prepare<F>(
    image_path: &Path,
    running: Arc<AtomicBool>,
    on_decompress_start: impl FnOnce(),
    mut on_progress: F,
) -> Result<PreparedImage>
where
    F: FnMut(u64),
{
    let ext = image_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let input_file = File::open(image_path)?;

    let mut reader: Box<dyn Read> = match ext.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input_file))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input_file))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
        // Not compressed: size comes straight from the file metadata.
        _ => {
            let size_bytes = input_file.metadata()?.len();
            return Ok(PreparedImage {
                path: image_path.to_path_buf(),
                size_bytes,
                _temp_handle: None,
            });
        }
    };

    on_decompress_start();
    tracing::debug!(image = %image_path.display(), "decompressing image");

    let mut temp_file = NamedTempFile::new()?;
    let mut total: u64 = 0;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = [0u8; 8192];

        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    Ok(PreparedImage {
        path: temp_path.to_path_buf(),
        size_bytes: total,
        _temp_handle: Some(temp_path),
    })
}

/// Best-effort signature wipe. Old filesystem and RAID signatures on the
/// device can confuse later probing; failing to clear them is not fatal
/// because the raw write overwrites the relevant regions anyway.
fn wipe_signatures(device_path: &Path) {
    let dev = device_path.to_string_lossy();
    let result = cmd::require("wipefs").and_then(|_| cmd::run("wipefs", &["-a", &dev]));
    if let Err(err) = result {
        tracing::warn!(device = %dev, %err, "signature wipe failed; continuing");
    }
}

/// Writes a prepared image raw onto the device, with optional verification.
///
/// Destroys all prior content on the device. On return the written data is
/// fully flushed and the kernel's view of the partition table has been
/// refreshed and settled, so the provisioner may query the device.
///
/// # Errors
///
/// [`Error::WriteFailed`] for any I/O failure on the device path or a
/// verification mismatch; [`Error::Cancelled`] if the shared flag is
/// cleared mid-stream. A partial write is left as-is: undoing a raw device
/// write is not well-defined.
pub fn run<F1, F2>(
    image: &PreparedImage,
    device_path: &Path,
    verify: bool,
    running: Arc<AtomicBool>,
    on_write_start: impl FnOnce(u64),
    mut on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    mut on_verify_progress: F2,
) -> Result<()>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    wipe_signatures(device_path);

    let mut image_file = File::open(&image.path)?;
    let image_len = image.size_bytes;

    let mut device_file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT) // unbuffered I/O
        .open(device_path)
        .map_err(|e| Error::WriteFailed(format!("opening {}: {e}", device_path.display())))?;

    on_write_start(image_len);

    // Align buffer to 512 bytes for O_DIRECT compatibility.
    let block_size = 512;
    let mut buf = vec![0u8; BUFFER_SIZE + block_size];
    let offset = buf.as_ptr().align_offset(block_size);
    let buffer = &mut buf[offset..offset + BUFFER_SIZE];

    let mut written: u64 = 0;
    while written < image_len {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
        image_file.read_exact(&mut buffer[..to_read])?;

        // The last chunk may not be a multiple of the block size; pad with
        // zeros to satisfy O_DIRECT.
        let padded_size = if to_read % block_size != 0 {
            let pad = to_read.div_ceil(block_size) * block_size;
            buffer[to_read..pad].fill(0);
            pad
        } else {
            to_read
        };

        device_file
            .write_all(&buffer[..padded_size])
            .map_err(|e| Error::WriteFailed(e.to_string()))?;
        written += to_read as u64;
        on_write_progress(written);
    }

    // Nothing may remain buffered before any partition-table operation.
    device_file
        .flush()
        .and_then(|_| device_file.sync_all())
        .map_err(|e| Error::WriteFailed(format!("flushing device: {e}")))?;
    drop(device_file);

    if verify {
        verify_written(
            &image.path,
            device_path,
            image_len,
            running,
            on_verify_start,
            &mut on_verify_progress,
        )?;
    }

    // Blocking, not advisory: the provisioner must see the freshly written
    // partition table.
    platform::reread_partition_table(device_path)?;
    platform::udev_settle()?;

    Ok(())
}

/// Compares SHA-256 of the source image against a readback of the same byte
/// range from the device.
fn verify_written<F>(
    image_path: &Path,
    device_path: &Path,
    image_len: u64,
    running: Arc<AtomicBool>,
    on_verify_start: impl FnOnce(u64),
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let mut image_file = File::open(image_path)?;
    let mut device_file = File::open(device_path)
        .map_err(|e| Error::WriteFailed(format!("reopening device for verify: {e}")))?;

    on_verify_start(image_len);

    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();

    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let mut remaining = image_len;
    while remaining > 0 {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_file.read_exact(&mut image_buf[..chunk])?;
        device_file
            .read_exact(&mut device_buf[..chunk])
            .map_err(|e| Error::WriteFailed(format!("reading device back: {e}")))?;

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        on_progress(image_len - remaining);
    }

    if image_hasher.finalize() != device_hasher.finalize() {
        return Err(Error::WriteFailed("verification hash mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn compression_detection_by_extension() {
        assert!(is_compressed(Path::new("image.img.xz")));
        assert!(is_compressed(Path::new("image.raw.GZ")));
        assert!(is_compressed(Path::new("image.zst")));
        assert!(!is_compressed(Path::new("image.img")));
        assert!(!is_compressed(Path::new("image.iso")));
    }

    #[test]
    fn prepare_passes_uncompressed_images_through() {
        let mut f = NamedTempFile::with_suffix(".img").unwrap();
        f.write_all(&[0xAB; 4096]).unwrap();
        f.flush().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let prepared = prepare(f.path(), running, || {}, |_| {}).unwrap();
        assert_eq!(prepared.path, f.path());
        assert_eq!(prepared.size_bytes, 4096);
    }

    #[test]
    fn prepare_decompresses_gzip_and_reports_final_size() {
        let payload = vec![0x5Au8; 10_000];
        let mut f = NamedTempFile::with_suffix(".gz").unwrap();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut f, flate2::Compression::default());
            encoder.write_all(&payload).unwrap();
            encoder.finish().unwrap();
        }
        f.flush().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let mut last_progress = 0;
        let prepared = prepare(f.path(), running, || {}, |n| last_progress = n).unwrap();
        assert_ne!(prepared.path, f.path());
        assert_eq!(prepared.size_bytes, payload.len() as u64);
        assert_eq!(last_progress, payload.len() as u64);
        assert_eq!(std::fs::read(&prepared.path).unwrap(), payload);
    }

    #[test]
    fn prepare_honors_cancellation() {
        let mut f = NamedTempFile::with_suffix(".gz").unwrap();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut f, flate2::Compression::default());
            encoder.write_all(&[0u8; 100_000]).unwrap();
            encoder.finish().unwrap();
        }
        f.flush().unwrap();

        let running = Arc::new(AtomicBool::new(false));
        assert!(matches!(
            prepare(f.path(), running, || {}, |_| {}),
            Err(Error::Cancelled)
        ));
    }
}
