use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Result as IoResult, Write};
use std::path::Path;
use thiserror::Error;

pub fn sha256_file(path: &Path) -> IoResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Which side of a buffered copy failed. The two sides usually belong
/// to different collaborators (e.g. an extraction stream feeding a
/// local spool file), so callers can map them to different error
/// kinds.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
}

/// Copy `reader` into `writer` through a fixed-size buffer, returning the
/// byte count and hex SHA-256 of everything copied. Memory use is bounded
/// by the buffer regardless of stream size.
pub fn copy_and_hash<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> Result<(u64, String), CopyError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf).map_err(CopyError::Read)?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
    writer.flush().map_err(CopyError::Write)?;
    Ok((total, hex::encode(hasher.finalize())))
}
