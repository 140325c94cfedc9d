//! File persistence helpers: atomic writes, JSON state and bincode blobs.
//!
//! Every writer goes through [`atomic_write`] (write to a `.tmp` sibling, then
//! rename) so a crash never leaves a half-written state or weights file.

use crate::error::NetError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Atomically write raw bytes, creating parent directories as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), NetError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write `data` as pretty-printed JSON.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<(), NetError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes())
}

/// Load JSON from `path`. Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, NetError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Atomically write `data` with bincode and return the SHA-256 of the bytes
/// written.
pub fn atomic_write_bincode<T: Serialize + ?Sized>(
    path: &Path,
    data: &T,
) -> Result<String, NetError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut writer = BufWriter::new(File::create(&tmp)?);
    bincode::serialize_into(&mut writer, data)?;
    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp, path)?;
    sha256_file(path)
}

/// Read a bincode file written by [`atomic_write_bincode`].
pub fn load_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, NetError> {
    if !path.exists() {
        return Err(NetError::not_found(path.display().to_string()));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn sha256_file(path: &Path) -> Result<String, NetError> {
    Ok(sha256_hex(&std::fs::read(path)?))
}
