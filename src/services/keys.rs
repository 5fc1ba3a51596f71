//! Object key derivation: `{YYYYMMDD}/{content_hash}/{filename}`.

use chrono::NaiveDate;
use thiserror::Error;

const KEY_SEPARATOR: char = '/';
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("filename `{filename}` is not allowed: {reason}")]
    UnsafeFilename { filename: String, reason: &'static str },
    #[error("content hash `{0}` is not lowercase hex")]
    InvalidHash(String),
}

/// Build the storage key for an upload.
///
/// Pure: the same inputs always give the same key. Filenames are rejected,
/// never rewritten, so every accepted name appears verbatim in the key.
pub fn derive_key(
    upload_date: NaiveDate,
    content_hash: &str,
    filename: &str,
) -> Result<String, KeyError> {
    ensure_filename_safe(filename)?;
    if content_hash.is_empty()
        || !content_hash
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(KeyError::InvalidHash(content_hash.to_string()));
    }

    Ok(format!(
        "{}{sep}{}{sep}{}",
        upload_date.format("%Y%m%d"),
        content_hash,
        filename,
        sep = KEY_SEPARATOR
    ))
}

/// Reject names that could escape their key segment.
pub fn ensure_filename_safe(filename: &str) -> Result<(), KeyError> {
    let reject = |reason| {
        Err(KeyError::UnsafeFilename {
            filename: filename.to_string(),
            reason,
        })
    };

    if filename.is_empty() {
        return reject("empty");
    }
    if filename.len() > MAX_FILENAME_LEN {
        return reject("longer than 255 bytes");
    }
    if filename == "." || filename.contains("..") {
        return reject("contains a path traversal sequence");
    }
    if filename.contains(KEY_SEPARATOR) || filename.contains('\\') {
        return reject("contains a path separator");
    }
    if filename.chars().any(char::is_control) {
        return reject("contains control characters");
    }
    Ok(())
}
