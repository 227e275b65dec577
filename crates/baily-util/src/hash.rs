use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Length of the truncated hex digest used in cache-busting queries and ETags.
pub const SHORT_HASH_LEN: usize = 8;

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute a truncated BLAKE3 digest suitable for URL queries (`?v=...`).
#[must_use]
pub fn short_hash(data: &[u8]) -> String {
    let mut hex = content_hash(data);
    hex.truncate(SHORT_HASH_LEN);
    hex
}

/// Compute the BLAKE3 hash of a file, returning the hex-encoded digest.
///
/// Streams the file content to minimize memory usage.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn file_hash(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash a set of `(name, digest)` pairs into one combined digest.
///
/// The pairs are sorted by name first so the result is independent of
/// insertion order. Used for the browser hash over the optimized-dep
/// manifest.
#[must_use]
pub fn combined_hash<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut sorted: Vec<(&str, &str)> = pairs.into_iter().collect();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for (name, digest) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }

    let mut hex = hasher.finalize().to_hex().to_string();
    hex.truncate(SHORT_HASH_LEN);
    hex
}
