//! Content hashing for cache keys and manifest input fingerprints.
//!
//! Every skip decision in the pipeline rests on comparing a recorded hash
//! against the current inputs, so all hashing goes through this module to
//! keep the encoding consistent: SHA-256, lowercase hex.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::BristlenoseError;

/// Hash a byte slice to lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// Hash a file's contents without reading it fully into memory.
///
/// Media files can be multi-gigabyte, so this streams in 1 MiB chunks.
pub fn hash_file(path: &Path) -> Result<String, BristlenoseError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// Hash an ordered sequence of strings into one fingerprint.
///
/// Each part is length-prefixed before hashing so `["ab", "c"]` and
/// `["a", "bc"]` produce different digests.
pub fn hash_strings<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex(&hasher.finalize())
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_strings_length_prefixed() {
        assert_ne!(hash_strings(["ab", "c"]), hash_strings(["a", "bc"]));
        assert_eq!(hash_strings(["a", "b"]), hash_strings(["a", "b"]));
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(hash_file(&path).unwrap(), sha256_hex(b"hello world"));
    }
}
