use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length of a hex encoded SHA-256 digest.
pub(crate) const SHA256_HEX_LEN: usize = 64;

#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.chars().all(|ch| ch.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::{is_sha256_hex, sha256_bytes, sha256_file};

    #[test]
    fn sha256_file_matches_in_memory_digest() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file_path = temp.path().join("payload.bin");
        std::fs::write(&file_path, b"abc").expect("payload file should be written");

        let digest = sha256_file(&file_path).expect("checksum should be computed");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest, sha256_bytes(b"abc"));
    }

    #[test]
    fn hex_check_requires_exact_length() {
        assert!(is_sha256_hex(&sha256_bytes(b"")));
        assert!(!is_sha256_hex("abcd"));
        assert!(!is_sha256_hex(&"z".repeat(64)));
    }
}
