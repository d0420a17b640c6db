//! Content hashing for Burrow.
//!
//! BLAKE3-256 is the content hash used for chunk and whole-file integrity.
//! Key material and signing live outside this crate; the transport hands us
//! an already-authenticated peer.

use std::io::Read;

use crate::wire::{ContentHash, HASH_BUFFER_SIZE};

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use burrow_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, burrow_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream `reader` through a fixed `HASH_BUFFER_SIZE` buffer and hash it.
///
/// Memory use is bounded regardless of input size. Returns the digest and
/// the number of bytes consumed.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(ContentHash, u64)> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}
