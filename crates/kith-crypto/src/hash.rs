use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Short fingerprint of a public key for logs and UI: first 8 bytes of
/// sha256 over the key bytes, hex encoded.
pub fn fingerprint(key_bytes: &[u8]) -> String {
    hex::encode(&sha256(key_bytes)[..8])
}
