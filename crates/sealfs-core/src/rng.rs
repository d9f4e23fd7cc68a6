//! Cryptographic randomness helpers.
//!
//! All key material, IVs, salts, and inode numbers come from the
//! thread-local auto-seeded CSPRNG.

use rand::RngCore;

/// Fill `buffer` with cryptographically secure random bytes.
pub fn fill_random(buffer: &mut [u8]) {
    rand::rng().fill_bytes(buffer);
}

/// A random lowercase-hex string covering `num_bytes` of entropy.
///
/// Used for unique VFS registration names and throwaway file names.
pub fn random_hex_string(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    fill_random(&mut bytes);
    hex::encode(bytes)
}

/// A uniformly random `u64`.
pub fn random_u64() -> u64 {
    rand::rng().next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_string_has_expected_length() {
        assert_eq!(random_hex_string(8).len(), 16);
        assert_eq!(random_hex_string(0), "");
    }

    #[test]
    fn fill_random_is_not_constant() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }
}
