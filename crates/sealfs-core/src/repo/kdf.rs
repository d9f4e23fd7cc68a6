//! User key derivation.
//!
//! `user_key = Argon2id(password, effective_salt)`. The effective salt is
//! the stored 32-byte salt; when a key file is supplied it becomes the
//! BLAKE3 keyed hash of the key file's contents under that salt. Losing
//! either credential makes the repository undecryptable.

use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::repo::config::{Argon2idParams, MASTER_KEY_LEN, SALT_LEN};

/// Derive the 32-byte user key from the password and optional key file.
pub fn derive_user_key(
    password: &[u8],
    key_file: Option<&Path>,
    salt: &[u8],
    params: &Argon2idParams,
) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>> {
    let salt: &[u8; SALT_LEN] = salt
        .try_into()
        .map_err(|_| Error::invalid(format!("salt has {} bytes, expected {SALT_LEN}", salt.len())))?;

    let mut effective_salt = Zeroizing::new(*salt);
    if let Some(path) = key_file {
        let mut hasher = blake3::Hasher::new_keyed(salt);
        let mut file = std::fs::File::open(path)?;
        std::io::copy(&mut file, &mut hasher)?;
        effective_salt.copy_from_slice(hasher.finalize().as_bytes());
    }

    // memory_cost is persisted in MiB; Argon2 takes KiB.
    let memory_kib = params
        .memory_cost
        .checked_mul(1024)
        .ok_or_else(|| Error::invalid("argon2 memory cost overflows"))?;
    let argon_params = Params::new(
        memory_kib,
        params.time_cost,
        params.parallelism,
        Some(MASTER_KEY_LEN),
    )
    .map_err(|e| Error::invalid(format!("argon2 parameters rejected: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut derived = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    argon
        .hash_password_into(password, &effective_salt[..], &mut derived[..])
        .map_err(|e| Error::invalid(format!("argon2 derivation failed: {e}")))?;
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_params() -> Argon2idParams {
        Argon2idParams {
            time_cost: 1,
            memory_cost: 1,
            parallelism: 2,
        }
    }

    #[test]
    fn derivation_without_key_file_matches_known_vector() {
        let salt = [2u8; SALT_LEN];
        let key = derive_user_key(b"password", None, &salt, &test_params()).unwrap();
        assert_eq!(
            hex::encode(&key[..]),
            "d6c41d93bc2cbf1c02e7c7fef2e25281e281b97d0a884ad6857c12e74905a381"
        );
    }

    #[test]
    fn derivation_with_key_file_matches_known_vector() {
        let salt = [2u8; SALT_LEN];
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(b"000").unwrap();
        key_file.flush().unwrap();

        let key =
            derive_user_key(b"password", Some(key_file.path()), &salt, &test_params()).unwrap();
        assert_eq!(
            hex::encode(&key[..]),
            "f07fec06343a7a7a144db88eaba9d9e9a4832d2b5d83e210a3cd568a2c300fa4"
        );
    }

    #[test]
    fn key_file_changes_the_derived_key() {
        let salt = [2u8; SALT_LEN];
        let without = derive_user_key(b"password", None, &salt, &test_params()).unwrap();

        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(b"different material").unwrap();
        key_file.flush().unwrap();
        let with =
            derive_user_key(b"password", Some(key_file.path()), &salt, &test_params()).unwrap();
        assert_ne!(&without[..], &with[..]);
    }

    #[test]
    fn salt_must_be_exactly_32_bytes() {
        for bad_len in [0usize, 16, 31, 33, 64] {
            let salt = vec![2u8; bad_len];
            assert!(matches!(
                derive_user_key(b"password", None, &salt, &test_params()),
                Err(Error::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn missing_key_file_is_a_storage_error() {
        let salt = [2u8; SALT_LEN];
        let result = derive_user_key(
            b"password",
            Some(Path::new("/definitely/not/here")),
            &salt,
            &test_params(),
        );
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
