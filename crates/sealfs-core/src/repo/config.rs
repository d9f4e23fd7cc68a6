//! The repository configuration blob and master-key wrapping.
//!
//! `config.pb` is a protobuf message; the field tags below are part of the
//! on-disk format and must never be renumbered. The master keys are a
//! versioned, extensible record of 32-byte blobs: adding a key means adding
//! a field and extending [`MasterKeys::fields_mut`], and every field is
//! filled from the CSPRNG at generation time.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use prost::Message;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::rng::fill_random;

pub const MASTER_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const CONFIG_FILE_NAME: &str = "config.pb";
pub const TREE_DB_FILE_NAME: &str = "tree.db";
pub const FORMAT_VERSION: u32 = 1;

/// Parameters fixed at repository creation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileSystemParams {
    #[prost(uint32, tag = "1")]
    pub format_version: u32,
    /// Physical block size of per-inode content files.
    #[prost(uint64, tag = "2")]
    pub underlying_block_size: u64,
    /// Plaintext sector size of the tree database; its backing file uses
    /// physical blocks of this plus the 28-byte overhead.
    #[prost(uint64, tag = "3")]
    pub virtual_block_size_for_tree_db: u64,
    /// When set, the tree database omits the derived-name columns and only
    /// exact lookups are possible.
    #[prost(bool, tag = "4")]
    pub exact_name_only: bool,
    /// A [`crate::db::tree::NameLookupMode`] discriminant.
    #[prost(int32, tag = "5")]
    pub name_lookup_mode: i32,
}

impl FileSystemParams {
    pub fn lookup_mode(&self) -> Result<crate::db::tree::NameLookupMode> {
        crate::db::tree::NameLookupMode::try_from(self.name_lookup_mode)
    }
}

/// Argon2id cost parameters. `memory_cost` is in MiB.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Argon2idParams {
    #[prost(uint32, tag = "1")]
    pub time_cost: u32,
    #[prost(uint32, tag = "2")]
    pub memory_cost: u32,
    #[prost(uint32, tag = "3")]
    pub parallelism: u32,
}

/// An AES-256-GCM envelope with a detached tag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedData {
    #[prost(bytes = "vec", tag = "1")]
    pub iv: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub mac: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
}

/// The repository's master keys, each binding one subsystem.
///
/// Zeroized on drop. Only ever persisted inside the wrapped envelope of
/// [`encrypt_master_keys`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MasterKeys {
    /// Encrypts the tree database's backing file.
    #[prost(bytes = "vec", tag = "1")]
    pub tree_key: Vec<u8>,
    /// Encrypts every per-inode content file.
    #[prost(bytes = "vec", tag = "2")]
    pub content_key: Vec<u8>,
    /// Reserved for size-obfuscating padding.
    #[prost(bytes = "vec", tag = "3")]
    pub padding_key: Vec<u8>,
}

impl Drop for MasterKeys {
    fn drop(&mut self) {
        for field in self.fields_mut() {
            field.zeroize();
        }
    }
}

impl MasterKeys {
    fn fields_mut(&mut self) -> [&mut Vec<u8>; 3] {
        [
            &mut self.tree_key,
            &mut self.content_key,
            &mut self.padding_key,
        ]
    }

    /// Draw a full set of fresh keys, one 32-byte blob per field.
    pub fn generate() -> Self {
        let mut keys = Self::default();
        for field in keys.fields_mut() {
            field.resize(MASTER_KEY_LEN, 0);
            fill_random(field);
        }
        keys
    }

    pub fn validate(&self) -> Result<()> {
        for (name, field) in [
            ("tree_key", &self.tree_key),
            ("content_key", &self.content_key),
            ("padding_key", &self.padding_key),
        ] {
            if field.len() != MASTER_KEY_LEN {
                return Err(Error::invalid(format!(
                    "{name} has {} bytes, expected {MASTER_KEY_LEN}",
                    field.len()
                )));
            }
        }
        Ok(())
    }

    pub fn tree_key(&self) -> Result<[u8; MASTER_KEY_LEN]> {
        key_array("tree_key", &self.tree_key)
    }

    pub fn content_key(&self) -> Result<[u8; MASTER_KEY_LEN]> {
        key_array("content_key", &self.content_key)
    }
}

fn key_array(name: &str, bytes: &[u8]) -> Result<[u8; MASTER_KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| Error::invalid(format!("{name} has {} bytes, expected {MASTER_KEY_LEN}", bytes.len())))
}

/// The serialized `config.pb` message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepositoryConfig {
    #[prost(message, optional, tag = "1")]
    pub params: Option<FileSystemParams>,
    #[prost(message, optional, tag = "2")]
    pub argon2_params: Option<Argon2idParams>,
    #[prost(bytes = "vec", tag = "3")]
    pub salt: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub encrypted_master_keys: Option<EncryptedData>,
}

impl RepositoryConfig {
    pub fn decode_from(bytes: &[u8]) -> Result<Self> {
        let config = Self::decode(bytes)
            .map_err(|e| Error::invalid(format!("repository config does not parse: {e}")))?;
        if config.salt.len() != SALT_LEN {
            return Err(Error::invalid(format!(
                "repository config salt has {} bytes, expected {SALT_LEN}",
                config.salt.len()
            )));
        }
        Ok(config)
    }
}

/// Wrap the serialized master keys under the user key.
///
/// The serialization buffer is encrypted in place, so no plaintext copy of
/// the keys outlives the call.
pub fn encrypt_master_keys(
    keys: &MasterKeys,
    user_key: &[u8; MASTER_KEY_LEN],
) -> Result<EncryptedData> {
    let mut buffer = keys.encode_to_vec();
    let mut iv = [0u8; 12];
    fill_random(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(user_key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| Error::internal("master key wrapping failed"))?;
    Ok(EncryptedData {
        iv: iv.to_vec(),
        mac: tag.to_vec(),
        ciphertext: buffer,
    })
}

/// Unwrap the master keys. Authentication failure means wrong credentials
/// or a tampered config; the two are indistinguishable by construction.
pub fn decrypt_master_keys(
    data: &EncryptedData,
    user_key: &[u8; MASTER_KEY_LEN],
) -> Result<MasterKeys> {
    if data.iv.len() != 12 || data.mac.len() != 16 {
        return Err(Error::invalid(format!(
            "encrypted master keys have a {}-byte IV and {}-byte MAC",
            data.iv.len(),
            data.mac.len()
        )));
    }
    let mut buffer = Zeroizing::new(data.ciphertext.clone());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(user_key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&data.iv),
            b"",
            buffer.as_mut_slice(),
            Tag::from_slice(&data.mac),
        )
        .map_err(|_| Error::KeyUnwrapFailed)?;
    let keys = MasterKeys::decode(buffer.as_slice())
        .map_err(|e| Error::invalid(format!("unwrapped master keys do not parse: {e}")))?;
    keys.validate()?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct_and_valid() {
        let keys = MasterKeys::generate();
        keys.validate().unwrap();
        assert_ne!(keys.tree_key, keys.content_key);
        assert_ne!(keys.content_key, keys.padding_key);
        assert_ne!(MasterKeys::generate().tree_key, keys.tree_key);
    }

    #[test]
    fn validate_rejects_short_keys() {
        let mut keys = MasterKeys::generate();
        keys.content_key.truncate(16);
        assert!(matches!(keys.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let keys = MasterKeys::generate();
        let mut user_key = [0u8; MASTER_KEY_LEN];
        fill_random(&mut user_key);

        let wrapped = encrypt_master_keys(&keys, &user_key).unwrap();
        assert_eq!(wrapped.iv.len(), 12);
        assert_eq!(wrapped.mac.len(), 16);
        assert_ne!(wrapped.ciphertext, keys.encode_to_vec());

        let unwrapped = decrypt_master_keys(&wrapped, &user_key).unwrap();
        assert_eq!(unwrapped, keys);
    }

    #[test]
    fn unwrap_with_wrong_key_fails_closed() {
        let keys = MasterKeys::generate();
        let mut user_key = [0u8; MASTER_KEY_LEN];
        fill_random(&mut user_key);
        let wrapped = encrypt_master_keys(&keys, &user_key).unwrap();

        user_key[7] ^= 1;
        assert!(matches!(
            decrypt_master_keys(&wrapped, &user_key),
            Err(Error::KeyUnwrapFailed)
        ));
    }

    #[test]
    fn unwrap_detects_ciphertext_tampering() {
        let keys = MasterKeys::generate();
        let mut user_key = [0u8; MASTER_KEY_LEN];
        fill_random(&mut user_key);
        let mut wrapped = encrypt_master_keys(&keys, &user_key).unwrap();
        wrapped.ciphertext[0] ^= 1;
        assert!(matches!(
            decrypt_master_keys(&wrapped, &user_key),
            Err(Error::KeyUnwrapFailed)
        ));
    }

    #[test]
    fn config_round_trips_through_wire_format() {
        let config = RepositoryConfig {
            params: Some(FileSystemParams {
                format_version: FORMAT_VERSION,
                underlying_block_size: 4096,
                virtual_block_size_for_tree_db: 4096,
                exact_name_only: false,
                name_lookup_mode: crate::db::tree::NameLookupMode::CaseInsensitive as i32,
            }),
            argon2_params: Some(Argon2idParams {
                time_cost: 1,
                memory_cost: 64,
                parallelism: 2,
            }),
            salt: vec![2u8; SALT_LEN],
            encrypted_master_keys: Some(EncryptedData {
                iv: vec![1; 12],
                mac: vec![2; 16],
                ciphertext: vec![3; 96],
            }),
        };
        let decoded = RepositoryConfig::decode_from(&config.encode_to_vec()).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(
            decoded.params.unwrap().lookup_mode().unwrap(),
            crate::db::tree::NameLookupMode::CaseInsensitive
        );
    }

    #[test]
    fn config_with_bad_salt_is_rejected() {
        let config = RepositoryConfig {
            salt: vec![0u8; 16],
            ..Default::default()
        };
        assert!(matches!(
            RepositoryConfig::decode_from(&config.encode_to_vec()),
            Err(Error::InvalidParameter(_))
        ));
    }
}
