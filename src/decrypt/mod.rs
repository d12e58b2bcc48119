//! Stream decryption
//!
//! A [`DecryptionContext`] is derived once per manifest from its
//! [`CipherParams`]; a [`StreamDecryptor`] then consumes the reassembled
//! ciphertext incrementally, carrying cipher state across segment boundaries.

mod container;
mod stream;

pub use container::{ContainerFormat, SNIFF_LEN};
pub use stream::{StreamDecryptor, decrypt_all};

use crate::error::{Error, Result};
use crate::manifest::{CipherAlgorithm, CipherParams, KeyEncoding};
use aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key material resolved for one manifest
#[derive(Clone, PartialEq, Eq)]
pub enum DecryptionContext {
    /// The stream is not encrypted
    Clear,
    /// AES-128-CTR; the counter block is `nonce | 0u64` big-endian
    Ctr {
        /// Content key
        key: [u8; 16],
        /// Upper half of the initial counter block
        nonce: [u8; 8],
    },
    /// AES-128-CBC with PKCS#7 padding on the final block
    Cbc {
        /// Content key
        key: [u8; 16],
        /// Initialisation vector
        iv: [u8; 16],
    },
}

// Keys stay out of logs
impl std::fmt::Debug for DecryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptionContext::Clear => f.write_str("Clear"),
            DecryptionContext::Ctr { .. } => f.write_str("Ctr { .. }"),
            DecryptionContext::Cbc { .. } => f.write_str("Cbc { .. }"),
        }
    }
}

impl DecryptionContext {
    /// Derive the context for a manifest's cipher parameters
    ///
    /// `master_key` is the base64 key configured under `api.master_key`; it is
    /// only needed for [`KeyEncoding::SecurityToken`].
    pub fn derive(cipher: Option<&CipherParams>, master_key: Option<&str>) -> Result<Self> {
        let Some(params) = cipher else {
            return Ok(DecryptionContext::Clear);
        };

        let material = match params.key_encoding {
            KeyEncoding::Raw => params.key_material.clone(),
            KeyEncoding::SecurityToken => {
                let master_key = master_key.ok_or_else(|| Error::Config {
                    message: "encrypted stream requires a master key".to_string(),
                    key: Some("api.master_key".to_string()),
                })?;
                unwrap_security_token(&params.key_material, master_key)?
            }
        };

        match params.algorithm {
            CipherAlgorithm::Aes128Ctr => {
                if material.len() < 24 {
                    return Err(Error::InvalidManifest(format!(
                        "CTR key material is {} bytes, need 24",
                        material.len()
                    )));
                }
                let mut key = [0u8; 16];
                let mut nonce = [0u8; 8];
                key.copy_from_slice(&material[..16]);
                nonce.copy_from_slice(&material[16..24]);
                Ok(DecryptionContext::Ctr { key, nonce })
            }
            CipherAlgorithm::Aes128Cbc => {
                if material.len() < 32 {
                    return Err(Error::InvalidManifest(format!(
                        "CBC key material is {} bytes, need 32",
                        material.len()
                    )));
                }
                let mut key = [0u8; 16];
                let mut iv = [0u8; 16];
                key.copy_from_slice(&material[..16]);
                iv.copy_from_slice(&material[16..32]);
                Ok(DecryptionContext::Cbc { key, iv })
            }
        }
    }
}

/// Decrypt a base64 `iv(16) | ciphertext` token with AES-256-CBC
fn unwrap_security_token(token: &[u8], master_key: &str) -> Result<Vec<u8>> {
    let master = STANDARD
        .decode(master_key.trim())
        .map_err(|e| Error::Config {
            message: format!("master key is not base64: {e}"),
            key: Some("api.master_key".to_string()),
        })?;
    if master.len() != 32 {
        return Err(Error::Config {
            message: format!("master key is {} bytes, need 32", master.len()),
            key: Some("api.master_key".to_string()),
        });
    }

    let token = STANDARD
        .decode(token)
        .map_err(|e| Error::InvalidManifest(format!("security token is not base64: {e}")))?;
    if token.len() < 32 || token.len() % 16 != 0 {
        return Err(Error::InvalidManifest(format!(
            "security token has invalid length {}",
            token.len()
        )));
    }

    let (iv, ciphertext) = token.split_at(16);
    let mut buffer = ciphertext.to_vec();
    let decryptor = Aes256CbcDec::new_from_slices(&master, iv)
        .map_err(|e| Error::InvalidManifest(format!("security token cipher: {e}")))?;
    let plain = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| Error::InvalidManifest(format!("security token: {e}")))?;
    Ok(plain.to_vec())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    const MASTER: [u8; 32] = [7u8; 32];

    fn wrap_token(plain: &[u8; 32], iv: [u8; 16]) -> String {
        let mut buffer = plain.to_vec();
        let len = buffer.len();
        Aes256CbcEnc::new_from_slices(&MASTER, &iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
            .unwrap();
        let mut token = iv.to_vec();
        token.extend_from_slice(&buffer);
        STANDARD.encode(token)
    }

    fn token_params(token: String) -> CipherParams {
        CipherParams {
            algorithm: CipherAlgorithm::Aes128Ctr,
            key_material: token.into_bytes(),
            key_encoding: KeyEncoding::SecurityToken,
        }
    }

    #[test]
    fn clear_without_cipher() {
        assert_eq!(
            DecryptionContext::derive(None, None).unwrap(),
            DecryptionContext::Clear
        );
    }

    #[test]
    fn security_token_unwraps_to_key_and_nonce() {
        let mut plain = [0u8; 32];
        for (i, b) in plain.iter_mut().enumerate() {
            *b = i as u8;
        }
        let params = token_params(wrap_token(&plain, [3u8; 16]));

        let ctx = DecryptionContext::derive(Some(&params), Some(&STANDARD.encode(MASTER))).unwrap();
        let DecryptionContext::Ctr { key, nonce } = ctx else {
            panic!("expected CTR context, got {ctx:?}");
        };
        assert_eq!(&key[..], &plain[..16]);
        assert_eq!(&nonce[..], &plain[16..24]);
    }

    #[test]
    fn security_token_needs_master_key() {
        let params = token_params(wrap_token(&[0u8; 32], [0u8; 16]));
        match DecryptionContext::derive(Some(&params), None) {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("api.master_key")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_token_is_invalid_manifest() {
        let params = token_params(STANDARD.encode([1u8; 20]));
        assert!(matches!(
            DecryptionContext::derive(Some(&params), Some(&STANDARD.encode(MASTER))),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn raw_cbc_material_splits_key_and_iv() {
        let mut material = vec![1u8; 16];
        material.extend_from_slice(&[2u8; 16]);
        let params = CipherParams {
            algorithm: CipherAlgorithm::Aes128Cbc,
            key_material: material,
            key_encoding: KeyEncoding::Raw,
        };
        assert_eq!(
            DecryptionContext::derive(Some(&params), None).unwrap(),
            DecryptionContext::Cbc {
                key: [1u8; 16],
                iv: [2u8; 16]
            }
        );
    }

    #[test]
    fn debug_hides_keys() {
        let ctx = DecryptionContext::Ctr {
            key: [9u8; 16],
            nonce: [9u8; 8],
        };
        assert_eq!(format!("{ctx:?}"), "Ctr { .. }");
    }
}
