//! Session cipher derived from the device's Key-Exchange header.
//!
//! Every message is encrypted on its own: a new AES-128-CBC instance is built
//! from the same key and IV for each call, so no chaining state survives
//! between frames. The device expects exactly this.

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

use crate::constants::ANONYMOUS_USER;
use crate::error::{AuthFailure, Error, Result};
use crate::headers::parse_params;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Upper-case hex MD5 of the cloud password, the form the device stores.
pub fn hash_cloud_password(cloud_password: &str) -> String {
    hex::encode_upper(Md5::digest(cloud_password.as_bytes()))
}

#[derive(Clone)]
pub struct CryptoEngine {
    key: [u8; 16],
    iv: [u8; 16],
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine").finish_non_exhaustive()
    }
}

impl CryptoEngine {
    /// Derives key and IV from a `Key-Exchange` value.
    ///
    /// `key = MD5(nonce ":" secret)` where `secret` is `super_secret_key` for
    /// the anonymous peer and the hashed cloud password otherwise;
    /// `iv = MD5(username ":" nonce)`.
    pub fn from_key_exchange(key_exchange: &str, cloud_password: &str, super_secret_key: &str) -> Result<Self> {
        let params = parse_params(key_exchange);
        let nonce = params
            .get("nonce")
            .filter(|n| !n.is_empty())
            .ok_or(Error::Authentication(AuthFailure::NonceMissing))?;
        let username = params.get("username").map(String::as_str).unwrap_or_default();

        let secret = if username == ANONYMOUS_USER {
            super_secret_key.to_string()
        } else {
            hash_cloud_password(cloud_password)
        };

        let key: [u8; 16] = Md5::digest(format!("{nonce}:{secret}").as_bytes()).into();
        let iv: [u8; 16] = Md5::digest(format!("{username}:{nonce}").as_bytes()).into();
        Ok(Self { key, iv })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| Error::Decryption(e.to_string()))
    }
}
