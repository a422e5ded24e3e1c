// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use itertools::Itertools;
use rand::{distributions::Alphanumeric, thread_rng, Fill, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{
    base64_decode, base64_encode,
    pk_encryption::{Message, PkDecryption},
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    error::ErrorKind,
    olm::BackedUpRoomKey,
    types::{EncryptedSessionData, MegolmV1AuthData},
};

/// Error type for the decoding of a [`BackupDecryptionKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),

    /// The parity byte of the recovery key didn't match.
    #[error("the parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),

    /// The recovery key has an invalid length.
    #[error("the decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The recovery key isn't valid Base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// The public key isn't a valid Curve25519 key.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),

    /// The key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
}

impl DecodeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Error type for the decryption of backed up room keys.
#[derive(Debug, Error)]
pub enum BackupDecryptionError {
    /// The encrypted session data couldn't be decoded.
    #[error(transparent)]
    Message(#[from] vodozemac::pk_encryption::MessageDecodeError),

    /// The ciphertext didn't authenticate or had a broken padding.
    #[error(transparent)]
    Decryption(#[from] vodozemac::pk_encryption::Error),

    /// The decrypted room key couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The backup was created for a different public key than ours.
    #[error("the backup uses the public key {expected}, but our key is {got}")]
    MismatchedPublicKey {
        /// The public key the backup version announces.
        expected: String,
        /// The public key of the decryption key we hold.
        got: String,
    },
}

impl BackupDecryptionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupDecryptionError::Decryption(_) => ErrorKind::Integrity,
            BackupDecryptionError::MismatchedPublicKey { .. } => ErrorKind::Configuration,
            BackupDecryptionError::Message(_) | BackupDecryptionError::Json(_) => {
                ErrorKind::Protocol
            }
        }
    }
}

/// The salt and iteration count a [`BackupDecryptionKey`] was derived with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The random salt.
    pub salt: String,
    /// The number of PBKDF2 rounds.
    pub iterations: u32,
}

/// The private part of a backup key.
///
/// The private part of the key is not used on a regular basis. Rather, it is
/// used only when we need to *recover* the backup. Users get it presented as a
/// Base58 recovery key, or derive it from a passphrase.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BackupDecryptionKey {
    pub(crate) inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key will hold.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    /// The PBKDF2 rounds used for newly derived keys.
    pub const PBKDF_ROUNDS: u32 = 500_000;
    const SALT_LENGTH: usize = 32;

    /// Create a new random decryption key.
    pub fn new() -> Result<Self, rand::Error> {
        let mut rng = thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        Fill::try_fill(key.as_mut_slice(), &mut rng)?;

        Ok(Self { inner: key })
    }

    /// Create a decryption key from raw bytes.
    pub fn from_bytes(bytes: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*bytes) }
    }

    /// Derive a key from a passphrase with PBKDF2-HMAC-SHA512.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt.as_bytes(), rounds, &mut *key);

        Self { inner: key }
    }

    /// Derive a key from a passphrase using a fresh random salt.
    ///
    /// The returned [`PassphraseInfo`] needs to be published in the auth data
    /// of the backup so that other devices can derive the same key.
    pub fn new_from_passphrase(passphrase: &str) -> (Self, PassphraseInfo) {
        let salt: String = thread_rng()
            .sample_iter(Alphanumeric)
            .take(Self::SALT_LENGTH)
            .map(char::from)
            .collect();
        let key = Self::from_passphrase(passphrase, &salt, Self::PBKDF_ROUNDS);

        (key, PassphraseInfo { salt, iterations: Self::PBKDF_ROUNDS })
    }

    /// Try to create a key from a base64 encoded string.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(base64_decode(key)?);
        Self::from_slice(&decoded)
    }

    /// Export the [`BackupDecryptionKey`] as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        base64_encode(self.inner.as_slice())
    }

    /// Try to create a key from a Base58 recovery key.
    ///
    /// Whitespace in the recovery key is ignored.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> = Zeroizing::new(value.split_whitespace().collect());
        let decoded = Zeroizing::new(
            bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;
        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        if prefix != Self::PREFIX {
            return Err(DecodeError::Prefix(Self::PREFIX, prefix));
        }

        let (key, parity) = decoded[Self::PREFIX.len()..].split_at(Self::KEY_SIZE);
        let expected_parity = Self::parity_byte(key);
        if parity[0] != expected_parity {
            return Err(DecodeError::Parity(expected_parity, parity[0]));
        }

        Self::from_slice(key)
    }

    /// Export the key as a Base58 recovery key, grouped into blocks of four
    /// characters.
    pub fn to_base58(&self) -> String {
        let mut bytes =
            Zeroizing::new(Vec::with_capacity(Self::PREFIX.len() + Self::KEY_SIZE + 1));
        bytes.extend_from_slice(&Self::PREFIX);
        bytes.extend_from_slice(self.inner.as_slice());
        bytes.push(Self::parity_byte(self.inner.as_slice()));

        let encoded = Zeroizing::new(
            bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string(),
        );

        let chars = Zeroizing::new(encoded.chars().collect::<Vec<_>>());
        chars
            .chunks(Self::DISPLAY_CHUNK_SIZE)
            .map(|c| c.iter().collect::<String>())
            .join(" ")
    }

    /// The public key that encrypts room keys for this decryption key.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.pk_decryption().public_key(), None)
    }

    /// Check that this key belongs to the backup with the given auth data.
    pub fn check_auth_data(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> Result<(), BackupDecryptionError> {
        let public_key = self.pk_decryption().public_key();

        if public_key == auth_data.public_key {
            Ok(())
        } else {
            Err(BackupDecryptionError::MismatchedPublicKey {
                expected: auth_data.public_key.to_base64(),
                got: public_key.to_base64(),
            })
        }
    }

    /// Decrypt a room key that was encrypted for the backup.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, BackupDecryptionError> {
        let message = Message::from_base64(
            &session_data.ciphertext,
            &session_data.mac,
            &session_data.ephemeral,
        )?;

        let plaintext = Zeroizing::new(self.pk_decryption().decrypt(&message)?);

        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn from_slice(key: &[u8]) -> Result<Self, DecodeError> {
        let key: &[u8; Self::KEY_SIZE] =
            key.try_into().map_err(|_| DecodeError::Length(Self::KEY_SIZE, key.len()))?;

        Ok(Self::from_bytes(key))
    }

    fn pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.inner))
    }

    fn parity_byte(key: &[u8]) -> u8 {
        key.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use similar_asserts::assert_eq;

    use super::{BackupDecryptionKey, DecodeError};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base58_round_trip() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let encoded = key.to_base58();

        assert!(encoded.starts_with("Es"));
        assert!(encoded.split(' ').all(|chunk| chunk.len() <= 4));

        let decoded = BackupDecryptionKey::from_base58(&encoded).unwrap();
        assert_eq!(decoded.inner, key.inner);
    }

    #[test]
    fn base58_errors_are_reported() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let mut bytes = vec![0x8b, 0x01];
        bytes.extend_from_slice(key.inner.as_slice());

        let parity = bytes.iter().fold(0, |acc, x| acc ^ x);

        let mut wrong_parity = bytes.clone();
        wrong_parity.push(parity ^ 0xff);
        let encoded = bs58::encode(&wrong_parity).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Parity(..)));

        let mut wrong_prefix = bytes.clone();
        wrong_prefix[0] = 0x8c;
        wrong_prefix.push(parity);
        let encoded = bs58::encode(&wrong_prefix).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Prefix(..)));

        let encoded = bs58::encode(&bytes).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Length(..)));

        assert_matches!(BackupDecryptionKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn base64_round_trip() {
        let key = BackupDecryptionKey::new().unwrap();
        let decoded = BackupDecryptionKey::from_base64(&key.to_base64()).unwrap();

        assert_eq!(decoded.inner, key.inner);
        assert_matches!(BackupDecryptionKey::from_base64("AAAA"), Err(DecodeError::Length(32, 3)));
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let first = BackupDecryptionKey::from_passphrase("correct horse", "salt", 10);
        let second = BackupDecryptionKey::from_passphrase("correct horse", "salt", 10);
        let other_salt = BackupDecryptionKey::from_passphrase("correct horse", "pepper", 10);

        assert_eq!(first.inner, second.inner);
        assert_ne!(first.inner, other_salt.inner);
    }

    #[test]
    fn passphrase_info_recreates_the_key() {
        let (key, info) = BackupDecryptionKey::new_from_passphrase("correct horse");

        assert_eq!(info.salt.len(), BackupDecryptionKey::SALT_LENGTH);
        assert_eq!(info.iterations, BackupDecryptionKey::PBKDF_ROUNDS);

        let recreated =
            BackupDecryptionKey::from_passphrase("correct horse", &info.salt, info.iterations);
        assert_eq!(recreated.inner, key.inner);
    }

    #[test]
    fn debug_hides_the_key() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        assert_eq!(format!("{key:?}"), "BackupDecryptionKey(\"...\")");
    }
}
