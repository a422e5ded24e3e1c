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

use vodozemac::{base64_encode, pk_encryption::PkEncryption, Curve25519PublicKey};
use zeroize::Zeroizing;

use super::{DecodeError, PassphraseInfo};
use crate::{
    olm::InboundGroupSession,
    types::{EncryptedSessionData, KeyBackupData, MegolmV1AuthData, RoomKeyBackupInfo, Signatures},
};

/// The public part of a backup key.
///
/// Room keys get encrypted for this key before they are uploaded, only the
/// holder of the matching [`BackupDecryptionKey`](super::BackupDecryptionKey)
/// can read them.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    key: Curve25519PublicKey,
    signatures: Signatures,
    passphrase_info: Option<PassphraseInfo>,
    version: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MegolmV1BackupKey")
            .field("key", &self.key.to_base64())
            .field("version", &self.version)
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { key, signatures: Default::default(), passphrase_info: None, version }
    }

    /// Create the key from the auth data a backup version announces.
    pub fn from_auth_data(auth_data: &MegolmV1AuthData, version: String) -> Self {
        let passphrase_info = auth_data
            .private_key_salt
            .clone()
            .zip(auth_data.private_key_iterations)
            .map(|(salt, iterations)| PassphraseInfo { salt, iterations });

        Self {
            key: auth_data.public_key,
            signatures: auth_data.signatures.clone(),
            passphrase_info,
            version: Some(version),
        }
    }

    /// Try to create a new [`MegolmV1BackupKey`] from a base64 encoded
    /// Curve25519 public key.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(public_key)?, None))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The Curve25519 public key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.key
    }

    /// The signatures that the backup key carries.
    pub fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    /// The passphrase parameters the matching private key was derived with.
    pub fn passphrase_info(&self) -> Option<&PassphraseInfo> {
        self.passphrase_info.as_ref()
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub(crate) fn with_version(mut self, version: String) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn with_passphrase_info(mut self, info: Option<PassphraseInfo>) -> Self {
        self.passphrase_info = info;
        self
    }

    /// The auth data describing this key, without any signatures.
    pub fn auth_data(&self) -> MegolmV1AuthData {
        let mut auth_data = MegolmV1AuthData::new(self.key, self.signatures.clone());

        if let Some(info) = &self.passphrase_info {
            auth_data.private_key_salt = Some(info.salt.clone());
            auth_data.private_key_iterations = Some(info.iterations);
        }

        auth_data
    }

    /// The backup info that announces this key on the homeserver.
    pub fn backup_info(&self) -> RoomKeyBackupInfo {
        RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(self.auth_data())
    }

    /// Encrypt a room key so it can be uploaded to the backup.
    pub(crate) async fn encrypt(
        &self,
        session: &InboundGroupSession,
    ) -> Result<KeyBackupData, serde_json::Error> {
        let pk = PkEncryption::from_key(self.key);

        // Only whether the key reached us directly matters, not the length of
        // the forwarding chain.
        let forwarded_count = u32::from(session.has_been_imported());
        let first_message_index = session.first_known_index();

        let key = session.to_backup().await;
        let key = Zeroizing::new(serde_json::to_vec(&key)?);

        let message = pk.encrypt(&key);

        Ok(KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: message.ephemeral_key.to_base64(),
                ciphertext: base64_encode(message.ciphertext),
                mac: base64_encode(message.mac),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use similar_asserts::assert_eq;

    use crate::{
        backups::{BackupDecryptionError, BackupDecryptionKey, MegolmV1BackupKey, PassphraseInfo},
        olm::{Account, EncryptionSettings, InboundGroupSession},
        types::RoomKeyBackupInfo,
    };

    #[tokio::test]
    async fn backed_up_keys_decrypt_to_the_same_session() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let room_id = room_id!("!test:localhost");
        let (_, inbound) =
            account.create_group_session_pair(room_id, EncryptionSettings::default()).await;

        let decryption_key = BackupDecryptionKey::new().unwrap();
        let backup_key = decryption_key.megolm_v1_public_key().with_version("1".to_owned());

        let backed_up = backup_key.encrypt(&inbound).await.unwrap();
        assert_eq!(backed_up.first_message_index, 0);
        assert_eq!(backed_up.forwarded_count, 0);

        let room_key = decryption_key.decrypt_session_data(&backed_up.session_data).unwrap();
        let restored =
            InboundGroupSession::from_backup(room_id, inbound.session_id(), room_key).unwrap();

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.sender_key(), inbound.sender_key());
        assert_eq!(restored.first_known_index(), 0);
        assert!(restored.has_been_imported());

        let other_key = BackupDecryptionKey::new().unwrap();
        assert_matches!(
            other_key.decrypt_session_data(&backed_up.session_data).map(drop),
            Err(BackupDecryptionError::Decryption(_))
        );
    }

    #[test]
    fn auth_data_carries_the_passphrase_info() {
        let decryption_key = BackupDecryptionKey::from_passphrase("it's a secret", "salt", 10);
        let info = PassphraseInfo { salt: "salt".to_owned(), iterations: 10 };
        let key = decryption_key.megolm_v1_public_key().with_passphrase_info(Some(info.clone()));

        let backup_info = key.backup_info();
        assert_matches!(&backup_info, RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data));
        assert_eq!(data.private_key_salt.as_deref(), Some("salt"));
        assert!(decryption_key.check_auth_data(data).is_ok());

        let restored = MegolmV1BackupKey::from_auth_data(data, "2".to_owned());
        assert_eq!(restored.backup_version(), Some("2"));
        assert_eq!(restored.passphrase_info(), Some(&info));
        assert_eq!(restored.to_base64(), key.to_base64());

        let other = BackupDecryptionKey::new().unwrap();
        assert_matches!(
            other.check_auth_data(data),
            Err(BackupDecryptionError::MismatchedPublicKey { .. })
        );
    }
}
