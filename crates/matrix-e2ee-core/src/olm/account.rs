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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519Signature,
};

use super::{
    utility::signable_json, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
    Session,
};
use crate::{
    error::{SessionCreationError, SignatureError},
    identities::DeviceData,
    types::{DeviceKeys, EventEncryptionAlgorithm, Signatures, SignedKey},
};

/// Signed one-time keys, ready for upload, keyed by their
/// `signed_curve25519:<key id>` identifier.
pub type OneTimeKeys = BTreeMap<String, SignedKey>;

/// The parts of an account that never change.
///
/// Cheap to clone, sessions carry a copy so they can bind our identity into
/// the payloads they encrypt.
#[derive(Clone)]
pub struct StaticAccountData {
    /// The user_id this account belongs to.
    pub user_id: OwnedUserId,
    /// The device_id of this entry.
    pub device_id: OwnedDeviceId,
    /// The associated identity keys.
    pub identity_keys: Arc<IdentityKeys>,
}

impl StaticAccountData {
    /// The ID of our Ed25519 signing key.
    pub fn signing_key_id(&self) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// Our device keys, without any signatures.
    pub fn unsigned_device_keys(&self) -> DeviceKeys {
        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
                self.identity_keys.curve25519.into(),
            ),
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                self.identity_keys.ed25519.into(),
            ),
        ]);

        DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            vec![
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                EventEncryptionAlgorithm::MegolmV1AesSha2,
            ],
            keys,
            Signatures::new(),
        )
    }

    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StaticAccountData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAccountData")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .finish()
    }
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    static_data: StaticAccountData,
    inner: Box<InnerAccount>,
    /// Have the device keys been uploaded.
    shared: bool,
    /// The number of signed one-time keys the server holds for us.
    uploaded_signed_key_count: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn with_device_id(user_id: &UserId, device_id: &DeviceId) -> Self {
        let mut account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        // The server can't have one-time keys of a new account, generate the
        // first batch right away so it goes up with the device keys.
        let initial_count = account.max_number_of_one_time_keys() / 2;
        account.generate_one_time_keys(initial_count);

        Self {
            static_data: StaticAccountData {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(account),
            shared: false,
            uploaded_signed_key_count: 0,
        }
    }

    /// Get the immutable data for this account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.static_data.identity_keys
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Get the currently known uploaded key count.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count
    }

    /// Update the uploaded key count.
    pub fn update_uploaded_key_count(&mut self, new_count: u64) {
        if new_count != self.uploaded_signed_key_count {
            debug!(
                "Updated uploaded one-time key count {} -> {new_count}.",
                self.uploaded_signed_key_count
            );
        }

        self.uploaded_signed_key_count = new_count;
    }

    /// Get the maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate new one-time keys that need to be uploaded to the server.
    ///
    /// The server should hold half of the keys the account can store, more
    /// are generated once the count drops below that.
    ///
    /// Returns `None` if no keys need to be uploaded, otherwise the number of
    /// newly generated one-time keys. May return 0 if some one-time keys are
    /// already generated but weren't uploaded.
    #[instrument(skip_all)]
    pub fn generate_one_time_keys_if_needed(&mut self) -> Option<u64> {
        if !self.inner.one_time_keys().is_empty() {
            return Some(0);
        }

        let count = self.uploaded_key_count();
        let target = (self.max_one_time_keys() / 2) as u64;

        if count >= target {
            return None;
        }

        let key_count = target - count;
        let result = self.inner.generate_one_time_keys(usize::try_from(key_count).unwrap_or(0));

        debug!(
            count = key_count,
            discarded_keys = result.removed.len(),
            created_keys = result.created.len(),
            "Generated new one-time keys"
        );

        Some(key_count)
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Sign the canonical form of the given object.
    pub fn sign_json(&self, object: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&signable_json(object)?))
    }

    /// Sign the device keys of the account and return them so they can be
    /// uploaded.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = self.static_data.unsigned_device_keys();
        let signature = self.sign_json(&device_keys)?;

        device_keys.signatures.add_signature(
            self.user_id().to_owned(),
            self.static_data.signing_key_id(),
            signature,
        );

        Ok(device_keys)
    }

    /// Sign and prepare the one-time keys that weren't published yet.
    pub fn signed_one_time_keys(&self) -> Result<OneTimeKeys, SignatureError> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                Ok((format!("signed_curve25519:{}", key_id.to_base64()), self.sign_key(key)?))
            })
            .collect()
    }

    fn sign_key(&self, key: Curve25519PublicKey) -> Result<SignedKey, SignatureError> {
        let mut key = SignedKey::new(key);
        let signature = self.sign_json(&key)?;

        key.signatures_mut().add_signature(
            self.user_id().to_owned(),
            self.static_data.signing_key_id(),
            signature,
        );

        Ok(key)
    }

    /// Get the device keys (until they were shared) and the one-time keys
    /// that need to be uploaded.
    pub fn keys_for_upload(&self) -> Result<(Option<DeviceKeys>, OneTimeKeys), SignatureError> {
        let device_keys = if self.shared { None } else { Some(self.device_keys()?) };

        Ok((device_keys, self.signed_one_time_keys()?))
    }

    /// Create a new session with another account given a one-time key.
    ///
    /// The one-time key needs to carry a valid signature of the device.
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        one_time_key: &SignedKey,
    ) -> Result<Session, SessionCreationError> {
        device.verify_one_time_key(one_time_key).map_err(|error| {
            SessionCreationError::InvalidSignature {
                user_id: device.user_id().to_owned(),
                device_id: device.device_id().to_owned(),
                error: Box::new(error),
            }
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key.key(),
        );

        Ok(Session::new(self.static_data.clone(), session, identity_key))
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// Returns the newly created session and the plaintext of the message.
    /// The one-time key the message used is removed from the account, which
    /// needs to be saved together with the session.
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, String), SessionCreationError> {
        trace!(
            session_id = %message.session_id(),
            "Creating a new Olm session from a pre-key message"
        );

        let result = self.inner.create_inbound_session(their_identity_key, message)?;
        let session = Session::new(self.static_data.clone(), result.session, their_identity_key);
        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        debug!(
            session_id = session.session_id(),
            "Decrypted an Olm message from a new Olm session"
        );

        Ok((session, plaintext))
    }

    /// Create a group session pair.
    ///
    /// This session pair can be used to encrypt and decrypt messages meant for
    /// a large group of participants.
    ///
    /// The outbound session is used to encrypt messages while the inbound one
    /// is used to decrypt messages encrypted by the outbound one.
    pub async fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> (OutboundGroupSession, InboundGroupSession) {
        trace!(?room_id, "Creating a new group session pair");

        let identity_keys = self.identity_keys();
        let outbound = OutboundGroupSession::new(
            self.device_id().to_owned(),
            identity_keys.curve25519,
            room_id,
            settings,
        );

        let inbound = InboundGroupSession::new(
            identity_keys.curve25519,
            identity_keys.ed25519,
            room_id,
            &outbound.session_key().await,
        );

        (outbound, inbound)
    }

    /// Get a serializable version of the `Account` so it can be persisted.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle: self.inner.pickle(),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_signed_key_count,
        }
    }

    /// A copy of the account that doesn't share any state with this one.
    pub fn deep_clone(&self) -> Self {
        Self::from_pickle(self.pickle())
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let account = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: pickle.user_id,
                device_id: pickle.device_id,
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(account),
            shared: pickle.shared,
            uploaded_signed_key_count: pickle.uploaded_signed_key_count,
        }
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: u64,
}
