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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, MilliSecondsSinceUnixEpoch, OwnedDeviceKeyId,
    UserId,
};
use serde::{Deserialize, Serialize};
use tracing::trace;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    olm::{SignedJsonObject, VerifyJson},
    types::{DeviceKey, DeviceKeys, EventEncryptionAlgorithm, Signatures, SignedKey},
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    #[default]
    Unset,
}

impl DeviceKeys {
    /// Check that the device keys are signed by the Ed25519 key they carry.
    pub(crate) fn check_self_signature(&self) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(
            &self.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            self,
        )
    }

    /// Check that the given object was signed by this device.
    pub(crate) fn has_signed(&self, object: &impl SignedJsonObject) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(
            &self.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            object,
        )
    }
}

/// A device of a user as it is kept in the device registry.
///
/// Trust derived from cross-signing isn't part of the device, it is computed
/// on demand by the trust engine.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceData {
    device_keys: Arc<DeviceKeys>,
    #[serde(default)]
    local_trust: LocalTrust,
    #[serde(default)]
    deleted: bool,
    first_time_seen_ts: MilliSecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for DeviceData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceData")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("display_name", &self.display_name())
            .field("keys", self.keys())
            .field("deleted", &self.deleted)
            .field("local_trust", &self.local_trust)
            .finish()
    }
}

impl DeviceData {
    /// Create a new device, this constructor skips signature verification of
    /// the keys, `TryFrom` should be used for devices we receive from the
    /// server.
    pub fn new(device_keys: DeviceKeys, local_trust: LocalTrust) -> Self {
        Self {
            device_keys: device_keys.into(),
            local_trust,
            deleted: false,
            first_time_seen_ts: MilliSecondsSinceUnixEpoch::now(),
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_keys.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.device_keys.unsigned.device_display_name.as_deref()
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.device_keys.curve25519_key()
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.device_keys.ed25519_key()
    }

    /// Get a map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, DeviceKey> {
        &self.device_keys.keys
    }

    /// Get a map containing all the device signatures.
    pub fn signatures(&self) -> &Signatures {
        &self.device_keys.signatures
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.local_trust
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any group sessions.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }

    /// Set the trust state of the device. The change needs to be saved to the
    /// store to take effect.
    pub(crate) fn set_trust_state(&mut self, state: LocalTrust) {
        self.local_trust = state;
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// Does this device support the Olm encryption algorithm.
    pub fn supports_olm(&self) -> bool {
        self.algorithms().contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// Was the device removed by its owner.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Mark the device as deleted.
    pub(crate) fn mark_as_deleted(&mut self) {
        self.deleted = true;
    }

    /// Return the device keys.
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// Get the local timestamp of when this device was first seen.
    pub fn first_time_seen_ts(&self) -> MilliSecondsSinceUnixEpoch {
        self.first_time_seen_ts
    }

    /// Update a device with a new device keys struct.
    ///
    /// Returns `true` if any changes were made to the data.
    pub(crate) fn update_device(
        &mut self,
        device_keys: &DeviceKeys,
    ) -> Result<bool, SignatureError> {
        device_keys.check_self_signature()?;

        if self.user_id() != device_keys.user_id {
            Err(SignatureError::UserIdMismatch)
        } else if self.device_id() != device_keys.device_id {
            Err(SignatureError::DeviceIdMismatch)
        } else if self.ed25519_key() != device_keys.ed25519_key() {
            Err(SignatureError::SigningKeyChanged(
                self.ed25519_key().map(Box::new),
                device_keys.ed25519_key().map(Box::new),
            ))
        } else if self.device_keys.as_ref() != device_keys || self.deleted {
            trace!(
                user_id = ?self.user_id(),
                device_id = ?self.device_id(),
                keys = ?self.keys(),
                "Updated a device",
            );

            self.device_keys = device_keys.clone().into();
            self.deleted = false;

            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Check that a one-time key was signed by this device.
    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedKey,
    ) -> Result<(), SignatureError> {
        self.device_keys.has_signed(one_time_key)
    }

    /// Check that an object was signed by this device.
    pub(crate) fn has_signed(&self, object: &impl SignedJsonObject) -> Result<(), SignatureError> {
        self.device_keys.has_signed(object)
    }
}

impl TryFrom<&DeviceKeys> for DeviceData {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        device_keys.check_self_signature()?;
        Ok(Self::new(device_keys.clone(), LocalTrust::Unset))
    }
}

impl PartialEq for DeviceData {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}
