// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use ruma::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceKeyId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Ed25519PublicKey;

use super::{DeviceKeys, Signatures};
use crate::{error::SignatureError, olm::VerifyJson};

/// The usage a cross-signing key was published for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// The root of a user's cross-signing identity.
    Master,
    /// Signs the user's own devices.
    SelfSigning,
    /// Signs the master keys of other users.
    UserSigning,
}

/// A cross signing key.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "CrossSigningKeyHelper", into = "CrossSigningKeyHelper")]
pub struct CrossSigningKey {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for.
    pub usage: Vec<KeyUsage>,

    /// The public key.
    ///
    /// The object must have exactly one property.
    pub keys: BTreeMap<OwnedDeviceKeyId, SigningKey>,

    /// Signatures of the key.
    ///
    /// Only optional for master key.
    pub signatures: Signatures,

    other: BTreeMap<String, Value>,
}

impl CrossSigningKey {
    /// Creates a new `CrossSigningKey` with the given user ID, usage, keys and
    /// signatures.
    pub fn new(
        user_id: OwnedUserId,
        usage: Vec<KeyUsage>,
        keys: BTreeMap<OwnedDeviceKeyId, SigningKey>,
        signatures: Signatures,
    ) -> Self {
        Self { user_id, usage, keys, signatures, other: BTreeMap::new() }
    }

    /// Create a cross-signing key holding a single Ed25519 public key.
    pub(crate) fn from_ed25519(
        user_id: OwnedUserId,
        usage: KeyUsage,
        public_key: Ed25519PublicKey,
    ) -> Self {
        let key_id = DeviceKeyId::from_parts(
            DeviceKeyAlgorithm::Ed25519,
            public_key.to_base64().as_str().into(),
        );

        Self::new(user_id, vec![usage], [(key_id, public_key.into())].into(), Signatures::new())
    }

    /// Get the first Ed25519 key and its key ID.
    pub fn get_first_key_and_id(&self) -> Option<(&DeviceKeyId, Ed25519PublicKey)> {
        self.keys.iter().find_map(|(key_id, key)| match key {
            SigningKey::Ed25519(key) => Some((&**key_id, *key)),
            SigningKey::Unknown(_) => None,
        })
    }
}

/// An enum over the different key types a cross-signing key can have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningKey {
    /// The Ed25519 cross-signing key.
    Ed25519(Ed25519PublicKey),
    /// An unknown cross-signing key.
    Unknown(String),
}

impl SigningKey {
    /// Convert the signing key into a base64 encoded string.
    pub fn to_base64(&self) -> String {
        match self {
            SigningKey::Ed25519(k) => k.to_base64(),
            SigningKey::Unknown(k) => k.to_owned(),
        }
    }
}

impl From<Ed25519PublicKey> for SigningKey {
    fn from(val: Ed25519PublicKey) -> Self {
        SigningKey::Ed25519(val)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CrossSigningKeyHelper {
    pub user_id: OwnedUserId,
    pub usage: Vec<KeyUsage>,
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    #[serde(default, skip_serializing_if = "Signatures::is_empty")]
    pub signatures: Signatures,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl TryFrom<CrossSigningKeyHelper> for CrossSigningKey {
    type Error = vodozemac::KeyError;

    fn try_from(value: CrossSigningKeyHelper) -> Result<Self, Self::Error> {
        let keys: Result<BTreeMap<OwnedDeviceKeyId, SigningKey>, vodozemac::KeyError> = value
            .keys
            .into_iter()
            .map(|(k, v)| {
                let key = match k.algorithm() {
                    DeviceKeyAlgorithm::Ed25519 => {
                        SigningKey::Ed25519(Ed25519PublicKey::from_base64(&v)?)
                    }
                    _ => SigningKey::Unknown(v),
                };

                Ok((k, key))
            })
            .collect();

        Ok(Self {
            user_id: value.user_id,
            usage: value.usage,
            keys: keys?,
            signatures: value.signatures,
            other: value.other,
        })
    }
}

impl From<CrossSigningKey> for CrossSigningKeyHelper {
    fn from(value: CrossSigningKey) -> Self {
        let keys: BTreeMap<OwnedDeviceKeyId, String> =
            value.keys.into_iter().map(|(k, v)| (k, v.to_base64())).collect();

        Self {
            user_id: value.user_id,
            usage: value.usage,
            keys,
            signatures: value.signatures,
            other: value.other,
        }
    }
}

macro_rules! cross_signing_pubkey {
    ($name:ident, $usage:expr) => {
        #[doc = concat!("Wrapper for a cross-signing key with the `", stringify!($usage), "` usage.")]
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "CrossSigningKey", into = "CrossSigningKey")]
        pub struct $name(Arc<CrossSigningKey>);

        impl $name {
            /// The user this key belongs to.
            pub fn user_id(&self) -> &UserId {
                &self.0.user_id
            }

            /// The Ed25519 public key.
            pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
                self.0.get_first_key_and_id().map(|(_, key)| key)
            }

            /// The ID of the Ed25519 public key.
            pub fn key_id(&self) -> Option<OwnedDeviceKeyId> {
                self.0.get_first_key_and_id().map(|(key_id, _)| key_id.to_owned())
            }

            /// The signatures this key carries.
            pub fn signatures(&self) -> &Signatures {
                &self.0.signatures
            }

            /// The underlying cross-signing key.
            pub fn as_cross_signing_key(&self) -> &CrossSigningKey {
                &self.0
            }

            /// Add a signature to this key.
            pub(crate) fn add_signatures(&mut self, signatures: Signatures) {
                Arc::make_mut(&mut self.0).signatures.extend(signatures);
            }

            fn verify_signed_object(
                &self,
                signed_object: &impl crate::olm::SignedJsonObject,
            ) -> Result<(), SignatureError> {
                let (key_id, key) =
                    self.0.get_first_key_and_id().ok_or(SignatureError::MissingSigningKey)?;

                key.verify_json(&self.0.user_id, key_id, signed_object)
            }
        }

        impl TryFrom<CrossSigningKey> for $name {
            type Error = SignatureError;

            fn try_from(key: CrossSigningKey) -> Result<Self, Self::Error> {
                if !key.usage.contains(&$usage) {
                    Err(SignatureError::UsageMismatch)
                } else if key.get_first_key_and_id().is_none() {
                    Err(SignatureError::MissingSigningKey)
                } else {
                    Ok(Self(key.into()))
                }
            }
        }

        impl From<$name> for CrossSigningKey {
            fn from(key: $name) -> Self {
                Arc::unwrap_or_clone(key.0)
            }
        }

        impl AsRef<CrossSigningKey> for $name {
            fn as_ref(&self) -> &CrossSigningKey {
                &self.0
            }
        }
    };
}

cross_signing_pubkey!(MasterPubkey, KeyUsage::Master);
cross_signing_pubkey!(SelfSigningPubkey, KeyUsage::SelfSigning);
cross_signing_pubkey!(UserSigningPubkey, KeyUsage::UserSigning);

impl MasterPubkey {
    /// Check if the given cross-signing sub-key is signed by this master key.
    pub fn verify_subkey(&self, subkey: &CrossSigningKey) -> Result<(), SignatureError> {
        if subkey.user_id != self.0.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        self.verify_signed_object(subkey)
    }
}

impl SelfSigningPubkey {
    /// Check if the given device is signed by this self-signing key.
    pub fn verify_device_keys(&self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        if device_keys.user_id != self.0.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        self.verify_signed_object(device_keys)
    }
}

impl UserSigningPubkey {
    /// Check if the given master key of another user is signed by this
    /// user-signing key.
    pub fn verify_master_key(&self, master_key: &MasterPubkey) -> Result<(), SignatureError> {
        self.verify_signed_object(master_key.as_cross_signing_key())
    }
}
