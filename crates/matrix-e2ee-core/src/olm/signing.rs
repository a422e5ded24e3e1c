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

//! The private half of a user's cross-signing identity.

use std::{fmt, sync::Arc};

use ruma::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceKeyId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode, Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};

use super::{utility::signable_json, Account};
use crate::{
    error::{ErrorKind, SignatureError},
    types::{
        CrossSigningKey, DeviceKeys, KeyUsage, MasterPubkey, SelfSigningPubkey, Signatures,
        UserSigningPubkey,
    },
};

/// Error type describing failures restoring a pickled signing key.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The seed of the signing key wasn't valid base64.
    #[error(transparent)]
    Decode(#[from] vodozemac::Base64DecodeError),

    /// The seed of the signing key had the wrong length.
    #[error("the signing key seed has an invalid length, expected 32 bytes, got {0}")]
    InvalidLength(usize),

    /// The public key that was stored doesn't belong to the restored seed.
    #[error("the public key doesn't match the restored signing key")]
    PublicKeyMismatch,

    /// The stored public key isn't usable for its purpose.
    #[error(transparent)]
    PublicKey(#[from] SignatureError),
}

impl SigningError {
    /// Classify this error, a pickle that doesn't restore was corrupted.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Integrity
    }
}

#[derive(Clone)]
struct Signing {
    inner: Arc<Ed25519SecretKey>,
    public_key: Ed25519PublicKey,
}

impl Signing {
    fn new() -> Self {
        let inner = Ed25519SecretKey::new();
        let public_key = inner.public_key();

        Self { inner: inner.into(), public_key }
    }

    fn from_seed(seed: &str) -> Result<Self, SigningError> {
        let bytes = base64_decode(seed)?;
        let length = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SigningError::InvalidLength(length))?;

        let inner = Ed25519SecretKey::from_slice(&bytes);
        let public_key = inner.public_key();

        Ok(Self { inner: inner.into(), public_key })
    }

    fn seed(&self) -> String {
        base64_encode(self.inner.to_bytes().as_slice())
    }

    fn key_id(&self) -> OwnedDeviceKeyId {
        let key_name = self.public_key.to_base64();
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, key_name.as_str().into())
    }

    fn sign_json(&self, object: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.inner.sign(signable_json(object)?.as_bytes()))
    }

    fn signatures_for(
        &self,
        user_id: &UserId,
        object: &impl Serialize,
    ) -> Result<Signatures, SignatureError> {
        let mut signatures = Signatures::new();
        signatures.add_signature(user_id.to_owned(), self.key_id(), self.sign_json(object)?);

        Ok(signatures)
    }

    fn cross_signing_key(&self, user_id: &UserId, usage: KeyUsage) -> CrossSigningKey {
        CrossSigningKey::from_ed25519(user_id.to_owned(), usage, self.public_key)
    }
}

/// A pickled cross-signing key, the private seed and the public key object
/// that was published for it.
#[derive(Clone, Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSigning {
    seed: String,
    public_key: CrossSigningKey,
}

/// A pickled [`PrivateCrossSigningIdentity`].
#[derive(Clone, Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledCrossSigningIdentity {
    /// The user the identity belongs to.
    pub user_id: OwnedUserId,
    master_key: PickledSigning,
    self_signing_key: PickledSigning,
    user_signing_key: PickledSigning,
}

/// The private cross-signing keys of our own user.
///
/// The master key certifies the self-signing and user-signing keys, the
/// self-signing key certifies our own devices and the user-signing key
/// certifies the master keys of other users.
#[derive(Clone)]
pub struct PrivateCrossSigningIdentity {
    user_id: OwnedUserId,
    master_key: Signing,
    master_public_key: MasterPubkey,
    self_signing_key: Signing,
    self_signing_public_key: SelfSigningPubkey,
    user_signing_key: Signing,
    user_signing_public_key: UserSigningPubkey,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .field("master_key", &self.master_key.public_key)
            .field("self_signing_key", &self.self_signing_key.public_key)
            .field("user_signing_key", &self.user_signing_key.public_key)
            .finish()
    }
}

impl PrivateCrossSigningIdentity {
    /// Create a brand new cross-signing identity for the owner of the given
    /// account.
    ///
    /// The master key gets signed by the account's device key, so the
    /// device and the identity vouch for each other once the device is
    /// signed by the self-signing key.
    pub fn with_account(account: &Account) -> Result<Self, SignatureError> {
        let user_id = account.user_id();

        let master_key = Signing::new();
        let mut master = master_key.cross_signing_key(user_id, KeyUsage::Master);
        let device_signature = account.sign_json(&master)?;
        master.signatures.add_signature(
            user_id.to_owned(),
            account.static_data().signing_key_id(),
            device_signature,
        );

        let self_signing_key = Signing::new();
        let mut self_signing = self_signing_key.cross_signing_key(user_id, KeyUsage::SelfSigning);
        self_signing.signatures.extend(master_key.signatures_for(user_id, &self_signing)?);

        let user_signing_key = Signing::new();
        let mut user_signing = user_signing_key.cross_signing_key(user_id, KeyUsage::UserSigning);
        user_signing.signatures.extend(master_key.signatures_for(user_id, &user_signing)?);

        Ok(Self {
            user_id: user_id.to_owned(),
            master_public_key: master.try_into()?,
            master_key,
            self_signing_public_key: self_signing.try_into()?,
            self_signing_key,
            user_signing_public_key: user_signing.try_into()?,
            user_signing_key,
        })
    }

    /// The user this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The public master key, as it should be published.
    pub fn master_public_key(&self) -> &MasterPubkey {
        &self.master_public_key
    }

    /// The public self-signing key, as it should be published.
    pub fn self_signing_public_key(&self) -> &SelfSigningPubkey {
        &self.self_signing_public_key
    }

    /// The public user-signing key, as it should be published.
    pub fn user_signing_public_key(&self) -> &UserSigningPubkey {
        &self.user_signing_public_key
    }

    /// Sign one of our own devices with the self-signing key.
    ///
    /// Returns the signatures that should be uploaded for the device.
    pub fn sign_device(&self, device_keys: &DeviceKeys) -> Result<Signatures, SignatureError> {
        if device_keys.user_id != self.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        self.self_signing_key.signatures_for(&self.user_id, device_keys)
    }

    /// Sign the master key of another user with the user-signing key.
    ///
    /// Returns the signatures that should be uploaded for the master key.
    pub fn sign_user(&self, master_key: &MasterPubkey) -> Result<Signatures, SignatureError> {
        self.user_signing_key.signatures_for(&self.user_id, master_key.as_cross_signing_key())
    }

    /// Sign an arbitrary object, e.g. the auth data of a backup, with the
    /// master key.
    pub fn sign_with_master_key(
        &self,
        object: &impl Serialize,
    ) -> Result<Signatures, SignatureError> {
        self.master_key.signatures_for(&self.user_id, object)
    }

    /// Store the identity so it can be restored later.
    pub fn pickle(&self) -> PickledCrossSigningIdentity {
        PickledCrossSigningIdentity {
            user_id: self.user_id.clone(),
            master_key: PickledSigning {
                seed: self.master_key.seed(),
                public_key: self.master_public_key.clone().into(),
            },
            self_signing_key: PickledSigning {
                seed: self.self_signing_key.seed(),
                public_key: self.self_signing_public_key.clone().into(),
            },
            user_signing_key: PickledSigning {
                seed: self.user_signing_key.seed(),
                public_key: self.user_signing_public_key.clone().into(),
            },
        }
    }

    /// Restore a previously pickled identity.
    pub fn from_pickle(pickle: PickledCrossSigningIdentity) -> Result<Self, SigningError> {
        fn restore<P>(pickled: PickledSigning) -> Result<(Signing, P), SigningError>
        where
            P: TryFrom<CrossSigningKey, Error = SignatureError>,
        {
            let signing = Signing::from_seed(&pickled.seed)?;

            let matches = pickled
                .public_key
                .get_first_key_and_id()
                .is_some_and(|(_, key)| key == signing.public_key);

            if !matches {
                return Err(SigningError::PublicKeyMismatch);
            }

            Ok((signing, P::try_from(pickled.public_key)?))
        }

        let (master_key, master_public_key) = restore(pickle.master_key)?;
        let (self_signing_key, self_signing_public_key) = restore(pickle.self_signing_key)?;
        let (user_signing_key, user_signing_public_key) = restore(pickle.user_signing_key)?;

        Ok(Self {
            user_id: pickle.user_id,
            master_key,
            master_public_key,
            self_signing_key,
            self_signing_public_key,
            user_signing_key,
            user_signing_public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};

    use super::{PrivateCrossSigningIdentity, SigningError};
    use crate::{error::SignatureError, olm::Account};

    fn identity() -> (Account, PrivateCrossSigningIdentity) {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let identity = PrivateCrossSigningIdentity::with_account(&account).unwrap();

        (account, identity)
    }

    #[test]
    fn subkeys_are_signed_by_the_master_key() {
        let (_, identity) = identity();
        let master = identity.master_public_key();

        master.verify_subkey(identity.self_signing_public_key().as_cross_signing_key()).unwrap();
        master.verify_subkey(identity.user_signing_public_key().as_cross_signing_key()).unwrap();
    }

    #[test]
    fn master_key_is_signed_by_the_device() {
        let (account, identity) = identity();
        let device_keys = account.device_keys().unwrap();

        device_keys.has_signed(identity.master_public_key().as_cross_signing_key()).unwrap();
    }

    #[test]
    fn signing_devices() {
        let (account, identity) = identity();
        let mut device_keys = account.device_keys().unwrap();

        let signatures = identity.sign_device(&device_keys).unwrap();
        device_keys.signatures.extend(signatures);

        identity.self_signing_public_key().verify_device_keys(&device_keys).unwrap();

        let other = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        assert_matches!(
            identity.sign_device(&other.device_keys().unwrap()),
            Err(SignatureError::UserIdMismatch)
        );
    }

    #[test]
    fn signing_other_users() {
        let (_, alice) = identity();
        let bob_account = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        let bob = PrivateCrossSigningIdentity::with_account(&bob_account).unwrap();

        let mut bob_master = bob.master_public_key().clone();
        bob_master.add_signatures(alice.sign_user(&bob_master).unwrap());

        alice.user_signing_public_key().verify_master_key(&bob_master).unwrap();
    }

    #[test]
    fn pickle_cycle() {
        let (_, identity) = identity();
        let pickle = serde_json::to_value(identity.pickle()).unwrap();
        let restored = PrivateCrossSigningIdentity::from_pickle(
            serde_json::from_value(pickle).unwrap(),
        )
        .unwrap();

        assert_eq!(restored.master_public_key(), identity.master_public_key());
        assert_eq!(restored.self_signing_public_key(), identity.self_signing_public_key());
    }

    #[test]
    fn mismatched_pickles_are_rejected() {
        let (_, alice) = identity();
        let (_, other) = identity();

        let mut pickle = alice.pickle();
        pickle.master_key = other.pickle().master_key;
        pickle.master_key.seed = alice.pickle().self_signing_key.seed;

        assert_matches!(
            PrivateCrossSigningIdentity::from_pickle(pickle),
            Err(SigningError::PublicKeyMismatch)
        );
    }
}
