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

//! Trust computed from cross-signing signatures.
//!
//! Nothing in here is cached, trust is recomputed from the stored keys on
//! every call so a changed cross-signing key is taken into account at once.

use ruma::{OwnedUserId, UserId};
use tracing::{debug, instrument};

use super::{DeviceData, UserIdentityData};
use crate::{
    error::ErrorKind,
    olm::{PrivateCrossSigningIdentity, VerifyJson},
    store::{Result as StoreResult, Store},
    types::CrossSigningKey,
};

/// The outcome of checking the cross-signing chain of a user.
///
/// Every broken link has its own variant so the reason can be shown to the
/// user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserTrustResult {
    /// The chain of signatures from our root of trust to the user holds.
    Success,
    /// The given user, either us or the target, has no cross-signing keys.
    CrossSigningNotConfigured(OwnedUserId),
    /// The key of the given user is signed, but not by a key we know.
    UnknownCrossSignatureInfo(OwnedUserId),
    /// Our own master key isn't trusted, nothing can be derived from it.
    KeysNotTrusted(OwnedUserId),
    /// The key is missing the signature that would link it to the chain.
    KeyNotSigned(Box<CrossSigningKey>),
    /// The key carries a signature for the chain, but it doesn't verify.
    InvalidSignature {
        /// The key carrying the signature.
        key: Box<CrossSigningKey>,
        /// The offending signature, base64 encoded.
        signature: String,
    },
}

impl UserTrustResult {
    /// Is the user trusted.
    pub fn is_success(&self) -> bool {
        matches!(self, UserTrustResult::Success)
    }

    /// Classify a failed trust check, `None` if the user is trusted.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            UserTrustResult::Success => None,
            UserTrustResult::CrossSigningNotConfigured(_) => Some(ErrorKind::Configuration),
            UserTrustResult::InvalidSignature { .. } => Some(ErrorKind::Integrity),
            UserTrustResult::UnknownCrossSignatureInfo(_)
            | UserTrustResult::KeysNotTrusted(_)
            | UserTrustResult::KeyNotSigned(_) => Some(ErrorKind::Protocol),
        }
    }
}

/// The trust of a single device.
///
/// The two axes are independent, a device can be verified interactively
/// without being cross-signed and the other way around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceTrust {
    /// The device is signed by a self-signing key we trust.
    pub cross_signing_verified: bool,
    /// The device was verified out of band.
    pub locally_verified: bool,
}

impl DeviceTrust {
    /// Is the device trusted on either axis.
    pub fn is_verified(&self) -> bool {
        self.cross_signing_verified || self.locally_verified
    }
}

/// Everything a trust decision depends on, read at one point in time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TrustSnapshot<'a> {
    pub own_user_id: &'a UserId,
    pub private_identity: Option<&'a PrivateCrossSigningIdentity>,
    pub own_identity: Option<&'a UserIdentityData>,
}

type Link = Result<(), UserTrustResult>;

/// Check that `signed` carries a valid signature made by `signer`.
fn check_link(signer: &CrossSigningKey, signed: &CrossSigningKey) -> Link {
    let Some((key_id, public_key)) = signer.get_first_key_and_id() else {
        return Err(UserTrustResult::UnknownCrossSignatureInfo(signer.user_id.clone()));
    };

    match signed.signatures.get_signature(&signer.user_id, key_id) {
        Some(signature) => public_key.verify_json(&signer.user_id, key_id, signed).map_err(|_| {
            UserTrustResult::InvalidSignature {
                key: Box::new(signed.clone()),
                signature: signature.to_base64(),
            }
        }),
        None if signed.signatures.get(&signer.user_id).is_some_and(|s| !s.is_empty()) => {
            Err(UserTrustResult::UnknownCrossSignatureInfo(signed.user_id.clone()))
        }
        None => Err(UserTrustResult::KeyNotSigned(Box::new(signed.clone()))),
    }
}

impl TrustSnapshot<'_> {
    /// Our own identity, if its master key is one we trust.
    ///
    /// The root of trust is the master key we hold the private part of, or a
    /// published master key we verified out of band.
    fn trusted_root(&self) -> Result<UserIdentityData, UserTrustResult> {
        let own_user_id = self.own_user_id.to_owned();

        match (self.private_identity, self.own_identity) {
            (Some(private), Some(published)) => {
                if private.master_public_key().get_first_key()
                    == published.master_key().get_first_key()
                {
                    Ok(published.clone())
                } else {
                    Err(UserTrustResult::KeysNotTrusted(own_user_id))
                }
            }
            (Some(private), None) => Ok(UserIdentityData::from_private(private)),
            (None, Some(published)) if published.is_locally_verified() => Ok(published.clone()),
            (None, Some(_)) => Err(UserTrustResult::KeysNotTrusted(own_user_id)),
            (None, None) => Err(UserTrustResult::CrossSigningNotConfigured(own_user_id)),
        }
    }

    fn check_chain(&self, target: &UserIdentityData) -> Link {
        let root = self.trusted_root()?;
        let master = root.master_key().as_cross_signing_key();

        if target.user_id() == self.own_user_id {
            if target.master_key().get_first_key() != root.master_key().get_first_key() {
                return Err(UserTrustResult::KeysNotTrusted(self.own_user_id.to_owned()));
            }

            check_link(master, target.self_signing_key().as_cross_signing_key())?;

            if let Some(user_signing) = target.user_signing_key() {
                check_link(master, user_signing.as_cross_signing_key())?;
            }
        } else {
            let Some(user_signing) = root.user_signing_key() else {
                return Err(UserTrustResult::CrossSigningNotConfigured(
                    self.own_user_id.to_owned(),
                ));
            };
            let user_signing = user_signing.as_cross_signing_key();

            check_link(master, user_signing)?;

            let target_master = target.master_key().as_cross_signing_key();
            check_link(user_signing, target_master)?;
            check_link(target_master, target.self_signing_key().as_cross_signing_key())?;
        }

        Ok(())
    }

    /// Walk the signatures from our root of trust to the given identity.
    ///
    /// `target_user` is the user the identity was looked up for, `target`
    /// is `None` if that user has no published identity.
    pub(crate) fn user_trust(
        &self,
        target_user: &UserId,
        target: Option<&UserIdentityData>,
    ) -> UserTrustResult {
        let result = match target {
            Some(target) => self.check_chain(target),
            None if target_user == self.own_user_id => {
                self.trusted_root().and_then(|root| self.check_chain(&root))
            }
            None => Err(UserTrustResult::CrossSigningNotConfigured(target_user.to_owned())),
        };

        match result {
            Ok(()) => UserTrustResult::Success,
            Err(result) => result,
        }
    }

    /// Compute both trust axes of a device.
    pub(crate) fn device_trust(
        &self,
        device: &DeviceData,
        owner: Option<&UserIdentityData>,
    ) -> DeviceTrust {
        let own_root = (device.user_id() == self.own_user_id && owner.is_none())
            .then(|| self.trusted_root().ok())
            .flatten();
        let owner = owner.or(own_root.as_ref());

        let cross_signing_verified = owner.is_some_and(|identity| {
            self.user_trust(device.user_id(), Some(identity)).is_success()
                && identity.self_signing_key().verify_device_keys(device.as_device_keys()).is_ok()
        });

        DeviceTrust { cross_signing_verified, locally_verified: device.is_locally_trusted() }
    }
}

/// Answers trust questions about users and devices from the current
/// content of the store.
#[derive(Debug, Clone)]
pub struct TrustEngine {
    store: Store,
}

impl TrustEngine {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compute the cross-signing trust of the given user.
    #[instrument(skip(self))]
    pub async fn user_trust(&self, user_id: &UserId) -> StoreResult<UserTrustResult> {
        let own_identity = self.store.get_user_identity(self.store.user_id()).await?;
        let target = if user_id == self.store.user_id() {
            own_identity.clone()
        } else {
            self.store.get_user_identity(user_id).await?
        };

        let private_identity = self.store.private_identity().await;
        let snapshot = TrustSnapshot {
            own_user_id: self.store.user_id(),
            private_identity: private_identity.as_ref(),
            own_identity: own_identity.as_ref(),
        };

        let result = snapshot.user_trust(user_id, target.as_ref());
        debug!(?result, "Computed the trust of a user");

        Ok(result)
    }

    /// Compute the trust of the given device.
    pub async fn device_trust(&self, device: &DeviceData) -> StoreResult<DeviceTrust> {
        let own_identity = self.store.get_user_identity(self.store.user_id()).await?;
        let owner = if device.user_id() == self.store.user_id() {
            own_identity.clone()
        } else {
            self.store.get_user_identity(device.user_id()).await?
        };

        let private_identity = self.store.private_identity().await;
        let snapshot = TrustSnapshot {
            own_user_id: self.store.user_id(),
            private_identity: private_identity.as_ref(),
            own_identity: own_identity.as_ref(),
        };

        Ok(snapshot.device_trust(device, owner.as_ref()))
    }

    /// Is the device trusted on either axis.
    pub async fn is_device_verified(&self, device: &DeviceData) -> StoreResult<bool> {
        Ok(self.device_trust(device).await?.is_verified())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id, UserId};

    use super::{TrustSnapshot, UserTrustResult};
    use crate::{
        identities::{
            user::testing::{identity, other_identity},
            DeviceData, LocalTrust, UserIdentityData,
        },
        olm::{Account, PrivateCrossSigningIdentity},
        types::Signatures,
    };

    fn alice() -> &'static UserId {
        user_id!("@alice:localhost")
    }

    fn snapshot<'a>(
        private: Option<&'a PrivateCrossSigningIdentity>,
        own: Option<&'a UserIdentityData>,
    ) -> TrustSnapshot<'a> {
        TrustSnapshot { own_user_id: alice(), private_identity: private, own_identity: own }
    }

    fn signed_bob(alice: &PrivateCrossSigningIdentity) -> UserIdentityData {
        let (_, mut bob) = other_identity();
        let signatures = alice.sign_user(bob.master_key()).unwrap();
        bob.add_master_key_signatures(signatures);
        bob
    }

    #[test]
    fn missing_cross_signing() {
        let (_, bob) = other_identity();

        assert_eq!(
            snapshot(None, None).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::CrossSigningNotConfigured(alice().to_owned())
        );

        let (private, own) = identity(alice());
        assert_eq!(
            snapshot(Some(&private), Some(&own)).user_trust(bob.user_id(), None),
            UserTrustResult::CrossSigningNotConfigured(bob.user_id().to_owned())
        );
    }

    #[test]
    fn own_identity_is_trusted_through_the_private_keys() {
        let (private, own) = identity(alice());

        assert!(snapshot(Some(&private), Some(&own)).user_trust(alice(), Some(&own)).is_success());
        assert!(snapshot(Some(&private), None).user_trust(alice(), None).is_success());
    }

    #[test]
    fn unverified_own_identity_is_not_a_root() {
        let (_, mut own) = identity(alice());
        let (_, bob) = other_identity();

        assert_eq!(
            snapshot(None, Some(&own)).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::KeysNotTrusted(alice().to_owned())
        );

        own.mark_as_locally_verified();
        assert_matches!(
            snapshot(None, Some(&own)).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::KeyNotSigned(_)
        );
    }

    #[test]
    fn rotated_own_identity_is_not_trusted() {
        let (private, _) = identity(alice());
        let (_, rotated) = identity(alice());

        assert_eq!(
            snapshot(Some(&private), Some(&rotated)).user_trust(alice(), Some(&rotated)),
            UserTrustResult::KeysNotTrusted(alice().to_owned())
        );
    }

    #[test]
    fn other_users_need_our_signature() {
        let (private, own) = identity(alice());
        let (_, bob) = other_identity();
        let snapshot = snapshot(Some(&private), Some(&own));

        assert_matches!(
            snapshot.user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::KeyNotSigned(key)
        );
        assert_eq!(key.user_id, bob.user_id());

        let bob = signed_bob(&private);
        assert_eq!(snapshot.user_trust(bob.user_id(), Some(&bob)), UserTrustResult::Success);
    }

    #[test]
    fn tampered_signatures_are_reported() {
        let (private, own) = identity(alice());
        let (_, bob) = other_identity();

        // Sign a different master key and move the signature over.
        let (_, mallory) = other_identity();
        let forged = private.sign_user(mallory.master_key()).unwrap();
        let mut bob = bob;
        bob.add_master_key_signatures(forged);

        assert_matches!(
            snapshot(Some(&private), Some(&own)).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::InvalidSignature { key, signature }
        );
        assert_eq!(key.user_id, bob.user_id());
        assert!(!signature.is_empty());
    }

    #[test]
    fn signatures_of_unknown_keys() {
        let (old_private, _) = identity(alice());
        let (private, own) = identity(alice());
        let bob = signed_bob(&old_private);

        assert_eq!(
            snapshot(Some(&private), Some(&own)).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::UnknownCrossSignatureInfo(bob.user_id().to_owned())
        );
    }

    #[test]
    fn trust_is_deterministic() {
        let (private, own) = identity(alice());
        let bob = signed_bob(&private);
        let snapshot = snapshot(Some(&private), Some(&own));

        let first = snapshot.user_trust(bob.user_id(), Some(&bob));
        let second = snapshot.user_trust(bob.user_id(), Some(&bob));

        assert_eq!(first, second);
    }

    #[test]
    fn device_trust_axes_are_independent() {
        let (private, own) = identity(alice());
        let snapshot = snapshot(Some(&private), Some(&own));

        let account = Account::with_device_id(alice(), device_id!("SIGNED"));
        let mut keys = account.device_keys().unwrap();
        let signatures = private.sign_device(&keys).unwrap();
        keys.signatures.extend(signatures);
        let signed = DeviceData::try_from(&keys).unwrap();

        let trust = snapshot.device_trust(&signed, Some(&own));
        assert!(trust.cross_signing_verified);
        assert!(!trust.locally_verified);

        let account = Account::with_device_id(alice(), device_id!("UNSIGNED"));
        let mut unsigned = DeviceData::try_from(&account.device_keys().unwrap()).unwrap();
        unsigned.set_trust_state(LocalTrust::Verified);

        let trust = snapshot.device_trust(&unsigned, None);
        assert!(!trust.cross_signing_verified);
        assert!(trust.locally_verified);
        assert!(trust.is_verified());
    }

    #[test]
    fn empty_signatures_are_not_unknown() {
        let (private, own) = identity(alice());
        let (_, mut bob) = other_identity();
        bob.add_master_key_signatures(Signatures::new());

        assert_matches!(
            snapshot(Some(&private), Some(&own)).user_trust(bob.user_id(), Some(&bob)),
            UserTrustResult::KeyNotSigned(_)
        );
    }
}
