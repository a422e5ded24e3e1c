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

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    error::SignatureError,
    olm::PrivateCrossSigningIdentity,
    types::{MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
};

/// The public cross-signing identity of a user, as the homeserver published
/// it.
///
/// Creating or updating an identity only checks its structure, that every
/// key has the right usage and belongs to the user. Whether the signatures
/// between the keys hold is decided by the
/// [`TrustEngine`](super::TrustEngine), every time it is asked.
///
/// Only our own identity carries a user-signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentityData {
    user_id: OwnedUserId,
    master_key: MasterPubkey,
    self_signing_key: SelfSigningPubkey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_signing_key: Option<UserSigningPubkey>,
    /// Did we verify the master key of this identity out of band.
    #[serde(default)]
    locally_verified: bool,
}

impl PartialEq for UserIdentityData {
    /// Identities compare the master key signatures as well, a new signature
    /// over the master key changes the trust of the identity.
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.master_key == other.master_key
            && self.self_signing_key == other.self_signing_key
            && self.user_signing_key == other.user_signing_key
            && self.locally_verified == other.locally_verified
            && self.master_key.signatures() == other.master_key.signatures()
    }
}

impl UserIdentityData {
    /// Create a new identity from published cross-signing keys.
    pub(crate) fn new(
        master_key: MasterPubkey,
        self_signing_key: SelfSigningPubkey,
        user_signing_key: Option<UserSigningPubkey>,
    ) -> Result<Self, SignatureError> {
        let user_id = master_key.user_id();

        if self_signing_key.user_id() != user_id
            || user_signing_key.as_ref().is_some_and(|k| k.user_id() != user_id)
        {
            return Err(SignatureError::UserIdMismatch);
        }

        Ok(Self {
            user_id: user_id.to_owned(),
            master_key,
            self_signing_key,
            user_signing_key,
            locally_verified: false,
        })
    }

    /// The public identity that matches our private cross-signing keys.
    pub(crate) fn from_private(identity: &PrivateCrossSigningIdentity) -> Self {
        Self {
            user_id: identity.user_id().to_owned(),
            master_key: identity.master_public_key().clone(),
            self_signing_key: identity.self_signing_public_key().clone(),
            user_signing_key: Some(identity.user_signing_public_key().clone()),
            locally_verified: true,
        }
    }

    /// Get the user id of this identity.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the public master key of the identity.
    pub fn master_key(&self) -> &MasterPubkey {
        &self.master_key
    }

    /// Get the public self-signing key of the identity.
    pub fn self_signing_key(&self) -> &SelfSigningPubkey {
        &self.self_signing_key
    }

    /// Get the public user-signing key of the identity, only set for our
    /// own user.
    pub fn user_signing_key(&self) -> Option<&UserSigningPubkey> {
        self.user_signing_key.as_ref()
    }

    /// Was the master key of this identity verified out of band.
    pub fn is_locally_verified(&self) -> bool {
        self.locally_verified
    }

    pub(crate) fn mark_as_locally_verified(&mut self) {
        self.locally_verified = true;
    }

    /// Attach new signatures to the master key.
    pub(crate) fn add_master_key_signatures(&mut self, signatures: crate::types::Signatures) {
        self.master_key.add_signatures(signatures);
    }

    /// Replace the keys of the identity with newly published ones.
    ///
    /// The local verification is dropped if the master key changed. Returns
    /// `true` if anything changed.
    pub(crate) fn update(
        &mut self,
        master_key: MasterPubkey,
        self_signing_key: SelfSigningPubkey,
        user_signing_key: Option<UserSigningPubkey>,
    ) -> Result<bool, SignatureError> {
        let mut new = Self::new(master_key, self_signing_key, user_signing_key)?;

        if new.user_id != self.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        new.locally_verified = self.locally_verified
            && new.master_key.get_first_key() == self.master_key.get_first_key();

        let changed = new != *self;
        *self = new;

        Ok(changed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{device_id, user_id};

    use super::UserIdentityData;
    use crate::olm::{Account, PrivateCrossSigningIdentity};

    /// A freshly bootstrapped cross-signing identity of the given user and
    /// the public identity it would publish.
    pub fn identity(user_id: &ruma::UserId) -> (PrivateCrossSigningIdentity, UserIdentityData) {
        let account = Account::with_device_id(user_id, device_id!("IDENTITYDEVICE"));
        let private = PrivateCrossSigningIdentity::with_account(&account).unwrap();

        let public = UserIdentityData::new(
            private.master_public_key().clone(),
            private.self_signing_public_key().clone(),
            Some(private.user_signing_public_key().clone()),
        )
        .unwrap();

        (private, public)
    }

    pub fn other_identity() -> (PrivateCrossSigningIdentity, UserIdentityData) {
        let (private, public) = identity(user_id!("@bob:localhost"));
        let public = UserIdentityData::new(
            public.master_key().clone(),
            public.self_signing_key().clone(),
            None,
        )
        .unwrap();

        (private, public)
    }
}
