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

use std::{fmt, sync::Arc};

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use super::StaticAccountData;
use crate::{
    error::{OlmResult, SessionCreationError},
    identities::DeviceData,
    types::{
        deserialize_curve_key,
        events::olm_v1::{
            DecryptedOlmPayload, OlmPayloadContent, OlmV1Curve25519AesSha2Content, OlmV1Keys,
        },
        serialize_curve_key,
    },
};

/// Cryptographic session that enables secure communication between two
/// accounts.
#[derive(Clone)]
pub struct Session {
    /// Our own identity, bound into every payload we encrypt.
    pub our_identity: StaticAccountData,
    /// The OlmSession
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our sessionId
    pub session_id: Arc<str>,
    /// The Key of the sender
    pub sender_key: Curve25519PublicKey,
    /// When the session was created
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used
    pub last_use_time: SecondsSinceUnixEpoch,
    /// Why the session isn't used anymore, if it was quarantined.
    pub quarantine: Option<Arc<str>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .field("quarantine", &self.quarantine)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        our_identity: StaticAccountData,
        session: InnerSession,
        sender_key: Curve25519PublicKey,
    ) -> Self {
        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Self {
            our_identity,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key,
            creation_time: now,
            last_use_time: now,
            quarantine: None,
        }
    }

    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a [`DecryptionError`] if decryption
    /// failed.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        let plaintext = String::from_utf8_lossy(&plaintext).to_string();

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Was the given pre-key message created for this session.
    pub fn matches_pre_key_message(&self, message: &PreKeyMessage) -> bool {
        *self.session_id == message.session_id()
    }

    /// Get the sender key that was used to establish this Session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Has the session been taken out of use.
    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }

    /// Take the session out of use for new messages, recording why.
    pub(crate) fn quarantine(&mut self, reason: &str) {
        self.quarantine = Some(reason.into());
    }

    /// Encrypt the given content for the given recipient device.
    ///
    /// The content is wrapped into a payload that binds it to our identity
    /// and to the identity of the recipient.
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceData,
        content: &OlmPayloadContent,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        let recipient_signing_key = recipient_device.ed25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingSigningKey(
                recipient_device.user_id().to_owned(),
                recipient_device.device_id().to_owned(),
            )
        })?;

        let payload = DecryptedOlmPayload {
            sender: self.our_identity.user_id.clone(),
            recipient: recipient_device.user_id().to_owned(),
            keys: OlmV1Keys { ed25519: self.our_identity.identity_keys.ed25519 },
            recipient_keys: OlmV1Keys { ed25519: recipient_signing_key },
            room_id: content.room_id(),
            event_type: content.event_type().to_owned(),
            content: content.to_json()?,
        };

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.inner.lock().await.encrypt(&plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        trace!(
            session_id = self.session_id(),
            event_type = content.event_type(),
            "Encrypted a to-device payload"
        );

        Ok(OlmV1Curve25519AesSha2Content::new(
            self.our_identity.identity_keys.curve25519,
            self.sender_key,
            ciphertext,
        ))
    }

    /// Store the session as a base64 encoded string.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
            quarantine: self.quarantine.as_deref().map(ToOwned::to_owned),
        }
    }

    /// A copy of the session with its own ratchet, advancing one of them
    /// leaves the other untouched.
    pub async fn deep_clone(&self) -> Self {
        Self::from_pickle(self.our_identity.clone(), self.pickle().await)
    }

    /// Restore a Session from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `our_identity` - The identity of the account the session belongs to.
    ///
    /// * `pickle` - The pickled version of the `Session`.
    pub fn from_pickle(our_identity: StaticAccountData, pickle: PickledSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Session {
            our_identity,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
            quarantine: pickle.quarantine.map(Into::into),
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickle string holding the Olm Session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the other user that we share this session with.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The relative time elapsed since the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The relative time elapsed since the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
    /// Why the session was quarantined, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<String>,
}

/// Pick the session to encrypt with: the most recently used one that isn't
/// quarantined.
pub(crate) fn most_recent_session(sessions: &[Session]) -> Option<&Session> {
    sessions
        .iter()
        .filter(|s| !s.is_quarantined())
        .max_by_key(|s| (s.last_use_time, s.creation_time))
}
