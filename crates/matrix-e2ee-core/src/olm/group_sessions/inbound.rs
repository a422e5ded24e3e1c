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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;
use vodozemac::{
    megolm::{
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{BackedUpRoomKey, ExportedRoomKey, ExportedSessionKey, SessionKey};
use crate::{
    error::{EventError, MegolmError, MegolmResult, SessionCreationError},
    types::{
        deserialize_curve_key, deserialize_ed25519_key,
        events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            room_encrypted::{EncryptedRoomEvent, MegolmPlaintext},
            room_key::RoomKeyContent,
        },
        serialize_curve_key, serialize_ed25519_key, EventEncryptionAlgorithm, SenderClaimedKeys,
    },
};

/// Inbound group session.
///
/// Inbound group sessions decrypt the room messages one sender sends to a
/// room. The ratchet only moves forward: the session can decrypt messages
/// from its first known index onwards and never earlier ones.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    sender_key: Curve25519PublicKey,
    signing_key: Ed25519PublicKey,
    room_id: OwnedRoomId,
    forwarding_chain: Arc<Vec<String>>,
    /// Whether the session was received directly from its creator or imported
    /// through a forward, a backup or an export.
    imported: bool,
    backed_up: Arc<AtomicBool>,
    /// Digests of the ciphertexts we decrypted, by message index.
    decrypted_indices: Arc<Mutex<BTreeMap<u32, u64>>>,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us the
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());

        Self::from_inner(session, sender_key, signing_key, room_id.to_owned(), Vec::new(), false)
    }

    fn from_inner(
        session: InnerSession,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: OwnedRoomId,
        forwarding_chain: Vec<String>,
        imported: bool,
    ) -> Self {
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_key,
            room_id,
            forwarding_chain: forwarding_chain.into(),
            imported,
            backed_up: AtomicBool::new(false).into(),
            decrypted_indices: Default::default(),
        }
    }

    /// Create a session from the content of a `m.room_key` event.
    ///
    /// The `sender_key` must be the Curve25519 key of the Olm session the
    /// event arrived on and the `signing_key` the Ed25519 key from the `keys`
    /// field of the decrypted payload.
    pub fn from_room_key_content(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        let session_key = SessionKey::from_base64(&content.session_key)?;

        Ok(Self::new(sender_key, signing_key, &content.room_id, &session_key))
    }

    /// Create a session from an exported room key.
    pub fn from_export(exported_session: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        let session =
            InnerSession::import(&exported_session.session_key, SessionConfig::version_1());

        Ok(Self::from_inner(
            session,
            exported_session.sender_key,
            exported_session.sender_claimed_keys.ed25519,
            exported_session.room_id.clone(),
            exported_session.forwarding_curve25519_key_chain.clone(),
            true,
        ))
    }

    /// Create a session from a forwarded room key.
    ///
    /// # Arguments
    ///
    /// * `forwarder_key` - The Curve25519 key of the device that forwarded the
    ///   key to us.
    pub fn from_forwarded_key(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        let session_key = ExportedSessionKey::from_base64(&content.session_key)?;
        let session = InnerSession::import(&session_key, SessionConfig::version_1());

        let mut forwarding_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_chain.push(forwarder_key.to_base64());

        Ok(Self::from_inner(
            session,
            content.sender_key,
            content.sender_claimed_ed25519_key,
            content.room_id.clone(),
            forwarding_chain,
            true,
        ))
    }

    /// Create a session from a key that was restored from a backup.
    pub fn from_backup(
        room_id: &RoomId,
        session_id: &str,
        backup: BackedUpRoomKey,
    ) -> Result<Self, SessionCreationError> {
        let exported = ExportedRoomKey::from_backed_up_room_key(
            room_id.to_owned(),
            session_id.to_owned(),
            backup,
        );

        Self::from_export(&exported)
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the creator of the session claimed to own.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Was the session imported rather than received from its creator.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// The number of times the key was forwarded before it reached us.
    pub fn forwarded_count(&self) -> u32 {
        u32::try_from(self.forwarding_chain.len()).unwrap_or(u32::MAX)
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(Ordering::SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, Ordering::SeqCst)
    }

    /// Mark the session as backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, Ordering::SeqCst)
    }

    /// Export this session at the given message index.
    ///
    /// Indices below the first known index export the session at its first
    /// known index.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index, message_index);

        let session_key = {
            let mut session = self.inner.lock().await;
            session
                .export_at(message_index)
                .unwrap_or_else(|| session.export_at_first_known_index())
        };

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key,
            sender_claimed_keys: SenderClaimedKeys { ed25519: self.signing_key },
            forwarding_curve25519_key_chain: self.forwarding_chain.as_ref().clone(),
        }
    }

    /// Export this session at the first known message index.
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index).await
    }

    /// Export the session into the form that gets uploaded to a backup.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Check if this session's ratchet can decrypt more than the given one.
    ///
    /// Sessions from different senders or rooms, or whose ratchets don't
    /// derive from each other, are [`SessionOrdering::Unconnected`].
    pub async fn compare_ratchet(&self, other: &InboundGroupSession) -> SessionOrdering {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key != other.sender_key
            || self.signing_key != other.signing_key
            || self.room_id != other.room_id
        {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    /// Take over the decryption history of a session this one replaces.
    ///
    /// Used when an import widens a known session to an earlier index, the
    /// replay protection of the replaced session carries over.
    pub(crate) async fn inherit_history(&self, older: &InboundGroupSession) {
        if Arc::ptr_eq(&self.decrypted_indices, &older.decrypted_indices) {
            return;
        }

        let older_indices = older.decrypted_indices.lock().await.clone();
        let mut indices = self.decrypted_indices.lock().await;
        indices.extend(older_indices);
        forget_oldest_decryptions(&mut indices);
    }

    /// Decrypt an event from a room timeline.
    ///
    /// Returns the decrypted plaintext and the message index the event was
    /// encrypted at. The caller must persist the session before handing the
    /// plaintext out, the record of decrypted indices is part of it.
    pub async fn decrypt(
        &self,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<(MegolmPlaintext, u32)> {
        if event.content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let message = &event.content.ciphertext;
        let index = message.message_index();

        if index < self.first_known_index {
            return Err(MegolmError::UnknownMessageIndex {
                index,
                first_known_index: self.first_known_index,
            });
        }

        let digest = message_digest(message);
        let mut decrypted_indices = self.decrypted_indices.lock().await;

        if decrypted_indices.get(&index).is_some_and(|known| *known != digest) {
            warn!(
                session_id = self.session_id(),
                index, "A different ciphertext was received for an already decrypted index"
            );

            return Err(MegolmError::ReplayedMessage {
                session_id: self.session_id().to_owned(),
                index,
            });
        }

        let decrypted = self.inner.lock().await.decrypt(message)?;
        let plaintext: MegolmPlaintext = serde_json::from_slice(&decrypted.plaintext)?;

        if plaintext.room_id != self.room_id || event.room_id != self.room_id {
            return Err(
                EventError::MismatchedRoom(self.room_id.clone(), Some(plaintext.room_id)).into()
            );
        }

        remember_decryption(&mut decrypted_indices, decrypted.message_index, digest);

        Ok((plaintext, decrypted.message_index))
    }

    /// Get a serializable version of the session so it can be persisted.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();
        let decrypted_indices = self.decrypted_indices.lock().await.clone();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_key: self.signing_key,
            room_id: self.room_id.clone(),
            forwarding_chain: self.forwarding_chain.as_ref().clone(),
            imported: self.imported,
            backed_up: self.backed_up(),
            decrypted_indices,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let PickledInboundGroupSession {
            pickle,
            sender_key,
            signing_key,
            room_id,
            forwarding_chain,
            imported,
            backed_up,
            decrypted_indices,
        } = pickle;

        let session = InnerSession::from_pickle(pickle);
        let mut session =
            Self::from_inner(session, sender_key, signing_key, room_id, forwarding_chain, imported);
        session.backed_up = AtomicBool::new(backed_up).into();
        session.decrypted_indices = Arc::new(Mutex::new(decrypted_indices));

        session
    }
}

/// How many decrypted message indices a session remembers, the lowest ones
/// are forgotten first.
const MAX_DECRYPTED_INDICES: usize = 10_000;

fn remember_decryption(indices: &mut BTreeMap<u32, u64>, index: u32, digest: u64) {
    indices.insert(index, digest);
    forget_oldest_decryptions(indices);
}

fn forget_oldest_decryptions(indices: &mut BTreeMap<u32, u64>) {
    while indices.len() > MAX_DECRYPTED_INDICES {
        indices.pop_first();
    }
}

/// The first eight bytes of the SHA-256 digest of the ciphertext.
fn message_digest(message: &MegolmMessage) -> u64 {
    let digest = Sha256::digest(message.to_base64().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);

    u64::from_be_bytes(prefix)
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .field("imported", &self.imported)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an [`InboundGroupSession`].
///
/// Holds all the information that needs to be stored in a database to restore
/// an [`InboundGroupSession`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickle of the vodozemac session.
    pub pickle: InboundGroupSessionPickle,
    /// The public Curve25519 key of the account that sent us the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The Ed25519 key the sender claimed.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub signing_key: Ed25519PublicKey,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The list of Curve25519 keys that forwarded the session to us.
    #[serde(default)]
    pub forwarding_chain: Vec<String>,
    /// Was the session imported.
    pub imported: bool,
    /// Has the session been backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// Truncated digests of the ciphertexts that were decrypted, by message
    /// index.
    #[serde(default)]
    pub decrypted_indices: BTreeMap<u32, u64>,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use vodozemac::{megolm::SessionOrdering, Curve25519PublicKey, Ed25519PublicKey};

    use std::collections::BTreeMap;

    use super::{remember_decryption, InboundGroupSession, MAX_DECRYPTED_INDICES};
    use crate::{
        error::MegolmError,
        olm::{EncryptionSettings, OutboundGroupSession},
        types::events::room_encrypted::EncryptedRoomEvent,
    };

    fn sender_key() -> Curve25519PublicKey {
        Curve25519PublicKey::from_base64("xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc").unwrap()
    }

    fn signing_key() -> Ed25519PublicKey {
        Ed25519PublicKey::from_base64("2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4").unwrap()
    }

    async fn session_pair() -> (OutboundGroupSession, InboundGroupSession) {
        let outbound = OutboundGroupSession::new(
            device_id!("ALICEDEVICE").to_owned(),
            sender_key(),
            room_id!("!test:localhost"),
            EncryptionSettings::default(),
        );
        let inbound = InboundGroupSession::new(
            sender_key(),
            signing_key(),
            room_id!("!test:localhost"),
            &outbound.session_key().await,
        );

        (outbound, inbound)
    }

    async fn encrypt(outbound: &mut OutboundGroupSession, body: &str) -> EncryptedRoomEvent {
        EncryptedRoomEvent {
            event_id: None,
            sender: user_id!("@alice:localhost").to_owned(),
            room_id: room_id!("!test:localhost").to_owned(),
            content: outbound.encrypt("m.room.message", json!({ "body": body })).await.unwrap(),
        }
    }

    #[tokio::test]
    async fn decryption_moves_forward() {
        let (mut outbound, inbound) = session_pair().await;

        let first = encrypt(&mut outbound, "first").await;
        let second = encrypt(&mut outbound, "second").await;

        let (plaintext, index) = inbound.decrypt(&first).await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(plaintext.content["body"], "first");

        let (_, index) = inbound.decrypt(&second).await.unwrap();
        assert_eq!(index, 1);

        // Decrypting the same event again is fine, it's the same ciphertext.
        inbound.decrypt(&first).await.unwrap();
    }

    #[tokio::test]
    async fn indices_below_the_first_known_one_fail() {
        let (mut outbound, inbound) = session_pair().await;

        let first = encrypt(&mut outbound, "first").await;
        let second = encrypt(&mut outbound, "second").await;

        let exported = inbound.export_at_index(1).await;
        let late = InboundGroupSession::from_export(&exported).unwrap();

        assert_eq!(late.first_known_index(), 1);
        late.decrypt(&second).await.unwrap();

        for _ in 0..2 {
            assert_matches!(
                late.decrypt(&first).await,
                Err(MegolmError::UnknownMessageIndex { index: 0, first_known_index: 1 })
            );
        }
    }

    #[tokio::test]
    async fn replays_are_rejected() {
        let (mut outbound, inbound) = session_pair().await;

        // A second copy of the ratchet produces validly signed messages at
        // the same indices.
        let pickle = serde_json::to_value(outbound.pickle().await).unwrap();
        let mut copy = OutboundGroupSession::from_pickle(serde_json::from_value(pickle).unwrap());

        let first = encrypt(&mut outbound, "first").await;
        let forged = encrypt(&mut copy, "forged").await;

        inbound.decrypt(&first).await.unwrap();
        assert_matches!(
            inbound.decrypt(&forged).await,
            Err(MegolmError::ReplayedMessage { index: 0, .. })
        );
        inbound.decrypt(&first).await.unwrap();
    }

    #[tokio::test]
    async fn session_comparison() {
        let (mut outbound, inbound) = session_pair().await;
        encrypt(&mut outbound, "first").await;

        let worse = InboundGroupSession::from_export(&inbound.export_at_index(1).await).unwrap();
        let better = InboundGroupSession::from_export(&inbound.export().await).unwrap();

        assert_eq!(inbound.compare_ratchet(&worse).await, SessionOrdering::Better);
        assert_eq!(worse.compare_ratchet(&inbound).await, SessionOrdering::Worse);
        assert_eq!(inbound.compare_ratchet(&better).await, SessionOrdering::Equal);

        let (_, unrelated) = session_pair().await;
        assert_eq!(inbound.compare_ratchet(&unrelated).await, SessionOrdering::Unconnected);
    }

    #[tokio::test]
    async fn pickle_keeps_replay_protection() {
        let (mut outbound, inbound) = session_pair().await;
        let first = encrypt(&mut outbound, "first").await;
        inbound.decrypt(&first).await.unwrap();

        let pickle = serde_json::to_value(inbound.pickle().await).unwrap();
        let restored = InboundGroupSession::from_pickle(serde_json::from_value(pickle).unwrap());

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.decrypted_indices.lock().await.len(), 1);
        restored.decrypt(&first).await.unwrap();
    }

    #[test]
    fn decryption_history_is_capped() {
        let cap = u32::try_from(MAX_DECRYPTED_INDICES).unwrap();
        let mut indices: BTreeMap<u32, u64> = (0..cap).map(|i| (i, 0)).collect();

        remember_decryption(&mut indices, cap, 1);

        assert_eq!(indices.len(), MAX_DECRYPTED_INDICES);
        assert!(!indices.contains_key(&0));
        assert_eq!(indices.last_key_value(), Some((&cap, &1)));
    }
}
