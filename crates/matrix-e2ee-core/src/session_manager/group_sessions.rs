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
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::sessions::{OlmDecryptionInfo, SessionManager};
use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::{DeviceData, TrustEngine},
    olm::{
        EncryptionSettings, InboundGroupSession, OutboundGroupSession, RotationReason,
        SessionOrdering, ShareState,
    },
    requests::ToDeviceRequest,
    store::{Changes, Result as StoreResult, Store},
    transport::{retry_transient, RetrySettings, Transport},
    types::{
        events::{
            olm_v1::OlmPayloadContent,
            room_encrypted::{EncryptedRoomEvent, MegolmV1AesSha2Content},
            room_key::RoomKeyContent,
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
        },
        EventEncryptionAlgorithm,
    },
};

/// The state of the outbound side of a room.
///
/// Sessions that were replaced are kept read-only, they are listed by
/// [`CryptoStore::get_retired_outbound_group_sessions()`].
///
/// [`CryptoStore::get_retired_outbound_group_sessions()`]:
/// crate::store::CryptoStore::get_retired_outbound_group_sessions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundSessionState {
    /// We never sent a message to the room, or its session was discarded.
    NoSession,
    /// A session exists and can encrypt messages once it was shared.
    Active {
        /// The ID of the session.
        session_id: String,
        /// Was the room key shared with the room members.
        shared: bool,
    },
    /// The session can't be used anymore and gets replaced the next time the
    /// room key is shared.
    Rotating {
        /// The ID of the session.
        session_id: String,
        /// Why the session is replaced.
        reason: RotationReason,
    },
}

/// What happened when the room key of a room was shared.
#[derive(Clone, Debug, Default)]
pub struct ShareResult {
    /// The session that was shared.
    pub session_id: String,
    /// Why the previous session was replaced, if it was.
    pub rotated: Option<RotationReason>,
    /// The devices that received the room key in this round.
    pub shared_with: Vec<(OwnedUserId, OwnedDeviceId)>,
    /// The devices we told that they won't get the room key.
    pub withheld: Vec<(OwnedUserId, OwnedDeviceId, WithheldCode)>,
}

/// How an inbound group session was merged into the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The session wasn't known before.
    Imported,
    /// The session was known, the new copy decrypts messages further back.
    Widened,
    /// The known copy decrypts as much as the new one, it was kept.
    Unchanged,
    /// The new copy doesn't share a ratchet with the known one.
    Rejected,
}

impl ImportOutcome {
    /// Did the import change what we can decrypt.
    pub fn is_new(&self) -> bool {
        matches!(self, ImportOutcome::Imported | ImportOutcome::Widened)
    }
}

/// How much we trust the sender of a decrypted room event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderVerification {
    /// The sending device is verified and sent us the room key itself.
    Verified,
    /// The sending device is known but not verified, or the room key reached
    /// us indirectly.
    Unverified,
    /// We don't know a device of the sender owning the session.
    UnknownDevice,
}

/// Where a decrypted room event came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The device of the sender owning the session, if we know it.
    pub sender_device: Option<OwnedDeviceId>,
    /// The Curve25519 key of the device that created the session.
    #[serde(
        serialize_with = "crate::types::serialize_curve_key",
        deserialize_with = "crate::types::deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// The session that decrypted the event.
    pub session_id: String,
    /// The ratchet index the event was encrypted at.
    pub message_index: u32,
    /// How much we trust the sender.
    pub verification: SenderVerification,
}

/// A decrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The type of the decrypted event.
    pub event_type: String,
    /// The content of the decrypted event.
    pub content: Value,
    /// Where the event came from.
    pub encryption_info: EncryptionInfo,
}

#[derive(Clone, Debug)]
pub(crate) struct GroupSessionCache {
    store: Store,
    sessions: Arc<RwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>>,
}

impl GroupSessionCache {
    pub(crate) fn new(store: Store) -> Self {
        Self { store, sessions: Default::default() }
    }

    pub(crate) async fn insert(&self, session: OutboundGroupSession) {
        self.sessions.write().await.insert(session.room_id().to_owned(), session);
    }

    /// Either get a session for the given room from the cache or load it from
    /// the store.
    pub(crate) async fn get_or_load(
        &self,
        room_id: &RoomId,
    ) -> StoreResult<Option<OutboundGroupSession>> {
        if let Some(s) = self.sessions.read().await.get(room_id) {
            return Ok(Some(s.clone()));
        }

        let session = self.store.get_outbound_group_session(room_id).await?;

        if let Some(s) = &session {
            self.insert(s.clone()).await;
        }

        Ok(session)
    }
}

/// Creates, shares, rotates and uses the Megolm sessions of rooms, and keeps
/// the inbound sessions we received from others.
///
/// Outbound work on a room is serialized by a per-room lock, inbound work on
/// a session by a per-session lock.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    store: Store,
    sessions: SessionManager,
    trust: TrustEngine,
    transport: Arc<dyn Transport>,
    retry: RetrySettings,
    outbound: GroupSessionCache,
}

impl GroupSessionManager {
    pub(crate) fn new(
        store: Store,
        sessions: SessionManager,
        transport: Arc<dyn Transport>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            trust: TrustEngine::new(store.clone()),
            outbound: GroupSessionCache::new(store.clone()),
            store,
            sessions,
            transport,
            retry,
        }
    }

    /// The state of the outbound session of the given room.
    pub async fn outbound_state(&self, room_id: &RoomId) -> StoreResult<OutboundSessionState> {
        Ok(match self.outbound.get_or_load(room_id).await? {
            None => OutboundSessionState::NoSession,
            Some(session) => match session.rotation_reason() {
                Some(reason) => OutboundSessionState::Rotating {
                    session_id: session.session_id().to_owned(),
                    reason,
                },
                None => OutboundSessionState::Active {
                    session_id: session.session_id().to_owned(),
                    shared: session.shared(),
                },
            },
        })
    }

    async fn invalidate(&self, room_id: &RoomId, reason: RotationReason) -> StoreResult<bool> {
        let Some(mut session) = self.outbound.get_or_load(room_id).await? else {
            return Ok(false);
        };

        info!(session_id = session.session_id(), ?reason, "Invalidating an outbound group session");

        session.invalidate_session(reason);

        self.store.save_changes(Self::outbound_changes(&session)).await?;
        self.outbound.insert(session).await;

        Ok(true)
    }

    /// Tell the manager who is in the room now.
    ///
    /// The outbound session is invalidated right away if a single device that
    /// received it isn't eligible anymore, because its owner left or the
    /// device was deleted or blacklisted. Returns `true` if the session was
    /// invalidated.
    #[instrument(skip(self, members))]
    pub async fn room_members_changed(
        &self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> StoreResult<bool> {
        let _guard = self.store.lock_room(room_id).await;

        let Some(session) = self.outbound.get_or_load(room_id).await? else {
            return Ok(false);
        };

        if session.invalidated() {
            return Ok(false);
        }

        for (user_id, device_id) in session.recipients() {
            let removed = if !members.iter().any(|m| **m == *user_id) {
                true
            } else {
                self.store
                    .get_device(user_id, device_id)
                    .await?
                    .map_or(true, |d| d.is_deleted() || d.is_blacklisted())
            };

            if removed {
                debug!(?user_id, ?device_id, "A recipient of the room key left the room");
                return self.invalidate(room_id, RotationReason::MembershipChange).await;
            }
        }

        Ok(false)
    }

    fn outbound_changes(session: &OutboundGroupSession) -> Changes {
        Changes { outbound_group_sessions: vec![session.clone()], ..Default::default() }
    }

    async fn sharing_decision(
        &self,
        device: &DeviceData,
        settings: &EncryptionSettings,
    ) -> StoreResult<Option<WithheldCode>> {
        Ok(if device.is_blacklisted() {
            Some(WithheldCode::Blacklisted)
        } else if !device.supports_olm() {
            Some(WithheldCode::NoOlm)
        } else if settings.sharing_strategy.only_allow_trusted_devices
            && !self.trust.is_device_verified(device).await?
        {
            Some(WithheldCode::Unverified)
        } else {
            None
        })
    }

    fn rotation_reason(
        session: &OutboundGroupSession,
        recipients: &[DeviceData],
        settings: &EncryptionSettings,
    ) -> Option<RotationReason> {
        if let Some(reason) = session.rotation_reason() {
            return Some(reason);
        }

        if session.settings().algorithm != settings.algorithm
            || session.settings().sharing_strategy != settings.sharing_strategy
        {
            return Some(RotationReason::SettingsChanged);
        }

        let eligible: BTreeSet<_> =
            recipients.iter().map(|d| (d.user_id(), d.device_id())).collect();

        let device_removed = session.recipients().any(|r| !eligible.contains(&r));
        let key_changed = recipients
            .iter()
            .any(|d| session.is_shared_with(d) == ShareState::SharedButChangedSenderKey);

        (device_removed || key_changed).then_some(RotationReason::MembershipChange)
    }

    async fn create_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
        changes: &mut Changes,
    ) -> OutboundGroupSession {
        let (outbound, inbound) =
            self.store.account().await.create_group_session_pair(room_id, settings).await;

        info!(session_id = outbound.session_id(), "Created a new outbound group session");

        changes.inbound_group_sessions.push(inbound);
        outbound
    }

    async fn send(&self, request: ToDeviceRequest) -> OlmResult<()> {
        if request.is_empty() {
            return Ok(());
        }

        trace!(
            event_type = request.event_type.as_str(),
            recipient_count = request.message_count(),
            "Sending to-device messages"
        );

        let transport = &self.transport;
        let request = &request;
        retry_transient(&self.retry, move || transport.send_to_device(request)).await?;

        Ok(())
    }

    /// Share the room key of a room with the devices of the given users.
    ///
    /// A new session is created if the room has none, or if the current one
    /// needs to be rotated. Devices that already received the current session
    /// are skipped, devices that aren't allowed to get it are sent a
    /// withheld notice once.
    ///
    /// New sessions are persisted before any key leaves the device.
    #[instrument(skip(self, users, settings))]
    pub async fn share_room_key<'a>(
        &self,
        room_id: &RoomId,
        users: impl IntoIterator<Item = &'a UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<ShareResult> {
        let _guard = self.store.lock_room(room_id).await;
        let users: BTreeSet<&UserId> = users.into_iter().collect();

        let mut recipients = Vec::new();
        let mut refused = Vec::new();

        for user_id in users {
            for device in self.store.get_user_devices(user_id).await?.into_values() {
                let is_own_device = device.user_id() == self.store.user_id()
                    && device.device_id() == self.store.device_id();

                if is_own_device || device.is_deleted() {
                    continue;
                }

                match self.sharing_decision(&device, &settings).await? {
                    None => recipients.push(device),
                    Some(code) => refused.push((device, code)),
                }
            }
        }

        let mut changes = Changes::default();
        let mut rotated = None;

        let mut session = match self.outbound.get_or_load(room_id).await? {
            Some(session) => match Self::rotation_reason(&session, &recipients, &settings) {
                Some(reason) => {
                    info!(session_id = session.session_id(), ?reason, "Rotating the room key");

                    let mut retired = session;
                    retired.invalidate_session(reason);
                    changes.retired_outbound_group_sessions.push(retired);
                    rotated = Some(reason);

                    self.create_session(room_id, settings, &mut changes).await
                }
                None => session,
            },
            None => self.create_session(room_id, settings, &mut changes).await,
        };

        if !changes.is_empty() {
            changes.outbound_group_sessions.push(session.clone());
            self.store.save_changes(changes).await?;
            self.outbound.insert(session.clone()).await;
        }

        let to_share: Vec<DeviceData> = recipients
            .into_iter()
            .filter(|d| session.is_shared_with(d) == ShareState::NotShared)
            .collect();
        let mut withheld = refused;

        let ensured = self.sessions.ensure_sessions(&to_share).await?;
        let no_olm: BTreeSet<_> =
            ensured.failures.iter().map(|f| (f.user_id.clone(), f.device_id.clone())).collect();

        let message_index = session.message_index().await;
        let room_key = OlmPayloadContent::RoomKey(session.as_content().await);
        let mut key_request = ToDeviceRequest::new("m.room.encrypted");
        let mut shared_with = Vec::new();

        for device in to_share {
            let device_key = (device.user_id().to_owned(), device.device_id().to_owned());

            if no_olm.contains(&device_key) {
                withheld.push((device, WithheldCode::NoOlm));
                continue;
            }

            match self.sessions.encrypt_with_existing_session(&device, &room_key).await {
                Ok(encrypted) => {
                    key_request.add_message(
                        device_key.0,
                        device_key.1,
                        serde_json::to_value(&encrypted.content)?,
                    );
                    shared_with.push(device);
                }
                Err(OlmError::MissingSession | OlmError::SessionCreation(_)) => {
                    withheld.push((device, WithheldCode::NoOlm));
                }
                Err(e) => return Err(e),
            }
        }

        // Don't tell a device twice that it won't get the key.
        withheld.retain(|(d, code)| !session.is_withheld_to(d, *code));

        let mut withheld_request = ToDeviceRequest::new("m.room_key.withheld");
        for (device, code) in &withheld {
            let content = RoomKeyWithheldContent::new(
                *code,
                room_id.to_owned(),
                session.session_id().to_owned(),
                session.sender_key(),
                self.store.device_id().to_owned(),
            );

            withheld_request.add_message(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                serde_json::to_value(content)?,
            );
        }

        self.send(key_request).await?;
        self.send(withheld_request).await?;

        for device in &shared_with {
            if let Some(sender_key) = device.curve25519_key() {
                session.mark_shared_with(
                    device.user_id(),
                    device.device_id(),
                    sender_key,
                    message_index,
                );
            }
        }

        for (device, code) in &withheld {
            session.mark_withheld(device.user_id(), device.device_id(), *code);
        }

        session.mark_as_shared();

        self.store.save_changes(Self::outbound_changes(&session)).await?;
        self.outbound.insert(session.clone()).await;

        let result = ShareResult {
            session_id: session.session_id().to_owned(),
            rotated,
            shared_with: shared_with
                .iter()
                .map(|d| (d.user_id().to_owned(), d.device_id().to_owned()))
                .collect(),
            withheld: withheld
                .iter()
                .map(|(d, code)| (d.user_id().to_owned(), d.device_id().to_owned(), *code))
                .collect(),
        };

        info!(
            session_id = result.session_id.as_str(),
            shared = result.shared_with.len(),
            withheld = result.withheld.len(),
            "Shared the room key"
        );

        Ok(result)
    }

    /// Encrypt a room event with the outbound session of the room.
    ///
    /// The room key needs to be shared first. The advanced session is
    /// persisted before the ciphertext is returned.
    #[instrument(skip(self, content))]
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<MegolmV1AesSha2Content> {
        let _guard = self.store.lock_room(room_id).await;

        let mut session = self
            .outbound
            .get_or_load(room_id)
            .await?
            .filter(|s| s.shared() && !s.expired())
            .ok_or_else(|| MegolmError::MissingOutboundSession(room_id.to_owned()))?;

        let content = session.encrypt(event_type, content).await?;

        self.store.save_changes(Self::outbound_changes(&session)).await?;
        self.outbound.insert(session).await;

        Ok(content)
    }

    /// Merge an inbound group session into the store.
    ///
    /// A session we already know is only replaced by a copy that decrypts
    /// further back in its history, the ratchet never moves backwards and
    /// never gets narrower.
    #[instrument(skip_all, fields(room_id = ?session.room_id(), session_id = session.session_id()))]
    pub async fn import_session(&self, session: InboundGroupSession) -> StoreResult<ImportOutcome> {
        let _guard = self.store.lock_group_session(session.session_id()).await;

        let existing =
            self.store.get_inbound_group_session(session.room_id(), session.session_id()).await?;

        let outcome = match &existing {
            None => ImportOutcome::Imported,
            Some(existing) => match session.compare_ratchet(existing).await {
                SessionOrdering::Better => {
                    session.inherit_history(existing).await;
                    ImportOutcome::Widened
                }
                SessionOrdering::Equal | SessionOrdering::Worse => ImportOutcome::Unchanged,
                SessionOrdering::Unconnected => {
                    warn!("Refusing to replace a room key with an unrelated one");
                    ImportOutcome::Rejected
                }
            },
        };

        if outcome.is_new() {
            debug!(
                first_known_index = session.first_known_index(),
                ?outcome,
                "Storing a room key"
            );

            let changes = Changes { inbound_group_sessions: vec![session], ..Default::default() };
            self.store.save_changes(changes).await?;
        }

        Ok(outcome)
    }

    /// Accept a room key its creator sent us over Olm.
    pub async fn receive_room_key(
        &self,
        decrypted: &OlmDecryptionInfo,
        content: &RoomKeyContent,
    ) -> OlmResult<ImportOutcome> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        if decrypted.payload.room_id.as_ref() != Some(&content.room_id) {
            return Err(EventError::MismatchedRoom(
                content.room_id.clone(),
                decrypted.payload.room_id.clone(),
            )
            .into());
        }

        let session = InboundGroupSession::from_room_key_content(
            decrypted.sender_key,
            decrypted.payload.keys.ed25519,
            content,
        )?;

        info!(
            sender = ?decrypted.sender,
            room_id = ?content.room_id,
            session_id = session.session_id(),
            "Received a room key"
        );

        Ok(self.import_session(session).await?)
    }

    async fn sender_verification(
        &self,
        event: &EncryptedRoomEvent,
        session: &InboundGroupSession,
    ) -> StoreResult<(Option<OwnedDeviceId>, SenderVerification)> {
        let device = self
            .store
            .get_device_from_curve_key(&event.sender, session.sender_key())
            .await?
            .filter(|d| d.ed25519_key() == Some(session.signing_key()));

        let Some(device) = device else {
            return Ok((None, SenderVerification::UnknownDevice));
        };

        let verification =
            if !session.has_been_imported() && self.trust.is_device_verified(&device).await? {
                SenderVerification::Verified
            } else {
                SenderVerification::Unverified
            };

        Ok((Some(device.device_id().to_owned()), verification))
    }

    /// Decrypt a room event.
    ///
    /// Fails with [`MegolmError::MissingRoomKey`] if we don't have the
    /// session, carrying the withheld code if the sender told us why. The
    /// record of decrypted indices is persisted before the plaintext is
    /// returned.
    #[instrument(
        skip_all,
        fields(room_id = ?event.room_id, session_id = %event.content.session_id)
    )]
    pub async fn decrypt(&self, event: &EncryptedRoomEvent) -> MegolmResult<DecryptedRoomEvent> {
        let content = &event.content;
        let _guard = self.store.lock_group_session(&content.session_id).await;

        let session = self
            .store
            .get_inbound_group_session(&event.room_id, &content.session_id)
            .await?
            .filter(|s| s.sender_key() == content.sender_key);

        let Some(session) = session else {
            let withheld = self
                .store
                .get_withheld_info(&event.room_id, &content.session_id)
                .await?
                .map(|entry| entry.content.code);

            debug!(?withheld, "Missing the room key to decrypt an event");

            return Err(MegolmError::MissingRoomKey(withheld));
        };

        let (plaintext, message_index) = session.decrypt(event).await?;

        // The session itself didn't change, nobody needs to hear about it.
        let changes =
            Changes { inbound_group_sessions: vec![session.clone()], ..Default::default() };
        self.store.crypto_store().save_changes(changes).await?;

        let (sender_device, verification) = self.sender_verification(event, &session).await?;

        trace!(message_index, ?verification, "Decrypted a room event");

        Ok(DecryptedRoomEvent {
            event_type: plaintext.event_type,
            content: plaintext.content,
            encryption_info: EncryptionInfo {
                sender: event.sender.clone(),
                sender_device,
                sender_key: session.sender_key(),
                session_id: session.session_id().to_owned(),
                message_index,
                verification,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{DeviceId, UserId};

    use super::GroupSessionManager;
    use crate::{
        session_manager::sessions::testing::{peer, retry_settings, Peer},
        testing::MockHomeserver,
    };

    pub struct GroupPeer {
        pub peer: Peer,
        pub groups: GroupSessionManager,
    }

    pub async fn group_peer(
        server: &MockHomeserver,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> GroupPeer {
        let peer = peer(server, user_id, device_id).await;
        let groups = GroupSessionManager::new(
            peer.store.clone(),
            peer.manager.clone(),
            peer.transport.clone(),
            retry_settings(),
        );

        GroupPeer { peer, groups }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::{assert_let, assert_matches};
    use ruma::{device_id, room_id, user_id, OwnedUserId, RoomId};
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::{
        testing::{group_peer, GroupPeer},
        ImportOutcome, OutboundSessionState, SenderVerification,
    };
    use crate::{
        error::MegolmError,
        identities::LocalTrust,
        olm::{EncryptionSettings, InboundGroupSession, KeySharingPolicy, RotationReason},
        session_manager::sessions::testing::introduce,
        store::{Changes, DeviceChanges},
        testing::MockHomeserver,
        types::events::{
            olm_v1::OlmPayloadContent, room_encrypted::EncryptedRoomEvent,
            room_key_withheld::WithheldCode, ToDeviceEvent,
        },
    };
    use vodozemac::megolm::MegolmMessage;

    fn room() -> &'static RoomId {
        room_id!("!test:localhost")
    }

    async fn alice_and_bob(server: &MockHomeserver) -> (GroupPeer, GroupPeer) {
        let alice = group_peer(server, user_id!("@alice:localhost"), device_id!("ALICE")).await;
        let bob = group_peer(server, user_id!("@bob:localhost"), device_id!("BOB")).await;
        introduce(&alice.peer, &[&bob.peer]).await;
        introduce(&bob.peer, &[&alice.peer]).await;

        (alice, bob)
    }

    fn members(peers: &[&GroupPeer]) -> Vec<OwnedUserId> {
        peers.iter().map(|p| p.peer.device.user_id().to_owned()).collect()
    }

    /// Feed every to-device event waiting for the peer into its managers.
    async fn receive_to_device(
        server: &MockHomeserver,
        receiver: &GroupPeer,
    ) -> Vec<ToDeviceEvent> {
        let device = &receiver.peer.device;
        let events = server.take_to_device_events(device.user_id(), device.device_id()).await;

        for event in &events {
            if let ToDeviceEvent::Encrypted { sender, content } = event {
                let decrypted = receiver.peer.manager.decrypt(sender, content).await.unwrap();

                if let OlmPayloadContent::RoomKey(room_key) = decrypted.payload.content().unwrap() {
                    receiver.groups.receive_room_key(&decrypted, &room_key).await.unwrap();
                }
            }
        }

        events
    }

    async fn send_message(sender: &GroupPeer, body: &str) -> EncryptedRoomEvent {
        let content = sender
            .groups
            .encrypt(room(), "m.room.message", json!({ "body": body }))
            .await
            .unwrap();

        EncryptedRoomEvent {
            event_id: None,
            sender: sender.peer.device.user_id().to_owned(),
            room_id: room().to_owned(),
            content,
        }
    }

    #[tokio::test]
    async fn room_messages_flow() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;

        assert_eq!(
            alice.groups.outbound_state(room()).await.unwrap(),
            OutboundSessionState::NoSession
        );

        let members = members(&[&alice, &bob]);
        let result = alice
            .groups
            .share_room_key(room(), members.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();

        assert_eq!(result.shared_with, vec![(bob.peer.device.user_id().to_owned(), "BOB".into())]);
        assert!(result.withheld.is_empty());
        assert!(result.rotated.is_none());
        assert_eq!(
            alice.groups.outbound_state(room()).await.unwrap(),
            OutboundSessionState::Active { session_id: result.session_id.clone(), shared: true }
        );

        receive_to_device(&server, &bob).await;

        let event = send_message(&alice, "It's a secret to everybody").await;
        assert_eq!(event.content.session_id, result.session_id);

        let decrypted = bob.groups.decrypt(&event).await.unwrap();
        assert_eq!(decrypted.event_type, "m.room.message");
        assert_eq!(decrypted.content, json!({ "body": "It's a secret to everybody" }));
        assert_eq!(decrypted.encryption_info.message_index, 0);
        assert_eq!(decrypted.encryption_info.sender_device, Some("ALICE".into()));
        assert_eq!(decrypted.encryption_info.verification, SenderVerification::Unverified);

        // Alice can read her own messages.
        let own = alice.groups.decrypt(&event).await.unwrap();
        assert_eq!(own.content, decrypted.content);

        // Sharing again doesn't send the key a second time.
        let again = alice
            .groups
            .share_room_key(room(), members.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();
        assert_eq!(again.session_id, result.session_id);
        assert!(again.shared_with.is_empty());
    }

    #[tokio::test]
    async fn missing_keys_are_reported() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;

        alice
            .groups
            .share_room_key(room(), [alice.peer.device.user_id()], EncryptionSettings::default())
            .await
            .unwrap();

        let event = send_message(&alice, "Bob isn't invited").await;

        assert_matches!(bob.groups.decrypt(&event).await, Err(MegolmError::MissingRoomKey(None)));
    }

    #[tokio::test]
    async fn membership_changes_rotate_the_session() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;
        let both = members(&[&alice, &bob]);

        let first = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();
        receive_to_device(&server, &bob).await;

        let old_event = send_message(&alice, "Before Bob left").await;

        // Bob leaves, the session is invalidated right away.
        let only_alice = members(&[&alice]);
        assert!(alice.groups.room_members_changed(room(), &only_alice).await.unwrap());
        assert_eq!(
            alice.groups.outbound_state(room()).await.unwrap(),
            OutboundSessionState::Rotating {
                session_id: first.session_id.clone(),
                reason: RotationReason::MembershipChange
            }
        );
        assert_matches!(
            alice.groups.encrypt(room(), "m.room.message", json!({})).await,
            Err(MegolmError::MissingOutboundSession(_))
        );

        // Bob rejoins, he gets a fresh session.
        let second = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();

        assert_ne!(second.session_id, first.session_id);
        assert_eq!(second.rotated, Some(RotationReason::MembershipChange));

        let retired =
            alice.peer.store.get_retired_outbound_group_sessions(room()).await.unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].session_id(), first.session_id);

        receive_to_device(&server, &bob).await;
        let new_event = send_message(&alice, "After Bob rejoined").await;

        bob.groups.decrypt(&new_event).await.unwrap();
        // History sent under the retired session stays readable.
        bob.groups.decrypt(&old_event).await.unwrap();
    }

    #[tokio::test]
    async fn message_count_rotates_the_session() {
        let server = MockHomeserver::new();
        let (alice, _bob) = alice_and_bob(&server).await;
        let settings = EncryptionSettings { rotation_period_msgs: 1, ..Default::default() };

        let first = alice
            .groups
            .share_room_key(room(), [alice.peer.device.user_id()], settings.clone())
            .await
            .unwrap();

        send_message(&alice, "The only message").await;

        assert_matches!(
            alice.groups.outbound_state(room()).await.unwrap(),
            OutboundSessionState::Rotating { reason: RotationReason::MessageCountExceeded, .. }
        );

        let second = alice
            .groups
            .share_room_key(room(), [alice.peer.device.user_id()], settings)
            .await
            .unwrap();

        assert_ne!(second.session_id, first.session_id);
        assert_eq!(second.rotated, Some(RotationReason::MessageCountExceeded));
    }

    #[tokio::test]
    async fn untrusted_devices_are_refused() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;
        let both = members(&[&alice, &bob]);
        let settings = EncryptionSettings {
            sharing_strategy: KeySharingPolicy {
                only_allow_trusted_devices: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let result = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), settings.clone())
            .await
            .unwrap();

        assert!(result.shared_with.is_empty());
        assert_eq!(
            result.withheld,
            vec![(bob.peer.device.user_id().to_owned(), "BOB".into(), WithheldCode::Unverified)]
        );

        let events = receive_to_device(&server, &bob).await;
        assert_eq!(events.len(), 1);
        assert_let!(ToDeviceEvent::RoomKeyWithheld { content, .. } = &events[0]);
        assert_eq!(content.code, WithheldCode::Unverified);
        assert_eq!(content.session_id, result.session_id);

        // The notice isn't repeated.
        let again = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), settings.clone())
            .await
            .unwrap();
        assert!(again.withheld.is_empty());

        // Once Bob is verified he gets the key.
        let mut device = bob.peer.device.clone();
        device.set_trust_state(LocalTrust::Verified);
        let changes = Changes {
            devices: DeviceChanges { changed: vec![device], ..Default::default() },
            ..Default::default()
        };
        alice.peer.store.save_changes(changes).await.unwrap();

        let verified = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), settings)
            .await
            .unwrap();
        assert_eq!(verified.session_id, result.session_id);
        assert_eq!(verified.shared_with.len(), 1);
    }

    #[tokio::test]
    async fn devices_without_sessions_get_no_olm() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;
        let both = members(&[&alice, &bob]);

        server.exhaust_one_time_keys(bob.peer.device.user_id(), bob.peer.device.device_id()).await;

        let result = alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();

        assert!(result.shared_with.is_empty());
        assert_eq!(
            result.withheld,
            vec![(bob.peer.device.user_id().to_owned(), "BOB".into(), WithheldCode::NoOlm)]
        );
    }

    #[tokio::test]
    async fn imports_only_widen_sessions() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;

        alice
            .groups
            .share_room_key(room(), [alice.peer.device.user_id()], EncryptionSettings::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        for i in 0..6 {
            events.push(send_message(&alice, &format!("Message {i}")).await);
        }

        let session_id = &events[0].content.session_id;
        let own = alice
            .peer
            .store
            .get_inbound_group_session(room(), session_id)
            .await
            .unwrap()
            .unwrap();

        let at = |index| {
            let own = own.clone();
            async move {
                InboundGroupSession::from_export(&own.export_at_index(index).await).unwrap()
            }
        };

        assert_eq!(bob.groups.import_session(at(3).await).await.unwrap(), ImportOutcome::Imported);
        assert_matches!(
            bob.groups.decrypt(&events[1]).await,
            Err(MegolmError::UnknownMessageIndex { index: 1, first_known_index: 3 })
        );
        bob.groups.decrypt(&events[4]).await.unwrap();

        assert_eq!(bob.groups.import_session(at(5).await).await.unwrap(), ImportOutcome::Unchanged);
        assert_eq!(bob.groups.import_session(at(1).await).await.unwrap(), ImportOutcome::Widened);

        let decrypted = bob.groups.decrypt(&events[1]).await.unwrap();
        assert_eq!(decrypted.encryption_info.message_index, 1);
        assert_eq!(decrypted.encryption_info.verification, SenderVerification::Unverified);

        // The replay record of the narrower copy carried over.
        bob.groups.decrypt(&events[4]).await.unwrap();
        assert_matches!(
            bob.groups.decrypt(&events[0]).await,
            Err(MegolmError::UnknownMessageIndex { index: 0, first_known_index: 1 })
        );
    }

    #[tokio::test]
    async fn replayed_ciphertexts_are_rejected() {
        let server = MockHomeserver::new();
        let (alice, bob) = alice_and_bob(&server).await;
        let both = members(&[&alice, &bob]);

        alice
            .groups
            .share_room_key(room(), both.iter().map(|u| &**u), EncryptionSettings::default())
            .await
            .unwrap();
        receive_to_device(&server, &bob).await;

        let event = send_message(&alice, "First").await;

        bob.groups.decrypt(&event).await.unwrap();
        // Decrypting the same event again is fine.
        bob.groups.decrypt(&event).await.unwrap();

        // A different ciphertext claiming the same index isn't.
        let mut bytes = event.content.ciphertext.to_bytes();
        let mac_position = bytes.len() - 65;
        bytes[mac_position] ^= 0xff;

        let mut forged = event.clone();
        forged.content.ciphertext = MegolmMessage::from_bytes(&bytes).unwrap();

        assert_matches!(
            bob.groups.decrypt(&forged).await,
            Err(MegolmError::ReplayedMessage { index: 0, .. })
        );
    }
}
