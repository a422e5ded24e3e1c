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

use std::{slice, sync::Arc, time::Duration};

use ruma::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{EventError, OlmError, OlmResult, SessionCreationError},
    identities::DeviceData,
    olm::{most_recent_session, Account, Session},
    requests::{KeysClaimRequest, KeysClaimResponse, ToDeviceRequest, SIGNED_CURVE25519},
    store::{Changes, Result as StoreResult, Store},
    transport::{retry_transient, RetrySettings, Transport},
    types::{
        events::olm_v1::{DecryptedOlmPayload, OlmPayloadContent, OlmV1Curve25519AesSha2Content},
        EventEncryptionAlgorithm, SignedKey,
    },
};

/// How long a session needs to exist before we replace it because it looks
/// wedged.
const UNWEDGING_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A device we couldn't establish an Olm session with.
#[derive(Debug)]
pub struct SessionFailure {
    /// The owner of the device.
    pub user_id: OwnedUserId,
    /// The device.
    pub device_id: OwnedDeviceId,
    /// Why no session could be created.
    pub error: SessionCreationError,
}

impl SessionFailure {
    fn new(device: &DeviceData, error: SessionCreationError) -> Self {
        Self {
            user_id: device.user_id().to_owned(),
            device_id: device.device_id().to_owned(),
            error,
        }
    }
}

/// The outcome of [`SessionManager::ensure_sessions()`].
#[derive(Debug, Default)]
pub struct EnsureSessionsResult {
    /// The devices we established a new session with.
    pub created: Vec<(OwnedUserId, OwnedDeviceId)>,
    /// The devices we couldn't establish a session with.
    pub failures: Vec<SessionFailure>,
}

/// A to-device payload encrypted for a single device.
#[derive(Debug, Clone)]
pub struct OlmEncryptionResult {
    /// The session that encrypted the payload.
    pub session_id: String,
    /// The `m.room.encrypted` content.
    pub content: OlmV1Curve25519AesSha2Content,
}

/// A successfully decrypted to-device payload.
#[derive(Debug, Clone)]
pub struct OlmDecryptionInfo {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the sending device.
    pub sender_key: Curve25519PublicKey,
    /// The session that decrypted the payload.
    pub session_id: String,
    /// The decrypted, and checked, payload.
    pub payload: DecryptedOlmPayload,
}

enum DecryptAttempt {
    Decrypted(Box<Session>, String),
    Wedged,
    NoSession,
}

/// Establishes Olm sessions with other devices and encrypts and decrypts
/// to-device payloads with them.
///
/// The sessions we share with a device are locked as a whole for every
/// operation, so ratchets never advance concurrently. Sessions of different
/// devices are independent.
#[derive(Debug, Clone)]
pub(crate) struct SessionManager {
    store: Store,
    transport: Arc<dyn Transport>,
    retry: RetrySettings,
}

impl SessionManager {
    pub fn new(store: Store, transport: Arc<dyn Transport>, retry: RetrySettings) -> Self {
        Self { store, transport, retry }
    }

    fn is_own_device(&self, device: &DeviceData) -> bool {
        device.user_id() == self.store.user_id() && device.device_id() == self.store.device_id()
    }

    async fn has_usable_session(&self, curve_key: Curve25519PublicKey) -> StoreResult<bool> {
        let sessions = self.store.get_sessions(&curve_key.to_base64()).await?;
        let has_session = sessions.lock().await.iter().any(|s| !s.is_quarantined());

        Ok(has_session)
    }

    /// Make sure we share a usable Olm session with each of the given
    /// devices, claiming one-time keys for the ones we don't.
    ///
    /// Devices we couldn't establish a session with are reported in the
    /// result, they don't fail the other devices.
    #[instrument(skip_all, fields(device_count = devices.len()))]
    pub async fn ensure_sessions(&self, devices: &[DeviceData]) -> OlmResult<EnsureSessionsResult> {
        self.establish_sessions(devices, false).await
    }

    async fn establish_sessions(
        &self,
        devices: &[DeviceData],
        force: bool,
    ) -> OlmResult<EnsureSessionsResult> {
        let mut result = EnsureSessionsResult::default();
        let mut missing = Vec::new();

        for device in devices {
            if self.is_own_device(device) || device.is_deleted() {
                continue;
            }

            let Some(curve_key) = device.curve25519_key() else {
                let error = SessionCreationError::DeviceMissingCurveKey(
                    device.user_id().to_owned(),
                    device.device_id().to_owned(),
                );
                result.failures.push(SessionFailure::new(device, error));
                continue;
            };

            if force || !self.has_usable_session(curve_key).await? {
                missing.push(device);
            }
        }

        if missing.is_empty() {
            return Ok(result);
        }

        let mut request = KeysClaimRequest::default();
        for device in &missing {
            request
                .one_time_keys
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), SIGNED_CURVE25519.to_owned());
        }

        debug!(device_count = missing.len(), "Claiming one-time keys");

        let transport = &self.transport;
        let request = &request;
        let response =
            retry_transient(&self.retry, move || transport.claim_one_time_keys(request)).await?;

        let mut new_sessions = Vec::new();

        {
            let account = self.store.account().await;

            for device in missing {
                match Self::session_from_claim(&account, device, &response) {
                    Ok(session) => {
                        info!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            session_id = session.session_id(),
                            "Established a new Olm session"
                        );

                        result
                            .created
                            .push((device.user_id().to_owned(), device.device_id().to_owned()));
                        new_sessions.push(session);
                    }
                    Err(error) => {
                        warn!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            "Couldn't establish an Olm session: {error}"
                        );

                        result.failures.push(SessionFailure::new(device, error));
                    }
                }
            }
        }

        if !new_sessions.is_empty() {
            let changes = Changes { sessions: new_sessions.clone(), ..Default::default() };
            self.store.save_changes(changes).await?;

            for session in new_sessions {
                let sessions = self.store.get_sessions(&session.sender_key().to_base64()).await?;
                sessions.lock().await.push(session);
            }
        }

        Ok(result)
    }

    fn session_from_claim(
        account: &Account,
        device: &DeviceData,
        response: &KeysClaimResponse,
    ) -> Result<Session, SessionCreationError> {
        let prefix = format!("{SIGNED_CURVE25519}:");

        let one_time_key = response
            .one_time_keys
            .get(device.user_id())
            .and_then(|devices| devices.get(device.device_id()))
            .and_then(|keys| keys.iter().find(|(key_id, _)| key_id.starts_with(&prefix)))
            .and_then(|(_, key)| serde_json::from_value::<SignedKey>(key.clone()).ok())
            .ok_or_else(|| {
                SessionCreationError::OneTimeKeyMissing(
                    device.user_id().to_owned(),
                    device.device_id().to_owned(),
                )
            })?;

        account.create_outbound_session(device, &one_time_key)
    }

    /// Encrypt a payload for the given device.
    ///
    /// A session is established first if we don't share a usable one with
    /// the device yet. The advanced ratchet is persisted before the
    /// ciphertext is returned.
    #[instrument(skip_all, fields(user_id = ?device.user_id(), device_id = ?device.device_id()))]
    pub async fn encrypt(
        &self,
        device: &DeviceData,
        content: &OlmPayloadContent,
    ) -> OlmResult<OlmEncryptionResult> {
        let curve_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        if !self.has_usable_session(curve_key).await? {
            let result = self.ensure_sessions(slice::from_ref(device)).await?;

            if let Some(failure) = result.failures.into_iter().next() {
                return Err(failure.error.into());
            }
        }

        self.encrypt_with_existing_session(device, content).await
    }

    /// Encrypt a payload with the most recently used session we share with
    /// the device, without trying to establish a new one.
    pub async fn encrypt_with_existing_session(
        &self,
        device: &DeviceData,
        content: &OlmPayloadContent,
    ) -> OlmResult<OlmEncryptionResult> {
        let curve_key = device.curve25519_key().ok_or(OlmError::MissingSession)?;

        let sessions = self.store.get_sessions(&curve_key.to_base64()).await?;
        let mut sessions = sessions.lock().await;

        let index = most_recent_session(&sessions)
            .and_then(|recent| sessions.iter().position(|s| s.session_id == recent.session_id))
            .ok_or(OlmError::MissingSession)?;

        let mut session = sessions[index].deep_clone().await;
        let content = session.encrypt(device, content).await?;

        let changes = Changes { sessions: vec![session.clone()], ..Default::default() };
        self.store.save_changes(changes).await?;

        let session_id = session.session_id().to_owned();
        sessions[index] = session;

        Ok(OlmEncryptionResult { session_id, content })
    }

    /// Try to decrypt the message with copies of the given sessions, the
    /// sessions themselves stay untouched.
    async fn decrypt_with_existing_sessions(
        sessions: &[Session],
        message: &OlmMessage,
    ) -> DecryptAttempt {
        let mut order: Vec<usize> =
            (0..sessions.len()).filter(|i| !sessions[*i].is_quarantined()).collect();
        order.sort_by_key(|i| {
            std::cmp::Reverse((sessions[*i].last_use_time, sessions[*i].creation_time))
        });

        for i in order {
            let session = &sessions[i];

            let is_pre_key = match message {
                OlmMessage::PreKey(m) if !session.matches_pre_key_message(m) => continue,
                OlmMessage::PreKey(_) => true,
                OlmMessage::Normal(_) => false,
            };

            let mut session = session.deep_clone().await;

            match session.decrypt(message).await {
                Ok(plaintext) => return DecryptAttempt::Decrypted(Box::new(session), plaintext),
                Err(error) => {
                    trace!(
                        session_id = session.session_id(),
                        "Failed to decrypt a message: {error}"
                    );

                    // Pre-key messages only belong to the session they created.
                    if is_pre_key {
                        return DecryptAttempt::Wedged;
                    }
                }
            }
        }

        match message {
            OlmMessage::Normal(_) => DecryptAttempt::Wedged,
            OlmMessage::PreKey(_) => DecryptAttempt::NoSession,
        }
    }

    /// Decrypt a to-device payload sent by the given user.
    ///
    /// The sessions we share with the sending device are tried in most
    /// recently used order, a pre-key message nobody can decrypt creates a
    /// new session. The ratchet is committed before the plaintext is
    /// returned.
    ///
    /// A payload that isn't bound to us, or to the sending device, takes the
    /// session out of use.
    #[instrument(skip_all, fields(sender = ?sender, sender_key = %content.sender_key.to_base64()))]
    pub async fn decrypt(
        &self,
        sender: &UserId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<OlmDecryptionInfo> {
        if content.algorithm != EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let own_identity = self.store.static_account().clone();
        let sender_key = content.sender_key;
        let message = content
            .message_for(own_identity.identity_keys.curve25519)
            .ok_or(EventError::MissingCiphertext)?;

        let sessions = self.store.get_sessions(&sender_key.to_base64()).await?;
        let mut sessions = sessions.lock().await;
        let mut transaction = self.store.transaction();

        let (mut session, plaintext) =
            match Self::decrypt_with_existing_sessions(&sessions, message).await {
                DecryptAttempt::Decrypted(session, plaintext) => (*session, plaintext),
                DecryptAttempt::Wedged => {
                    warn!("None of the Olm sessions with the sender could decrypt the message");
                    return Err(OlmError::SessionWedged(sender.to_owned(), sender_key));
                }
                DecryptAttempt::NoSession => {
                    let OlmMessage::PreKey(pre_key) = message else {
                        return Err(OlmError::SessionWedged(sender.to_owned(), sender_key));
                    };

                    // Creating the session consumes one of our one-time keys,
                    // the account is committed together with the session.
                    transaction.account().await.create_inbound_session(sender_key, pre_key)?
                }
            };

        let sender_signing_key = self
            .store
            .get_device_from_curve_key(sender, sender_key)
            .await?
            .and_then(|d| d.ed25519_key());

        let payload = serde_json::from_str::<DecryptedOlmPayload>(&plaintext);
        let binding = match &payload {
            Ok(payload) => payload.check_binding(
                &sender.to_owned(),
                &own_identity.user_id,
                own_identity.identity_keys.ed25519,
                sender_signing_key,
            ),
            Err(_) => Ok(()),
        };

        if let Err(reason) = &binding {
            warn!(session_id = session.session_id(), "Quarantining an Olm session: {reason}");
            session.quarantine(&reason.to_string());
        }

        transaction.changes().sessions.push(session.clone());
        transaction.commit().await?;

        let session_id = session.session_id().to_owned();

        match sessions.iter_mut().find(|s| s.session_id == session.session_id) {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }

        let payload = payload?;

        if let Err(reason) = binding {
            return Err(OlmError::SessionQuarantined { session_id, reason });
        }

        trace!(
            session_id = session_id.as_str(),
            event_type = %payload.event_type,
            "Decrypted a to-device payload"
        );

        Ok(OlmDecryptionInfo { sender: sender.to_owned(), sender_key, session_id, payload })
    }

    /// Replace the sessions with a device whose messages we can't decrypt
    /// anymore.
    ///
    /// A fresh session is created and announced with an `m.dummy` payload.
    /// Nothing happens if the newest session with the device is younger than
    /// an hour, the other side is likely still catching up.
    ///
    /// Returns `true` if a new session was created.
    #[instrument(skip(self))]
    pub async fn unwedge(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<bool> {
        let Some(device) = self.store.get_device_from_curve_key(sender, sender_key).await? else {
            warn!("Can't replace the Olm session of an unknown device");
            return Ok(false);
        };

        let newest = {
            let sessions = self.store.get_sessions(&sender_key.to_base64()).await?;
            let sessions = sessions.lock().await;
            sessions.iter().map(|s| u64::from(s.creation_time.get())).max()
        };

        if let Some(created) = newest {
            let now = u64::from(SecondsSinceUnixEpoch::now().get());

            if now.saturating_sub(created) < UNWEDGING_INTERVAL.as_secs() {
                debug!("The newest Olm session with the device is recent, not replacing it");
                return Ok(false);
            }
        }

        let result = self.establish_sessions(slice::from_ref(&device), true).await?;

        if let Some(failure) = result.failures.into_iter().next() {
            return Err(failure.error.into());
        }

        let encrypted =
            self.encrypt_with_existing_session(&device, &OlmPayloadContent::Dummy).await?;

        let mut request = ToDeviceRequest::new("m.room.encrypted");
        request.add_message(
            device.user_id().to_owned(),
            device.device_id().to_owned(),
            serde_json::to_value(&encrypted.content)?,
        );

        let transport = &self.transport;
        let request = &request;
        retry_transient(&self.retry, move || transport.send_to_device(request)).await?;

        info!(session_id = encrypted.session_id.as_str(), "Replaced a wedged Olm session");

        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{sync::Arc, time::Duration};

    use ruma::{DeviceId, UserId};

    use super::SessionManager;
    use crate::{
        identities::DeviceData,
        olm::Account,
        requests::KeysUploadRequest,
        store::{testing::FlakyStore, Changes, DeviceChanges, MemoryStore, Store},
        testing::MockHomeserver,
        transport::{RetrySettings, Transport},
    };

    pub fn retry_settings() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    /// A device with its keys published on the homeserver.
    pub struct Peer {
        pub store: Store,
        pub memory: Arc<MemoryStore>,
        /// The store behind `store`, its writes can be made to fail.
        pub flaky: Arc<FlakyStore>,
        pub transport: Arc<dyn Transport>,
        pub manager: SessionManager,
        pub device: DeviceData,
    }

    pub async fn peer(server: &MockHomeserver, user_id: &UserId, device_id: &DeviceId) -> Peer {
        let account = Account::with_device_id(user_id, device_id);
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let store = Store::new(account, None, flaky.clone());
        let transport: Arc<dyn Transport> = server.transport_for(user_id, device_id);

        let (device_keys, one_time_keys) = store.account().await.keys_for_upload().unwrap();
        let device_keys = device_keys.unwrap();

        transport
            .upload_keys(&KeysUploadRequest {
                device_keys: Some(device_keys.clone()),
                one_time_keys,
            })
            .await
            .unwrap();

        let mut transaction = store.transaction();
        let account = transaction.account().await;
        account.mark_keys_as_published();
        account.mark_as_shared();
        transaction.commit().await.unwrap();

        let manager = SessionManager::new(store.clone(), transport.clone(), retry_settings());
        let device = DeviceData::try_from(&device_keys).unwrap();

        Peer { store, memory, flaky, transport, manager, device }
    }

    /// Let `peer` know about the devices of `others`.
    pub async fn introduce(peer: &Peer, others: &[&Peer]) {
        let changes = Changes {
            devices: DeviceChanges {
                new: others.iter().map(|o| o.device.clone()).collect(),
                ..Default::default()
            },
            ..Default::default()
        };

        peer.store.save_changes(changes).await.unwrap();
    }
}
