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

//! The [`OlmMachine`], the context object tying every component of the E2EE
//! core to a single logged in device.

use std::sync::Arc;

use as_variant::as_variant;
use eyeball::Subscriber;
use futures_util::Stream;
use ruma::{DeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, field::display, info, instrument, warn, Span};

use crate::{
    backups::{BackupMachine, BackupSettings, BackupState},
    error::{CrossSigningError, MegolmError, MegolmResult, OlmError, OlmResult},
    gossiping::{GossipMachine, KeyShareDecision},
    identities::{
        DeviceData, DeviceTrust, IdentityManager, LocalTrust, TrustEngine, UserIdentityData,
        UserTrustResult,
    },
    olm::{Account, EncryptionSettings, IdentityKeys, PrivateCrossSigningIdentity},
    requests::{
        KeysUploadRequest, SignatureUploadRequest, UploadSigningKeysRequest, SIGNED_CURVE25519,
    },
    session_manager::{
        DecryptedRoomEvent, GroupSessionManager, ImportOutcome, OutboundSessionState,
        SessionManager, ShareResult,
    },
    store::{
        Changes, CryptoStoreError, DeviceChanges, IdentityChanges, IntoCryptoStore,
        Result as StoreResult, RoomKeyInfo, Store,
    },
    transport::{retry_transient, RetrySettings, Transport},
    types::events::{
        olm_v1::{OlmPayloadContent, OlmV1Curve25519AesSha2Content},
        room_encrypted::{EncryptedRoomEvent, MegolmV1AesSha2Content},
        room_key_request::RequestedKeyInfo,
        room_key_withheld::WithheldCode,
        ToDeviceEvent,
    },
};

#[cfg(test)]
mod tests;

/// The configuration of an [`OlmMachine`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// The settings of the outbound group sessions we create, the sharing
    /// policy also applies to key requests.
    pub encryption_settings: EncryptionSettings,
    /// How room keys are backed up.
    pub backup: BackupSettings,
    /// How transient transport failures are retried.
    pub retry: RetrySettings,
}

/// The E2EE relevant parts of a sync response.
#[derive(Clone, Debug, Default)]
pub struct SyncChanges {
    /// The to-device events of the sync.
    pub to_device_events: Vec<ToDeviceEvent>,
    /// Users whose device list changed.
    pub changed_devices: Vec<OwnedUserId>,
    /// How many signed one-time keys the server still holds for us.
    pub one_time_keys_count: Option<u64>,
}

/// What became of a single to-device event.
#[derive(Debug)]
pub enum ProcessedToDeviceEvent {
    /// A room key its creator sent us.
    RoomKey {
        /// The room the key belongs to.
        room_id: OwnedRoomId,
        /// The ID of the session.
        session_id: String,
        /// How the key was merged into the store.
        outcome: ImportOutcome,
    },
    /// A room key another device forwarded to us.
    ForwardedRoomKey {
        /// The room the key belongs to.
        room_id: OwnedRoomId,
        /// The ID of the session.
        session_id: String,
        /// How the key was merged into the store, `None` if it was dropped.
        outcome: Option<ImportOutcome>,
    },
    /// An Olm session was replaced by its other side.
    Dummy {
        /// The sender of the event.
        sender: OwnedUserId,
    },
    /// A request for one of our room keys.
    KeyRequest(Option<KeyShareDecision>),
    /// A notice that we won't get a room key.
    Withheld {
        /// The room the key belongs to.
        room_id: OwnedRoomId,
        /// The ID of the session.
        session_id: String,
        /// Why we won't get the key.
        code: WithheldCode,
    },
    /// The event couldn't be handled, other events aren't affected.
    Failed {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The type of the event.
        event_type: &'static str,
        /// Why the event couldn't be handled.
        error: OlmError,
    },
}

impl ProcessedToDeviceEvent {
    fn has_new_room_key(&self) -> bool {
        match self {
            ProcessedToDeviceEvent::RoomKey { outcome, .. } => outcome.is_new(),
            ProcessedToDeviceEvent::ForwardedRoomKey { outcome, .. } => {
                outcome.is_some_and(|o| o.is_new())
            }
            _ => false,
        }
    }
}

/// State machine implementation of the Olm/Megolm encryption protocol used for
/// Matrix end to end encryption.
///
/// One machine exists per logged in device, it is created at login and torn
/// down with [`OlmMachine::close()`] at logout.
#[derive(Clone)]
pub struct OlmMachine {
    inner: Arc<OlmMachineInner>,
}

struct OlmMachineInner {
    /// Store for the encryption keys, shared by every component.
    store: Store,
    transport: Arc<dyn Transport>,
    config: MachineConfig,
    /// Keeps the device lists and the cross-signing identities up to date.
    identity_manager: IdentityManager,
    trust: TrustEngine,
    /// Establishes and uses Olm sessions.
    session_manager: SessionManager,
    /// Creates, shares and uses the Megolm sessions of rooms.
    group_session_manager: GroupSessionManager,
    /// Handles outgoing and incoming key requests.
    key_request_machine: GossipMachine,
    /// Uploads our room keys to the server-side backup.
    backup_machine: BackupMachine,
    /// Only one key upload may be in flight.
    key_upload_lock: Mutex<()>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a new machine for the given device.
    ///
    /// If the store already contains an account for the given user/device
    /// pair it is reused, otherwise a new one is created and persisted
    /// together with our own device, which is marked as verified.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `store` - A [`CryptoStore`] implementation that will be used to store
    ///   the encryption keys.
    ///
    /// * `transport` - Talks to the homeserver on behalf of the device.
    ///
    /// * `config` - The settings of the machine.
    ///
    /// [`CryptoStore`]: crate::store::CryptoStore
    #[instrument(skip(store, transport, config), fields(ed25519_key, curve25519_key))]
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        store: impl IntoCryptoStore,
        transport: Arc<dyn Transport>,
        config: MachineConfig,
    ) -> OlmResult<Self> {
        let store = store.into_crypto_store();

        let account = match store.load_account().await? {
            Some(account) => {
                if user_id != account.user_id() || device_id != account.device_id() {
                    return Err(CryptoStoreError::MismatchedAccount {
                        expected: (account.user_id().to_owned(), account.device_id().to_owned()),
                        got: (user_id.to_owned(), device_id.to_owned()),
                    }
                    .into());
                }

                debug!("Restored an Olm account");
                account
            }
            None => {
                let account = Account::with_device_id(user_id, device_id);
                let device = DeviceData::new(account.device_keys()?, LocalTrust::Verified);

                let changes = Changes {
                    account: Some(account.pickle()),
                    devices: DeviceChanges { new: vec![device], ..Default::default() },
                    ..Default::default()
                };
                store.save_changes(changes).await?;

                debug!("Created a new Olm account");
                account
            }
        };

        Span::current()
            .record("ed25519_key", display(account.identity_keys().ed25519))
            .record("curve25519_key", display(account.identity_keys().curve25519));

        let identity = store.load_identity().await?;
        if identity.is_some() {
            debug!("Restored the private cross-signing identity");
        }

        let store = Store::new(account, identity, store);
        let retry = config.retry.clone();

        let identity_manager = IdentityManager::new(store.clone());
        identity_manager.update_tracked_users([user_id]).await?;

        let session_manager = SessionManager::new(store.clone(), transport.clone(), retry.clone());
        let group_session_manager = GroupSessionManager::new(
            store.clone(),
            session_manager.clone(),
            transport.clone(),
            retry.clone(),
        );
        let key_request_machine = GossipMachine::new(
            store.clone(),
            session_manager.clone(),
            group_session_manager.clone(),
            transport.clone(),
            retry.clone(),
            config.encryption_settings.sharing_strategy.clone(),
        );
        let backup_machine = BackupMachine::new(
            store.clone(),
            group_session_manager.clone(),
            transport.clone(),
            retry,
            config.backup.clone(),
        );

        let inner = Arc::new(OlmMachineInner {
            trust: TrustEngine::new(store.clone()),
            store,
            transport,
            config,
            identity_manager,
            session_manager,
            group_session_manager,
            key_request_machine,
            backup_machine,
            key_upload_lock: Mutex::new(()),
        });

        Ok(Self { inner })
    }

    /// Tear the machine down, e.g. on logout.
    ///
    /// Pending background work, like a scheduled backup upload, is
    /// cancelled. Everything that was acknowledged is already persisted.
    pub async fn close(&self) {
        self.inner.backup_machine.close().await;
        info!("Closed the Olm machine");
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        self.inner.store.user_id()
    }

    /// The unique device ID that identifies this `OlmMachine`.
    pub fn device_id(&self) -> &DeviceId {
        self.inner.store.device_id()
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.inner.store.static_account().identity_keys
    }

    /// The settings the machine was created with.
    pub fn config(&self) -> &MachineConfig {
        &self.inner.config
    }

    fn retry(&self) -> &RetrySettings {
        &self.inner.config.retry
    }

    /// Upload our device keys, if the server doesn't know them yet, and
    /// fresh one-time keys once the server runs low on them.
    ///
    /// New one-time keys are persisted before they are uploaded. The account
    /// isn't locked while the request is in flight, other operations keep
    /// using it. Returns `true` if anything was uploaded.
    #[instrument(skip(self))]
    pub async fn publish_keys(&self) -> OlmResult<bool> {
        let _upload_guard = self.inner.key_upload_lock.lock().await;
        self.publish_keys_locked().await
    }

    /// Needs to be called with the key upload lock held.
    async fn publish_keys_locked(&self) -> OlmResult<bool> {
        let request = {
            let mut transaction = self.inner.store.transaction();
            let account = transaction.account().await;

            account.generate_one_time_keys_if_needed();
            let (device_keys, one_time_keys) = account.keys_for_upload()?;

            if device_keys.is_none() && one_time_keys.is_empty() {
                return Ok(false);
            }

            transaction.commit().await?;

            KeysUploadRequest { device_keys, one_time_keys }
        };

        debug!(
            device_keys = request.device_keys.is_some(),
            one_time_keys = request.one_time_keys.len(),
            "Publishing our keys"
        );

        let transport = &self.inner.transport;
        let request = &request;
        let response =
            retry_transient(self.retry(), move || transport.upload_keys(request)).await?;

        // Keys are only generated under the upload lock, everything that is
        // unpublished now was part of the request.
        let mut transaction = self.inner.store.transaction();
        let account = transaction.account().await;

        account.mark_keys_as_published();
        account.mark_as_shared();
        if let Some(count) = response.one_time_key_counts.get(SIGNED_CURVE25519) {
            account.update_uploaded_key_count(*count);
        }

        transaction.commit().await?;

        Ok(true)
    }

    /// Refresh the device lists and cross-signing identities of every tracked
    /// user whose device list is outdated.
    ///
    /// Returns the devices and identities that were added or changed.
    #[instrument(skip(self))]
    pub async fn query_keys(&self) -> OlmResult<(DeviceChanges, IdentityChanges)> {
        let Some(request) = self.inner.identity_manager.users_for_key_query().await? else {
            return Ok(Default::default());
        };

        let transport = &self.inner.transport;
        let request = &request;
        let response = retry_transient(self.retry(), move || transport.query_keys(request)).await?;

        self.inner.identity_manager.receive_keys_query_response(&response).await
    }

    /// Start tracking the device lists of the given users.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        self.inner.identity_manager.update_tracked_users(users).await
    }

    /// Handle the E2EE relevant parts of a sync response.
    ///
    /// Every to-device event is handled on its own, one that fails doesn't
    /// affect the others. New room keys get scheduled for the backup and
    /// pending key requests are sent out.
    #[instrument(skip_all, fields(event_count = changes.to_device_events.len()))]
    pub async fn receive_sync_changes(
        &self,
        changes: SyncChanges,
    ) -> OlmResult<Vec<ProcessedToDeviceEvent>> {
        self.inner
            .identity_manager
            .mark_users_as_changed(changes.changed_devices.iter().map(|u| &**u))
            .await?;

        if let Some(count) = changes.one_time_keys_count {
            let mut transaction = self.inner.store.transaction();
            transaction.account().await.update_uploaded_key_count(count);
            transaction.commit().await?;
        }

        let mut processed = Vec::with_capacity(changes.to_device_events.len());

        for event in changes.to_device_events {
            processed.push(self.receive_to_device_event(event).await);
        }

        if processed.iter().any(ProcessedToDeviceEvent::has_new_room_key) {
            self.inner.backup_machine.schedule_backup().await;
        }

        if let Err(e) = self.inner.key_request_machine.send_outgoing_requests().await {
            warn!("Couldn't send out our key requests: {e}");
        }

        // Skipped while another upload is in flight, the next sync catches up.
        let published = match self.inner.key_upload_lock.try_lock() {
            Ok(_upload_guard) => self.publish_keys_locked().await,
            Err(_) => Ok(false),
        };

        match published {
            Ok(_) => {}
            Err(e @ OlmError::Store(_)) => return Err(e),
            Err(e) => warn!("Couldn't publish our keys: {e}"),
        }

        Ok(processed)
    }

    async fn receive_to_device_event(&self, event: ToDeviceEvent) -> ProcessedToDeviceEvent {
        let event_type = event.event_type();
        let sender = event.sender().to_owned();

        let result = match event {
            ToDeviceEvent::Encrypted { sender, content } => {
                self.receive_encrypted(&sender, &content).await
            }
            ToDeviceEvent::RoomKeyRequest { sender, content } => self
                .inner
                .key_request_machine
                .receive_key_request(&sender, &content)
                .await
                .map(ProcessedToDeviceEvent::KeyRequest),
            ToDeviceEvent::RoomKeyWithheld { sender, content } => self
                .inner
                .key_request_machine
                .receive_withheld(&sender, &content)
                .await
                .map(|()| ProcessedToDeviceEvent::Withheld {
                    room_id: content.room_id,
                    session_id: content.session_id,
                    code: content.code,
                })
                .map_err(OlmError::from),
        };

        result.unwrap_or_else(|error| {
            warn!(sender = %sender, event_type, "Failed to handle a to-device event: {error}");
            ProcessedToDeviceEvent::Failed { sender, event_type, error }
        })
    }

    async fn receive_encrypted(
        &self,
        sender: &UserId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        let decrypted = match self.inner.session_manager.decrypt(sender, content).await {
            Ok(decrypted) => decrypted,
            Err(e) => {
                if let OlmError::SessionWedged(sender, sender_key) = &e {
                    if let Err(e) = self.inner.session_manager.unwedge(sender, *sender_key).await {
                        warn!("Couldn't replace a wedged Olm session: {e}");
                    }
                }

                return Err(e);
            }
        };

        Ok(match decrypted.payload.content()? {
            OlmPayloadContent::RoomKey(content) => {
                let outcome =
                    self.inner.group_session_manager.receive_room_key(&decrypted, &content).await?;

                let info = RequestedKeyInfo::new(
                    content.room_id.clone(),
                    decrypted.sender_key,
                    content.session_id.clone(),
                );
                self.inner.key_request_machine.room_key_received(&info).await?;

                ProcessedToDeviceEvent::RoomKey {
                    room_id: content.room_id,
                    session_id: content.session_id,
                    outcome,
                }
            }
            OlmPayloadContent::ForwardedRoomKey(content) => {
                let outcome = self
                    .inner
                    .key_request_machine
                    .receive_forwarded_room_key(&decrypted, &content)
                    .await?;

                ProcessedToDeviceEvent::ForwardedRoomKey {
                    room_id: content.room_id,
                    session_id: content.session_id,
                    outcome,
                }
            }
            OlmPayloadContent::Dummy => {
                ProcessedToDeviceEvent::Dummy { sender: decrypted.sender }
            }
        })
    }

    /// Tell the machine who is in a room now.
    ///
    /// The members become tracked users, key requests of other users are
    /// answered for the rooms they are in, and the outbound session of the
    /// room is rotated right away if a device that received it isn't
    /// eligible anymore. Returns `true` if the session was rotated.
    #[instrument(skip(self, members))]
    pub async fn room_members_changed(
        &self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> OlmResult<bool> {
        self.update_tracked_users(members.iter().map(|u| &**u)).await?;
        self.query_keys().await?;

        self.inner.key_request_machine.set_room_members(room_id, members).await;

        Ok(self.inner.group_session_manager.room_members_changed(room_id, members).await?)
    }

    /// Share the room key of a room with the devices of its members.
    ///
    /// Outdated device lists are refreshed first. A new outbound session is
    /// created if the room has none or the current one has to be rotated.
    #[instrument(skip(self, members))]
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> OlmResult<ShareResult> {
        self.room_members_changed(room_id, members).await?;

        let previous = as_variant!(
            self.outbound_session_state(room_id).await?,
            OutboundSessionState::Active { session_id, .. }
                | OutboundSessionState::Rotating { session_id, .. } => session_id
        );

        let result = self
            .inner
            .group_session_manager
            .share_room_key(
                room_id,
                members.iter().map(|u| &**u),
                self.inner.config.encryption_settings.clone(),
            )
            .await?;

        // Our own copy of a new room key needs to be backed up as well.
        if previous.as_deref() != Some(result.session_id.as_str()) {
            self.inner.backup_machine.schedule_backup().await;
        }

        Ok(result)
    }

    /// Encrypt a room event with the outbound session of the room.
    ///
    /// The room key needs to be shared with [`OlmMachine::share_room_key()`]
    /// first.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<MegolmV1AesSha2Content> {
        self.inner.group_session_manager.encrypt(room_id, event_type, content).await
    }

    /// The state of the outbound session of a room.
    pub async fn outbound_session_state(
        &self,
        room_id: &RoomId,
    ) -> StoreResult<OutboundSessionState> {
        self.inner.group_session_manager.outbound_state(room_id).await
    }

    /// Decrypt a room event.
    ///
    /// If the room key is missing, or doesn't reach back far enough, it is
    /// requested from our other devices and the sender. Events whose key was
    /// withheld aren't requested again.
    #[instrument(skip_all, fields(room_id = ?event.room_id, sender = %event.sender))]
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let result = self.inner.group_session_manager.decrypt(event).await;

        if let Err(MegolmError::MissingRoomKey(None) | MegolmError::UnknownMessageIndex { .. }) =
            &result
        {
            if let Err(e) = self.inner.key_request_machine.request_key(event).await {
                warn!("Couldn't request the room key of an undecryptable event: {e}");
            }
        }

        result
    }

    /// Get a device of a user, if we know it.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<DeviceData>> {
        self.inner.store.get_device(user_id, device_id).await
    }

    /// Get all the devices of a user we know about.
    pub async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<Vec<DeviceData>> {
        Ok(self.inner.store.get_user_devices(user_id).await?.into_values().collect())
    }

    /// Get the published cross-signing identity of a user.
    pub async fn get_identity(&self, user_id: &UserId) -> StoreResult<Option<UserIdentityData>> {
        self.inner.store.get_user_identity(user_id).await
    }

    /// Compute how much we trust a user, through the cross-signing
    /// signatures leading from our own identity to theirs.
    pub async fn user_trust(&self, user_id: &UserId) -> StoreResult<UserTrustResult> {
        self.inner.trust.user_trust(user_id).await
    }

    /// Compute how much we trust a device, `None` if we don't know it.
    pub async fn device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<DeviceTrust>> {
        match self.get_device(user_id, device_id).await? {
            Some(device) => Ok(Some(self.inner.trust.device_trust(&device).await?)),
            None => Ok(None),
        }
    }

    /// Set the local trust state of a device, e.g. after an interactive
    /// verification or to block it.
    ///
    /// Returns the updated device, `None` if we don't know the device.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> StoreResult<Option<DeviceData>> {
        self.inner.identity_manager.set_local_trust(user_id, device_id, trust_state).await
    }

    /// Remove a device from the registry, e.g. because its owner logged it
    /// out.
    pub async fn remove_device(&self, user_id: &UserId, device_id: &DeviceId) -> StoreResult<bool> {
        self.inner.identity_manager.remove_device(user_id, device_id).await
    }

    /// Create and publish a new cross-signing identity for our user.
    ///
    /// Our device signs the master key and gets signed by the new
    /// self-signing key. The published keys are queried again afterwards, so
    /// our device list carries the new signature.
    #[instrument(skip(self))]
    pub async fn bootstrap_cross_signing(&self) -> Result<(), CrossSigningError> {
        let identity = {
            let account = self.inner.store.account().await;
            PrivateCrossSigningIdentity::with_account(&account)?
        };

        let mut device_keys = self.inner.store.static_account().unsigned_device_keys();
        device_keys.signatures = identity.sign_device(&device_keys)?;

        let signing_keys = UploadSigningKeysRequest {
            master_key: identity.master_public_key().as_cross_signing_key().clone(),
            self_signing_key: identity.self_signing_public_key().as_cross_signing_key().clone(),
            user_signing_key: identity.user_signing_public_key().as_cross_signing_key().clone(),
        };

        let mut signatures = SignatureUploadRequest::default();
        signatures
            .signed_keys
            .entry(self.user_id().to_owned())
            .or_default()
            .insert(self.device_id().to_string(), serde_json::to_value(&device_keys)?);

        let transport = &self.inner.transport;
        let signing_keys = &signing_keys;
        retry_transient(self.retry(), move || transport.upload_signing_keys(signing_keys)).await?;
        let signatures = &signatures;
        retry_transient(self.retry(), move || transport.upload_signatures(signatures)).await?;

        let changes = Changes {
            identities: IdentityChanges {
                new: vec![UserIdentityData::from_private(&identity)],
                ..Default::default()
            },
            private_identity: Some(identity),
            ..Default::default()
        };
        self.inner.store.save_changes(changes).await?;

        info!("Bootstrapped cross-signing");

        self.inner.identity_manager.mark_users_as_changed([self.user_id()]).await?;
        self.query_keys().await?;

        Ok(())
    }

    /// Sign the master key of another user with our user-signing key, after
    /// their identity was verified interactively.
    #[instrument(skip(self))]
    pub async fn verify_user(&self, user_id: &UserId) -> Result<(), CrossSigningError> {
        let mut identity = self
            .get_identity(user_id)
            .await?
            .ok_or_else(|| CrossSigningError::MissingIdentity(user_id.to_owned()))?;

        let new_signatures = {
            let private_identity = self.inner.store.private_identity().await;
            let private_identity = private_identity.as_ref().ok_or(CrossSigningError::NotSetUp)?;
            private_identity.sign_user(identity.master_key())?
        };

        let master_key = identity.master_key();
        let key_id = master_key
            .get_first_key()
            .ok_or_else(|| CrossSigningError::MissingIdentity(user_id.to_owned()))?
            .to_base64();

        let mut signed_master_key = master_key.as_cross_signing_key().clone();
        signed_master_key.signatures = new_signatures.clone();

        let mut request = SignatureUploadRequest::default();
        request
            .signed_keys
            .entry(user_id.to_owned())
            .or_default()
            .insert(key_id, serde_json::to_value(&signed_master_key)?);

        let transport = &self.inner.transport;
        let request = &request;
        retry_transient(self.retry(), move || transport.upload_signatures(request)).await?;

        identity.add_master_key_signatures(new_signatures);
        let changes = Changes {
            identities: IdentityChanges { changed: vec![identity], ..Default::default() },
            ..Default::default()
        };
        self.inner.store.save_changes(changes).await?;

        info!("Signed the identity of a user");

        Ok(())
    }

    /// The machine uploading our room keys to the server-side backup.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.inner.backup_machine
    }

    /// Observe the state of the room key backup.
    pub fn backup_state(&self) -> Subscriber<BackupState> {
        self.inner.backup_machine.subscribe()
    }

    /// Receive notifications of room keys being received as a [`Stream`].
    ///
    /// Each time a room key is updated in any way, an update will be sent to
    /// the stream. Updates that happen at the same time are batched into a
    /// [`Vec`].
    ///
    /// If the reader of the stream lags too far behind, a warning will be
    /// logged and items will be dropped.
    pub fn room_keys_received_stream(&self) -> impl Stream<Item = Vec<RoomKeyInfo>> {
        self.inner.store.room_keys_received_stream()
    }
}
