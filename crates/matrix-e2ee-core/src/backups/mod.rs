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

//! Server-side backup support for room keys
//!
//! This module implements server-side backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
//!
//! The [`BackupMachine`] runs as a single sequential process: checking the
//! homeserver's backup, creating a new one and uploading room keys never
//! overlap. Its [`BackupState`] can be observed through
//! [`BackupMachine::subscribe`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use eyeball::{SharedObservable, Subscriber};
use rand::{thread_rng, Rng};
use ruma::{DeviceId, DeviceKeyAlgorithm, OwnedDeviceId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::{ErrorKind, SignatureError},
    identities::TrustEngine,
    olm::{InboundGroupSession, VerifyJson},
    requests::KeysBackupRequest,
    session_manager::GroupSessionManager,
    store::{BackupKeys, Changes, CryptoStoreError, Result as StoreResult, RoomKeyCounts, Store},
    transport::{retry_transient, RetrySettings, Transport, TransportError},
    types::{
        KeyBackupData, MegolmV1AuthData, RoomKeyBackupInfo, RoomKeyBackupPayload,
        RoomKeyBackupVersion,
    },
};

mod keys;
mod state;

pub use keys::{
    BackupDecryptionError, BackupDecryptionKey, DecodeError, MegolmV1BackupKey, PassphraseInfo,
};
pub use state::{BackupEvent, BackupState, CheckOutcome};

/// How room keys are backed up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// The upper bound of the random delay between learning a new room key
    /// and uploading it.
    pub max_delay: Duration,
    /// How many room keys go into a single upload.
    pub batch_size: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self { max_delay: Duration::from_secs(10), batch_size: 100 }
    }
}

/// Errors of the backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The homeserver couldn't be reached or rejected a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The auth data of a new backup couldn't be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// A backed up room key couldn't be decrypted.
    #[error(transparent)]
    Decryption(#[from] BackupDecryptionError),

    /// A room key couldn't be serialized for the backup.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// There is no usable backup to upload room keys to.
    #[error("no backup is enabled")]
    NotEnabled,
}

impl BackupError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Store(e) => e.kind(),
            BackupError::Transport(e) => e.kind(),
            BackupError::Signature(e) => e.kind(),
            BackupError::Decryption(e) => e.kind(),
            BackupError::Json(_) => ErrorKind::Protocol,
            BackupError::NotEnabled => ErrorKind::Configuration,
        }
    }
}

/// The result of a signature verification of a signed JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureVerification {
    /// The result of the signature verification using the public key of our own
    /// device.
    pub device_signature: SignatureState,
    /// The result of the signature verification using the public key of our own
    /// user identity.
    pub user_identity_signature: SignatureState,
    /// The result of the signature verification using public keys of other
    /// devices we own.
    pub other_signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

impl SignatureVerification {
    /// Is the result considered to be trusted?
    ///
    /// This tells us if the result has a valid signature from any of the
    /// following:
    ///
    /// * Our own device
    /// * Our own user identity, provided the identity is trusted as well
    /// * Any of our own devices, provided the device is trusted as well
    pub fn trusted(&self) -> bool {
        self.device_signature.trusted()
            || self.user_identity_signature.trusted()
            || self.other_signatures.values().any(|s| s.trusted())
    }
}

/// The result of a signature check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device or user identity that created the
    /// signature is not trusted.
    ValidButNotTrusted,
    /// The signature is valid and the device or user identity that created the
    /// signature is trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did we find a valid signature?
    pub fn signed(self) -> bool {
        matches!(self, SignatureState::ValidButNotTrusted | SignatureState::ValidAndTrusted)
    }

    fn from_check(result: Result<(), SignatureError>, trusted: bool) -> Self {
        match result {
            Ok(()) if trusted => SignatureState::ValidAndTrusted,
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
            Err(_) => SignatureState::Invalid,
        }
    }
}

/// The outcome of restoring room keys from a backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreResult {
    /// How many room keys the backup contained.
    pub total: usize,
    /// How many of them were new to us or better than our copy.
    pub imported: usize,
    /// How many couldn't be decrypted.
    pub failed: usize,
}

/// A state machine that handles backing up room keys.
///
/// The state machine can be activated using [`BackupMachine::create_backup`]
/// or [`BackupMachine::check_backup`]. Once it is ready, new room keys get
/// uploaded after a random delay, [`BackupMachine::back_up`] uploads them at
/// once.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    store: Store,
    trust: TrustEngine,
    groups: GroupSessionManager,
    transport: Arc<dyn Transport>,
    retry: RetrySettings,
    settings: BackupSettings,
    state: SharedObservable<BackupState>,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
    process_lock: Arc<Mutex<()>>,
    scheduled: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BackupMachine {
    pub(crate) fn new(
        store: Store,
        groups: GroupSessionManager,
        transport: Arc<dyn Transport>,
        retry: RetrySettings,
        settings: BackupSettings,
    ) -> Self {
        Self {
            trust: TrustEngine::new(store.clone()),
            store,
            groups,
            transport,
            retry,
            settings,
            state: SharedObservable::new(BackupState::Unknown),
            backup_key: Default::default(),
            process_lock: Default::default(),
            scheduled: Default::default(),
        }
    }

    /// The current state of the backup.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Subscribe to changes of the backup state.
    pub fn subscribe(&self) -> Subscriber<BackupState> {
        self.state.subscribe()
    }

    /// Are we able to back up room keys to the server?
    pub async fn enabled(&self) -> bool {
        self.state().is_enabled()
            && self.backup_key.read().await.as_ref().is_some_and(|k| k.backup_version().is_some())
    }

    /// The public key room keys are currently backed up with.
    pub async fn backup_key(&self) -> Option<MegolmV1BackupKey> {
        self.backup_key.read().await.clone()
    }

    fn apply(&self, event: BackupEvent) -> Option<BackupState> {
        let mut next = None;

        self.state.update_if(|state| {
            next = state.transition(event);

            match next {
                Some(new_state) => {
                    *state = new_state;
                    true
                }
                None => false,
            }
        });

        match next {
            Some(state) => info!(?event, ?state, "The backup state changed"),
            None => debug!(?event, state = ?self.state(), "Ignoring a backup event"),
        }

        next
    }

    fn on_error(&self, error: &BackupError) {
        let event = match error {
            BackupError::Transport(TransportError::WrongBackupVersion { .. }) => {
                BackupEvent::VersionChanged
            }
            _ => BackupEvent::Failed,
        };

        self.apply(event);
    }

    /// Check if our own device has signed the given auth data.
    fn check_own_device_signature(&self, auth_data: &MegolmV1AuthData) -> SignatureState {
        let device_keys = self.store.static_account().unsigned_device_keys();
        SignatureState::from_check(device_keys.has_signed(auth_data), true)
    }

    /// Check if our own cross-signing user identity has signed the given auth
    /// data.
    async fn check_own_identity_signature(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> StoreResult<SignatureState> {
        let user_id = self.store.user_id();

        let Some(identity) = self.store.get_user_identity(user_id).await? else {
            return Ok(SignatureState::Missing);
        };

        let master_key = identity.master_key();
        let (Some(key_id), Some(key)) = (master_key.key_id(), master_key.get_first_key()) else {
            return Ok(SignatureState::Missing);
        };

        let result = key.verify_json(user_id, &key_id, auth_data);
        let trusted = result.is_ok() && self.trust.user_trust(user_id).await?.is_success();

        Ok(SignatureState::from_check(result, trusted))
    }

    /// Check if the auth data has been signed by any of our other devices.
    async fn test_device_signatures(
        &self,
        auth_data: &MegolmV1AuthData,
        compute_all_signatures: bool,
    ) -> StoreResult<BTreeMap<OwnedDeviceId, SignatureState>> {
        let mut result = BTreeMap::new();

        let Some(user_signatures) = auth_data.signatures.get(self.store.user_id()) else {
            return Ok(result);
        };

        for device_key_id in user_signatures.keys() {
            if device_key_id.algorithm() != DeviceKeyAlgorithm::Ed25519
                || device_key_id.key_name() == self.store.device_id()
            {
                continue;
            }

            let device_id = device_key_id.key_name();
            let state = self.test_ed25519_device_signature(device_id, auth_data).await?;
            result.insert(device_id.to_owned(), state);

            if state.trusted() && !compute_all_signatures {
                break;
            }
        }

        Ok(result)
    }

    async fn test_ed25519_device_signature(
        &self,
        device_id: &DeviceId,
        auth_data: &MegolmV1AuthData,
    ) -> StoreResult<SignatureState> {
        // The master key signature shows up here as well, there's no device
        // for it so it counts as missing.
        let Some(device) = self.store.get_device(self.store.user_id(), device_id).await? else {
            trace!(?device_id, "Device not found, can't check signature");
            return Ok(SignatureState::Missing);
        };

        let result = device.has_signed(auth_data);
        let trusted = result.is_ok() && self.trust.is_device_verified(&device).await?;

        Ok(SignatureState::from_check(result, trusted))
    }

    /// Verify some backup info that we downloaded from the server.
    ///
    /// # Arguments
    ///
    /// * `backup_info`: The backup info that should be verified.
    ///
    /// * `compute_all_signatures`: *Useful for debugging only*. If this
    ///   parameter is `true`, the trust state of every signature is computed
    ///   instead of stopping at the first trusted one. Has no impact on
    ///   whether the backup will be considered trusted.
    pub async fn verify_backup(
        &self,
        backup_info: &RoomKeyBackupInfo,
        compute_all_signatures: bool,
    ) -> StoreResult<SignatureVerification> {
        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = backup_info else {
            return Ok(Default::default());
        };

        trace!(?auth_data, "Verifying backup auth data");

        let device_signature = self.check_own_device_signature(auth_data);
        let user_identity_signature = self.check_own_identity_signature(auth_data).await?;

        let other_signatures = if !(device_signature.trusted() || user_identity_signature.trusted())
            || compute_all_signatures
        {
            self.test_device_signatures(auth_data, compute_all_signatures).await?
        } else {
            Default::default()
        };

        Ok(SignatureVerification { device_signature, user_identity_signature, other_signatures })
    }

    /// Ask the homeserver for its current backup and decide whether we can
    /// back up to it.
    ///
    /// A backup that replaced the one we used before leaves us in
    /// [`BackupState::WrongBackUpVersion`], [`BackupMachine::disable_backup`]
    /// followed by another check adopts the new one.
    #[instrument(skip(self))]
    pub async fn check_backup(&self) -> Result<BackupState, BackupError> {
        let guard = self.process_lock.lock().await;

        if self.apply(BackupEvent::CheckStarted).is_none() {
            return Ok(self.state());
        }

        match self.check_backup_helper().await {
            Ok(outcome) => {
                self.apply(BackupEvent::CheckFinished(outcome));
            }
            Err(e) => {
                warn!("Checking the backup on the homeserver failed: {e}");
                self.on_error(&e);
                return Err(e);
            }
        }

        drop(guard);
        self.schedule_if_needed().await?;

        Ok(self.state())
    }

    async fn check_backup_helper(&self) -> Result<CheckOutcome, BackupError> {
        let transport = &self.transport;
        let version = retry_transient(&self.retry, move || transport.get_backup_version()).await?;

        let Some(version) = version else {
            debug!("The homeserver has no backup");
            self.forget_backup().await?;
            return Ok(CheckOutcome::NoBackup);
        };

        self.evaluate_version(version).await
    }

    async fn evaluate_version(
        &self,
        version: RoomKeyBackupVersion,
    ) -> Result<CheckOutcome, BackupError> {
        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = &version.info else {
            warn!(version = version.version.as_str(), "The backup uses an unsupported algorithm");
            self.backup_key.write().await.take();
            return Ok(CheckOutcome::NotTrusted);
        };

        let stored = self.store.load_backup_keys().await?;

        if let Some(local_version) = stored.backup_version.as_deref() {
            if local_version != version.version {
                warn!(
                    local_version,
                    server_version = version.version.as_str(),
                    "The backup on the homeserver was replaced"
                );
                self.backup_key.write().await.take();
                return Ok(CheckOutcome::WrongVersion);
            }
        }

        let verification = self.verify_backup(&version.info, false).await?;

        if !verification.trusted() {
            info!(version = version.version.as_str(), ?verification, "The backup isn't trusted");
            self.backup_key.write().await.take();
            return Ok(CheckOutcome::NotTrusted);
        }

        if stored.backup_version.is_none() {
            let changes =
                Changes { backup_version: Some(version.version.clone()), ..Default::default() };
            self.store.save_changes(changes).await?;
        }

        *self.backup_key.write().await =
            Some(MegolmV1BackupKey::from_auth_data(auth_data, version.version));

        Ok(CheckOutcome::Usable)
    }

    async fn forget_backup(&self) -> StoreResult<()> {
        self.backup_key.write().await.take();
        self.store.reset_backup_state().await?;
        self.store.delete_backup_keys().await
    }

    /// Create a new backup version on the homeserver and start backing up to
    /// it.
    ///
    /// The auth data gets signed by our device and, if we have one, by our
    /// cross-signing master key. Returns the new version.
    #[instrument(skip_all)]
    pub async fn create_backup(
        &self,
        decryption_key: &BackupDecryptionKey,
        passphrase_info: Option<PassphraseInfo>,
    ) -> Result<String, BackupError> {
        let guard = self.process_lock.lock().await;

        if self.apply(BackupEvent::EnableStarted).is_none() {
            return Err(BackupError::NotEnabled);
        }

        let version = match self.create_backup_helper(decryption_key, passphrase_info).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Creating a new backup failed: {e}");
                self.on_error(&e);
                return Err(e);
            }
        };

        self.apply(BackupEvent::Enabled);

        drop(guard);
        self.schedule_if_needed().await?;

        Ok(version)
    }

    async fn create_backup_helper(
        &self,
        decryption_key: &BackupDecryptionKey,
        passphrase_info: Option<PassphraseInfo>,
    ) -> Result<String, BackupError> {
        let key = decryption_key.megolm_v1_public_key().with_passphrase_info(passphrase_info);
        let mut auth_data = key.auth_data();

        {
            let account = self.store.account().await;
            let signature = account.sign_json(&auth_data)?;
            auth_data.signatures.add_signature(
                self.store.user_id().to_owned(),
                account.static_data().signing_key_id(),
                signature,
            );
        }

        if let Some(identity) = self.store.private_identity().await.as_ref() {
            let signatures = identity.sign_with_master_key(&auth_data)?;
            auth_data.signatures.extend(signatures);
        }

        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data.clone());
        let transport = &self.transport;
        let info_ref = &info;
        let version =
            retry_transient(&self.retry, move || transport.create_backup_version(info_ref)).await?;

        self.store.reset_backup_state().await?;

        let changes = Changes {
            backup_version: Some(version.clone()),
            backup_decryption_key: Some(decryption_key.clone()),
            ..Default::default()
        };
        self.store.save_changes(changes).await?;

        *self.backup_key.write().await =
            Some(MegolmV1BackupKey::from_auth_data(&auth_data, version.clone()));

        info!(version = version.as_str(), "Created a new backup");

        Ok(version)
    }

    /// Disable and reset our backup state.
    ///
    /// This will cancel any pending upload, forget the backup key and version
    /// and reset the backup state of each room key we have.
    #[instrument(skip(self))]
    pub async fn disable_backup(&self) -> StoreResult<()> {
        let _guard = self.process_lock.lock().await;

        if let Some(task) = self.scheduled.lock().await.take() {
            task.abort();
        }

        self.forget_backup().await?;
        self.apply(BackupEvent::DisableRequested);

        debug!("Done disabling backup");

        Ok(())
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> StoreResult<RoomKeyCounts> {
        let backup_key = self.backup_key.read().await.clone();
        let version = backup_key.as_ref().and_then(|k| k.backup_version());

        self.store.inbound_group_session_counts(version).await
    }

    /// Store the decryption key of a backup, e.g. after it was entered by the
    /// user.
    pub async fn save_decryption_key(
        &self,
        decryption_key: BackupDecryptionKey,
        version: String,
    ) -> StoreResult<()> {
        let changes = Changes {
            backup_decryption_key: Some(decryption_key),
            backup_version: Some(version),
            ..Default::default()
        };
        self.store.save_changes(changes).await
    }

    /// Get the backup keys we have saved in our crypto store.
    pub async fn get_backup_keys(&self) -> StoreResult<BackupKeys> {
        self.store.load_backup_keys().await
    }

    /// Note that new room keys arrived, they will be uploaded after a random
    /// delay of at most [`BackupSettings::max_delay`].
    pub(crate) async fn schedule_backup(&self) {
        if self.apply(BackupEvent::KeysPending).is_none() {
            return;
        }

        let max_delay = u64::try_from(self.settings.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(thread_rng().gen_range(0..=max_delay));
        trace!(?delay, "Scheduling a backup");

        let mut scheduled = self.scheduled.lock().await;

        let machine = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Once running, the upload can't be cancelled by the next schedule.
            machine.scheduled.lock().await.take();

            if let Err(e) = machine.back_up().await {
                warn!("Backing up room keys failed: {e}");
            }
        });

        if let Some(previous) = scheduled.replace(task) {
            previous.abort();
        }
    }

    fn schedule_if_needed(&self) -> impl std::future::Future<Output = StoreResult<()>> + Send + '_ {
        async move {
            if self.state() == BackupState::ReadyToBackUp {
                let counts = self.room_key_counts().await?;

                if counts.total > counts.backed_up {
                    self.schedule_backup().await;
                }
            }

            Ok(())
        }
    }

    /// Upload every room key that isn't part of the backup yet, in batches.
    ///
    /// Returns the number of uploaded room keys.
    #[instrument(skip(self))]
    pub async fn back_up(&self) -> Result<usize, BackupError> {
        let _guard = self.process_lock.lock().await;

        if self.state() == BackupState::ReadyToBackUp {
            self.apply(BackupEvent::KeysPending);
        }

        if self.apply(BackupEvent::DelayElapsed).is_none() {
            debug!(state = ?self.state(), "Not backing up room keys");
            return Ok(0);
        }

        let result = self.upload_pending_keys().await;

        match &result {
            // Keys that arrived after the last batch was picked.
            Ok(_) => self.schedule_if_needed().await?,
            Err(e) => {
                warn!("Uploading room keys failed: {e}");
                self.on_error(e);
            }
        }

        result
    }

    async fn upload_pending_keys(&self) -> Result<usize, BackupError> {
        let key = self.backup_key.read().await.clone().ok_or(BackupError::NotEnabled)?;
        let version = key.backup_version().ok_or(BackupError::NotEnabled)?.to_owned();

        let mut uploaded = 0;

        loop {
            let sessions = self
                .store
                .inbound_group_sessions_for_backup(&version, self.settings.batch_size)
                .await?;

            if sessions.is_empty() {
                self.apply(BackupEvent::UploadFinished { remaining: false });
                break;
            }

            let request = Self::encrypt_sessions(&key, &version, &sessions).await?;

            let transport = &self.transport;
            let request_ref = &request;
            retry_transient(&self.retry, move || transport.upload_backup_keys(request_ref))
                .await?;

            let ids: Vec<_> = sessions.iter().map(|s| (s.room_id(), s.session_id())).collect();
            self.store.mark_inbound_group_sessions_as_backed_up(&version, &ids).await?;

            for session in &sessions {
                session.mark_as_backed_up();
            }

            uploaded += sessions.len();
            info!(
                key_count = sessions.len(),
                version = version.as_str(),
                "Backed up a batch of room keys"
            );

            self.apply(BackupEvent::UploadFinished { remaining: true });
        }

        Ok(uploaded)
    }

    async fn encrypt_sessions(
        key: &MegolmV1BackupKey,
        version: &str,
        sessions: &[InboundGroupSession],
    ) -> Result<KeysBackupRequest, BackupError> {
        let mut rooms = RoomKeyBackupPayload::new();

        for session in sessions {
            let data = key.encrypt(session).await?;

            rooms
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), data);
        }

        Ok(KeysBackupRequest { version: version.to_owned(), rooms })
    }

    /// Download the room keys of a backup version and import them.
    ///
    /// Keys that fail to decrypt are skipped and counted. Restored keys only
    /// replace our own copy if they can decrypt more.
    #[instrument(skip(self, decryption_key))]
    pub async fn restore(
        &self,
        decryption_key: &BackupDecryptionKey,
        version: &str,
    ) -> Result<RestoreResult, BackupError> {
        let active_key = self.backup_key.read().await.clone();
        let is_active = active_key.as_ref().and_then(|k| k.backup_version()) == Some(version);

        if let Some(active_key) = active_key.as_ref().filter(|_| is_active) {
            decryption_key.check_auth_data(&active_key.auth_data())?;
        }

        let transport = &self.transport;
        let keys =
            retry_transient(&self.retry, move || transport.download_backup_keys(version)).await?;

        let mut result = RestoreResult::default();
        let mut restored: Vec<(OwnedRoomId, String)> = Vec::new();

        for (room_id, sessions) in keys {
            for (session_id, data) in sessions {
                result.total += 1;

                let Some(session) =
                    Self::decrypt_backed_up_key(decryption_key, &room_id, &session_id, &data)
                else {
                    result.failed += 1;
                    continue;
                };

                if self.groups.import_session(session).await?.is_new() {
                    result.imported += 1;
                    restored.push((room_id.clone(), session_id));
                }
            }
        }

        // Keys that came from the active backup don't need to go back up.
        if is_active && !restored.is_empty() {
            let ids: Vec<(&RoomId, &str)> =
                restored.iter().map(|(r, s)| (&**r, s.as_str())).collect();
            self.store.mark_inbound_group_sessions_as_backed_up(version, &ids).await?;
        }

        info!(?result, "Restored room keys from the backup");

        Ok(result)
    }

    fn decrypt_backed_up_key(
        decryption_key: &BackupDecryptionKey,
        room_id: &RoomId,
        session_id: &str,
        data: &KeyBackupData,
    ) -> Option<InboundGroupSession> {
        let room_key = match decryption_key.decrypt_session_data(&data.session_data) {
            Ok(room_key) => room_key,
            Err(e) => {
                warn!(?room_id, session_id, "Couldn't decrypt a backed up room key: {e}");
                return None;
            }
        };

        match InboundGroupSession::from_backup(room_id, session_id, room_key) {
            Ok(session) if session.session_id() == session_id => Some(session),
            Ok(session) => {
                warn!(
                    ?room_id,
                    session_id,
                    actual_session_id = session.session_id(),
                    "A backed up room key was stored under the wrong session ID"
                );
                None
            }
            Err(e) => {
                warn!(?room_id, session_id, "Couldn't restore a backed up room key: {e}");
                None
            }
        }
    }

    /// Stop any pending upload.
    pub(crate) async fn close(&self) {
        if let Some(task) = self.scheduled.lock().await.take() {
            task.abort();
        }
    }
}
