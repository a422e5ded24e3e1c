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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`]
//!
//! An in-memory only store is provided, persistent stores implement the
//! same trait.
//!
//! Every logical operation collects what it touched into a [`Changes`]
//! value that is committed as a whole. In-memory caches and the locks that
//! serialize work on a single session live in the crate-internal `Store`
//! wrapper, keyed by the session or room they protect.
//!
//! [`OlmMachine`]: crate::OlmMachine

use std::{collections::HashMap, error::Error as StdError, fmt, ops::Deref, sync::Arc};

use futures_util::{Stream, StreamExt};
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

mod locks;
mod memorystore;
#[cfg(test)]
pub(crate) mod testing;
mod traits;
mod types;

pub(crate) use locks::LockMap;
pub use memorystore::MemoryStore;
pub use traits::{CryptoStore, IntoCryptoStore};
pub use types::{
    BackupKeys, Changes, DeviceChanges, IdentityChanges, RoomKeyCounts, RoomKeyInfo,
    RoomKeyWithheldEntry, TrackedUser,
};

use crate::{
    error::ErrorKind,
    identities::DeviceData,
    olm::{Account, PrivateCrossSigningIdentity, Session, SigningError, StaticAccountData},
};

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// The store contains an account of a different user or device.
    #[error(
        "the account in the store doesn't match the account in the constructor: \
        expected {}:{}, got {}:{}", .expected.0, .expected.1, .got.0, .got.1
    )]
    MismatchedAccount {
        /// The expected user/device id pair.
        expected: (OwnedUserId, OwnedDeviceId),
        /// The user/device id pair that is loaded from the store.
        got: (OwnedUserId, OwnedDeviceId),
    },

    /// A stored value couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The stored private cross-signing identity couldn't be restored.
    #[error(transparent)]
    Identity(#[from] SigningError),

    /// A problem with the underlying database backend
    #[error(transparent)]
    Backend(Box<dyn StdError + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

struct StoreInner {
    static_account: StaticAccountData,
    account: Arc<Mutex<Account>>,
    identity: Arc<Mutex<Option<PrivateCrossSigningIdentity>>>,
    store: Arc<dyn CryptoStore>,
    /// Olm sessions by sender key, the mutex serializes work on the sessions
    /// of one device.
    sessions: RwLock<HashMap<String, Arc<Mutex<Vec<Session>>>>>,
    group_session_locks: LockMap<String>,
    room_locks: LockMap<OwnedRoomId>,
    room_keys_received_sender: broadcast::Sender<Vec<RoomKeyInfo>>,
}

/// A wrapper for our CryptoStore trait object.
///
/// This is needed because we want to have a generic interface so we can
/// store/restore objects that we can serialize. Since trait objects and
/// generics don't mix let the CryptoStore store strings and this wrapper
/// adds the generic interface on top.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("static_account", &self.inner.static_account)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new Store.
    pub(crate) fn new(
        account: Account,
        identity: Option<PrivateCrossSigningIdentity>,
        store: Arc<dyn CryptoStore>,
    ) -> Self {
        let (room_keys_received_sender, _) = broadcast::channel(10);

        Self {
            inner: Arc::new(StoreInner {
                static_account: account.static_data().clone(),
                account: Arc::new(Mutex::new(account)),
                identity: Arc::new(Mutex::new(identity)),
                store,
                sessions: Default::default(),
                group_session_locks: Default::default(),
                room_locks: Default::default(),
                room_keys_received_sender,
            }),
        }
    }

    /// The static data of our own account.
    pub(crate) fn static_account(&self) -> &StaticAccountData {
        &self.inner.static_account
    }

    /// The user ID of our own account.
    pub(crate) fn user_id(&self) -> &UserId {
        &self.inner.static_account.user_id
    }

    /// The device ID of our own account.
    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.inner.static_account.device_id
    }

    /// The underlying store.
    pub(crate) fn crypto_store(&self) -> Arc<dyn CryptoStore> {
        self.inner.store.clone()
    }

    /// Lock our account for reading, e.g. to sign something with it.
    ///
    /// Changes to the account need to go through a [`StoreTransaction`].
    pub(crate) async fn account(&self) -> MutexGuard<'_, Account> {
        self.inner.account.lock().await
    }

    /// Our private cross-signing identity, if one was bootstrapped.
    pub(crate) async fn private_identity(
        &self,
    ) -> MutexGuard<'_, Option<PrivateCrossSigningIdentity>> {
        self.inner.identity.lock().await
    }

    /// Start a new transaction, the changes it collects are committed at
    /// once.
    pub(crate) fn transaction(&self) -> StoreTransaction {
        StoreTransaction { store: self.clone(), changes: Changes::default(), account: None }
    }

    /// Save the changes and update the caches afterwards.
    #[instrument(skip_all)]
    pub(crate) async fn save_changes(&self, changes: Changes) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let room_key_updates: Vec<_> =
            changes.inbound_group_sessions.iter().map(RoomKeyInfo::from).collect();
        let private_identity = changes.private_identity.clone();

        self.inner.store.save_changes(changes).await?;

        if let Some(identity) = private_identity {
            *self.inner.identity.lock().await = Some(identity);
        }

        if !room_key_updates.is_empty() {
            trace!(count = room_key_updates.len(), "Notifying about received room keys");
            // Nobody listening is fine.
            let _ = self.inner.room_keys_received_sender.send(room_key_updates);
        }

        Ok(())
    }

    /// Get all the Olm sessions we share with the device owning the given
    /// Curve25519 key.
    ///
    /// The returned mutex guards every session of the device, hold it for the
    /// whole encrypt or decrypt operation. New sessions with the device are
    /// pushed into the locked list, the list is empty if we don't share any
    /// session with the device yet.
    pub(crate) async fn get_sessions(&self, sender_key: &str) -> Result<Arc<Mutex<Vec<Session>>>> {
        if let Some(sessions) = self.inner.sessions.read().await.get(sender_key) {
            return Ok(sessions.clone());
        }

        let mut cache = self.inner.sessions.write().await;

        // Someone else might have loaded the sessions while we waited.
        if let Some(sessions) = cache.get(sender_key) {
            return Ok(sessions.clone());
        }

        let sessions = self.inner.store.get_sessions(sender_key).await?.unwrap_or_default();
        let sessions = Arc::new(Mutex::new(sessions));
        cache.insert(sender_key.to_owned(), sessions.clone());

        Ok(sessions)
    }

    /// Serialize the work on a single group session.
    pub(crate) async fn lock_group_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.inner.group_session_locks.lock(session_id.to_owned()).await
    }

    /// Serialize outbound session management of a single room.
    pub(crate) async fn lock_room(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        self.inner.room_locks.lock(room_id.to_owned()).await
    }

    /// Find the device of the given user that owns the given Curve25519 key.
    pub(crate) async fn get_device_from_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .inner
            .store
            .get_user_devices(user_id)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == Some(curve_key)))
    }

    /// Receive notifications of room keys being received as a [`Stream`].
    ///
    /// Each time a room key is updated in any way, an update will be sent to
    /// the stream. Updates that happen at the same time are batched into a
    /// [`Vec`].
    ///
    /// If the reader of the stream lags too far behind, a warning will be
    /// logged and items will be dropped.
    pub(crate) fn room_keys_received_stream(&self) -> impl Stream<Item = Vec<RoomKeyInfo>> {
        BroadcastStream::new(self.inner.room_keys_received_sender.subscribe()).filter_map(
            |result: std::result::Result<_, BroadcastStreamRecvError>| async move {
                match result {
                    Ok(r) => Some(r),
                    Err(BroadcastStreamRecvError::Lagged(lag)) => {
                        warn!("room_keys_received_stream missed {lag} updates");
                        None
                    }
                }
            },
        )
    }
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        self.inner.store.deref()
    }
}

/// A temporary transaction (that implies a write) to the underlying store.
///
/// The account stays locked from the first call to
/// [`StoreTransaction::account()`] until the transaction is committed or
/// dropped. Changes are made to a copy of the account, the cached one is only
/// replaced once the store accepted the changes.
#[allow(missing_debug_implementations)]
pub(crate) struct StoreTransaction {
    store: Store,
    changes: Changes,
    account: Option<(OwnedMutexGuard<Account>, Account)>,
}

impl StoreTransaction {
    /// Gets the `Account` for update.
    pub(crate) async fn account(&mut self) -> &mut Account {
        let (_, account) = match self.account.take() {
            Some(locked) => self.account.insert(locked),
            None => {
                let guard = self.store.inner.account.clone().lock_owned().await;
                let account = guard.deep_clone();
                self.account.insert((guard, account))
            }
        };

        account
    }

    /// The changes this transaction will commit.
    pub(crate) fn changes(&mut self) -> &mut Changes {
        &mut self.changes
    }

    /// Commits all the changes, including the account if it was borrowed
    /// for update.
    pub(crate) async fn commit(self) -> Result<()> {
        let StoreTransaction { store, mut changes, account } = self;

        let Some((mut cached, account)) = account else {
            return store.save_changes(changes).await;
        };

        changes.account = Some(account.pickle());
        store.save_changes(changes).await?;

        *cached = account;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{FutureExt, StreamExt};
    use ruma::{device_id, room_id, user_id};

    use super::{testing::FlakyStore, Changes, CryptoStore, MemoryStore, Store};
    use crate::olm::{Account, EncryptionSettings};

    fn store() -> (Store, Arc<MemoryStore>) {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let memory = Arc::new(MemoryStore::new());

        (Store::new(account, None, memory.clone()), memory)
    }

    #[tokio::test]
    async fn transactions_persist_the_account() {
        let (store, memory) = store();
        assert!(memory.load_account().await.unwrap().is_none());

        let mut transaction = store.transaction();
        transaction.account().await.mark_as_shared();
        transaction.commit().await.unwrap();

        let account = memory.load_account().await.unwrap().unwrap();
        assert!(account.shared());
        assert!(store.account().await.shared());
    }

    #[tokio::test]
    async fn failed_commits_leave_the_account_untouched() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
        let store = Store::new(account, None, flaky.clone());

        flaky.fail_next_saves(1);
        let mut transaction = store.transaction();
        transaction.account().await.mark_as_shared();
        assert!(transaction.commit().await.is_err());

        assert!(!store.account().await.shared());
        assert!(flaky.memory.load_account().await.unwrap().is_none());

        let mut transaction = store.transaction();
        transaction.account().await.mark_as_shared();
        transaction.commit().await.unwrap();

        assert!(store.account().await.shared());
    }

    #[tokio::test]
    async fn room_keys_are_announced() {
        let (store, _) = store();
        let mut stream = Box::pin(store.room_keys_received_stream());

        let (_, inbound) = store
            .account()
            .await
            .create_group_session_pair(room_id!("!test:localhost"), EncryptionSettings::default())
            .await;

        let changes =
            Changes { inbound_group_sessions: vec![inbound.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let keys = stream.next().now_or_never().flatten().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].session_id, inbound.session_id());
    }

    #[tokio::test]
    async fn session_cache_survives_reloads() {
        let (store, _) = store();
        let mut transaction = store.transaction();
        transaction.account().await;
        transaction.commit().await.unwrap();

        let bob = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        let bob_device =
            crate::identities::DeviceData::try_from(&bob.device_keys().unwrap()).unwrap();
        let one_time_key = bob.signed_one_time_keys().unwrap().into_values().next().unwrap();

        let session =
            store.account().await.create_outbound_session(&bob_device, &one_time_key).unwrap();
        let sender_key = session.sender_key().to_base64();

        let changes = Changes { sessions: vec![session.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let sessions = store.get_sessions(&sender_key).await.unwrap();
        assert_eq!(sessions.lock().await.as_slice(), &[session]);
    }
}
