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

use std::collections::{BTreeMap, BTreeSet, HashSet};

use itertools::Itertools;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};

use super::{DeviceData, LocalTrust, UserIdentityData};
use crate::{
    error::OlmResult,
    requests::{KeysQueryRequest, KeysQueryResponse},
    store::{Changes, DeviceChanges, IdentityChanges, Result as StoreResult, Store},
    types::{DeviceKeys, MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
};

enum DeviceChange {
    New(DeviceData),
    Updated(DeviceData),
    None,
}

enum IdentityChange {
    New(UserIdentityData),
    Changed(UserIdentityData),
    None,
}

/// Keeps the device registry and the published user identities up to date.
#[derive(Debug, Clone)]
pub(crate) struct IdentityManager {
    store: Store,
}

impl IdentityManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// Start tracking the devices of the given users.
    ///
    /// Users that aren't tracked yet are marked as outdated, so the next
    /// [`IdentityManager::users_for_key_query()`] call includes them.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let tracked: HashSet<OwnedUserId> =
            self.store.load_tracked_users().await?.into_iter().map(|u| u.user_id).collect();

        let new: Vec<(&UserId, bool)> =
            users.into_iter().filter(|u| !tracked.contains(*u)).map(|u| (u, true)).collect();

        if !new.is_empty() {
            debug!(users = ?new.iter().map(|(u, _)| u).collect_vec(), "Tracking new users");
            self.store.save_tracked_users(&new).await?;
        }

        Ok(())
    }

    /// Mark the device lists of the given users as outdated, e.g. because
    /// the homeserver told us they changed.
    ///
    /// Users we don't track are ignored.
    pub async fn mark_users_as_changed(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let tracked: HashSet<OwnedUserId> =
            self.store.load_tracked_users().await?.into_iter().map(|u| u.user_id).collect();

        let changed: Vec<(&UserId, bool)> =
            users.into_iter().filter(|u| tracked.contains(*u)).map(|u| (u, true)).collect();

        self.store.save_tracked_users(&changed).await
    }

    /// Build a key query for all the users with an outdated device list.
    pub async fn users_for_key_query(&self) -> StoreResult<Option<KeysQueryRequest>> {
        let users: Vec<OwnedUserId> = self
            .store
            .load_tracked_users()
            .await?
            .into_iter()
            .filter(|u| u.dirty)
            .map(|u| u.user_id)
            .collect();

        Ok((!users.is_empty()).then(|| KeysQueryRequest::new(users)))
    }

    /// Receive a successful keys query response.
    ///
    /// Every device and identity in the response is checked on its own, one
    /// that fails the checks is skipped with a warning and the rest of the
    /// response is still applied.
    ///
    /// Returns the devices and identities that were added or changed.
    #[instrument(skip_all)]
    pub async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> OlmResult<(DeviceChanges, IdentityChanges)> {
        debug!(
            users = ?response.device_keys.keys().collect::<BTreeSet<_>>(),
            failures = ?response.failures.keys().collect::<BTreeSet<_>>(),
            "Handling a keys query response"
        );

        let mut devices = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            let changes = self.update_user_devices(user_id, device_map).await?;
            devices.new.extend(changes.new);
            devices.changed.extend(changes.changed);
            devices.deleted.extend(changes.deleted);
        }

        let identities = self.handle_cross_signing_keys(response).await?;

        let changes = Changes {
            identities: identities.clone(),
            devices: devices.clone(),
            ..Default::default()
        };

        self.store.save_changes(changes).await?;

        let queried: Vec<(&UserId, bool)> =
            response.device_keys.keys().map(|u| (&**u, false)).collect();
        self.store.save_tracked_users(&queried).await?;

        debug!(
            new_devices = devices.new.len(),
            changed_devices = devices.changed.len(),
            deleted_devices = devices.deleted.len(),
            new_identities = identities.new.len(),
            changed_identities = identities.changed.len(),
            "Finished handling of the keys query response"
        );

        Ok((devices, identities))
    }

    async fn update_or_create_device(&self, device_keys: DeviceKeys) -> StoreResult<DeviceChange> {
        let old_device = self.store.get_device(&device_keys.user_id, &device_keys.device_id).await?;

        let change = if let Some(mut device) = old_device {
            match device.update_device(&device_keys) {
                Ok(true) => DeviceChange::Updated(device),
                Ok(false) => DeviceChange::None,
                Err(e) => {
                    warn!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        error = ?e,
                        "Failed to update device keys",
                    );

                    DeviceChange::None
                }
            }
        } else {
            match DeviceData::try_from(&device_keys) {
                Ok(mut device) => {
                    // The server could lie about our own keys, only accept
                    // the ones we know.
                    let is_own_device = device.user_id() == self.user_id()
                        && device.device_id() == self.store.device_id();

                    if is_own_device {
                        let local_device_keys = self.store.static_account().unsigned_device_keys();

                        if device.keys() == &local_device_keys.keys {
                            device.set_trust_state(LocalTrust::Verified);
                            trace!("Adding our own device to the device store");

                            DeviceChange::New(device)
                        } else {
                            warn!(
                                keys = ?device.keys(),
                                "The homeserver published different keys for our own device",
                            );

                            DeviceChange::None
                        }
                    } else {
                        trace!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            keys = ?device.keys(),
                            "Adding a new device to the device store",
                        );

                        DeviceChange::New(device)
                    }
                }
                Err(e) => {
                    warn!(
                        user_id = ?device_keys.user_id,
                        device_id = ?device_keys.device_id,
                        error = ?e,
                        "Failed to create a new device",
                    );

                    DeviceChange::None
                }
            }
        };

        Ok(change)
    }

    async fn update_user_devices(
        &self,
        user_id: &UserId,
        device_map: &BTreeMap<OwnedDeviceId, Value>,
    ) -> StoreResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for (device_id, device_keys) in device_map {
            let device_keys = match serde_json::from_value::<DeviceKeys>(device_keys.clone()) {
                Ok(device_keys) => device_keys,
                Err(e) => {
                    warn!(?user_id, ?device_id, error = ?e, "Device keys failed to deserialize");
                    continue;
                }
            };

            if *user_id != *device_keys.user_id || *device_id != device_keys.device_id {
                warn!(
                    ?user_id,
                    ?device_id,
                    device_key_user = ?device_keys.user_id,
                    device_key_device_id = ?device_keys.device_id,
                    "Mismatch in the device keys payload",
                );
                continue;
            }

            match self.update_or_create_device(device_keys).await? {
                DeviceChange::New(d) => changes.new.push(d),
                DeviceChange::Updated(d) => changes.changed.push(d),
                DeviceChange::None => (),
            }
        }

        let stored_devices = self.store.get_user_devices(user_id).await?;

        for (device_id, mut device) in stored_devices {
            if device_map.contains_key(&device_id) {
                continue;
            }

            if user_id == self.user_id() && *device_id == *self.store.device_id() {
                warn!("Our own device might have been deleted");
            } else {
                device.mark_as_deleted();
                changes.deleted.push(device);
            }
        }

        Ok(changes)
    }

    async fn update_or_create_identity(
        &self,
        master_key: MasterPubkey,
        self_signing_key: SelfSigningPubkey,
        user_signing_key: Option<UserSigningPubkey>,
    ) -> StoreResult<IdentityChange> {
        let user_id = master_key.user_id().to_owned();

        let result = match self.store.get_user_identity(&user_id).await? {
            Some(mut identity) => identity
                .update(master_key, self_signing_key, user_signing_key)
                .map(|changed| {
                    if changed {
                        IdentityChange::Changed(identity)
                    } else {
                        IdentityChange::None
                    }
                }),
            None => UserIdentityData::new(master_key, self_signing_key, user_signing_key)
                .map(IdentityChange::New),
        };

        Ok(result.unwrap_or_else(|e| {
            warn!(?user_id, error = ?e, "Couldn't update or create a user identity");
            IdentityChange::None
        }))
    }

    /// Warn if our published identity isn't the one we hold the private keys
    /// for, someone else reset our cross-signing keys.
    async fn check_private_identity(&self, identity: &UserIdentityData) {
        if let Some(private) = self.store.private_identity().await.as_ref() {
            if private.master_public_key().get_first_key() != identity.master_key().get_first_key()
            {
                warn!(
                    "Our published master key doesn't match our private cross-signing keys, \
                     our cross-signing identity was reset"
                );
            }
        }
    }

    async fn handle_cross_signing_keys(
        &self,
        response: &KeysQueryResponse,
    ) -> StoreResult<IdentityChanges> {
        fn parse<T: serde::de::DeserializeOwned>(
            user_id: &UserId,
            key: &Value,
            name: &'static str,
        ) -> Option<T> {
            serde_json::from_value(key.clone())
                .map_err(|e| {
                    warn!(?user_id, error = ?e, "Invalid {name} in the keys query response")
                })
                .ok()
        }

        let mut changes = IdentityChanges::default();

        for (user_id, master_key) in &response.master_keys {
            let Some(master_key) = parse::<MasterPubkey>(user_id, master_key, "master key") else {
                continue;
            };

            if *master_key.user_id() != **user_id {
                warn!(?user_id, "A master key was published under a different user");
                continue;
            }

            let Some(self_signing) = response.self_signing_keys.get(user_id) else {
                warn!(?user_id, "A user identity didn't contain a self signing pubkey");
                continue;
            };
            let Some(self_signing) =
                parse::<SelfSigningPubkey>(user_id, self_signing, "self-signing key")
            else {
                continue;
            };

            let user_signing = if **user_id == *self.user_id() {
                response
                    .user_signing_keys
                    .get(user_id)
                    .and_then(|key| parse::<UserSigningPubkey>(user_id, key, "user-signing key"))
            } else {
                None
            };

            match self.update_or_create_identity(master_key, self_signing, user_signing).await? {
                IdentityChange::New(identity) => {
                    if identity.user_id() == self.user_id() {
                        self.check_private_identity(&identity).await;
                    }
                    info!(?user_id, "Received a new user identity");
                    changes.new.push(identity)
                }
                IdentityChange::Changed(identity) => {
                    if identity.user_id() == self.user_id() {
                        self.check_private_identity(&identity).await;
                    }
                    info!(?user_id, "The cross-signing keys of a user changed");
                    changes.changed.push(identity)
                }
                IdentityChange::None => (),
            }
        }

        Ok(changes)
    }

    /// Set the local trust state of a device and persist it.
    ///
    /// Returns the updated device, `None` if we don't know the device.
    #[instrument(skip(self))]
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> StoreResult<Option<DeviceData>> {
        let Some(mut device) = self.store.get_device(user_id, device_id).await? else {
            return Ok(None);
        };

        device.set_trust_state(trust_state);
        info!("Changed the local trust state of a device");

        let changes = Changes {
            devices: DeviceChanges { changed: vec![device.clone()], ..Default::default() },
            ..Default::default()
        };
        self.store.save_changes(changes).await?;

        Ok(Some(device))
    }

    /// Remove a device from the registry.
    ///
    /// Returns `false` if we didn't know the device.
    #[instrument(skip(self))]
    pub async fn remove_device(&self, user_id: &UserId, device_id: &DeviceId) -> StoreResult<bool> {
        let Some(mut device) = self.store.get_device(user_id, device_id).await? else {
            return Ok(false);
        };

        device.mark_as_deleted();
        info!("Removing a device");

        let changes = Changes {
            devices: DeviceChanges { deleted: vec![device], ..Default::default() },
            ..Default::default()
        };
        self.store.save_changes(changes).await?;

        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::BTreeMap, sync::Arc};

    use ruma::{DeviceId, UserId};

    use super::IdentityManager;
    use crate::{
        identities::UserIdentityData,
        olm::Account,
        requests::KeysQueryResponse,
        store::{MemoryStore, Store},
    };

    pub fn manager(user_id: &UserId, device_id: &DeviceId) -> IdentityManager {
        let account = Account::with_device_id(user_id, device_id);
        let store = Store::new(account, None, Arc::new(MemoryStore::new()));
        IdentityManager::new(store)
    }

    /// A key query response listing the devices of the given accounts.
    pub fn key_query(accounts: &[&Account]) -> KeysQueryResponse {
        let mut response = KeysQueryResponse::default();

        for account in accounts {
            let keys = serde_json::to_value(account.device_keys().unwrap()).unwrap();
            response
                .device_keys
                .entry(account.user_id().to_owned())
                .or_insert_with(BTreeMap::new)
                .insert(account.device_id().to_owned(), keys);
        }

        response
    }

    /// Add the public cross-signing keys of an identity to a response.
    pub fn add_identity(response: &mut KeysQueryResponse, identity: &UserIdentityData) {
        let user_id = identity.user_id().to_owned();

        response
            .master_keys
            .insert(user_id.clone(), serde_json::to_value(identity.master_key()).unwrap());
        response
            .self_signing_keys
            .insert(user_id.clone(), serde_json::to_value(identity.self_signing_key()).unwrap());

        if let Some(key) = identity.user_signing_key() {
            response.user_signing_keys.insert(user_id, serde_json::to_value(key).unwrap());
        }
    }
}
