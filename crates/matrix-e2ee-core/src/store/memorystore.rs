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

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use tokio::sync::{Mutex, RwLock};

use super::{
    BackupKeys, Changes, CryptoStore, CryptoStoreError, Result, RoomKeyCounts,
    RoomKeyWithheldEntry, TrackedUser,
};
use crate::{
    gossiping::{GossipRequest, KeyShareDecision},
    identities::{DeviceData, UserIdentityData},
    olm::{
        Account, InboundGroupSession, OutboundGroupSession, PickledAccount,
        PickledCrossSigningIdentity, PickledInboundGroupSession, PickledOutboundGroupSession,
        PickledSession, PrivateCrossSigningIdentity, Session, StaticAccountData,
    },
    types::events::room_key_request::RequestedKeyInfo,
};

type SessionId = String;

/// An in-memory only store that will forget all the E2EE key once it's dropped.
///
/// Sessions and identities are kept in their pickled, serialized form, a
/// value handed out by the store never aliases the one that was saved.
#[derive(Default, Debug)]
pub struct MemoryStore {
    static_account: RwLock<Option<StaticAccountData>>,
    account: RwLock<Option<String>>,
    private_identity: RwLock<Option<String>>,
    // Map of sender_key to map of session_id to serialized pickle
    sessions: RwLock<BTreeMap<String, BTreeMap<SessionId, String>>>,
    inbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, HashMap<SessionId, String>>>,
    /// Map room id -> session id -> backup version the session was last
    /// backed up to.
    inbound_group_sessions_backed_up_to: RwLock<HashMap<OwnedRoomId, HashMap<SessionId, String>>>,
    outbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, String>>,
    retired_outbound_group_sessions: RwLock<BTreeMap<OwnedRoomId, BTreeMap<SessionId, String>>>,
    tracked_users: RwLock<HashMap<OwnedUserId, TrackedUser>>,
    devices: RwLock<HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceData>>>,
    identities: RwLock<HashMap<OwnedUserId, String>>,
    outgoing_key_requests: RwLock<HashMap<OwnedTransactionId, GossipRequest>>,
    key_requests_by_info: RwLock<HashMap<String, OwnedTransactionId>>,
    key_share_decisions: RwLock<HashMap<String, KeyShareDecision>>,
    direct_withheld_info: RwLock<HashMap<OwnedRoomId, HashMap<SessionId, RoomKeyWithheldEntry>>>,
    backup_keys: RwLock<BackupKeys>,

    save_changes_lock: Mutex<()>,
}

/// The serialized form of a [`Changes`] value, produced before anything is
/// written so a failure leaves the store untouched.
#[derive(Default)]
struct PreparedChanges {
    static_account: Option<StaticAccountData>,
    account: Option<String>,
    private_identity: Option<String>,
    sessions: Vec<(String, SessionId, String)>,
    inbound_group_sessions: Vec<(OwnedRoomId, SessionId, String)>,
    outbound_group_sessions: Vec<(OwnedRoomId, String)>,
    retired_outbound_group_sessions: Vec<(OwnedRoomId, SessionId, String)>,
    identities: Vec<(OwnedUserId, String)>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_static_account(&self) -> Result<StaticAccountData> {
        self.static_account.read().await.clone().ok_or(CryptoStoreError::AccountUnset)
    }

    async fn prepare(changes: &Changes) -> Result<PreparedChanges> {
        let mut prepared = PreparedChanges::default();

        if let Some(pickle) = &changes.account {
            let static_account = Account::from_pickle(deserialize_clone(pickle)?);
            prepared.static_account = Some(static_account.static_data().clone());
            prepared.account = Some(serde_json::to_string(pickle)?);
        }

        if let Some(identity) = &changes.private_identity {
            prepared.private_identity = Some(serde_json::to_string(&identity.pickle())?);
        }

        for session in &changes.sessions {
            let pickle = session.pickle().await;
            prepared.sessions.push((
                session.sender_key().to_base64(),
                session.session_id().to_owned(),
                serde_json::to_string(&pickle)?,
            ));
        }

        for session in &changes.inbound_group_sessions {
            let pickle = session.pickle().await;
            prepared.inbound_group_sessions.push((
                session.room_id().to_owned(),
                session.session_id().to_owned(),
                serde_json::to_string(&pickle)?,
            ));
        }

        for session in &changes.outbound_group_sessions {
            let pickle = session.pickle().await;
            prepared
                .outbound_group_sessions
                .push((session.room_id().to_owned(), serde_json::to_string(&pickle)?));
        }

        for session in &changes.retired_outbound_group_sessions {
            let pickle = session.pickle().await;
            prepared.retired_outbound_group_sessions.push((
                session.room_id().to_owned(),
                session.session_id().to_owned(),
                serde_json::to_string(&pickle)?,
            ));
        }

        for identity in changes.identities.new.iter().chain(&changes.identities.changed) {
            prepared
                .identities
                .push((identity.user_id().to_owned(), serde_json::to_string(identity)?));
        }

        Ok(prepared)
    }
}

/// Round-trip an account pickle through JSON, the pickle itself can't be
/// cloned.
fn deserialize_clone(pickle: &PickledAccount) -> Result<PickledAccount> {
    Ok(serde_json::from_value(serde_json::to_value(pickle)?)?)
}

fn encode_key_info(info: &RequestedKeyInfo) -> String {
    info.as_key()
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let Some(pickle) = self.account.read().await.clone() else {
            return Ok(None);
        };

        let pickle: PickledAccount = serde_json::from_str(&pickle)?;
        let account = Account::from_pickle(pickle);

        *self.static_account.write().await = Some(account.static_data().clone());

        Ok(Some(account))
    }

    async fn load_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>> {
        let Some(pickle) = self.private_identity.read().await.clone() else {
            return Ok(None);
        };

        let pickle: PickledCrossSigningIdentity = serde_json::from_str(&pickle)?;

        Ok(Some(PrivateCrossSigningIdentity::from_pickle(pickle)?))
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;

        let prepared = Self::prepare(&changes).await?;

        if let Some(static_account) = prepared.static_account {
            *self.static_account.write().await = Some(static_account);
        }

        if let Some(account) = prepared.account {
            *self.account.write().await = Some(account);
        }

        if let Some(identity) = prepared.private_identity {
            *self.private_identity.write().await = Some(identity);
        }

        {
            let mut sessions = self.sessions.write().await;
            for (sender_key, session_id, pickle) in prepared.sessions {
                sessions.entry(sender_key).or_default().insert(session_id, pickle);
            }
        }

        {
            let mut sessions = self.inbound_group_sessions.write().await;
            for (room_id, session_id, pickle) in prepared.inbound_group_sessions {
                sessions.entry(room_id).or_default().insert(session_id, pickle);
            }

            // A replaced session that isn't backed up needs to be uploaded again.
            let mut backed_up_to = self.inbound_group_sessions_backed_up_to.write().await;
            for session in changes.inbound_group_sessions.iter().filter(|s| !s.backed_up()) {
                if let Some(sessions) = backed_up_to.get_mut(session.room_id()) {
                    sessions.remove(session.session_id());
                }
            }
        }

        self.outbound_group_sessions.write().await.extend(prepared.outbound_group_sessions);

        {
            let mut retired = self.retired_outbound_group_sessions.write().await;
            for (room_id, session_id, pickle) in prepared.retired_outbound_group_sessions {
                retired.entry(room_id).or_default().insert(session_id, pickle);
            }
        }

        self.identities.write().await.extend(prepared.identities);

        {
            let mut devices = self.devices.write().await;

            for device in changes.devices.new.into_iter().chain(changes.devices.changed) {
                devices
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .insert(device.device_id().to_owned(), device);
            }

            for device in changes.devices.deleted {
                if let Some(user_devices) = devices.get_mut(device.user_id()) {
                    user_devices.remove(device.device_id());
                }
            }
        }

        {
            let mut outgoing_key_requests = self.outgoing_key_requests.write().await;
            let mut key_requests_by_info = self.key_requests_by_info.write().await;

            for key_request in changes.key_requests {
                let id = key_request.request_id.clone();
                let info_string = encode_key_info(&key_request.info);

                outgoing_key_requests.insert(id.clone(), key_request);
                key_requests_by_info.insert(info_string, id);
            }
        }

        {
            let mut decisions = self.key_share_decisions.write().await;
            for decision in changes.key_share_decisions {
                decisions.insert(decision.key(), decision);
            }
        }

        {
            let mut withheld = self.direct_withheld_info.write().await;
            for (room_id, data) in changes.withheld_session_info {
                withheld.entry(room_id).or_default().extend(data);
            }
        }

        if let Some(key) = changes.backup_decryption_key {
            self.backup_keys.write().await.decryption_key = Some(key);
        }

        if let Some(version) = changes.backup_version {
            self.backup_keys.write().await.backup_version = Some(version);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Vec<Session>>> {
        let account_info = self.get_static_account().await?;

        let sessions = self.sessions.read().await;
        let Some(pickles) = sessions.get(sender_key) else {
            return Ok(None);
        };

        let sessions = pickles
            .values()
            .map(|pickle| {
                let pickle: PickledSession = serde_json::from_str(pickle)?;
                Ok(Session::from_pickle(account_info.clone(), pickle))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(sessions))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let sessions = self.inbound_group_sessions.read().await;

        sessions
            .get(room_id)
            .and_then(|m| m.get(session_id))
            .map(|pickle| {
                let pickle: PickledInboundGroupSession = serde_json::from_str(pickle)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .transpose()
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.inbound_group_sessions
            .read()
            .await
            .values()
            .flat_map(HashMap::values)
            .map(|pickle| {
                let pickle: PickledInboundGroupSession = serde_json::from_str(pickle)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }

    async fn inbound_group_session_counts(
        &self,
        backup_version: Option<&str>,
    ) -> Result<RoomKeyCounts> {
        let sessions = self.inbound_group_sessions.read().await;
        let backed_up_to = self.inbound_group_sessions_backed_up_to.read().await;

        let total = sessions.values().map(HashMap::len).sum();
        let backed_up = match backup_version {
            Some(version) => backed_up_to
                .values()
                .flat_map(HashMap::values)
                .filter(|v| v.as_str() == version)
                .count(),
            None => 0,
        };

        Ok(RoomKeyCounts { total, backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        backup_version: &str,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        let sessions = self.inbound_group_sessions.read().await;
        let backed_up_to = self.inbound_group_sessions_backed_up_to.read().await;

        let is_backed_up = |room_id: &RoomId, session_id: &str| {
            backed_up_to
                .get(room_id)
                .and_then(|m| m.get(session_id))
                .is_some_and(|v| v == backup_version)
        };

        sessions
            .iter()
            .flat_map(|(room_id, m)| m.iter().map(move |(id, pickle)| (room_id, id, pickle)))
            .filter(|(room_id, session_id, _)| !is_backed_up(room_id, session_id))
            .take(limit)
            .map(|(_, _, pickle)| {
                let pickle: PickledInboundGroupSession = serde_json::from_str(pickle)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        backup_version: &str,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;
        let mut sessions = self.inbound_group_sessions.write().await;
        let mut backed_up_to = self.inbound_group_sessions_backed_up_to.write().await;

        for &(room_id, session_id) in room_and_session_ids {
            let Some(pickle) = sessions.get_mut(room_id).and_then(|m| m.get_mut(session_id))
            else {
                continue;
            };

            let mut parsed: PickledInboundGroupSession = serde_json::from_str(pickle)?;
            parsed.backed_up = true;
            *pickle = serde_json::to_string(&parsed)?;

            backed_up_to
                .entry(room_id.to_owned())
                .or_default()
                .insert(session_id.to_owned(), backup_version.to_owned());
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;
        let mut sessions = self.inbound_group_sessions.write().await;

        for pickle in sessions.values_mut().flat_map(HashMap::values_mut) {
            let mut parsed: PickledInboundGroupSession = serde_json::from_str(pickle)?;
            parsed.backed_up = false;
            *pickle = serde_json::to_string(&parsed)?;
        }

        self.inbound_group_sessions_backed_up_to.write().await.clear();

        Ok(())
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        Ok(self.backup_keys.read().await.clone())
    }

    async fn delete_backup_keys(&self) -> Result<()> {
        *self.backup_keys.write().await = BackupKeys::default();
        Ok(())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        self.outbound_group_sessions
            .read()
            .await
            .get(room_id)
            .map(|pickle| {
                let pickle: PickledOutboundGroupSession = serde_json::from_str(pickle)?;
                Ok(OutboundGroupSession::from_pickle(pickle))
            })
            .transpose()
    }

    async fn get_retired_outbound_group_sessions(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<OutboundGroupSession>> {
        self.retired_outbound_group_sessions
            .read()
            .await
            .get(room_id)
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(|pickle| {
                let pickle: PickledOutboundGroupSession = serde_json::from_str(pickle)?;
                Ok(OutboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        Ok(self.tracked_users.read().await.values().cloned().collect())
    }

    async fn save_tracked_users(&self, tracked_users: &[(&UserId, bool)]) -> Result<()> {
        self.tracked_users.write().await.extend(tracked_users.iter().map(|(user_id, dirty)| {
            let user_id: OwnedUserId = (*user_id).to_owned();
            (user_id.clone(), TrackedUser { user_id, dirty: *dirty })
        }));

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self.devices.read().await.get(user_id).and_then(|m| m.get(device_id)).cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        Ok(self.devices.read().await.get(user_id).cloned().unwrap_or_default())
    }

    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentityData>> {
        self.identities
            .read()
            .await
            .get(user_id)
            .map(|identity| Ok(serde_json::from_str(identity)?))
            .transpose()
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldEntry>> {
        Ok(self
            .direct_withheld_info
            .read()
            .await
            .get(room_id)
            .and_then(|e| e.get(session_id))
            .cloned())
    }

    async fn get_key_share_decision(&self, decision_key: &str) -> Result<Option<KeyShareDecision>> {
        Ok(self.key_share_decisions.read().await.get(decision_key).cloned())
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<GossipRequest>> {
        Ok(self.outgoing_key_requests.read().await.get(request_id).cloned())
    }

    async fn get_key_request_by_info(
        &self,
        key_info: &RequestedKeyInfo,
    ) -> Result<Option<GossipRequest>> {
        let key_info_string = encode_key_info(key_info);

        let Some(request_id) = self.key_requests_by_info.read().await.get(&key_info_string).cloned()
        else {
            return Ok(None);
        };

        Ok(self.outgoing_key_requests.read().await.get(&request_id).cloned())
    }

    async fn get_unsent_key_requests(&self) -> Result<Vec<GossipRequest>> {
        Ok(self
            .outgoing_key_requests
            .read()
            .await
            .values()
            .filter(|req| !req.sent_out)
            .cloned()
            .collect())
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        let removed = self.outgoing_key_requests.write().await.remove(request_id);

        if let Some(request) = removed {
            let key_info_string = encode_key_info(&request.info);
            self.key_requests_by_info.write().await.remove(&key_info_string);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use ruma::{device_id, owned_device_id, room_id, user_id};

    use super::MemoryStore;
    use crate::{
        gossiping::GossipRequest,
        identities::device::testing::get_device,
        olm::{Account, EncryptionSettings, OutboundGroupSession},
        store::{Changes, CryptoStore, CryptoStoreError, DeviceChanges},
        types::events::room_key_request::RequestedKeyInfo,
    };

    fn account() -> Account {
        Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    async fn store_with_account() -> (Account, MemoryStore) {
        let store = MemoryStore::new();
        let account = account();

        let changes = Changes { account: Some(account.pickle()), ..Default::default() };
        store.save_changes(changes).await.unwrap();

        (account, store)
    }

    #[tokio::test]
    async fn account_round_trip() {
        let (account, store) = store_with_account().await;
        let loaded = store.load_account().await.unwrap().unwrap();

        assert_eq!(account.identity_keys(), loaded.identity_keys());
    }

    #[tokio::test]
    async fn sessions_need_an_account() {
        let store = MemoryStore::new();
        assert!(matches!(store.get_sessions("key").await, Err(CryptoStoreError::AccountUnset)));
    }

    #[tokio::test]
    async fn inbound_group_sessions_and_backups() {
        let (account, store) = store_with_account().await;
        let room_id = room_id!("!test:localhost");

        let (_, inbound) =
            account.create_group_session_pair(room_id, EncryptionSettings::default()).await;

        let changes =
            Changes { inbound_group_sessions: vec![inbound.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let loaded =
            store.get_inbound_group_session(room_id, inbound.session_id()).await.unwrap().unwrap();
        assert_eq!(loaded, inbound);
        assert_eq!(store.get_inbound_group_sessions().await.unwrap(), vec![inbound.clone()]);

        let counts = store.inbound_group_session_counts(Some("1")).await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (1, 0));

        assert_eq!(store.inbound_group_sessions_for_backup("1", 10).await.unwrap().len(), 1);
        store
            .mark_inbound_group_sessions_as_backed_up("1", &[(room_id, inbound.session_id())])
            .await
            .unwrap();
        assert!(store.inbound_group_sessions_for_backup("1", 10).await.unwrap().is_empty());

        // A new backup version needs every key again.
        assert_eq!(store.inbound_group_sessions_for_backup("2", 10).await.unwrap().len(), 1);

        let loaded =
            store.get_inbound_group_session(room_id, inbound.session_id()).await.unwrap().unwrap();
        assert!(loaded.backed_up());

        store.reset_backup_state().await.unwrap();
        let counts = store.inbound_group_session_counts(Some("1")).await.unwrap();
        assert_eq!(counts.backed_up, 0);
    }

    #[tokio::test]
    async fn stored_sessions_are_snapshots() {
        let (account, store) = store_with_account().await;
        let room_id = room_id!("!test:localhost");

        let mut outbound = OutboundGroupSession::new(
            account.device_id().to_owned(),
            account.identity_keys().curve25519,
            room_id,
            EncryptionSettings::default(),
        );

        let changes =
            Changes { outbound_group_sessions: vec![outbound.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        outbound.encrypt("m.room.message", serde_json::json!({})).await.unwrap();

        let loaded = store.get_outbound_group_session(room_id).await.unwrap().unwrap();
        assert_eq!(loaded.message_index().await, 0);
        assert_eq!(outbound.message_index().await, 1);
    }

    #[tokio::test]
    async fn devices() {
        let store = MemoryStore::new();
        let device = get_device();

        let changes = Changes {
            devices: DeviceChanges { new: vec![device.clone()], ..Default::default() },
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap();
        assert_eq!(loaded, Some(device.clone()));
        assert_eq!(store.get_user_devices(device.user_id()).await.unwrap().len(), 1);

        let changes = Changes {
            devices: DeviceChanges { deleted: vec![device.clone()], ..Default::default() },
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        assert!(store.get_device(device.user_id(), device.device_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_requests() {
        let store = MemoryStore::new();
        let info = RequestedKeyInfo::new(
            room_id!("!test:localhost").to_owned(),
            vodozemac::Curve25519PublicKey::from_bytes([0; 32]),
            "session".to_owned(),
        );

        let recipients = BTreeMap::from([(
            user_id!("@alice:localhost").to_owned(),
            BTreeSet::from([owned_device_id!("ALICE2")]),
        )]);
        let request = GossipRequest::new(info.clone(), recipients);

        let changes = Changes { key_requests: vec![request.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        assert_eq!(store.get_key_request_by_info(&info).await.unwrap(), Some(request.clone()));
        assert_eq!(
            store.get_outgoing_key_request(&request.request_id).await.unwrap(),
            Some(request.clone())
        );
        assert_eq!(store.get_unsent_key_requests().await.unwrap().len(), 1);

        store.delete_outgoing_key_request(&request.request_id).await.unwrap();
        assert!(store.get_key_request_by_info(&info).await.unwrap().is_none());
    }
}
