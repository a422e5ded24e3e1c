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

//! A store whose writes can be made to fail.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, TransactionId, UserId};

use super::{
    BackupKeys, Changes, CryptoStore, CryptoStoreError, MemoryStore, Result, RoomKeyCounts,
    RoomKeyWithheldEntry, TrackedUser,
};
use crate::{
    gossiping::{GossipRequest, KeyShareDecision},
    identities::{DeviceData, UserIdentityData},
    olm::{
        Account, InboundGroupSession, OutboundGroupSession, PrivateCrossSigningIdentity, Session,
    },
    types::events::room_key_request::RequestedKeyInfo,
};

/// A [`MemoryStore`] whose writes can fail and whose reads can lag behind.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub memory: Arc<MemoryStore>,
    failing_saves: AtomicUsize,
    stale_backup_queries: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl FlakyStore {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory, ..Default::default() }
    }

    /// Reject the next `count` calls to `save_changes`.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// The next `count` queries for room keys to back up find nothing, as
    /// if they ran just before the keys were written.
    pub fn return_stale_backup_queries(&self, count: usize) {
        self.stale_backup_queries.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CryptoStore for FlakyStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        self.memory.load_account().await
    }

    async fn load_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>> {
        self.memory.load_identity().await
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        if take_one(&self.failing_saves) {
            return Err(CryptoStoreError::backend(io::Error::other("disk full")));
        }

        self.memory.save_changes(changes).await
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Vec<Session>>> {
        self.memory.get_sessions(sender_key).await
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        self.memory.get_inbound_group_session(room_id, session_id).await
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.memory.get_inbound_group_sessions().await
    }

    async fn inbound_group_session_counts(
        &self,
        backup_version: Option<&str>,
    ) -> Result<RoomKeyCounts> {
        self.memory.inbound_group_session_counts(backup_version).await
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        backup_version: &str,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        if take_one(&self.stale_backup_queries) {
            return Ok(Vec::new());
        }

        self.memory.inbound_group_sessions_for_backup(backup_version, limit).await
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        backup_version: &str,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        self.memory
            .mark_inbound_group_sessions_as_backed_up(backup_version, room_and_session_ids)
            .await
    }

    async fn reset_backup_state(&self) -> Result<()> {
        self.memory.reset_backup_state().await
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        self.memory.load_backup_keys().await
    }

    async fn delete_backup_keys(&self) -> Result<()> {
        self.memory.delete_backup_keys().await
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        self.memory.get_outbound_group_session(room_id).await
    }

    async fn get_retired_outbound_group_sessions(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<OutboundGroupSession>> {
        self.memory.get_retired_outbound_group_sessions(room_id).await
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        self.memory.load_tracked_users().await
    }

    async fn save_tracked_users(&self, users: &[(&UserId, bool)]) -> Result<()> {
        self.memory.save_tracked_users(users).await
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        self.memory.get_device(user_id, device_id).await
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        self.memory.get_user_devices(user_id).await
    }

    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentityData>> {
        self.memory.get_user_identity(user_id).await
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldEntry>> {
        self.memory.get_withheld_info(room_id, session_id).await
    }

    async fn get_key_share_decision(&self, decision_key: &str) -> Result<Option<KeyShareDecision>> {
        self.memory.get_key_share_decision(decision_key).await
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<GossipRequest>> {
        self.memory.get_outgoing_key_request(request_id).await
    }

    async fn get_key_request_by_info(
        &self,
        key_info: &RequestedKeyInfo,
    ) -> Result<Option<GossipRequest>> {
        self.memory.get_key_request_by_info(key_info).await
    }

    async fn get_unsent_key_requests(&self) -> Result<Vec<GossipRequest>> {
        self.memory.get_unsent_key_requests().await
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        self.memory.delete_outgoing_key_request(request_id).await
    }
}
