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

//! An in-memory homeserver implementing [`Transport`], so that several
//! [`OlmMachine`](crate::OlmMachine)s can exchange keys and messages without
//! a network.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::{
    requests::{
        KeysBackupRequest, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, SignatureUploadRequest,
        ToDeviceRequest, UploadSigningKeysRequest, SIGNED_CURVE25519,
    },
    transport::{Transport, TransportError},
    types::{events::ToDeviceEvent, RoomKeyBackupInfo, RoomKeyBackupPayload, RoomKeyBackupVersion},
};

type DeviceMap<T> = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, T>>;

#[derive(Debug, Default)]
struct ServerState {
    device_keys: DeviceMap<Value>,
    one_time_keys: DeviceMap<BTreeMap<String, Value>>,
    master_keys: BTreeMap<OwnedUserId, Value>,
    self_signing_keys: BTreeMap<OwnedUserId, Value>,
    user_signing_keys: BTreeMap<OwnedUserId, Value>,
    inboxes: DeviceMap<Vec<Value>>,
    backup_versions: Vec<RoomKeyBackupVersion>,
    backups: BTreeMap<String, RoomKeyBackupPayload>,
    injected_failures: VecDeque<TransportError>,
    claim_count: usize,
    backup_upload_count: usize,
}

/// A homeserver keeping everything in memory.
#[derive(Debug, Default, Clone)]
pub struct MockHomeserver {
    state: Arc<Mutex<ServerState>>,
}

impl MockHomeserver {
    /// Create a new, empty, homeserver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a transport acting on behalf of the given device.
    pub fn transport_for(&self, user_id: &UserId, device_id: &DeviceId) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            server: self.clone(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        })
    }

    /// Make the next requests fail with the given errors, in order.
    pub async fn fail_next_requests(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state.lock().await.injected_failures.extend(errors);
    }

    /// Take out the to-device events waiting for the given device.
    pub async fn take_to_device_events(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Vec<ToDeviceEvent> {
        let events = self
            .state
            .lock()
            .await
            .inboxes
            .get_mut(user_id)
            .and_then(|devices| devices.get_mut(device_id))
            .map(std::mem::take)
            .unwrap_or_default();

        events.into_iter().filter_map(|event| serde_json::from_value(event).ok()).collect()
    }

    /// Remove a device, as if its owner logged it out.
    pub async fn delete_device(&self, user_id: &UserId, device_id: &DeviceId) {
        let mut state = self.state.lock().await;

        if let Some(devices) = state.device_keys.get_mut(user_id) {
            devices.remove(device_id);
        }
        if let Some(devices) = state.one_time_keys.get_mut(user_id) {
            devices.remove(device_id);
        }
    }

    /// Drop every unclaimed one-time key of the given device.
    pub async fn exhaust_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        let mut state = self.state.lock().await;

        let keys = state.one_time_keys.get_mut(user_id).and_then(|d| d.get_mut(device_id));

        if let Some(keys) = keys {
            keys.clear();
        }
    }

    /// Replace the current backup version, as another client would.
    pub async fn replace_backup_version(&self, info: RoomKeyBackupInfo) -> String {
        let mut state = self.state.lock().await;
        let version = (state.backup_versions.len() + 1).to_string();
        state.backup_versions.push(RoomKeyBackupVersion { version: version.clone(), info });
        version
    }

    /// The room keys stored in the given backup version.
    pub async fn backed_up_keys(&self, version: &str) -> RoomKeyBackupPayload {
        self.state.lock().await.backups.get(version).cloned().unwrap_or_default()
    }

    /// How many one-time key claims were received.
    pub async fn claim_count(&self) -> usize {
        self.state.lock().await.claim_count
    }

    /// How many backup uploads were accepted.
    pub async fn backup_upload_count(&self) -> usize {
        self.state.lock().await.backup_upload_count
    }

    async fn injected_failure(&self) -> Result<(), TransportError> {
        match self.state.lock().await.injected_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// The [`Transport`] of a single device on a [`MockHomeserver`].
#[derive(Debug)]
pub struct MockTransport {
    server: MockHomeserver,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
}

fn to_json(value: &impl Serialize) -> Result<Value, TransportError> {
    serde_json::to_value(value)
        .map_err(|e| TransportError::Server { status: 400, message: e.to_string() })
}

fn merge_signatures(target: &mut Value, signed: &Value) {
    let Some(signatures) = signed.get("signatures").and_then(Value::as_object) else {
        return;
    };

    let target_signatures = &mut target["signatures"];
    if !target_signatures.is_object() {
        *target_signatures = json!({});
    }

    for (user_id, user_signatures) in signatures {
        let entry = &mut target_signatures[user_id.as_str()];
        if !entry.is_object() {
            *entry = json!({});
        }

        if let (Some(entry), Some(user_signatures)) =
            (entry.as_object_mut(), user_signatures.as_object())
        {
            entry.extend(user_signatures.clone());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;

        if let Some(device_keys) = &request.device_keys {
            let device_keys = to_json(device_keys)?;

            state
                .device_keys
                .entry(self.user_id.clone())
                .or_default()
                .insert(self.device_id.clone(), device_keys);
        }

        let keys = state
            .one_time_keys
            .entry(self.user_id.clone())
            .or_default()
            .entry(self.device_id.clone())
            .or_default();

        for (key_id, key) in &request.one_time_keys {
            let key = to_json(key)?;
            keys.insert(key_id.clone(), key);
        }

        let count = keys.len() as u64;

        Ok(KeysUploadResponse {
            one_time_key_counts: [(SIGNED_CURVE25519.to_owned(), count)].into(),
        })
    }

    async fn query_keys(
        &self,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError> {
        self.server.injected_failure().await?;
        let state = self.server.state.lock().await;
        let mut response = KeysQueryResponse::default();

        for (user_id, devices) in &request.device_keys {
            let published = state.device_keys.get(user_id).cloned().unwrap_or_default();
            let published = if devices.is_empty() {
                published
            } else {
                published.into_iter().filter(|(d, _)| devices.contains(d)).collect()
            };

            response.device_keys.insert(user_id.clone(), published);

            if let Some(key) = state.master_keys.get(user_id) {
                response.master_keys.insert(user_id.clone(), key.clone());
            }
            if let Some(key) = state.self_signing_keys.get(user_id) {
                response.self_signing_keys.insert(user_id.clone(), key.clone());
            }
            if *user_id == self.user_id {
                if let Some(key) = state.user_signing_keys.get(user_id) {
                    response.user_signing_keys.insert(user_id.clone(), key.clone());
                }
            }
        }

        Ok(response)
    }

    async fn claim_one_time_keys(
        &self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;
        state.claim_count += 1;

        let mut response = KeysClaimResponse::default();

        for (user_id, devices) in &request.one_time_keys {
            for (device_id, algorithm) in devices {
                let Some(keys) =
                    state.one_time_keys.get_mut(user_id).and_then(|d| d.get_mut(device_id))
                else {
                    continue;
                };

                let prefix = format!("{algorithm}:");
                let Some(key_id) = keys.keys().find(|k| k.starts_with(&prefix)).cloned() else {
                    continue;
                };

                if let Some(key) = keys.remove(&key_id) {
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id.clone(), [(key_id, key)].into());
                }
            }
        }

        Ok(response)
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;

        for (user_id, devices) in &request.messages {
            for (device_id, content) in devices {
                let event = json!({
                    "type": request.event_type,
                    "sender": self.user_id,
                    "content": content,
                });

                state
                    .inboxes
                    .entry(user_id.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_default()
                    .push(event);
            }
        }

        Ok(())
    }

    async fn upload_signing_keys(
        &self,
        request: &UploadSigningKeysRequest,
    ) -> Result<(), TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;
        let master = to_json(&request.master_key)?;
        let self_signing = to_json(&request.self_signing_key)?;
        let user_signing = to_json(&request.user_signing_key)?;

        state.master_keys.insert(self.user_id.clone(), master);
        state.self_signing_keys.insert(self.user_id.clone(), self_signing);
        state.user_signing_keys.insert(self.user_id.clone(), user_signing);

        Ok(())
    }

    async fn upload_signatures(
        &self,
        request: &SignatureUploadRequest,
    ) -> Result<(), TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;

        for (user_id, objects) in &request.signed_keys {
            for (key_id, signed) in objects {
                let device_id = <&DeviceId>::from(key_id.as_str());

                if let Some(device) =
                    state.device_keys.get_mut(user_id).and_then(|d| d.get_mut(device_id))
                {
                    merge_signatures(device, signed);
                } else if let Some(master) = state.master_keys.get_mut(user_id) {
                    let is_master = master["keys"]
                        .as_object()
                        .is_some_and(|keys| keys.values().any(|k| k.as_str() == Some(key_id)));

                    if is_master {
                        merge_signatures(master, signed);
                    }
                }
            }
        }

        Ok(())
    }

    async fn get_backup_version(&self) -> Result<Option<RoomKeyBackupVersion>, TransportError> {
        self.server.injected_failure().await?;
        Ok(self.server.state.lock().await.backup_versions.last().cloned())
    }

    async fn create_backup_version(
        &self,
        info: &RoomKeyBackupInfo,
    ) -> Result<String, TransportError> {
        self.server.injected_failure().await?;
        Ok(self.server.replace_backup_version(info.clone()).await)
    }

    async fn upload_backup_keys(&self, request: &KeysBackupRequest) -> Result<(), TransportError> {
        self.server.injected_failure().await?;
        let mut state = self.server.state.lock().await;

        let current_version = state.backup_versions.last().map(|v| v.version.clone());
        if current_version.as_deref() != Some(request.version.as_str()) {
            return Err(TransportError::WrongBackupVersion { current_version });
        }

        let backup = state.backups.entry(request.version.clone()).or_default();
        for (room_id, sessions) in &request.rooms {
            backup.entry(room_id.clone()).or_default().extend(sessions.clone());
        }
        state.backup_upload_count += 1;

        Ok(())
    }

    async fn download_backup_keys(
        &self,
        version: &str,
    ) -> Result<RoomKeyBackupPayload, TransportError> {
        self.server.injected_failure().await?;
        Ok(self.server.backed_up_keys(version).await)
    }
}
