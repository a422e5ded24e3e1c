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

//! Requests the crypto core asks the transport to send, and the responses it
//! expects back.
//!
//! Values the homeserver relays from other users (device keys, cross-signing
//! keys, one-time keys) are kept as raw JSON in responses. Every one of them
//! is validated on its own, so a single malformed entry can't poison the
//! rest of the response.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CrossSigningKey, DeviceKeys, RoomKeyBackupPayload, SignedKey};

/// The algorithm name under which signed one-time keys are published.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Publish our device keys and one-time keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Our device keys, only set until the server knows them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys, keyed by `signed_curve25519:<key id>`.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

/// The server's answer to a [`KeysUploadRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many unclaimed one-time keys the server holds, per algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// Ask for the current device list and cross-signing keys of some users.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users to query, an empty device list means all devices.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

impl KeysQueryRequest {
    /// Query all devices of the given users.
    pub fn new(users: impl IntoIterator<Item = OwnedUserId>) -> Self {
        Self { device_keys: users.into_iter().map(|u| (u, Vec::new())).collect() }
    }
}

/// The server's answer to a [`KeysQueryRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The devices of every queried user.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
    /// Published master keys.
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, Value>,
    /// Published self-signing keys.
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, Value>,
    /// Published user-signing keys, only ever returned for our own user.
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, Value>,
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Claim one-time keys so Olm sessions can be created.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The key algorithm to claim, per device.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
}

/// The server's answer to a [`KeysClaimRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, keyed by `<algorithm>:<key id>`.
    #[serde(default)]
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, Value>>>,
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Customized version of the `/sendToDevice` request body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// The content of the events to send, per user and device.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new, empty, request for the given event type.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: TransactionId::new(),
            messages: BTreeMap::new(),
        }
    }

    /// Add a message for a single device.
    pub fn add_message(&mut self, user_id: OwnedUserId, device_id: OwnedDeviceId, content: Value) {
        self.messages.entry(user_id).or_default().insert(device_id, content);
    }

    /// Gets the total number of messages in the request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }

    /// Is the request without any messages.
    pub fn is_empty(&self) -> bool {
        self.message_count() == 0
    }
}

/// Publish our cross-signing keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSigningKeysRequest {
    /// The master key.
    pub master_key: CrossSigningKey,
    /// The self-signing key.
    pub self_signing_key: CrossSigningKey,
    /// The user-signing key.
    pub user_signing_key: CrossSigningKey,
}

/// Publish signatures we made over other keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignatureUploadRequest {
    /// The signed objects, each with only our new signatures attached, keyed
    /// by user and then by device ID or public key.
    pub signed_keys: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}

/// Upload a batch of encrypted room keys to a backup version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The backup version the keys are encrypted for.
    pub version: String,
    /// The encrypted keys, by room and session.
    pub rooms: RoomKeyBackupPayload,
}

impl KeysBackupRequest {
    /// The number of room keys in the request.
    pub fn key_count(&self) -> usize {
        self.rooms.values().map(|sessions| sessions.len()).sum()
    }
}
