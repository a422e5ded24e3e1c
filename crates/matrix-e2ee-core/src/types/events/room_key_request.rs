// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Types for `m.room_key_request` to-device events.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// What a key request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// Request a room key.
    Request,
    /// Cancel a previously sent request.
    RequestCancellation,
}

/// The `m.room_key_request` content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a new key request or a cancellation of a previous
    /// request.
    pub action: KeyRequestAction,

    /// Information about the requested key, only present for requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,

    /// ID of the device requesting the key.
    pub requesting_device_id: OwnedDeviceId,

    /// A random string uniquely identifying the request for a key.
    pub request_id: OwnedTransactionId,
}

/// The session a key request is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The encryption algorithm the requested key in this event is to be used
    /// with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the key is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// Create the info for a Megolm session.
    pub fn new(room_id: OwnedRoomId, sender_key: Curve25519PublicKey, session_id: String) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            sender_key,
            session_id,
        }
    }

    /// A stable key identifying the requested session, used to deduplicate
    /// requests.
    pub fn as_key(&self) -> String {
        format!("{}|{}|{}", self.room_id, self.sender_key.to_base64(), self.session_id)
    }
}
