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

//! Types for `m.room.encrypted` room events using the `m.megolm.v1.aes-sha2`
//! algorithm.

use ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::MegolmMessage, Curve25519PublicKey};

use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// The content of an `m.room.encrypted` room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The encryption algorithm, always `m.megolm.v1.aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,

    /// The encrypted content of the event.
    pub ciphertext: MegolmMessage,

    /// The Curve25519 key of the sender.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the sending device.
    pub device_id: OwnedDeviceId,

    /// The ID of the session used to encrypt the message.
    pub session_id: String,
}

impl MegolmV1AesSha2Content {
    /// The ratchet index the message was encrypted at.
    pub fn ratchet_index(&self) -> u32 {
        self.ciphertext.message_index()
    }
}

/// An encrypted room event as it arrives from the sync loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedRoomEvent {
    /// The globally unique ID of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,

    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The room the event was sent to.
    pub room_id: OwnedRoomId,

    /// The encrypted content.
    pub content: MegolmV1AesSha2Content,
}

/// The plaintext that gets encrypted with a Megolm session.
///
/// The room ID is part of the plaintext so a homeserver can't move an event
/// into a different room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmPlaintext {
    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the inner event.
    pub content: Value,

    /// The room the event was sent to.
    pub room_id: OwnedRoomId,
}
