// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Types for the `m.room_key.withheld` events.

use ruma::{OwnedDeviceId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// A machine-readable code for why the megolm key was not sent.
///
/// Normally sent as the payload of an [`RoomKeyWithheldContent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithheldCode {
    /// the user/device was blacklisted.
    #[serde(rename = "m.blacklisted")]
    Blacklisted,

    /// the user/devices is unverified.
    #[serde(rename = "m.unverified")]
    Unverified,

    /// The user/device is not allowed have the key. For example, this would
    /// usually be sent in response to a key request if the user was not in
    /// the room when the message was sent.
    #[serde(rename = "m.unauthorised")]
    Unauthorised,

    /// Sent in reply to a key request if the device that the key is requested
    /// from does not have the requested key.
    #[serde(rename = "m.unavailable")]
    Unavailable,

    /// An olm session could not be established.
    /// This may happen, for example, if the sender was unable to obtain a
    /// one-time key from the recipient.
    #[serde(rename = "m.no_olm")]
    NoOlm,
}

impl WithheldCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
        }
    }
}

impl std::fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
        };

        f.write_str(string)
    }
}

/// The `m.room_key.withheld` event content.
///
/// Devices that purposely do not send megolm keys to a device may instead send
/// an `m.room_key.withheld` event as a to-device message to the device to
/// indicate that it should not expect to receive keys for the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyWithheldContent {
    /// The encryption algorithm of the withheld session.
    pub algorithm: EventEncryptionAlgorithm,

    /// The machine-readable reason for withholding the key.
    pub code: WithheldCode,

    /// A human-readable reason for withholding the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// The room where the key is used.
    pub room_id: OwnedRoomId,

    /// The ID of the session.
    pub session_id: String,

    /// The Curve25519 key of the device that created the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The device that withheld the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_device: Option<OwnedDeviceId>,
}

impl RoomKeyWithheldContent {
    /// Create a new withheld content for a Megolm session.
    pub fn new(
        code: WithheldCode,
        room_id: OwnedRoomId,
        session_id: String,
        sender_key: Curve25519PublicKey,
        from_device: OwnedDeviceId,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            reason: Some(code.to_string()),
            code,
            room_id,
            session_id,
            sender_key,
            from_device: Some(from_device),
        }
    }
}
