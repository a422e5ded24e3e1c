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

//! Types for the to-device and room events the E2EE core sends and receives.

pub mod forwarded_room_key;
pub mod olm_v1;
pub mod room_encrypted;
pub mod room_key;
pub mod room_key_request;
pub mod room_key_withheld;

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};

use self::{
    olm_v1::OlmV1Curve25519AesSha2Content, room_key_request::RoomKeyRequestContent,
    room_key_withheld::RoomKeyWithheldContent,
};

/// A to-device event the crypto layer handles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToDeviceEvent {
    /// An Olm encrypted event.
    #[serde(rename = "m.room.encrypted")]
    Encrypted {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The encrypted content.
        content: OlmV1Curve25519AesSha2Content,
    },

    /// A request for a room key, or its cancellation.
    #[serde(rename = "m.room_key_request")]
    RoomKeyRequest {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The request.
        content: RoomKeyRequestContent,
    },

    /// A notice that a room key won't be shared with us.
    #[serde(rename = "m.room_key.withheld")]
    RoomKeyWithheld {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The notice.
        content: RoomKeyWithheldContent,
    },
}

impl ToDeviceEvent {
    /// The sender of the event.
    pub fn sender(&self) -> &UserId {
        match self {
            ToDeviceEvent::Encrypted { sender, .. }
            | ToDeviceEvent::RoomKeyRequest { sender, .. }
            | ToDeviceEvent::RoomKeyWithheld { sender, .. } => sender,
        }
    }

    /// The event type of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ToDeviceEvent::Encrypted { .. } => "m.room.encrypted",
            ToDeviceEvent::RoomKeyRequest { .. } => "m.room_key_request",
            ToDeviceEvent::RoomKeyWithheld { .. } => "m.room_key.withheld",
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use serde_json::json;

    use super::{room_key_request::KeyRequestAction, ToDeviceEvent};

    #[test]
    fn to_device_events_are_tagged_by_type() {
        let json = json!({
            "type": "m.room_key_request",
            "sender": "@alice:localhost",
            "content": {
                "action": "request",
                "body": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "room_id": "!test:localhost",
                    "sender_key": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
                    "session_id": "ZFD6+OmV7fVCsJ7Gap8UnORH8EnmiAkes8FAvQuCw/I"
                },
                "requesting_device_id": "ALICEDEVICE",
                "request_id": "1495474790150.19"
            }
        });

        let event: ToDeviceEvent = serde_json::from_value(json).unwrap();

        assert_eq!(event.event_type(), "m.room_key_request");
        assert_let!(ToDeviceEvent::RoomKeyRequest { content, .. } = event);
        assert_eq!(content.action, KeyRequestAction::Request);
        assert!(content.body.is_some());
    }
}
