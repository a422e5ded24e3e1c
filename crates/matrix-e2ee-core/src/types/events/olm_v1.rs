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

//! Module containing the payloads that travel inside the
//! `m.olm.v1.curve25519-aes-sha2` encryption scheme.

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use super::{forwarded_room_key::ForwardedRoomKeyContent, room_key::RoomKeyContent};
use crate::{
    error::EventError,
    types::{
        deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key,
        serialize_ed25519_key, EventEncryptionAlgorithm,
    },
};

/// The Ed25519 key a payload is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmV1Keys {
    /// The Ed25519 key.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// The plaintext of an Olm encrypted to-device message.
///
/// Besides the inner event the payload binds the message to the identities of
/// both ends, a relayed or re-addressed message fails these checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmPayload {
    /// The sender of the event.
    pub sender: OwnedUserId,

    /// The intended recipient of the event.
    pub recipient: OwnedUserId,

    /// The Ed25519 key of the sending device.
    pub keys: OlmV1Keys,

    /// The Ed25519 key of the receiving device.
    pub recipient_keys: OlmV1Keys,

    /// The room the inner event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the inner event.
    pub content: Value,
}

impl DecryptedOlmPayload {
    /// Parse the inner event.
    pub fn content(&self) -> Result<OlmPayloadContent, serde_json::Error> {
        OlmPayloadContent::from_parts(&self.event_type, self.content.clone())
    }

    /// Check that the payload is addressed to us and was sent by the device
    /// owning the given signing key.
    pub fn check_binding(
        &self,
        sender: &OwnedUserId,
        own_user_id: &OwnedUserId,
        own_signing_key: Ed25519PublicKey,
        sender_signing_key: Option<Ed25519PublicKey>,
    ) -> Result<(), EventError> {
        if &self.sender != sender {
            Err(EventError::MismatchedSender(self.sender.clone(), sender.clone()))
        } else if &self.recipient != own_user_id {
            Err(EventError::MismatchedRecipient(self.recipient.clone(), own_user_id.clone()))
        } else if self.recipient_keys.ed25519 != own_signing_key {
            Err(EventError::MismatchedRecipientKeys)
        } else if let Some(key) = sender_signing_key.filter(|k| *k != self.keys.ed25519) {
            Err(EventError::MismatchedKeys(Box::new(key), Box::new(self.keys.ed25519)))
        } else {
            Ok(())
        }
    }
}

/// The inner events we send and accept over Olm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OlmPayloadContent {
    /// A Megolm session shared by its creator.
    RoomKey(RoomKeyContent),
    /// A Megolm session forwarded in reply to a key request.
    ForwardedRoomKey(ForwardedRoomKeyContent),
    /// An empty event used to replace a wedged session.
    Dummy,
}

impl OlmPayloadContent {
    /// The event type of the content.
    pub fn event_type(&self) -> &'static str {
        match self {
            OlmPayloadContent::RoomKey(_) => "m.room_key",
            OlmPayloadContent::ForwardedRoomKey(_) => "m.forwarded_room_key",
            OlmPayloadContent::Dummy => "m.dummy",
        }
    }

    /// The room the content concerns.
    pub fn room_id(&self) -> Option<OwnedRoomId> {
        match self {
            OlmPayloadContent::RoomKey(c) => Some(c.room_id.clone()),
            OlmPayloadContent::ForwardedRoomKey(c) => Some(c.room_id.clone()),
            OlmPayloadContent::Dummy => None,
        }
    }

    /// Serialize the content into JSON.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            OlmPayloadContent::RoomKey(c) => serde_json::to_value(c),
            OlmPayloadContent::ForwardedRoomKey(c) => serde_json::to_value(c),
            OlmPayloadContent::Dummy => Ok(Value::Object(Default::default())),
        }
    }

    fn from_parts(event_type: &str, content: Value) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            "m.room_key" => OlmPayloadContent::RoomKey(serde_json::from_value(content)?),
            "m.forwarded_room_key" => {
                OlmPayloadContent::ForwardedRoomKey(serde_json::from_value(content)?)
            }
            "m.dummy" => OlmPayloadContent::Dummy,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported decrypted event type {other}"
                )))
            }
        })
    }
}

/// The content of an `m.room.encrypted` to-device event using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The encryption algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the sender.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The encrypted payloads, keyed by the Curve25519 key of the recipient
    /// device.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

impl OlmV1Curve25519AesSha2Content {
    /// Create a content carrying a single ciphertext.
    pub fn new(
        sender_key: Curve25519PublicKey,
        recipient_key: Curve25519PublicKey,
        message: OlmMessage,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key,
            ciphertext: [(recipient_key.to_base64(), message)].into(),
        }
    }

    /// Take out the ciphertext addressed to the given key.
    pub fn message_for(&self, recipient_key: Curve25519PublicKey) -> Option<&OlmMessage> {
        self.ciphertext.get(&recipient_key.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::user_id;
    use serde_json::json;
    use vodozemac::Ed25519PublicKey;

    use super::{DecryptedOlmPayload, OlmPayloadContent};
    use crate::error::EventError;

    const SENDER_KEY: &str = "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4";
    const RECIPIENT_KEY: &str = "n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY";

    fn payload() -> DecryptedOlmPayload {
        serde_json::from_value(json!({
            "sender": "@alice:localhost",
            "recipient": "@bob:localhost",
            "keys": { "ed25519": SENDER_KEY },
            "recipient_keys": { "ed25519": RECIPIENT_KEY },
            "room_id": "!test:localhost",
            "type": "m.room_key",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!test:localhost",
                "session_id": "ZFD6+OmV7fVCsJ7Gap8UnORH8EnmiAkes8FAvQuCw/I",
                "session_key": "AgAAAADNp1EbxXYOGmJtyX4AkD1bvJvAUyPkbIaKxtnGKjv"
            }
        }))
        .unwrap()
    }

    #[test]
    fn content_is_parsed_by_type() {
        assert_let!(Ok(OlmPayloadContent::RoomKey(content)) = payload().content());
        assert_eq!(content.room_id, "!test:localhost");
    }

    #[test]
    fn binding_is_checked() {
        let payload = payload();
        let alice = user_id!("@alice:localhost").to_owned();
        let bob = user_id!("@bob:localhost").to_owned();
        let sender_key = Ed25519PublicKey::from_base64(SENDER_KEY).unwrap();
        let recipient_key = Ed25519PublicKey::from_base64(RECIPIENT_KEY).unwrap();

        payload.check_binding(&alice, &bob, recipient_key, Some(sender_key)).unwrap();

        assert_let!(
            Err(EventError::MismatchedSender(..)) =
                payload.check_binding(&bob, &bob, recipient_key, Some(sender_key))
        );
        assert_let!(
            Err(EventError::MismatchedRecipient(..)) =
                payload.check_binding(&alice, &alice, recipient_key, Some(sender_key))
        );
        assert_let!(
            Err(EventError::MismatchedRecipientKeys) =
                payload.check_binding(&alice, &bob, sender_key, Some(sender_key))
        );
        assert_let!(
            Err(EventError::MismatchedKeys(..)) =
                payload.check_binding(&alice, &bob, recipient_key, Some(recipient_key))
        );
    }
}
