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

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

mod inbound;
mod outbound;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub(crate) use outbound::ShareState;
pub use outbound::{
    EncryptionSettings, KeySharingPolicy, OutboundGroupSession, PickledOutboundGroupSession,
    RotationReason, ShareInfo, SharedWith,
};
pub use vodozemac::megolm::{ExportedSessionKey, SessionKey, SessionOrdering};

use crate::types::{
    deserialize_curve_key, events::forwarded_room_key::ForwardedRoomKeyContent,
    serialize_curve_key, EventEncryptionAlgorithm, SenderClaimedKeys,
};

/// An exported version of an [`InboundGroupSession`].
///
/// This can be used to share the [`InboundGroupSession`] in an exported file
/// or to forward it to another device.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    pub sender_claimed_keys: SenderClaimedKeys,

    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// A backed up version of an [`InboundGroupSession`].
///
/// The room and session IDs aren't part of the encrypted data, they are the
/// keys under which the backup stores it.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    pub sender_claimed_keys: SenderClaimedKeys,

    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl ExportedRoomKey {
    /// Attach the room and session IDs to a backed up room key.
    pub fn from_backed_up_room_key(
        room_id: OwnedRoomId,
        session_id: String,
        room_key: BackedUpRoomKey,
    ) -> Self {
        let BackedUpRoomKey {
            algorithm,
            sender_key,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        } = room_key;

        Self {
            algorithm,
            room_id,
            sender_key,
            session_id,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        }
    }

    /// The Ed25519 key the creator of the session claimed.
    pub fn sender_claimed_ed25519_key(&self) -> Ed25519PublicKey {
        self.sender_claimed_keys.ed25519
    }
}

impl From<ExportedRoomKey> for ForwardedRoomKeyContent {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            room_id: k.room_id,
            sender_key: k.sender_key,
            session_id: k.session_id,
            session_key: k.session_key.to_base64(),
            sender_claimed_ed25519_key: k.sender_claimed_keys.ed25519,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}
