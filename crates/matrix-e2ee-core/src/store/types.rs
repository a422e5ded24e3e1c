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

//! Data types used by the crypto store.

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::{
    backups::BackupDecryptionKey,
    gossiping::{GossipRequest, KeyShareDecision},
    identities::{DeviceData, UserIdentityData},
    olm::{
        InboundGroupSession, OutboundGroupSession, PickledAccount, PrivateCrossSigningIdentity,
        Session,
    },
    types::{events::room_key_withheld::RoomKeyWithheldContent, EventEncryptionAlgorithm},
};

/// Aggregated changes to be saved in the database.
///
/// Everything a single logical operation modified goes into one `Changes`
/// value, a store commits it as a whole or not at all.
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct Changes {
    pub account: Option<PickledAccount>,
    pub private_identity: Option<PrivateCrossSigningIdentity>,
    pub backup_version: Option<String>,
    pub backup_decryption_key: Option<BackupDecryptionKey>,
    pub sessions: Vec<Session>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    /// Outbound sessions that were rotated out, kept read-only.
    pub retired_outbound_group_sessions: Vec<OutboundGroupSession>,
    pub key_requests: Vec<GossipRequest>,
    pub key_share_decisions: Vec<KeyShareDecision>,
    pub identities: IdentityChanges,
    pub devices: DeviceChanges,
    /// Stores when a `m.room_key.withheld` is received
    pub withheld_session_info: BTreeMap<OwnedRoomId, BTreeMap<String, RoomKeyWithheldEntry>>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.private_identity.is_none()
            && self.backup_version.is_none()
            && self.backup_decryption_key.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.retired_outbound_group_sessions.is_empty()
            && self.key_requests.is_empty()
            && self.key_share_decisions.is_empty()
            && self.identities.is_empty()
            && self.devices.is_empty()
            && self.withheld_session_info.is_empty()
    }

    /// Merge another set of changes into this one, later entries win.
    pub fn extend(&mut self, other: Changes) {
        if other.account.is_some() {
            self.account = other.account;
        }
        if other.private_identity.is_some() {
            self.private_identity = other.private_identity;
        }
        if other.backup_version.is_some() {
            self.backup_version = other.backup_version;
        }
        if other.backup_decryption_key.is_some() {
            self.backup_decryption_key = other.backup_decryption_key;
        }

        self.sessions.extend(other.sessions);
        self.inbound_group_sessions.extend(other.inbound_group_sessions);
        self.outbound_group_sessions.extend(other.outbound_group_sessions);
        self.retired_outbound_group_sessions.extend(other.retired_outbound_group_sessions);
        self.key_requests.extend(other.key_requests);
        self.key_share_decisions.extend(other.key_share_decisions);
        self.identities.new.extend(other.identities.new);
        self.identities.changed.extend(other.identities.changed);
        self.devices.new.extend(other.devices.new);
        self.devices.changed.extend(other.devices.changed);
        self.devices.deleted.extend(other.devices.deleted);

        for (room_id, entries) in other.withheld_session_info {
            self.withheld_session_info.entry(room_id).or_default().extend(entries);
        }
    }
}

/// New and changed user identities of a key query.
#[derive(Debug, Clone, Default)]
pub struct IdentityChanges {
    pub new: Vec<UserIdentityData>,
    pub changed: Vec<UserIdentityData>,
}

impl IdentityChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty()
    }
}

/// New, changed and removed devices of a key query.
#[derive(Debug, Clone, Default)]
pub struct DeviceChanges {
    pub new: Vec<DeviceData>,
    pub changed: Vec<DeviceData>,
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    /// Are there any changes stored or is this an empty `DeviceChanges`.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A user for which we are tracking the list of devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedUser {
    /// The user ID of the user.
    pub user_id: OwnedUserId,
    /// Is the list of devices we hold for the user considered to be out of
    /// date, a key query needs to be sent for outdated users.
    pub dirty: bool,
}

/// A `m.room_key.withheld` notice we received, together with its sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyWithheldEntry {
    /// The user that sent the notice.
    pub sender: OwnedUserId,
    /// The content of the notice.
    pub content: RoomKeyWithheldContent,
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Stored versions of the backup keys.
#[derive(Default, Clone, Debug)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys.
    pub decryption_key: Option<BackupDecryptionKey>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// Information on a room key that has been received or imported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyInfo {
    /// The messaging algorithm the key is used for.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the key is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(
        serialize_with = "crate::types::serialize_curve_key",
        deserialize_with = "crate::types::deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,
}

impl From<&InboundGroupSession> for RoomKeyInfo {
    fn from(group_session: &InboundGroupSession) -> Self {
        RoomKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: group_session.room_id().to_owned(),
            sender_key: group_session.sender_key(),
            session_id: group_session.session_id().to_owned(),
        }
    }
}
