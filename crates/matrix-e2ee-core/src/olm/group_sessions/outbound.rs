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

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, SessionConfig},
    Curve25519PublicKey,
};

use super::SessionKey;
use crate::{
    identities::DeviceData,
    types::{
        deserialize_curve_key,
        events::{
            room_encrypted::{MegolmPlaintext, MegolmV1AesSha2Content},
            room_key::RoomKeyContent,
            room_key_withheld::WithheldCode,
        },
        serialize_curve_key, EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;
const MINIMUM_ROTATION_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareState {
    NotShared,
    SharedButChangedSenderKey,
    Shared(u32),
}

/// Who gets a room key, and who can request it later.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeySharingPolicy {
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    pub only_allow_trusted_devices: bool,

    /// Should our own devices that we didn't verify receive room keys, when
    /// they ask for them.
    pub share_with_unverified_own_devices: bool,
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// Which devices receive the room key.
    pub sharing_strategy: KeySharingPolicy,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            sharing_strategy: Default::default(),
        }
    }
}

impl EncryptionSettings {
    /// The rotation period that is in effect.
    ///
    /// Periods below one hour are raised to one hour.
    pub fn effective_rotation_period(&self) -> Duration {
        if cfg!(feature = "_disable-minimum-rotation-period-ms") {
            self.rotation_period
        } else {
            self.rotation_period.max(MINIMUM_ROTATION_PERIOD)
        }
    }

    /// The message count after which a session is rotated, clamped between 1
    /// and 10000.
    pub fn effective_rotation_period_msgs(&self) -> u64 {
        self.rotation_period_msgs.clamp(1, 10_000)
    }
}

/// Why an outbound group session stopped being usable for new messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RotationReason {
    /// A device that received the session isn't part of the room anymore.
    MembershipChange,
    /// The session encrypted as many messages as the settings allow.
    MessageCountExceeded,
    /// The session is older than the rotation period.
    AgeExceeded,
    /// The room switched to different encryption settings.
    SettingsChanged,
}

/// Struct holding info about the share state of a outbound group session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareInfo {
    /// When the key has been shared
    Shared(SharedWith),
    /// When the session has been withheld
    Withheld(WithheldCode),
}

/// The ratchet position a device received the session at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedWith {
    /// The sender key of the device that was used to encrypt the room key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The message index that the device received.
    pub message_index: u32,
}

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    device_id: OwnedDeviceId,
    sender_key: Curve25519PublicKey,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    creation_time: SecondsSinceUnixEpoch,
    message_count: u64,
    shared: bool,
    invalidated: Option<RotationReason>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>,
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that created this session.
    ///
    /// * `sender_key` - The Curve25519 identity key of the device.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period of
    ///   the outbound group session.
    pub fn new(
        device_id: OwnedDeviceId,
        sender_key: Curve25519PublicKey,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            device_id,
            sender_key,
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: 0,
            shared: false,
            invalidated: None,
            settings: Arc::new(settings),
            shared_with_set: BTreeMap::new(),
        }
    }

    /// Encrypt a room message for the given room.
    ///
    /// The room ID becomes part of the plaintext, receivers reject the event
    /// if it shows up in a different room.
    pub async fn encrypt(
        &mut self,
        event_type: &str,
        content: Value,
    ) -> Result<MegolmV1AesSha2Content, serde_json::Error> {
        let plaintext = serde_json::to_string(&MegolmPlaintext {
            event_type: event_type.to_owned(),
            content,
            room_id: self.room_id.clone(),
        })?;

        let ciphertext = self.inner.lock().await.encrypt(&plaintext);
        self.message_count += 1;

        Ok(MegolmV1AesSha2Content {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            ciphertext,
            sender_key: self.sender_key,
            device_id: self.device_id.clone(),
            session_id: self.session_id().to_owned(),
        })
    }

    /// Check if the session needs to be rotated, at the given point in time.
    ///
    /// Returns the first reason that applies.
    pub fn rotation_reason_at(&self, now: SecondsSinceUnixEpoch) -> Option<RotationReason> {
        if let Some(reason) = self.invalidated {
            return Some(reason);
        }

        if self.message_count >= self.settings.effective_rotation_period_msgs() {
            return Some(RotationReason::MessageCountExceeded);
        }

        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(now.get().into());

        // A clock that went backwards counts as expired.
        let elapsed = now
            .checked_sub(creation_time)
            .map_or(true, |elapsed| elapsed >= self.settings.effective_rotation_period());

        elapsed.then_some(RotationReason::AgeExceeded)
    }

    /// Check if the session needs to be rotated now.
    pub fn rotation_reason(&self) -> Option<RotationReason> {
        self.rotation_reason_at(SecondsSinceUnixEpoch::now())
    }

    /// Check if the session has expired and if it should be rotated.
    pub fn expired(&self) -> bool {
        self.rotation_reason().is_some()
    }

    /// Stop using the session for new messages.
    pub fn invalidate_session(&mut self, reason: RotationReason) {
        self.invalidated.get_or_insert(reason);
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.is_some()
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Check if the session has been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// The settings the session was created with.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to to create an [`InboundGroupSession`].
    ///
    /// [`InboundGroupSession`]: super::InboundGroupSession
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// Gets the Sender Key
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The number of messages encrypted with this session.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// When the session was created.
    pub fn creation_time(&self) -> SecondsSinceUnixEpoch {
        self.creation_time
    }

    /// Get the current message index for this session.
    ///
    /// This returns the message index that will be used for the next
    /// encrypted message.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// The `m.room_key` content that shares this session.
    pub(crate) async fn as_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            session_id: self.session_id().to_owned(),
            session_key: self.session_key().await.to_base64(),
        }
    }

    /// Has the session been shared with the given device.
    pub(crate) fn is_shared_with(&self, device: &DeviceData) -> ShareState {
        self.shared_with_set
            .get(device.user_id())
            .and_then(|d| d.get(device.device_id()))
            .map(|info| match info {
                ShareInfo::Shared(s) => {
                    if Some(s.sender_key) == device.curve25519_key() {
                        ShareState::Shared(s.message_index)
                    } else {
                        ShareState::SharedButChangedSenderKey
                    }
                }
                ShareInfo::Withheld(_) => ShareState::NotShared,
            })
            .unwrap_or(ShareState::NotShared)
    }

    /// Was the session withheld from the given device with the given code.
    pub(crate) fn is_withheld_to(&self, device: &DeviceData, code: WithheldCode) -> bool {
        self.shared_with_set
            .get(device.user_id())
            .and_then(|d| d.get(device.device_id()))
            .is_some_and(|info| matches!(info, ShareInfo::Withheld(c) if *c == code))
    }

    /// Mark the session as shared with the given user/device pair, starting
    /// from some message index.
    pub(crate) fn mark_shared_with(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
        message_index: u32,
    ) {
        self.shared_with_set.entry(user_id.to_owned()).or_default().insert(
            device_id.to_owned(),
            ShareInfo::Shared(SharedWith { sender_key, message_index }),
        );
    }

    /// Record that the session was withheld from the given user/device pair.
    pub(crate) fn mark_withheld(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        code: WithheldCode,
    ) {
        self.shared_with_set
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), ShareInfo::Withheld(code));
    }

    /// The devices that received the session, or were refused it.
    pub fn shared_with(&self) -> &BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>> {
        &self.shared_with_set
    }

    /// Iterate over the devices the key was actually sent to.
    pub(crate) fn recipients(&self) -> impl Iterator<Item = (&UserId, &DeviceId)> + '_ {
        self.shared_with_set.iter().flat_map(|(user_id, devices)| {
            devices.iter().filter_map(move |(device_id, info)| {
                matches!(info, ShareInfo::Shared(_))
                    .then_some((user_id.as_ref(), device_id.as_ref()))
            })
        })
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(pickle: PickledOutboundGroupSession) -> Self {
        let inner = GroupSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id();

        Self {
            inner: Arc::new(Mutex::new(inner)),
            device_id: pickle.device_id,
            sender_key: pickle.sender_key,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: pickle.message_count,
            shared: pickle.shared,
            invalidated: pickle.invalidated,
            settings: Arc::new(pickle.settings),
            shared_with_set: pickle.shared_with_set,
        }
    }

    /// Get a serializable version of the session so it can be persisted.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledOutboundGroupSession {
            pickle,
            device_id: self.device_id.clone(),
            sender_key: self.sender_key,
            room_id: self.room_id.clone(),
            settings: self.settings.as_ref().clone(),
            creation_time: self.creation_time,
            message_count: self.message_count,
            shared: self.shared,
            invalidated: self.invalidated,
            shared_with_set: self.shared_with_set.clone(),
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

/// A pickled version of an [`OutboundGroupSession`].
///
/// Holds all the information that needs to be stored in a database to restore
/// an [`OutboundGroupSession`].
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickle of the vodozemac session.
    pub pickle: GroupSessionPickle,
    /// The device that created the session.
    pub device_id: OwnedDeviceId,
    /// The Curve25519 key of the device that created the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The timestamp when this session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Is the session shared.
    pub shared: bool,
    /// Why the session was invalidated, if it was.
    pub invalidated: Option<RotationReason>,
    /// The set of users the session has been already shared with.
    pub shared_with_set: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::{device_id, room_id, SecondsSinceUnixEpoch, UInt};
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::{EncryptionSettings, OutboundGroupSession, RotationReason};

    fn session(settings: EncryptionSettings) -> OutboundGroupSession {
        OutboundGroupSession::new(
            device_id!("ALICEDEVICE").to_owned(),
            Curve25519PublicKey::from_base64("xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc")
                .unwrap(),
            room_id!("!test:localhost"),
            settings,
        )
    }

    fn seconds_after(session: &OutboundGroupSession, secs: u64) -> SecondsSinceUnixEpoch {
        let created: u64 = session.creation_time().get().into();
        SecondsSinceUnixEpoch(UInt::new_saturating(created + secs))
    }

    #[test]
    fn settings_are_clamped() {
        let settings = EncryptionSettings {
            rotation_period: Duration::from_secs(1),
            rotation_period_msgs: 0,
            ..Default::default()
        };

        assert_eq!(settings.effective_rotation_period_msgs(), 1);

        #[cfg(not(feature = "_disable-minimum-rotation-period-ms"))]
        assert_eq!(settings.effective_rotation_period(), Duration::from_secs(3600));

        let settings = EncryptionSettings { rotation_period_msgs: 1_000_000, ..Default::default() };
        assert_eq!(settings.effective_rotation_period_msgs(), 10_000);
    }

    #[tokio::test]
    async fn rotation_after_message_count() {
        let mut session =
            session(EncryptionSettings { rotation_period_msgs: 2, ..Default::default() });

        assert_eq!(session.rotation_reason(), None);
        session.encrypt("m.room.message", json!({"body": "1"})).await.unwrap();
        assert_eq!(session.rotation_reason(), None);
        session.encrypt("m.room.message", json!({"body": "2"})).await.unwrap();
        assert_eq!(session.rotation_reason(), Some(RotationReason::MessageCountExceeded));
        assert_eq!(session.message_index().await, 2);
    }

    #[test]
    fn rotation_after_age() {
        let session = session(EncryptionSettings::default());

        let day = 24 * 3600;
        assert_eq!(session.rotation_reason_at(seconds_after(&session, 6 * day)), None);
        assert_eq!(
            session.rotation_reason_at(seconds_after(&session, 7 * day)),
            Some(RotationReason::AgeExceeded)
        );
    }

    #[test]
    fn invalidation_wins() {
        let mut session = session(EncryptionSettings::default());

        session.invalidate_session(RotationReason::MembershipChange);
        session.invalidate_session(RotationReason::AgeExceeded);

        assert!(session.invalidated());
        assert_eq!(session.rotation_reason(), Some(RotationReason::MembershipChange));
    }

    #[tokio::test]
    async fn pickle_cycle() {
        let mut session = session(EncryptionSettings::default());
        session.encrypt("m.room.message", json!({"body": "1"})).await.unwrap();
        session.mark_shared_with(
            ruma::user_id!("@bob:localhost"),
            device_id!("BOBDEVICE"),
            session.sender_key(),
            0,
        );

        let pickle = serde_json::to_string(&session.pickle().await).unwrap();
        let restored = OutboundGroupSession::from_pickle(serde_json::from_str(&pickle).unwrap());

        assert_eq!(restored.session_id(), session.session_id());
        assert_eq!(restored.message_count(), 1);
        assert_eq!(restored.message_index().await, 1);
        assert_eq!(restored.recipients().count(), 1);
    }
}
