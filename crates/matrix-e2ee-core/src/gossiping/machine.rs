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

//! Room key requests, the answers we give to them and the forwarded keys we
//! accept.
//!
//! A request is answered after these checks, in order:
//!
//! 1. The requesting device is known, its owner is in the room and, for
//!    devices of other users, we sent them the session ourselves. Otherwise
//!    `m.unauthorised`.
//! 2. We have the session. Otherwise `m.unavailable`.
//! 3. The device passes the sharing policy. Otherwise `m.blacklisted` or
//!    `m.unverified`.
//! 4. The key is forwarded over Olm, or `m.no_olm` if no Olm session could be
//!    established.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{DeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{GossipRequest, KeyShareDecision, KeyShareOutcome};
use crate::{
    error::{EventError, OlmError, OlmResult},
    identities::{DeviceData, TrustEngine},
    olm::{InboundGroupSession, KeySharingPolicy, ShareState},
    requests::ToDeviceRequest,
    session_manager::{GroupSessionManager, ImportOutcome, OlmDecryptionInfo, SessionManager},
    store::{Changes, Result as StoreResult, RoomKeyWithheldEntry, Store},
    transport::{retry_transient, RetrySettings, Transport},
    types::{
        events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            olm_v1::OlmPayloadContent,
            room_encrypted::EncryptedRoomEvent,
            room_key_request::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
        },
        EventEncryptionAlgorithm,
    },
};

/// How a request gets answered, before the answer is sent.
enum Verdict {
    Share { device: DeviceData, session: InboundGroupSession, message_index: u32 },
    Withhold(WithheldCode),
}

#[derive(Debug, Clone)]
pub(crate) struct GossipMachine {
    store: Store,
    sessions: SessionManager,
    groups: GroupSessionManager,
    trust: TrustEngine,
    transport: Arc<dyn Transport>,
    retry: RetrySettings,
    policy: KeySharingPolicy,
    room_members: Arc<RwLock<BTreeMap<OwnedRoomId, BTreeSet<OwnedUserId>>>>,
}

impl GossipMachine {
    pub fn new(
        store: Store,
        sessions: SessionManager,
        groups: GroupSessionManager,
        transport: Arc<dyn Transport>,
        retry: RetrySettings,
        policy: KeySharingPolicy,
    ) -> Self {
        Self {
            trust: TrustEngine::new(store.clone()),
            store,
            sessions,
            groups,
            transport,
            retry,
            policy,
            room_members: Default::default(),
        }
    }

    fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    fn device_id(&self) -> &DeviceId {
        self.store.device_id()
    }

    /// Remember who is in the room, key requests of other users are only
    /// answered for rooms they are in.
    pub async fn set_room_members(&self, room_id: &RoomId, members: &[OwnedUserId]) {
        self.room_members
            .write()
            .await
            .insert(room_id.to_owned(), members.iter().cloned().collect());
    }

    async fn is_room_member(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        user_id == self.user_id()
            || self.room_members.read().await.get(room_id).is_some_and(|m| m.contains(user_id))
    }

    async fn send(&self, request: ToDeviceRequest) -> OlmResult<()> {
        if request.is_empty() {
            return Ok(());
        }

        let transport = &self.transport;
        let request = &request;
        retry_transient(&self.retry, move || transport.send_to_device(request)).await?;

        Ok(())
    }

    /// Ask our other devices, and the device that sent the event, for the
    /// room key of an event we can't decrypt.
    ///
    /// Only one request exists per session. Returns `true` if a new request
    /// was created.
    #[instrument(
        skip_all,
        fields(room_id = ?event.room_id, session_id = %event.content.session_id)
    )]
    pub async fn request_key(&self, event: &EncryptedRoomEvent) -> OlmResult<bool> {
        let info = RequestedKeyInfo::new(
            event.room_id.clone(),
            event.content.sender_key,
            event.content.session_id.clone(),
        );

        if self.store.get_key_request_by_info(&info).await?.is_some() {
            debug!("The room key was already requested");
            return Ok(false);
        }

        let mut recipients: BTreeMap<OwnedUserId, BTreeSet<_>> = BTreeMap::new();

        for device in self.store.get_user_devices(self.user_id()).await?.into_values() {
            if device.device_id() != self.device_id() && !device.is_deleted() {
                recipients
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .insert(device.device_id().to_owned());
            }
        }

        if *event.sender != *self.user_id() || *event.content.device_id != *self.device_id() {
            recipients
                .entry(event.sender.clone())
                .or_default()
                .insert(event.content.device_id.clone());
        }

        if recipients.is_empty() {
            return Ok(false);
        }

        let request = GossipRequest::new(info, recipients);
        info!(request_id = request.request_id.as_str(), "Requesting a room key");

        let changes = Changes { key_requests: vec![request], ..Default::default() };
        self.store.save_changes(changes).await?;

        self.send_outgoing_requests().await?;

        Ok(true)
    }

    /// Send the key requests that weren't sent yet.
    pub async fn send_outgoing_requests(&self) -> OlmResult<usize> {
        let requests = self.store.get_unsent_key_requests().await?;
        let count = requests.len();

        for mut request in requests {
            self.send(request.to_request(self.device_id())?).await?;

            request.sent_out = true;
            let changes = Changes { key_requests: vec![request], ..Default::default() };
            self.store.save_changes(changes).await?;
        }

        Ok(count)
    }

    /// Cancel our request for a room key its creator just sent us.
    pub async fn room_key_received(&self, info: &RequestedKeyInfo) -> OlmResult<()> {
        if let Some(request) = self.store.get_key_request_by_info(info).await? {
            debug!(
                request_id = request.request_id.as_str(),
                "Received a room key we requested, cancelling the request"
            );
            self.mark_as_done(&request).await?;
        }

        Ok(())
    }

    async fn mark_as_done(&self, request: &GossipRequest) -> OlmResult<()> {
        if request.sent_out {
            self.send(request.to_cancellation(self.device_id())?).await?;
        }

        self.store.delete_outgoing_key_request(&request.request_id).await?;

        Ok(())
    }

    /// Was the session shared with the device when it was sent out, and from
    /// which index.
    async fn shared_index(
        &self,
        device: &DeviceData,
        info: &RequestedKeyInfo,
    ) -> StoreResult<Option<u32>> {
        let current = self.store.get_outbound_group_session(&info.room_id).await?;
        let retired = self.store.get_retired_outbound_group_sessions(&info.room_id).await?;

        let outbound = current
            .into_iter()
            .chain(retired)
            .find(|s| s.session_id() == info.session_id && s.sender_key() == info.sender_key);

        Ok(outbound.and_then(|s| match s.is_shared_with(device) {
            ShareState::Shared(index) => Some(index),
            ShareState::NotShared | ShareState::SharedButChangedSenderKey => None,
        }))
    }

    async fn decide(
        &self,
        sender: &UserId,
        requesting_device_id: &DeviceId,
        info: &RequestedKeyInfo,
    ) -> OlmResult<Verdict> {
        let own_device = sender == self.user_id();

        let device = self
            .store
            .get_device(sender, requesting_device_id)
            .await?
            .filter(|d| !d.is_deleted());

        let Some(device) = device else {
            return Ok(Verdict::Withhold(WithheldCode::Unauthorised));
        };

        if !self.is_room_member(&info.room_id, sender).await {
            return Ok(Verdict::Withhold(WithheldCode::Unauthorised));
        }

        let shared_index = if own_device {
            None
        } else {
            match self.shared_index(&device, info).await? {
                Some(index) => Some(index),
                None => return Ok(Verdict::Withhold(WithheldCode::Unauthorised)),
            }
        };

        let session = self
            .store
            .get_inbound_group_session(&info.room_id, &info.session_id)
            .await?
            .filter(|s| s.sender_key() == info.sender_key);

        let Some(session) = session else {
            return Ok(Verdict::Withhold(WithheldCode::Unavailable));
        };

        if device.is_blacklisted() {
            return Ok(Verdict::Withhold(WithheldCode::Blacklisted));
        }

        let trusted = if own_device {
            self.policy.share_with_unverified_own_devices
                || self.trust.is_device_verified(&device).await?
        } else {
            !self.policy.only_allow_trusted_devices
                || self.trust.is_device_verified(&device).await?
        };

        if !trusted {
            return Ok(Verdict::Withhold(WithheldCode::Unverified));
        }

        let message_index =
            shared_index.unwrap_or_default().max(session.first_known_index());

        Ok(Verdict::Share { device, session, message_index })
    }

    async fn forward_key(
        &self,
        device: &DeviceData,
        session: &InboundGroupSession,
        message_index: u32,
    ) -> OlmResult<Option<WithheldCode>> {
        let export = session.export_at_index(message_index).await;
        let content = OlmPayloadContent::ForwardedRoomKey(export.into());

        let encrypted = match self.sessions.encrypt(device, &content).await {
            Ok(encrypted) => encrypted,
            Err(OlmError::MissingSession | OlmError::SessionCreation(_)) => {
                return Ok(Some(WithheldCode::NoOlm));
            }
            Err(e) => return Err(e),
        };

        let mut request = ToDeviceRequest::new("m.room.encrypted");
        request.add_message(
            device.user_id().to_owned(),
            device.device_id().to_owned(),
            serde_json::to_value(&encrypted.content)?,
        );
        self.send(request).await?;

        Ok(None)
    }

    async fn send_withheld(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        info: &RequestedKeyInfo,
        code: WithheldCode,
    ) -> OlmResult<()> {
        let content = RoomKeyWithheldContent::new(
            code,
            info.room_id.clone(),
            info.session_id.clone(),
            info.sender_key,
            self.device_id().to_owned(),
        );

        let mut request = ToDeviceRequest::new("m.room_key.withheld");
        let content = serde_json::to_value(content)?;
        request.add_message(user_id.to_owned(), device_id.to_owned(), content);

        self.send(request).await
    }

    /// Answer a room key request.
    ///
    /// Every request ends with exactly one recorded decision, either the key
    /// was forwarded or a withheld notice went out. A request that gets the
    /// same answer as an earlier one from the same device isn't answered
    /// again, the recorded decision is returned instead.
    #[instrument(skip_all, fields(sender = %sender, device_id = %content.requesting_device_id))]
    pub async fn receive_key_request(
        &self,
        sender: &UserId,
        content: &RoomKeyRequestContent,
    ) -> OlmResult<Option<KeyShareDecision>> {
        let info = match (&content.action, &content.body) {
            (KeyRequestAction::Request, Some(info)) => info,
            (KeyRequestAction::Request, None) => {
                warn!("Received a key request without the requested key info");
                return Ok(None);
            }
            (KeyRequestAction::RequestCancellation, _) => return Ok(None),
        };

        let device_id: &DeviceId = &content.requesting_device_id;

        if sender == self.user_id() && device_id == self.device_id() {
            return Ok(None);
        }

        let previous = self
            .store
            .get_key_share_decision(&KeyShareDecision::key_for(sender, device_id, info))
            .await?;

        if previous.as_ref().is_some_and(|p| matches!(p.outcome, KeyShareOutcome::Shared { .. })) {
            debug!("The room key was already forwarded to the device");
            return Ok(previous);
        }

        let outcome = match self.decide(sender, device_id, info).await? {
            Verdict::Withhold(code) => KeyShareOutcome::Withheld(code),
            Verdict::Share { device, session, message_index } => {
                match self.forward_key(&device, &session, message_index).await? {
                    None => KeyShareOutcome::Shared { message_index },
                    Some(code) => KeyShareOutcome::Withheld(code),
                }
            }
        };

        if let KeyShareOutcome::Withheld(code) = outcome {
            if previous.as_ref().is_some_and(|p| p.outcome == outcome) {
                debug!(?code, "The device was already told that it won't get the room key");
                return Ok(previous);
            }

            self.send_withheld(sender, device_id, info, code).await?;
        }

        info!(
            ?outcome,
            room_id = ?info.room_id,
            session_id = info.session_id.as_str(),
            "Answered a key request"
        );

        let decision = KeyShareDecision {
            user_id: sender.to_owned(),
            device_id: device_id.to_owned(),
            request_id: content.request_id.clone(),
            info: info.clone(),
            outcome,
        };

        let changes = Changes { key_share_decisions: vec![decision.clone()], ..Default::default() };
        self.store.save_changes(changes).await?;

        Ok(Some(decision))
    }

    /// Store a notice telling us why we won't get a room key.
    pub async fn receive_withheld(
        &self,
        sender: &UserId,
        content: &RoomKeyWithheldContent,
    ) -> StoreResult<()> {
        info!(
            sender = %sender,
            room_id = ?content.room_id,
            session_id = content.session_id.as_str(),
            code = content.code.as_str(),
            "Received a withheld notice"
        );

        let entry = RoomKeyWithheldEntry { sender: sender.to_owned(), content: content.clone() };
        let mut changes = Changes::default();
        changes
            .withheld_session_info
            .entry(content.room_id.clone())
            .or_default()
            .insert(content.session_id.clone(), entry);

        self.store.save_changes(changes).await
    }

    /// Accept a forwarded room key.
    ///
    /// Keys we didn't ask for are dropped, as are keys forwarded by anyone but
    /// one of our verified devices or the device that created the session.
    /// Returns `None` if the key was dropped.
    #[instrument(
        skip_all,
        fields(room_id = ?content.room_id, session_id = content.session_id.as_str())
    )]
    pub async fn receive_forwarded_room_key(
        &self,
        decrypted: &OlmDecryptionInfo,
        content: &ForwardedRoomKeyContent,
    ) -> OlmResult<Option<ImportOutcome>> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let info = RequestedKeyInfo::new(
            content.room_id.clone(),
            content.sender_key,
            content.session_id.clone(),
        );

        let Some(request) = self.store.get_key_request_by_info(&info).await? else {
            warn!(
                sender = %decrypted.sender,
                "Received a forwarded room key that we didn't request"
            );
            return Ok(None);
        };

        let forwarder =
            self.store.get_device_from_curve_key(&decrypted.sender, decrypted.sender_key).await?;

        let trusted = match &forwarder {
            Some(device) if device.curve25519_key() == Some(content.sender_key) => true,
            Some(device) if device.user_id() == self.user_id() => {
                self.trust.is_device_verified(device).await?
            }
            _ => false,
        };

        if !trusted {
            warn!(
                sender = %decrypted.sender,
                "Received a forwarded room key from a device we don't trust to forward it"
            );
            return Ok(None);
        }

        let session = InboundGroupSession::from_forwarded_key(decrypted.sender_key, content)?;
        let outcome = self.groups.import_session(session).await?;

        if outcome.is_new() {
            self.mark_as_done(&request).await?;
        }

        info!(?outcome, "Received a forwarded room key");

        Ok(Some(outcome))
    }
}
