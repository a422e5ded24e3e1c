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

mod machine;

use std::collections::{BTreeMap, BTreeSet};

pub(crate) use machine::GossipMachine;
use ruma::{DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    requests::ToDeviceRequest,
    types::events::{
        room_key_request::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
        room_key_withheld::WithheldCode,
    },
};

/// A struct describing an outgoing key request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRequest {
    /// The unique id of the key request.
    pub request_id: OwnedTransactionId,
    /// The session we're asking for.
    pub info: RequestedKeyInfo,
    /// The devices the request goes to.
    pub recipients: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    /// Has the request been sent out.
    pub sent_out: bool,
}

impl GossipRequest {
    pub(crate) fn new(
        info: RequestedKeyInfo,
        recipients: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    ) -> Self {
        Self { request_id: TransactionId::new(), info, recipients, sent_out: false }
    }

    fn to_device_request(
        &self,
        content: &RoomKeyRequestContent,
    ) -> serde_json::Result<ToDeviceRequest> {
        let content = serde_json::to_value(content)?;
        let mut request = ToDeviceRequest::new("m.room_key_request");

        for (user_id, devices) in &self.recipients {
            for device_id in devices {
                request.add_message(user_id.clone(), device_id.clone(), content.clone());
            }
        }

        Ok(request)
    }

    pub(crate) fn to_request(
        &self,
        own_device_id: &DeviceId,
    ) -> serde_json::Result<ToDeviceRequest> {
        self.to_device_request(&RoomKeyRequestContent {
            action: KeyRequestAction::Request,
            body: Some(self.info.clone()),
            requesting_device_id: own_device_id.to_owned(),
            request_id: self.request_id.clone(),
        })
    }

    pub(crate) fn to_cancellation(
        &self,
        own_device_id: &DeviceId,
    ) -> serde_json::Result<ToDeviceRequest> {
        self.to_device_request(&RoomKeyRequestContent {
            action: KeyRequestAction::RequestCancellation,
            body: None,
            requesting_device_id: own_device_id.to_owned(),
            request_id: self.request_id.clone(),
        })
    }
}

/// What we did with a room key request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyShareOutcome {
    /// The room key was forwarded, starting at the given message index.
    Shared {
        /// The first message index the forwarded key can decrypt.
        message_index: u32,
    },
    /// The requester was told why it won't get the room key.
    Withheld(WithheldCode),
}

/// The recorded answer to a room key request of some device.
///
/// Exactly one decision exists per device and requested session, a repeated
/// request doesn't trigger a second answer unless the outcome changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareDecision {
    /// The user that asked for the key.
    pub user_id: OwnedUserId,
    /// The device that asked for the key.
    pub device_id: OwnedDeviceId,
    /// The ID of the request the decision answered last.
    pub request_id: OwnedTransactionId,
    /// The session that was requested.
    pub info: RequestedKeyInfo,
    /// What we did.
    pub outcome: KeyShareOutcome,
}

impl KeyShareDecision {
    /// The key under which the decision is stored.
    pub fn key(&self) -> String {
        Self::key_for(&self.user_id, &self.device_id, &self.info)
    }

    pub(crate) fn key_for(
        user_id: &UserId,
        device_id: &DeviceId,
        info: &RequestedKeyInfo,
    ) -> String {
        format!("{user_id}|{device_id}|{}", info.as_key())
    }
}
