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

//! The crypto specific Olm objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod session;
mod signing;
mod utility;

pub use account::{Account, OneTimeKeys, PickledAccount, StaticAccountData};
pub(crate) use group_sessions::ShareState;
pub use group_sessions::{
    BackedUpRoomKey, EncryptionSettings, ExportedRoomKey, ExportedSessionKey,
    InboundGroupSession, KeySharingPolicy, OutboundGroupSession, PickledInboundGroupSession,
    PickledOutboundGroupSession, RotationReason, SessionKey, SessionOrdering, ShareInfo,
    SharedWith,
};
pub(crate) use session::most_recent_session;
pub use session::{PickledSession, Session};
pub use signing::{
    PickledCrossSigningIdentity, PickledSigning, PrivateCrossSigningIdentity, SigningError,
};
pub(crate) use utility::{signable_json, VerifyJson};
pub use utility::SignedJsonObject;
pub use vodozemac::{olm::IdentityKeys, Curve25519PublicKey};
