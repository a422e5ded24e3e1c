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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports two main types of identities, a per-device identity and a
//! per-user identity.
//!
//! ## Device
//!
//! Every E2EE capable Matrix client will create a new Olm account and upload
//! the public keys of the Olm account to the server. This is represented as a
//! [`DeviceData`].
//!
//! Devices can have a local trust state which is needed for our own devices,
//! since they can't be cross-signed before our own identity is verified.
//!
//! ## User
//!
//! Cross-signing capable devices will upload 3 additional Ed25519 keys which
//! form a user identity, a [`UserIdentityData`]. Whether a user or a device
//! is trusted through these keys is answered by the [`TrustEngine`].

pub(crate) mod device;
pub(crate) mod manager;
mod trust;
pub(crate) mod user;

pub use device::{DeviceData, LocalTrust};
pub(crate) use manager::IdentityManager;
pub(crate) use trust::TrustSnapshot;
pub use trust::{DeviceTrust, TrustEngine, UserTrustResult};
pub use user::UserIdentityData;
