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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backups;
pub mod canonical_json;
mod error;
mod gossiping;
mod identities;
mod machine;
pub mod olm;
pub mod requests;
mod session_manager;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use error::{
    CrossSigningError, ErrorKind, EventError, MegolmError, MegolmResult, OlmError, OlmResult,
    SessionCreationError, SignatureError,
};
pub use gossiping::{GossipRequest, KeyShareDecision, KeyShareOutcome};
pub use identities::{
    DeviceData, DeviceTrust, LocalTrust, TrustEngine, UserIdentityData, UserTrustResult,
};
pub use machine::{MachineConfig, OlmMachine, ProcessedToDeviceEvent, SyncChanges};
pub use session_manager::{
    DecryptedRoomEvent, EncryptionInfo, EnsureSessionsResult, ImportOutcome, OlmDecryptionInfo,
    OlmEncryptionResult, OutboundSessionState, SenderVerification, SessionFailure, ShareResult,
};

/// The bounds every implementation of the async traits of this crate, the
/// store and the transport, needs to satisfy.
pub trait AsyncTraitDeps: std::fmt::Debug + Send + Sync {}

impl<T: std::fmt::Debug + Send + Sync> AsyncTraitDeps for T {}

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
