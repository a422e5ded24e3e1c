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

//! The network collaborator of the crypto core.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    error::ErrorKind,
    requests::{
        KeysBackupRequest, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, SignatureUploadRequest,
        ToDeviceRequest, UploadSigningKeysRequest,
    },
    types::{RoomKeyBackupInfo, RoomKeyBackupPayload, RoomKeyBackupVersion},
    AsyncTraitDeps,
};

/// Errors the transport reports back.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The homeserver couldn't be reached.
    #[error("the homeserver couldn't be reached: {0}")]
    Network(String),

    /// The homeserver asked us to slow down.
    #[error("rate limited by the homeserver, retry after {retry_after:?}")]
    RateLimited {
        /// How long the server wants us to wait, if it told us.
        retry_after: Option<Duration>,
    },

    /// The homeserver rejected the request.
    #[error("the homeserver rejected the request with status {status}: {message}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// The error message of the server.
        message: String,
    },

    /// A backup upload targeted a version that isn't the active one anymore.
    #[error("the backup version isn't the current one, the current one is {current_version:?}")]
    WrongBackupVersion {
        /// The version the server considers active, if any.
        current_version: Option<String>,
    },
}

impl TransportError {
    /// Can the request be retried as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::RateLimited { .. })
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Protocol
        }
    }
}

/// Everything the crypto core needs from a homeserver.
///
/// Implementations are expected to be cancel safe, a request that is dropped
/// halfway may be sent again.
#[async_trait]
pub trait Transport: AsyncTraitDeps {
    /// Publish device keys and one-time keys.
    async fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError>;

    /// Query the devices and cross-signing keys of some users.
    async fn query_keys(
        &self,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError>;

    /// Claim one-time keys of other devices.
    async fn claim_one_time_keys(
        &self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Send events directly to devices.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;

    /// Publish our cross-signing keys.
    async fn upload_signing_keys(
        &self,
        request: &UploadSigningKeysRequest,
    ) -> Result<(), TransportError>;

    /// Publish signatures over devices or master keys.
    async fn upload_signatures(&self, request: &SignatureUploadRequest)
        -> Result<(), TransportError>;

    /// Get the currently active backup version, if there is one.
    async fn get_backup_version(&self) -> Result<Option<RoomKeyBackupVersion>, TransportError>;

    /// Create a new backup version, returning its server assigned version.
    async fn create_backup_version(&self, info: &RoomKeyBackupInfo)
        -> Result<String, TransportError>;

    /// Upload encrypted room keys to a backup version.
    ///
    /// Uploading a key that is already part of the backup replaces it.
    async fn upload_backup_keys(&self, request: &KeysBackupRequest)
        -> Result<(), TransportError>;

    /// Download every room key of a backup version.
    async fn download_backup_keys(
        &self,
        version: &str,
    ) -> Result<RoomKeyBackupPayload, TransportError>;
}

/// How transient transport failures are retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// How often a request is attempted in total.
    pub max_attempts: u32,
    /// The delay before the first retry, it doubles on every further one.
    pub initial_backoff: Duration,
    /// The delay between two attempts never exceeds this.
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Run the given request, retrying it with exponential backoff as long as it
/// fails with a transient error.
///
/// Errors that aren't transient are returned at once.
pub async fn retry_transient<T, F, Fut>(
    settings: &RetrySettings,
    mut request: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut backoff = settings.initial_backoff;
    let mut attempt = 1;

    loop {
        match request().await {
            Ok(response) => return Ok(response),
            Err(error) if error.is_transient() && attempt < settings.max_attempts => {
                let delay = match &error {
                    TransportError::RateLimited { retry_after: Some(retry_after) } => *retry_after,
                    _ => backoff,
                }
                .min(settings.max_backoff);

                warn!(attempt, ?delay, "Request failed with a transient error, retrying: {error}");

                tokio::time::sleep(delay).await;

                backoff = backoff.saturating_mul(2).min(settings.max_backoff);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use assert_matches2::assert_matches;

    use super::{retry_transient, RetrySettings, TransportError};
    use crate::error::ErrorKind;

    fn settings() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);

        let result = retry_transient(&settings(), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Network("offline".to_owned()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_give_up() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_transient(&settings(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::RateLimited { retry_after: Some(Duration::from_secs(60)) })
        })
        .await;

        assert_matches!(result, Err(TransportError::RateLimited { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_return_at_once() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_transient(&settings(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Server { status: 400, message: "M_BAD_JSON".to_owned() })
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
