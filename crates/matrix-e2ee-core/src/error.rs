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

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    canonical_json::CanonicalJsonError, store::CryptoStoreError, transport::TransportError,
    types::events::room_key_withheld::WithheldCode,
};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// The class of a failure, deciding how callers should react to it.
///
/// Failures are always scoped to the narrowest entity they concern: one
/// session, one device or one backup version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The network was unreachable or we were rate limited, the operation
    /// should be retried with a backoff.
    Transient,
    /// The other side, or the server, told us something precise, a withheld
    /// key, a missing signature or an exhausted ratchet. Render it, don't
    /// retry it.
    Protocol,
    /// Something was tampered with or went backwards. The affected session
    /// is quarantined, everything else keeps working.
    Integrity,
    /// Cross-signing or backups aren't set up. Informational.
    Configuration,
    /// The storage backend failed.
    Storage,
}

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// A new Olm session couldn't be created.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The transport failed to deliver a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Our keys couldn't be signed for publishing.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// None of the Olm sessions we share with the sender could decrypt the
    /// message.
    #[error(
        "decryption failed likely because an Olm session from {0} with sender key {1} was wedged"
    )]
    SessionWedged(OwnedUserId, Curve25519PublicKey),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,

    /// The payload decrypted fine but was bound to different identities than
    /// the ones of the session it arrived on. The session got quarantined.
    #[error("the Olm session {session_id} was quarantined: {reason}")]
    SessionQuarantined {
        /// The ID of the quarantined session.
        session_id: String,
        /// The payload check that failed.
        reason: EventError,
    },
}

impl OlmError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OlmError::Store(_) => ErrorKind::Storage,
            OlmError::Transport(e) => e.kind(),
            OlmError::Signature(e) => e.kind(),
            OlmError::EventError(e) => e.kind(),
            OlmError::SessionCreation(e) => e.kind(),
            OlmError::SessionQuarantined { .. } => ErrorKind::Integrity,
            OlmError::JsonError(_) | OlmError::SessionWedged(..) | OlmError::MissingSession => {
                ErrorKind::Protocol
            }
        }
    }
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("Can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The event was encrypted at a ratchet index that predates the point at
    /// which we learned the session. This is permanent for the event.
    #[error(
        "the event was encrypted at message index {index}, but we only know the \
        session from index {first_known_index}"
    )]
    UnknownMessageIndex {
        /// The index the event was encrypted at.
        index: u32,
        /// The first index our copy of the session can decrypt.
        first_known_index: u32,
    },

    /// A different ciphertext was seen for a message index that was already
    /// decrypted.
    #[error("the message index {index} of session {session_id} was replayed")]
    ReplayedMessage {
        /// The session the replayed message belongs to.
        session_id: String,
        /// The replayed message index.
        index: u32,
    },

    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The room has no outbound session that was shared and can still be
    /// used, the room key needs to be shared first.
    #[error("the room {0} has no usable outbound group session, share a room key first")]
    MissingOutboundSession(OwnedRoomId),

    /// A pairwise operation needed to share the room key failed.
    #[error(transparent)]
    Olm(#[from] Box<OlmError>),

    /// The transport failed to deliver a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

impl From<OlmError> for MegolmError {
    fn from(e: OlmError) -> Self {
        MegolmError::Olm(Box::new(e))
    }
}

impl MegolmError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MegolmError::Store(_) => ErrorKind::Storage,
            MegolmError::Transport(e) => e.kind(),
            MegolmError::Olm(e) => e.kind(),
            MegolmError::ReplayedMessage { .. } | MegolmError::Decryption(_) => {
                ErrorKind::Integrity
            }
            MegolmError::EventError(e) => e.kind(),
            MegolmError::JsonError(_)
            | MegolmError::MissingRoomKey(_)
            | MegolmError::UnknownMessageIndex { .. }
            | MegolmError::MissingOutboundSession(_)
            | MegolmError::Decode(_) => ErrorKind::Protocol,
        }
    }
}

/// Error that occurs when decrypting an event that is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The recipient of the plaintext isn't us.
    #[error("the plaintext was addressed to {0}, but we are {1}")]
    MismatchedRecipient(OwnedUserId, OwnedUserId),

    /// The recipient keys of the plaintext aren't our keys.
    #[error("the plaintext was encrypted for a different signing key than ours")]
    MismatchedRecipientKeys,

    /// The public key that was part of the message doesn't match the key we
    /// have stored.
    #[error(
        "the public key that was part of the message doesn't match the key we \
        have stored, expected {0}, got {1}"
    )]
    MismatchedKeys(Box<Ed25519PublicKey>, Box<Ed25519PublicKey>),

    /// The room ID of the room key doesn't match the room ID of the decrypted
    /// event.
    #[error(
        "the room id of the room key doesn't match the room id of the \
        decrypted event: expected {0}, got {1:?}"
    )]
    MismatchedRoom(OwnedRoomId, Option<OwnedRoomId>),

    /// The payload carried an event type we don't handle.
    #[error("unsupported decrypted event type {0}")]
    UnsupportedEventType(String),
}

impl EventError {
    /// Classify this error, a payload bound to someone else counts as
    /// tampering.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventError::MismatchedSender(..)
            | EventError::MismatchedRecipient(..)
            | EventError::MismatchedRecipientKeys
            | EventError::MismatchedKeys(..)
            | EventError::MismatchedRoom(..) => ErrorKind::Integrity,
            EventError::UnsupportedAlgorithm
            | EventError::MissingCiphertext
            | EventError::UnsupportedEventType(_) => ErrorKind::Protocol,
        }
    }
}

/// Error type describing different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The user id of signing key differs from the user id that provided the
    /// signature.
    #[error("the user id of the signing key differs user id that provided the signature")]
    UserIdMismatch,

    /// The device ID of the device keys differs from the ID it was published
    /// under.
    #[error("the device id of the device keys differs from the one they were published under")]
    DeviceIdMismatch,

    /// The cross-signing key doesn't declare the usage it was published for.
    #[error("the cross-signing key doesn't have the expected usage")]
    UsageMismatch,

    /// The provided JSON object doesn't contain the expected signature.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signing key that used to sign the object has been changed.
    #[error("the signing key that used to sign the object has changed, old: {0:?}, new: {1:?}")]
    SigningKeyChanged(Option<Box<Ed25519PublicKey>>, Option<Box<Ed25519PublicKey>>),

    /// The signed object couldn't be brought into its canonical form.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),
}

impl SignatureError {
    /// Classify this error.
    ///
    /// A signature that is present but doesn't verify means the canonical
    /// form we computed differs from the signed one, or the object was
    /// tampered with.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignatureError::VerificationError(_)
            | SignatureError::InvalidSignature
            | SignatureError::SigningKeyChanged(..) => ErrorKind::Integrity,
            _ => ErrorKind::Protocol,
        }
    }
}

/// Error that occurs when a new Olm session can't be created.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The signed one-time key is missing.
    #[error(
        "Tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// Failed to verify the one-time key signatures.
    #[error(
        "Failed to verify the signature of a one-time key for {user_id} {device_id}: {error}"
    )]
    InvalidSignature {
        /// The owner of the one-time key.
        user_id: OwnedUserId,
        /// The device that published the one-time key.
        device_id: OwnedDeviceId,
        /// The exact error describing why the signature verification failed.
        error: Box<SignatureError>,
    },

    /// The user's device is missing a curve25519 key.
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// The user's device is missing an ed25519 key.
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        an ed25519 key"
    )]
    DeviceMissingSigningKey(OwnedUserId, OwnedDeviceId),

    /// The given curve25519 key is not a valid key.
    #[error("The given curve25519 key is not a valid key")]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// Error when creating an Olm Session from an incoming Olm message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The room key couldn't be decoded into a Megolm session.
    #[error(transparent)]
    Decode(#[from] vodozemac::megolm::SessionKeyDecodeError),
}

impl SessionCreationError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionCreationError::InvalidSignature { error, .. } => error.kind(),
            _ => ErrorKind::Protocol,
        }
    }
}

/// Error of the cross-signing operations of the machine.
#[derive(Error, Debug)]
pub enum CrossSigningError {
    /// We don't hold the private cross-signing keys of our user.
    #[error("cross-signing isn't set up on this device")]
    NotSetUp,

    /// The user has no published cross-signing identity we know of.
    #[error("the user {0} didn't publish a cross-signing identity")]
    MissingIdentity(OwnedUserId),

    /// Creating or checking a signature failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// A signed key couldn't be serialized for the upload.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The transport failed to deliver a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// Refreshing the published keys after the upload failed.
    #[error(transparent)]
    Olm(#[from] Box<OlmError>),
}

impl From<OlmError> for CrossSigningError {
    fn from(e: OlmError) -> Self {
        CrossSigningError::Olm(Box::new(e))
    }
}

impl CrossSigningError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrossSigningError::NotSetUp | CrossSigningError::MissingIdentity(_) => {
                ErrorKind::Configuration
            }
            CrossSigningError::Signature(e) => e.kind(),
            CrossSigningError::Json(_) => ErrorKind::Protocol,
            CrossSigningError::Transport(e) => e.kind(),
            CrossSigningError::Store(_) => ErrorKind::Storage,
            CrossSigningError::Olm(e) => e.kind(),
        }
    }
}
