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

use ruma::{DeviceKeyAlgorithm, DeviceKeyId, UserId};
use serde::Serialize;
use vodozemac::Ed25519PublicKey;

use crate::{
    canonical_json::{to_signable_json, CanonicalJsonError},
    error::SignatureError,
    types::{CrossSigningKey, DeviceKeys, MegolmV1AuthData, Signature, Signatures, SignedKey},
};

/// A JSON object that carries a `signatures` field.
pub trait SignedJsonObject: Serialize {
    /// The signatures of the object.
    fn signatures(&self) -> &Signatures;
}

impl SignedJsonObject for DeviceKeys {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

impl SignedJsonObject for CrossSigningKey {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

impl SignedJsonObject for SignedKey {
    fn signatures(&self) -> &Signatures {
        self.signatures()
    }
}

impl SignedJsonObject for MegolmV1AuthData {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// Get the canonical form of an object as it gets signed.
pub(crate) fn signable_json(object: &impl Serialize) -> Result<String, SignatureError> {
    let json = serde_json::to_value(object).map_err(CanonicalJsonError::from)?;
    Ok(to_signable_json(&json)?)
}

pub(crate) trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object's `signatures` and `unsigned` fields are removed before the
    /// canonical form is computed, the signature is looked up under the given
    /// user and key ID.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError>;

    /// Verify a signature over an already canonicalized JSON string.
    fn verify_canonicalized_json(
        &self,
        canonical_json: &str,
        signature: &Signature,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError> {
        if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
            return Err(SignatureError::UnsupportedAlgorithm);
        }

        let signature = signed_object
            .signatures()
            .get_signature(user_id, key_id)
            .ok_or(SignatureError::NoSignatureFound)?;

        let canonical_json = signable_json(signed_object)?;

        self.verify_canonicalized_json(&canonical_json, signature)
    }

    fn verify_canonicalized_json(
        &self,
        canonical_json: &str,
        signature: &Signature,
    ) -> Result<(), SignatureError> {
        match signature {
            Signature::Ed25519(s) => Ok(self.verify(canonical_json.as_bytes(), s)?),
            Signature::Invalid(_) => Err(SignatureError::InvalidSignature),
            Signature::Other(_) => Err(SignatureError::UnsupportedAlgorithm),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::Ed25519PublicKey;

    use super::VerifyJson;
    use crate::{error::SignatureError, types::DeviceKeys};

    fn device_keys() -> serde_json::Value {
        json!({
            "device_id": "GBEWHQOYGS",
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "keys": {
                "curve25519:GBEWHQOYGS": "F8QhZ0Z1rjtWrQOblMDgZtEX5x1UrG7sZ2Kk3xliNAU",
                "ed25519:GBEWHQOYGS": "n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:GBEWHQOYGS": "OlF2REsqjYdAfr04ONx8VS/5cB7KjrWYRlLF4eUm2foAiQL/RAfsjsa2JXZeoOHh6vEualZHbWlod49OewVqBg"
                }
            },
            "unsigned": {
                "device_display_name": "Weechat-Matrix-rs"
            },
            "user_id": "@example:localhost"
        })
    }

    #[test]
    fn signature_test() {
        let device_keys: DeviceKeys = serde_json::from_value(device_keys()).unwrap();
        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();

        signing_key
            .verify_json(
                user_id!("@example:localhost"),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS")),
                &device_keys,
            )
            .expect("Can't verify device keys");
    }

    #[test]
    fn tampered_object_fails_verification() {
        let mut json = device_keys();
        json["algorithms"] = json!(["m.megolm.v1.aes-sha2"]);

        let device_keys: DeviceKeys = serde_json::from_value(json).unwrap();
        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();

        let result = signing_key.verify_json(
            user_id!("@example:localhost"),
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS")),
            &device_keys,
        );

        assert_matches!(result, Err(SignatureError::VerificationError(_)));
    }

    #[test]
    fn missing_signature_is_reported() {
        let device_keys: DeviceKeys = serde_json::from_value(device_keys()).unwrap();
        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();

        let result = signing_key.verify_json(
            user_id!("@other:localhost"),
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS")),
            &device_keys,
        );

        assert_matches!(result, Err(SignatureError::NoSignatureFound));
    }
}
