//! Key ids and key directory shapes.
//!
//! Every public key a device publishes is addressed as `"<algorithm>:<id>"`.
//! Identity keys use the device id as `<id>` (`curve25519:DEVICEID`), one-time
//! keys use an opaque counter chosen by the publishing account
//! (`signed_curve25519:AAAAAQ`).

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::{DeviceId, UserId},
};

/// Signatures attached to a signed object: `user → key id → signature`.
pub type Signatures = BTreeMap<UserId, BTreeMap<String, String>>;

/// Result of a device key query: `user → device → keys`.
pub type DeviceKeysResponse = BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>;

/// One-time keys wanted from the directory: `user → device → algorithm`.
pub type OneTimeKeyClaim = BTreeMap<UserId, BTreeMap<DeviceId, KeyAlgorithm>>;

/// Keys handed out by a claim: `user → device → key`.
///
/// Devices the directory had no key for are absent.
pub type ClaimResponse = BTreeMap<UserId, BTreeMap<DeviceId, ClaimedKey>>;

/// Public key algorithms Herald names on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Curve25519 identity key
    #[serde(rename = "curve25519")]
    Curve25519,
    /// Ed25519 signing key
    #[serde(rename = "ed25519")]
    Ed25519,
    /// Curve25519 one-time key carrying a signature
    #[serde(rename = "signed_curve25519")]
    SignedCurve25519,
}

impl KeyAlgorithm {
    /// Wire name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Curve25519 => "curve25519",
            Self::Ed25519 => "ed25519",
            Self::SignedCurve25519 => "signed_curve25519",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key id of the form `<algorithm>:<id>`.
///
/// The algorithm part is kept as a string: the directory may publish
/// algorithms this agent does not know, and those ids must still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId {
    algorithm: String,
    id: String,
}

impl KeyId {
    /// Build a key id from a known algorithm.
    pub fn new(algorithm: KeyAlgorithm, id: impl Into<String>) -> Self {
        Self { algorithm: algorithm.as_str().to_string(), id: id.into() }
    }

    /// Key id of a device's identity key for `algorithm`.
    pub fn for_device(algorithm: KeyAlgorithm, device_id: &DeviceId) -> Self {
        Self::new(algorithm, device_id.as_str())
    }

    /// Parse `<algorithm>:<id>`. Both halves must be non-empty.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once(':') {
            Some((algorithm, id)) if !algorithm.is_empty() && !id.is_empty() => {
                Ok(Self { algorithm: algorithm.to_string(), id: id.to_string() })
            },
            _ => Err(ProtocolError::MalformedKeyId(raw.to_string())),
        }
    }

    /// Algorithm half.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Id half (device id or one-time key counter).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check whether this key id uses `algorithm`.
    pub fn is(&self, algorithm: KeyAlgorithm) -> bool {
        self.algorithm == algorithm.as_str()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.id)
    }
}

impl FromStr for KeyId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for KeyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identity keys a device published to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Owner of the device
    pub user_id: UserId,
    /// The device
    pub device_id: DeviceId,
    /// Encryption algorithms the device supports
    pub algorithms: Vec<String>,
    /// Public keys by key id (`curve25519:<device>`, `ed25519:<device>`)
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this object
    #[serde(default)]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// Public key published under `<algorithm>:<device_id>`.
    pub fn key(&self, algorithm: KeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&KeyId::for_device(algorithm, &self.device_id).to_string())
            .map(String::as_str)
    }

    /// Like [`DeviceKeys::key`], but a missing key is an error.
    pub fn require_key(&self, algorithm: KeyAlgorithm) -> Result<&str> {
        self.key(algorithm).ok_or_else(|| ProtocolError::MissingDeviceKey {
            user_id: self.user_id.to_string(),
            device_id: self.device_id.to_string(),
            key_id: KeyId::for_device(algorithm, &self.device_id).to_string(),
        })
    }
}

/// A one-time key with its signatures, as uploaded and as claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// Public key (unpadded base64)
    pub key: String,
    /// Signatures over the canonical form of `{"key": ...}`
    #[serde(default)]
    pub signatures: Signatures,
}

/// A one-time key the directory handed out for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedKey {
    /// Id of the claimed key (`signed_curve25519:<counter>`)
    pub key_id: KeyId,
    /// Public key (unpadded base64)
    pub key: String,
    /// Signatures the owning device attached
    pub signatures: Signatures,
}

/// Body of a device key query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// Users to query; an empty device list means every device
    pub device_keys: BTreeMap<UserId, Vec<DeviceId>>,
}

/// Response to a device key query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysQueryResponse {
    /// Device keys per user and device
    #[serde(default)]
    pub device_keys: DeviceKeysResponse,
}

/// Body of a one-time key claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeysClaimRequest {
    /// Wanted algorithm per user and device
    pub one_time_keys: OneTimeKeyClaim,
}

/// Raw key claim response as the homeserver sends it.
///
/// Each device maps to a single-entry object keyed by the claimed key id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysClaimResponse {
    /// Claimed keys per user, device and key id
    #[serde(default)]
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, ClaimedKeyValue>>>,
}

/// A claimed key entry: signed object, or a bare key for unsigned algorithms.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ClaimedKeyValue {
    /// `{"key": ..., "signatures": ...}`
    Signed(SignedOneTimeKey),
    /// Bare base64 key
    Plain(String),
}

impl KeysClaimResponse {
    /// Flatten into one [`ClaimedKey`] per device.
    ///
    /// Devices whose entry is empty are dropped.
    pub fn into_claimed(self) -> Result<ClaimResponse> {
        let mut claimed = ClaimResponse::new();

        for (user_id, devices) in self.one_time_keys {
            for (device_id, keys) in devices {
                let Some((raw_id, value)) = keys.into_iter().next() else {
                    continue;
                };

                let key_id = KeyId::parse(&raw_id)?;
                let (key, signatures) = match value {
                    ClaimedKeyValue::Signed(signed) => (signed.key, signed.signatures),
                    ClaimedKeyValue::Plain(key) => (key, Signatures::new()),
                };

                claimed
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device_id, ClaimedKey { key_id, key, signatures });
            }
        }

        Ok(claimed)
    }
}

/// Body of a key upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeysUploadRequest {
    /// Signed identity keys for this device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys by key id
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
}

/// Response to a key upload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysUploadResponse {
    /// Unclaimed one-time keys the server now holds, per algorithm
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn key_id_formats_algorithm_and_device() {
        let device = DeviceId::new("DEVICEID");
        assert_eq!(
            KeyId::for_device(KeyAlgorithm::Curve25519, &device).to_string(),
            "curve25519:DEVICEID"
        );
        assert_eq!(KeyId::for_device(KeyAlgorithm::Ed25519, &device).to_string(), "ed25519:DEVICEID");
    }

    #[test]
    fn key_id_rejects_missing_halves() {
        assert!(KeyId::parse("curve25519").is_err());
        assert!(KeyId::parse(":DEVICE").is_err());
        assert!(KeyId::parse("curve25519:").is_err());
    }

    #[test]
    fn key_id_keeps_colons_in_id() {
        let id = KeyId::parse("signed_curve25519:AA:BB").unwrap();
        assert_eq!(id.algorithm(), "signed_curve25519");
        assert_eq!(id.id(), "AA:BB");
        assert!(id.is(KeyAlgorithm::SignedCurve25519));
    }

    #[test]
    fn device_keys_lookup_by_device_key_id() {
        let keys: DeviceKeys = serde_json::from_value(json!({
            "user_id": "@bob:x",
            "device_id": "BOBDEV",
            "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
            "keys": {
                "curve25519:BOBDEV": "curve-bob",
                "ed25519:BOBDEV": "ed-bob",
            },
        }))
        .unwrap();

        assert_eq!(keys.key(KeyAlgorithm::Curve25519), Some("curve-bob"));
        assert_eq!(keys.key(KeyAlgorithm::Ed25519), Some("ed-bob"));
        assert!(keys.signatures.is_empty());
        assert!(matches!(
            keys.require_key(KeyAlgorithm::SignedCurve25519),
            Err(ProtocolError::MissingDeviceKey { .. })
        ));
    }

    #[test]
    fn claim_response_flattens_per_device() {
        let raw: KeysClaimResponse = serde_json::from_value(json!({
            "one_time_keys": {
                "@bob:x": {
                    "BOBDEV": {
                        "signed_curve25519:AAAAHg": {
                            "key": "otk-bob",
                            "signatures": { "@bob:x": { "ed25519:BOBDEV": "sig" } }
                        }
                    },
                    "EMPTY": {}
                }
            },
            "failures": {}
        }))
        .unwrap();

        let claimed = raw.into_claimed().unwrap();
        let bob = &claimed[&UserId::new("@bob:x")];

        assert_eq!(bob.len(), 1);
        let key = &bob[&DeviceId::new("BOBDEV")];
        assert_eq!(key.key, "otk-bob");
        assert_eq!(key.key_id.to_string(), "signed_curve25519:AAAAHg");
    }

    #[test]
    fn claim_request_names_signed_curve25519() {
        let mut wanted = OneTimeKeyClaim::new();
        wanted
            .entry(UserId::new("@bob:x"))
            .or_default()
            .insert(DeviceId::new("BOBDEV"), KeyAlgorithm::SignedCurve25519);

        let body = serde_json::to_value(KeysClaimRequest { one_time_keys: wanted }).unwrap();
        assert_eq!(body, json!({ "one_time_keys": { "@bob:x": { "BOBDEV": "signed_curve25519" } } }));
    }

    proptest! {
        #[test]
        fn key_id_display_parse_agree(
            algorithm in "[a-z_0-9]{1,20}",
            id in "[A-Za-z0-9:]{1,20}",
        ) {
            let raw = format!("{algorithm}:{id}");
            let parsed = KeyId::parse(&raw).unwrap();
            prop_assert_eq!(parsed.algorithm(), algorithm.as_str());
            prop_assert_eq!(parsed.id(), id.as_str());
            prop_assert_eq!(parsed.to_string(), raw);
        }
    }
}
