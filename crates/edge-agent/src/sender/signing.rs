//! Envelope signing
//!
//! The signature covers the Keccak-256 hash of the canonical envelope bytes:
//! the envelope as a JSON object without its `signature` member, keys in
//! sorted order. Signatures are 65 bytes `r || s || v` with `v` in 27/28,
//! hex encoded with a `0x` prefix.

use async_trait::async_trait;
use edge_core::{AgentError, AgentResult, CloudEvent, Signer};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::Value;
use sha3::{Digest, Keccak256};

use crate::error::SendError;

const SIGNATURE_FIELD: &str = "signature";
const SIGNATURE_LEN: usize = 65;
const ETHEREUM_V_OFFSET: u8 = 27;

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// Canonical bytes of a JSON document with any `signature` member removed
pub fn canonical_bytes(document: &Value) -> Result<Vec<u8>, SendError> {
    let mut document = document.clone();
    if let Value::Object(map) = &mut document {
        map.remove(SIGNATURE_FIELD);
    }
    Ok(serde_json::to_vec(&document)?)
}

/// Sign `event` in place and return the bytes to publish
pub async fn sign_event(event: &mut CloudEvent, signer: &dyn Signer) -> Result<Vec<u8>, SendError> {
    event.signature = None;
    let unsigned = serde_json::to_value(&*event)?;
    let hash = keccak256(&canonical_bytes(&unsigned)?);

    let signature = signer
        .sign_hash(hash)
        .await
        .map_err(|e| SendError::Signing(e.to_string()))?;
    if signature.len() != SIGNATURE_LEN {
        return Err(SendError::Signing(format!(
            "expected {} signature bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }

    event.signature = Some(format!("0x{}", hex::encode(signature)));
    Ok(serde_json::to_vec(&*event)?)
}

/// Ethereum address (`0x` + 40 hex chars) of a public key
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.as_affine().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recover the signing address from a 65-byte signature over `hash`
pub fn recover_address(hash: &[u8; 32], signature: &[u8]) -> Result<String, SendError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(SendError::Signing(format!("bad signature length {}", signature.len())));
    }
    let v = signature[64];
    let recovery = v.checked_sub(ETHEREUM_V_OFFSET).unwrap_or(v);
    let recovery = RecoveryId::from_byte(recovery)
        .ok_or_else(|| SendError::Signing(format!("bad recovery byte {}", v)))?;
    let signature = Signature::from_slice(&signature[..64]).map_err(|e| SendError::Signing(e.to_string()))?;

    let key = VerifyingKey::recover_from_prehash(hash, &signature, recovery)
        .map_err(|e| SendError::Signing(e.to_string()))?;
    Ok(address_of(&key))
}

/// Check a published message against the expected signer address
pub fn verify_message(bytes: &[u8], address: &str) -> Result<bool, SendError> {
    let document: Value = serde_json::from_slice(bytes)?;
    let Some(signature) = document.get(SIGNATURE_FIELD).and_then(Value::as_str) else {
        return Ok(false);
    };
    let signature = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| SendError::Signing(e.to_string()))?;
    let hash = keccak256(&canonical_bytes(&document)?);
    let recovered = recover_address(&hash, &signature)?;
    Ok(recovered.eq_ignore_ascii_case(address))
}

/// In-process signer for tooling and tests; the dongle signs in hardware
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn from_bytes(secret: &[u8]) -> AgentResult<Self> {
        let key = SigningKey::from_slice(secret).map_err(|e| AgentError::InvalidInput(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn address(&self) -> String {
        address_of(self.key.verifying_key())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn ethereum_address(&self) -> AgentResult<String> {
        Ok(self.address())
    }

    async fn sign_hash(&self, hash: [u8; 32]) -> AgentResult<Vec<u8>> {
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery.to_byte() + ETHEREUM_V_OFFSET);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;

    // Well-known development key (first account of the standard test mnemonic)
    const SECRET: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn signer() -> LocalSigner {
        LocalSigner::from_bytes(&hex::decode(SECRET).unwrap()).unwrap()
    }

    fn event(data: Value) -> CloudEvent {
        CloudEvent {
            id: "2f6c1c8e-33f4-4bb4-9a8e-2f1d7c1e0001".to_string(),
            source: "edge/agent".to_string(),
            specversion: "1.0".to_string(),
            subject: ADDRESS.to_string(),
            event_type: "com.edge.device.status".to_string(),
            time: Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
            datacontenttype: "application/json".to_string(),
            vehicle_token_id: None,
            make: None,
            model: None,
            year: None,
            signature: None,
            data,
        }
    }

    #[test]
    fn test_keccak_known_value() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_address_derivation() {
        assert_eq!(signer().address(), ADDRESS);
    }

    #[tokio::test]
    async fn test_signed_publish_round_trip() {
        let signer = signer();
        let mut envelope = event(json!({"foo": 1}));
        let bytes = sign_event(&mut envelope, &signer).await.unwrap();

        let published: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(published["data"], json!({"foo": 1}));
        assert!(published["signature"].as_str().unwrap().starts_with("0x"));
        assert!(verify_message(&bytes, ADDRESS).unwrap());
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_verification() {
        let signer = signer();
        let mut envelope = event(json!({"foo": 1}));
        let bytes = sign_event(&mut envelope, &signer).await.unwrap();

        let mut tampered: Value = serde_json::from_slice(&bytes).unwrap();
        tampered["data"]["foo"] = json!(2);
        let tampered = serde_json::to_vec(&tampered).unwrap();
        assert!(!verify_message(&tampered, ADDRESS).unwrap());
    }

    #[tokio::test]
    async fn test_recovery_byte_forms() {
        let signer = signer();
        let hash = keccak256(b"edge");
        let mut signature = signer.sign_hash(hash).await.unwrap();
        assert!(signature[64] == 27 || signature[64] == 28);
        assert_eq!(recover_address(&hash, &signature).unwrap(), ADDRESS);

        // Hardware that reports v as 0/1 verifies the same way
        signature[64] -= ETHEREUM_V_OFFSET;
        assert_eq!(recover_address(&hash, &signature).unwrap(), ADDRESS);
    }

    #[test]
    fn test_unsigned_message_is_rejected() {
        let bytes = serde_json::to_vec(&event(json!({}))).unwrap();
        assert!(!verify_message(&bytes, ADDRESS).unwrap());
    }
}
