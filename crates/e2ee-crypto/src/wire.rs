//! Wire types shared between the client session manager and the server:
//! the prekey bundle and the message envelope, both serialized as JSON with
//! base64-encoded byte fields, per §6.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

fn b64_encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, String> {
    B64.decode(s).map_err(|e| e.to_string())
}

/// `{ keyId, publicKey, signature }` — the signed prekey half of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
}

/// `{ keyId, publicKey }` — a one-time prekey half of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// The bundle a peer fetches to start X3DH as initiator (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    #[serde(rename = "signedPrekey")]
    pub signed_prekey: SignedPrekeyPublic,
    #[serde(rename = "oneTimePrekey", skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

/// Body of `POST /users/prekeys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyUploadRequest {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    #[serde(rename = "signedPrekey")]
    pub signed_prekey: SignedPrekeyPublic,
    #[serde(rename = "oneTimePrekeys")]
    pub one_time_prekeys: Vec<OneTimePrekeyPublic>,
}

/// `{ dh, pn, n }` ratchet header, present on every wire message (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetHeader {
    pub dh: String,
    pub pn: u32,
    pub n: u32,
}

/// X3DH init material attached only to a session's first outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhInit {
    #[serde(rename = "senderIdentityKey")]
    pub sender_identity_key: String,
    #[serde(rename = "senderEphemeralKey")]
    pub sender_ephemeral_key: String,
    #[serde(rename = "usedSignedPrekeyId")]
    pub used_signed_prekey_id: u32,
    #[serde(rename = "usedOneTimePrekeyId", skip_serializing_if = "Option::is_none")]
    pub used_one_time_prekey_id: Option<u32>,
}

/// The full relayed message envelope (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub header: RatchetHeader,
    pub ciphertext: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    pub iv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<X3dhInit>,
}

impl MessageEnvelope {
    /// Structural well-formedness check the relay performs (§4.8): the
    /// envelope has a header, non-empty ciphertext, and an `iv`. The relay
    /// never inspects what `ciphertext` decodes to.
    pub fn is_well_formed(&self) -> bool {
        !self.ciphertext.is_empty() && !self.iv.is_empty() && b64_decode(&self.ciphertext).is_ok()
    }
}

pub fn encode_key(bytes: &[u8]) -> String {
    b64_encode(bytes)
}

pub fn decode_key(s: &str) -> Result<Vec<u8>, String> {
    b64_decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = MessageEnvelope {
            header: RatchetHeader {
                dh: encode_key(&[1u8; 32]),
                pn: 0,
                n: 3,
            },
            ciphertext: encode_key(b"ciphertext-bytes"),
            auth_tag: encode_key(b"tag"),
            iv: encode_key(&[0u8; 12]),
            x3dh: None,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.header, envelope.header);
        assert!(parsed.is_well_formed());
    }

    #[test]
    fn malformed_ciphertext_is_not_well_formed() {
        let envelope = MessageEnvelope {
            header: RatchetHeader {
                dh: encode_key(&[1u8; 32]),
                pn: 0,
                n: 0,
            },
            ciphertext: "not valid base64 !!".to_string(),
            auth_tag: encode_key(b"tag"),
            iv: encode_key(&[0u8; 12]),
            x3dh: None,
        };
        assert!(!envelope.is_well_formed());
    }
}
