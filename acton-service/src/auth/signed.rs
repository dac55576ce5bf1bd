//! Signed (self-describing) tokens: three base64url segments
//! `header.payload.sig`, integrity verified by HMAC-SHA256 without a store
//! lookup. Signature comparison is constant-time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by the payload segment of a signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedClaims {
    pub sub: String,
    pub sid: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub exp: i64,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_ip: Option<String>,
}

/// Encodes and verifies signed tokens against one configured secret.
#[derive(Clone)]
pub struct SignedTokenCodec {
    secret: Vec<u8>,
}

impl SignedTokenCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Sign `claims`, producing `header.payload.sig`. The header is a fixed
    /// JSON object describing the algorithm, matching the shape most signed
    /// token formats use even though this gateway only ever emits one.
    pub fn sign(&self, claims: &SignedClaims) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload_json = serde_json::to_vec(claims)
            .map_err(|e| Error::Internal(format!("failed to encode claims: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(payload_json);
        let signing_input = format!("{}.{}", header, payload);
        let sig = self.mac(signing_input.as_bytes())?;
        let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
        Ok(format!("{}.{}", signing_input, sig_b64))
    }

    /// Verify a signed token's integrity and decode its claims. Does not
    /// check `exp`/`nbf` — the caller applies those against its own clock
    /// per the validation ordering.
    pub fn verify(&self, token: &str) -> Result<SignedClaims> {
        let mut parts = token.splitn(3, '.');
        let header = parts.next().ok_or_else(|| Error::InvalidToken("malformed token".into()))?;
        let payload = parts.next().ok_or_else(|| Error::InvalidToken("malformed token".into()))?;
        let sig_b64 = parts.next().ok_or_else(|| Error::InvalidToken("malformed token".into()))?;

        let signing_input = format!("{}.{}", header, payload);
        let expected_sig = self.mac(signing_input.as_bytes())?;

        let provided_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| Error::InvalidToken("malformed signature".into()))?;

        if provided_sig.len() != expected_sig.len()
            || provided_sig.ct_eq(&expected_sig).unwrap_u8() != 1
        {
            tracing::warn!(kind = "signature_mismatch", "signed token failed verification");
            return Err(Error::InvalidToken("signature mismatch".into()));
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::InvalidToken("malformed payload".into()))?;
        serde_json::from_slice(&payload_bytes)
            .map_err(|_| Error::InvalidToken("malformed claims".into()))
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("invalid HMAC key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> SignedClaims {
        SignedClaims {
            sub: "user-1".to_string(),
            sid: "sess-1".to_string(),
            iat: 1_700_000_000,
            nbf: None,
            exp: 1_900_000_000,
            roles: vec!["user".to_string()],
            permissions: vec!["read".to_string()],
            bound_ip: None,
        }
    }

    #[test]
    fn round_trips_sign_and_verify() {
        let codec = SignedTokenCodec::new("a-very-secret-signing-key-32bytes!!");
        let token = codec.sign(&claims()).unwrap();
        let verified = codec.verify(&token).unwrap();
        assert_eq!(verified.sub, "user-1");
        assert_eq!(verified.sid, "sess-1");
    }

    #[test]
    fn tampering_with_final_character_fails_verification() {
        let codec = SignedTokenCodec::new("a-very-secret-signing-key-32bytes!!");
        let mut token = codec.sign(&claims()).unwrap();
        token.pop();
        token.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(codec.verify(&token).is_err());
    }

    #[test]
    fn tampering_with_payload_fails_verification() {
        let codec = SignedTokenCodec::new("a-very-secret-signing-key-32bytes!!");
        let token = codec.sign(&claims()).unwrap();
        let mut segments: Vec<&str> = token.split('.').collect();
        let tampered_payload = format!("{}x", segments[1]);
        segments[1] = &tampered_payload;
        let tampered = segments.join(".");
        assert!(codec.verify(&tampered).is_err());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let codec_a = SignedTokenCodec::new("secret-a-32-bytes-of-secret-key!");
        let codec_b = SignedTokenCodec::new("secret-b-32-bytes-of-secret-key!");
        let token = codec_a.sign(&claims()).unwrap();
        assert!(codec_b.verify(&token).is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        let codec = SignedTokenCodec::new("a-very-secret-signing-key-32bytes!!");
        assert!(codec.verify("not-a-valid-token").is_err());
        assert!(codec.verify("only.two").is_err());
    }
}
