//! CRAM-MD5 challenge-response authentication (RFC 2195)
//!
//! The server sends a base64-encoded challenge; the client replies with
//! base64 of `<user> <hex-digest>`, where the digest is the HMAC-MD5 of the
//! raw challenge keyed by the user's shared secret. Comparison is
//! constant-time.

use crate::error::{MailError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

/// Build a fresh challenge: `<nonce.timestamp@hostname>`.
pub fn create_challenge(hostname: &str) -> String {
    let nonce: u64 = rand::random();
    format!("<{}.{}@{}>", nonce, Utc::now().timestamp(), hostname)
}

/// The challenge as sent on the wire.
pub fn encode_challenge(challenge: &str) -> String {
    BASE64.encode(challenge.as_bytes())
}

/// Decode a client response into the user name and claimed digest. The
/// digest is everything after the last space, so user names containing
/// spaces survive.
pub fn decode_response(response: &str) -> Result<(String, String)> {
    let raw = BASE64
        .decode(response.trim().as_bytes())
        .map_err(|_| MailError::AuthenticationFailed)?;
    let text = String::from_utf8(raw).map_err(|_| MailError::AuthenticationFailed)?;
    let (user, digest) = text
        .rsplit_once(' ')
        .ok_or(MailError::AuthenticationFailed)?;
    if user.is_empty() || digest.is_empty() {
        return Err(MailError::AuthenticationFailed);
    }
    Ok((user.to_string(), digest.to_string()))
}

/// Verify a claimed digest against the HMAC-MD5 of the challenge under the
/// shared secret.
pub fn verify_cram_md5(challenge: &str, secret: &[u8], claimed_hex: &str) -> Result<bool> {
    let key = PKey::hmac(secret).map_err(|e| MailError::Crypto(e.to_string()))?;
    let mut signer =
        Signer::new(MessageDigest::md5(), &key).map_err(|e| MailError::Crypto(e.to_string()))?;
    signer
        .update(challenge.as_bytes())
        .map_err(|e| MailError::Crypto(e.to_string()))?;
    let mac = signer
        .sign_to_vec()
        .map_err(|e| MailError::Crypto(e.to_string()))?;
    let expected = hex_encode(&mac);
    Ok(secrets_equal(expected.as_bytes(), claimed_hex.trim().as_bytes()))
}

/// Constant-time equality for secret material. Length is not secret here;
/// unequal lengths simply fail.
pub fn secrets_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example from RFC 2195 section 2.
    const CHALLENGE: &str = "<1896.697170952@postoffice.reston.mci.net>";
    const SECRET: &[u8] = b"tanstaaftanstaaf";
    const DIGEST: &str = "b913a602c7eda7a495b4e6e7334d3890";

    #[test]
    fn test_rfc2195_example_verifies() {
        assert!(verify_cram_md5(CHALLENGE, SECRET, DIGEST).unwrap());
    }

    #[test]
    fn test_wrong_digest_rejected() {
        assert!(!verify_cram_md5(CHALLENGE, SECRET, "b913a602c7eda7a495b4e6e7334d3891").unwrap());
        assert!(!verify_cram_md5(CHALLENGE, SECRET, "deadbeef").unwrap());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        assert!(!verify_cram_md5(CHALLENGE, b"wrong", DIGEST).unwrap());
    }

    #[test]
    fn test_response_round_trip() {
        let encoded = BASE64.encode(format!("tim {}", DIGEST).as_bytes());
        let (user, digest) = decode_response(&encoded).unwrap();
        assert_eq!(user, "tim");
        assert_eq!(digest, DIGEST);
    }

    #[test]
    fn test_malformed_responses_rejected() {
        assert!(decode_response("not base64!!!").is_err());
        assert!(decode_response(&BASE64.encode(b"nospace")).is_err());
        assert!(decode_response(&BASE64.encode(b" leadingspaceonly")).is_err());
    }

    #[test]
    fn test_challenge_is_encoded_and_fresh() {
        let a = create_challenge("mail.example.com");
        let b = create_challenge("mail.example.com");
        assert!(a.starts_with('<') && a.ends_with('>'));
        assert!(a.contains("@mail.example.com"));
        assert_ne!(a, b);
        let decoded = BASE64.decode(encode_challenge(&a)).unwrap();
        assert_eq!(decoded, a.as_bytes());
    }
}
