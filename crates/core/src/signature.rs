use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Reasons a webhook signature is not accepted. Every variant means "not authentic".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a hex encoded HMAC-SHA256 of the raw `body` keyed with `secret`.
///
/// The comparison runs in constant time; a length mismatch fails the same way
/// as a content mismatch.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    provided: Option<&str>,
) -> Result<(), SignatureError> {
    let provided = provided
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::Missing)?;
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }

    let provided_bytes = hex::decode(provided).map_err(|_| SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::MissingSecret)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the hex signature the gateway attaches to `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::MissingSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
