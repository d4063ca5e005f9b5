//! Ed25519 signatures, base64 codecs, and the two canonical signing strings
//! from spec.md §4.2. Pure, non-suspending functions — no I/O.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Generate a new Ed25519 keypair, grounded in `AgentIdentity::new` from the
/// ed25519 proof-signing example in the pack.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut secret_bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut OsRng, &mut secret_bytes);
    let signing_key = SigningKey::from_bytes(&secret_bytes);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Accepts padded or unpadded base64 (standard or URL-safe alphabet) on input,
/// per spec.md §4.2's encoding rule.
pub fn b64_decode(input: &str) -> Result<Vec<u8>, String> {
    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .map_err(|e| format!("invalid base64: {e}"))
}

/// Always emits padded standard base64.
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_b64(data: &[u8]) -> String {
    b64_encode(&Sha256::digest(data))
}

pub fn hmac_sha256_hex(secret: &str, body: &[u8]) -> Option<String> {
    use hmac::{Hmac, Mac};
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, String> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "public key must be 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&arr).map_err(|e| format!("invalid public key: {e}"))
}

pub fn signature_from_bytes(bytes: &[u8]) -> Result<Signature, String> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| "signature must be 64 bytes".to_string())?;
    Ok(Signature::from_bytes(&arr))
}

pub fn sign(key: &SigningKey, message: &[u8]) -> Signature {
    key.sign(message)
}

pub fn verify(key: &VerifyingKey, message: &[u8], sig: &Signature) -> bool {
    key.verify(message, sig).is_ok()
}

/// Envelope signing string (spec.md §4.2):
/// `timestamp \n sha256(body_json)_b64 \n from \n to \n (correlation_id | "")`
pub fn envelope_signing_string(
    timestamp: &chrono::DateTime<chrono::Utc>,
    body_json: &[u8],
    from: &str,
    to: &str,
    correlation_id: Option<&str>,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        timestamp.to_rfc3339(),
        sha256_b64(body_json),
        from,
        to,
        correlation_id.unwrap_or("")
    )
}

/// HTTP request signature canonical string (spec.md §4.2, §6.3): one line per
/// signed header in the order given by `headers`, joined by `\n`. The
/// pseudo-header `(request-target)` is rendered as `<method-lower> <uri>`.
pub fn http_signing_string(
    method: &str,
    request_uri: &str,
    signed_headers: &[(&str, &str)],
    headers_order: &[String],
) -> Result<String, String> {
    let mut lines = Vec::with_capacity(headers_order.len());
    for name in headers_order {
        let lower = name.to_lowercase();
        if lower == "(request-target)" {
            lines.push(format!("(request-target): {} {}", method.to_lowercase(), request_uri));
            continue;
        }
        let value = signed_headers
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(&lower))
            .map(|(_, v)| *v)
            .ok_or_else(|| format!("missing header for signing string: {lower}"))?;
        lines.push(format!("{lower}: {value}"));
    }
    Ok(lines.join("\n"))
}

/// `|now - date| > 300s` is stale, per spec.md §4.2/§4.3.
pub fn is_fresh(date: &chrono::DateTime<chrono::Utc>, now: &chrono::DateTime<chrono::Utc>) -> bool {
    (*now - *date).num_seconds().abs() <= FRESHNESS_WINDOW_SECS
}
