use crate::config::Config;
use crate::crypto;
use crate::error::AppError;
use crate::models::Agent;
use crate::store::Store;
use chrono::Utc;
use rocket::outcome::Outcome as RocketOutcome;
use rocket::request::{FromRequest, Outcome, Request};
use std::sync::Arc;

/// A parsed `Signature: keyId="...",algorithm="...",headers="...",signature="..."` header.
#[derive(Debug)]
struct ParsedSignatureHeader {
    key_id: String,
    algorithm: String,
    headers: Vec<String>,
    signature_b64: String,
}

fn parse_signature_header(raw: &str) -> Result<ParsedSignatureHeader, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature_b64 = None;

    for part in split_signature_params(raw) {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match name.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => headers = Some(value.split(' ').map(|s| s.to_string()).collect()),
            "signature" => signature_b64 = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignatureHeader {
        key_id: key_id.ok_or_else(|| AppError::MalformedSignature("missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::MalformedSignature("missing algorithm".to_string()))?,
        headers: headers
            .ok_or_else(|| AppError::MalformedSignature("missing headers".to_string()))?,
        signature_b64: signature_b64
            .ok_or_else(|| AppError::MalformedSignature("missing signature".to_string()))?,
    })
}

/// Splits on commas that are not inside a quoted value.
fn split_signature_params(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

const REQUIRED_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date"];

/// Resolves a `did:key:<base64 pubkey>` identifier to a shadow agent,
/// creating one on first sight (§4.3). Plain agent ids resolve via direct
/// store lookup.
fn resolve_or_shadow_agent(
    store: &dyn Store,
    key_id: &str,
    registration_policy_open: bool,
) -> Result<Agent, AppError> {
    if let Some(rest) = key_id.strip_prefix("did:key:") {
        let public_key = crypto::b64_decode(rest)
            .map_err(|e| AppError::MalformedSignature(format!("invalid did:key: {e}")))?;
        let shadow_id = format!("did:key:{rest}");
        if let Some(agent) = store
            .get_agent(&shadow_id)
            .map_err(|e| AppError::Internal(e.to_string()))?
        {
            return Ok(agent);
        }
        let now = Utc::now();
        let agent = Agent {
            id: shadow_id.clone(),
            kind: "shadow".to_string(),
            keys: vec![crate::models::PublicKeyEntry {
                public_key,
                active: true,
                deactivate_at: None,
            }],
            registration_mode: crate::models::RegistrationMode::Imported,
            webhook: None,
            policy: Default::default(),
            last_heartbeat: now,
            metadata: serde_json::Value::Null,
            approved: registration_policy_open,
            created_at: now,
        };
        store
            .put_agent(agent.clone())
            .map_err(|e| AppError::Internal(e.to_string()))?;
        return Ok(agent);
    }

    store
        .get_agent(key_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("agent {key_id} not found")))
}

/// Verifies a request's `Signature` header against the resolved agent's
/// active (or recently-deactivated, inside the replay window) key set.
/// Returns the authenticated agent. Never falls back to API-key auth on a
/// present-but-invalid signature: that fallback was removed as a P0 fix.
pub fn verify_signed_request(
    store: &dyn Store,
    registration_policy_open: bool,
    method: &str,
    request_uri: &str,
    header_lookup: impl Fn(&str) -> Option<String>,
    signature_header: &str,
) -> Result<Agent, AppError> {
    let parsed = parse_signature_header(signature_header)?;

    if parsed.algorithm != "ed25519" {
        return Err(AppError::AlgorithmNotAllowed);
    }

    for required in REQUIRED_SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h.eq_ignore_ascii_case(required)) {
            return Err(AppError::MissingRequiredSignedHeader(required.to_string()));
        }
    }

    let date_value = header_lookup("date")
        .ok_or_else(|| AppError::MissingRequiredSignedHeader("date".to_string()))?;
    let date = chrono::DateTime::parse_from_rfc2822(&date_value)
        .map_err(|_| AppError::MalformedSignature("unparseable date".to_string()))?
        .with_timezone(&Utc);
    if !crypto::is_fresh(&date, &Utc::now()) {
        return Err(AppError::StaleDate);
    }

    let mut signed_headers = Vec::new();
    for name in &parsed.headers {
        if name.eq_ignore_ascii_case("(request-target)") {
            continue;
        }
        let value = header_lookup(name)
            .ok_or_else(|| AppError::MissingRequiredSignedHeader(name.clone()))?;
        signed_headers.push((name.as_str().to_owned(), value));
    }
    let signed_headers_ref: Vec<(&str, &str)> = signed_headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let signing_string = crypto::http_signing_string(method, request_uri, &signed_headers_ref, &parsed.headers)
        .map_err(AppError::MalformedSignature)?;

    let signature_bytes = crypto::b64_decode(&parsed.signature_b64)
        .map_err(AppError::MalformedSignature)?;
    let signature =
        crypto::signature_from_bytes(&signature_bytes).map_err(AppError::MalformedSignature)?;

    let agent = resolve_or_shadow_agent(store, &parsed.key_id, registration_policy_open)?;

    let verified = agent.keys.iter().any(|key| {
        if !key.active {
            if let Some(deactivate_at) = key.deactivate_at {
                if Utc::now() - deactivate_at > chrono::Duration::seconds(crypto::FRESHNESS_WINDOW_SECS) {
                    return false;
                }
            } else {
                return false;
            }
        }
        match crypto::verifying_key_from_bytes(&key.public_key) {
            Ok(vk) => crypto::verify(&vk, signing_string.as_bytes(), &signature),
            Err(_) => false,
        }
    });

    if !verified {
        return Err(AppError::SignatureInvalid);
    }

    Ok(agent)
}

/// An agent authenticated via a verified `Signature` header, with no subject
/// match enforced yet. Used for endpoints with no single subject (registration,
/// global lookups), which fall back to the API-key gate when unsigned.
pub struct SignedAgent(pub Agent);

/// An agent authenticated and confirmed to be the subject of the URL path
/// (e.g. the `{agent_id}` in `/agents/{agent_id}/inbox/pull`).
pub struct SubjectAgent(pub Agent);

/// Raw presented API key, if any, read from `X-Api-Key` or a `Bearer` token.
pub struct ApiKeyHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiKeyHeader {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let key = req
            .headers()
            .get_one("X-Api-Key")
            .map(|s| s.to_string())
            .or_else(|| {
                req.headers()
                    .get_one("Authorization")
                    .and_then(|a| a.strip_prefix("Bearer "))
                    .map(|s| s.to_string())
            });
        RocketOutcome::Success(ApiKeyHeader(key))
    }
}

/// Verifies the request's `Signature` header without enforcing a subject
/// match. Used by endpoints with no single subject agent (registration,
/// global lookups).
pub async fn authenticate_signed(req: &Request<'_>) -> Result<SignedAgent, AppError> {
    let store = req.rocket().state::<Arc<dyn Store>>().expect("Store managed");
    let config = req.rocket().state::<Config>().expect("Config managed");

    let sig_header = req
        .headers()
        .get_one("Signature")
        .ok_or(AppError::MissingSignature)?;

    let method = req.method().as_str().to_string();
    let uri = req.uri().to_string();
    let headers = req.headers().clone();
    let agent = verify_signed_request(
        store.as_ref(),
        config.registration_policy == crate::config::RegistrationPolicy::Open,
        &method,
        &uri,
        |name| headers.get_one(name).map(|s| s.to_string()),
        sig_header,
    )?;
    Ok(SignedAgent(agent))
}

/// Resolves `SubjectAgent` against the `agent_id` path segment, enforcing
/// that the signed key owner equals the subject: a signature only
/// authorizes acting as the agent that produced it (§4.3).
pub async fn require_subject_match<'r>(
    req: &'r Request<'_>,
    subject_agent_id: &str,
) -> Result<SubjectAgent, AppError> {
    let store = req.rocket().state::<Arc<dyn Store>>().expect("Store managed");
    let config = req.rocket().state::<Config>().expect("Config managed");

    let Some(sig_header) = req.headers().get_one("Signature") else {
        return Err(AppError::MissingSignature);
    };

    let method = req.method().as_str().to_string();
    let uri = req.uri().to_string();
    let headers = req.headers().clone();
    let agent = verify_signed_request(
        store.as_ref(),
        config.registration_policy == crate::config::RegistrationPolicy::Open,
        &method,
        &uri,
        |name| headers.get_one(name).map(|s| s.to_string()),
        sig_header,
    )?;

    if agent.id != subject_agent_id {
        return Err(AppError::SubjectMismatchForbidden);
    }
    if !agent.approved {
        return Err(AppError::AgentNotApproved);
    }
    Ok(SubjectAgent(agent))
}

/// Shared-secret gate for endpoints with no subject agent (registration,
/// global lookups) or as a fallback when `REQUIRE_HTTP_SIGNATURES` is unset.
pub fn check_api_key(config: &Config, provided: Option<&str>) -> Result<(), AppError> {
    if !config.api_key_required {
        return Ok(());
    }
    let Some(master_key) = &config.master_api_key else {
        return Ok(());
    };
    match provided {
        None => Err(AppError::ApiKeyRequired),
        Some(key) if key == master_key => Ok(()),
        Some(_) => Err(AppError::ApiKeyInvalid),
    }
}
