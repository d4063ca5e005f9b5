use admp_relay::config::Config;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

/// Fresh in-memory-backed app per test.
pub fn test_client() -> Client {
    Client::tracked(admp_relay::rocket_with_config(Config::default())).expect("valid rocket instance")
}

pub fn test_client_with_config(config: Config) -> Client {
    Client::tracked(admp_relay::rocket_with_config(config)).expect("valid rocket instance")
}

pub struct TestAgent {
    pub id: String,
    pub signing_key: SigningKey,
}

/// Registers an agent with a relay-generated keypair and returns its signing key.
pub fn register_agent(client: &Client, id: &str) -> TestAgent {
    let res = client
        .post("/api/v1/agents/register")
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id": "{id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "registration of {id} failed");
    let body: serde_json::Value = res.into_json().unwrap();
    let secret_b64 = body["secret_key"].as_str().expect("secret_key present");
    let bytes = STANDARD.decode(secret_b64).unwrap();
    let arr: [u8; 32] = bytes.try_into().unwrap();
    TestAgent {
        id: id.to_string(),
        signing_key: SigningKey::from_bytes(&arr),
    }
}

/// Builds the `Host`/`Date`/`Signature` headers for a request signed by `agent`,
/// per the relay's `(request-target) host date` canonical string.
pub fn sign_headers(agent: &TestAgent, method: &str, path: &str) -> Vec<Header<'static>> {
    sign_headers_as(&agent.id, &agent.signing_key, method, path)
}

/// Same as [`sign_headers`] but with an explicit `keyId`, for tests that need
/// to present a signature under a different identity than the one that owns it.
pub fn sign_headers_as(key_id: &str, signing_key: &SigningKey, method: &str, path: &str) -> Vec<Header<'static>> {
    sign_headers_at(key_id, signing_key, method, path, Utc::now())
}

/// Same as [`sign_headers_as`] but with an explicit `Date`, so tests can
/// construct stale or future-dated requests.
pub fn sign_headers_at(
    key_id: &str,
    signing_key: &SigningKey,
    method: &str,
    path: &str,
    date: chrono::DateTime<Utc>,
) -> Vec<Header<'static>> {
    build_signature_headers(key_id, signing_key, method, path, date, false)
}

/// Same as [`sign_headers`], but flips the last character of the Ed25519
/// signature so the request carries a well-formed but invalid proof.
pub fn sign_headers_tampered(agent: &TestAgent, method: &str, path: &str) -> Vec<Header<'static>> {
    build_signature_headers(&agent.id, &agent.signing_key, method, path, Utc::now(), true)
}

fn build_signature_headers(
    key_id: &str,
    signing_key: &SigningKey,
    method: &str,
    path: &str,
    date: chrono::DateTime<Utc>,
    tamper: bool,
) -> Vec<Header<'static>> {
    let host = "relay.local".to_string();
    let date = date.to_rfc2822();
    let signing_string = format!(
        "(request-target): {} {}\nhost: {}\ndate: {}",
        method.to_lowercase(),
        path,
        host,
        date
    );
    let signature = signing_key.sign(signing_string.as_bytes());
    let mut sig_b64 = STANDARD.encode(signature.to_bytes());
    if tamper {
        // 64 signature bytes always base64-encode with trailing `==` padding;
        // flip the last non-padding character instead.
        let mut chars: Vec<char> = sig_b64.chars().collect();
        let idx = chars.len() - 3;
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        sig_b64 = chars.into_iter().collect();
    }
    let signature_header = format!(
        "keyId=\"{key_id}\",algorithm=\"ed25519\",headers=\"(request-target) host date\",signature=\"{sig_b64}\""
    );
    vec![
        Header::new("Host", host),
        Header::new("Date", date),
        Header::new("Signature", signature_header),
    ]
}

/// A minimal, always-fresh envelope JSON body. `to` is overwritten by the route
/// from the URL path, so the value here is cosmetic.
pub fn envelope_json(from: &str, to: &str, subject: &str, body: serde_json::Value) -> String {
    serde_json::json!({
        "version": "1",
        "id": "",
        "type": "task",
        "from": from,
        "to": to,
        "subject": subject,
        "body": body,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}
