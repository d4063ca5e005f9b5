use crate::common::{register_agent, sign_headers, sign_headers_as, test_client};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rocket::http::{ContentType, Status};

#[test]
fn register_returns_generated_keypair() {
    let client = test_client();
    let res = client
        .post("/api/v1/agents/register")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_id"], "alice");
    assert!(body["secret_key"].is_string());
    assert!(body["public_key"].is_string());
}

#[test]
fn register_rejects_duplicate_agent_id() {
    let client = test_client();
    register_agent(&client, "dup");
    let res = client
        .post("/api/v1/agents/register")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "dup"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn register_rejects_empty_agent_id() {
    let client = test_client();
    let res = client
        .post("/api/v1/agents/register")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": ""}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn heartbeat_requires_subject_match() {
    let client = test_client();
    let alice = register_agent(&client, "alice-hb");
    let bob = register_agent(&client, "bob-hb");

    let headers = sign_headers(&bob, "POST", "/api/v1/agents/alice-hb/heartbeat");
    let mut req = client.post("/api/v1/agents/alice-hb/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let headers = sign_headers(&alice, "POST", "/api/v1/agents/alice-hb/heartbeat");
    let mut req = client.post("/api/v1/agents/alice-hb/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);
}

#[test]
fn rotate_key_grace_window_allows_the_old_signature() {
    let client = test_client();
    let agent = register_agent(&client, "rotator");

    let headers = sign_headers(&agent, "POST", "/api/v1/agents/rotator/rotate-key");
    let mut req = client
        .post("/api/v1/agents/rotator/rotate-key")
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["secret_key"].is_string());

    // The just-rotated-out key is still inside the freshness grace window, so
    // a request signed with it still verifies.
    let headers = sign_headers(&agent, "POST", "/api/v1/agents/rotator/heartbeat");
    let mut req = client.post("/api/v1/agents/rotator/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);
}

#[test]
fn webhook_set_get_delete_round_trip() {
    let client = test_client();
    let agent = register_agent(&client, "webhook-owner");

    let headers = sign_headers(&agent, "POST", "/api/v1/agents/webhook-owner/webhook");
    let mut req = client
        .post("/api/v1/agents/webhook-owner/webhook")
        .header(ContentType::JSON)
        .body(r#"{"url": "http://localhost:9999/hook", "secret": "shh"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);

    let headers = sign_headers(&agent, "GET", "/api/v1/agents/webhook-owner/webhook");
    let mut req = client.get("/api/v1/agents/webhook-owner/webhook");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["url"], "http://localhost:9999/hook");
    assert!(body.get("secret").is_none(), "webhook secret must never be echoed back");

    let headers = sign_headers(&agent, "DELETE", "/api/v1/agents/webhook-owner/webhook");
    let mut req = client.delete("/api/v1/agents/webhook-owner/webhook");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);

    let headers = sign_headers(&agent, "GET", "/api/v1/agents/webhook-owner/webhook");
    let mut req = client.get("/api/v1/agents/webhook-owner/webhook");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::NotFound);
}

#[test]
fn shadow_agent_requires_approval_before_acting() {
    let client = test_client();
    let mut csprng = OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    // URL-safe, unpadded so the did:key value survives as a single path segment.
    let public_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes());
    let shadow_id = format!("did:key:{public_b64}");

    let path = format!("/api/v1/agents/{shadow_id}/heartbeat");
    let headers = sign_headers_as(&shadow_id, &signing_key, "POST", &path);
    let mut req = client.post(path.clone());
    for h in headers {
        req = req.header(h);
    }
    // Default registration policy is approval-required: the shadow agent is
    // created on first sight but not yet approved.
    assert_eq!(req.dispatch().status(), Status::Forbidden);

    let res = client.post(format!("/api/v1/agents/{shadow_id}/approve")).dispatch();
    assert_eq!(res.status(), Status::Ok);

    let headers = sign_headers_as(&shadow_id, &signing_key, "POST", &path);
    let mut req = client.post(path);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);
}

#[test]
fn inbox_stats_counts_by_status() {
    let client = test_client();
    let sender = register_agent(&client, "stats-sender");
    let recipient = register_agent(&client, "stats-recipient");
    let _ = sender;

    let body = crate::common::envelope_json("stats-sender", "stats-recipient", "ping", serde_json::json!({}));
    let res = client
        .post("/api/v1/agents/stats-recipient/messages")
        .header(ContentType::JSON)
        .body(body)
        .dispatch();
    assert_eq!(res.status(), Status::Created);

    let headers = sign_headers(&recipient, "GET", "/api/v1/agents/stats-recipient/inbox/stats");
    let mut req = client.get("/api/v1/agents/stats-recipient/inbox/stats");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["counts"]["delivered"], 1);
}
