use crate::common::{register_agent, sign_headers, sign_headers_at, sign_headers_tampered, test_client};
use chrono::Utc;
use rocket::http::Status;

#[test]
fn missing_signature_is_rejected() {
    let client = test_client();
    register_agent(&client, "auth-missing");
    let res = client.post("/api/v1/agents/auth-missing/heartbeat").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "missing_signature");
}

#[test]
fn stale_date_is_rejected() {
    let client = test_client();
    let agent = register_agent(&client, "auth-stale");
    let old_date = Utc::now() - chrono::Duration::seconds(301);
    let headers = sign_headers_at(&agent.id, &agent.signing_key, "POST", "/api/v1/agents/auth-stale/heartbeat", old_date);
    let mut req = client.post("/api/v1/agents/auth-stale/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "stale_date");
}

#[test]
fn tampered_signature_is_rejected() {
    let client = test_client();
    let agent = register_agent(&client, "auth-tamper");
    let headers = sign_headers_tampered(&agent, "POST", "/api/v1/agents/auth-tamper/heartbeat");

    let mut req = client.post("/api/v1/agents/auth-tamper/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "signature_invalid");
}

#[test]
fn signature_for_a_different_path_is_rejected() {
    let client = test_client();
    let agent = register_agent(&client, "auth-wrong-path");
    register_agent(&client, "auth-other-subject");

    // Sign for a path that isn't the one actually dispatched.
    let headers = sign_headers(&agent, "POST", "/api/v1/agents/auth-other-subject/heartbeat");
    let mut req = client.post("/api/v1/agents/auth-wrong-path/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn signature_does_not_authorize_a_different_subject() {
    let client = test_client();
    let alice = register_agent(&client, "auth-alice");
    register_agent(&client, "auth-bob");

    let headers = sign_headers(&alice, "POST", "/api/v1/agents/auth-bob/heartbeat");
    let mut req = client.post("/api/v1/agents/auth-bob/heartbeat");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "subject_mismatch_forbidden");
}
