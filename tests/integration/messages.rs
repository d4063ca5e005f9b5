use crate::common::{envelope_json, register_agent, sign_headers, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn send_then_pull_then_ack_round_trip() {
    let client = test_client();
    register_agent(&client, "sender-1");
    let recipient = register_agent(&client, "recipient-1");

    let res = client
        .post("/api/v1/agents/recipient-1/messages")
        .header(ContentType::JSON)
        .body(envelope_json("sender-1", "recipient-1", "greet", serde_json::json!({"hello": "world"})))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let send_body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(send_body["status"], "delivered");

    let headers = sign_headers(&recipient, "POST", "/api/v1/agents/recipient-1/inbox/pull");
    let mut req = client
        .post("/api/v1/agents/recipient-1/inbox/pull")
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let pulled: serde_json::Value = res.into_json().unwrap();
    assert_eq!(pulled["status"], "leased");
    let message_id = pulled["id"].as_str().unwrap().to_string();

    let headers = sign_headers(
        &recipient,
        "POST",
        &format!("/api/v1/agents/recipient-1/messages/{message_id}/ack"),
    );
    let mut req = client
        .post(format!("/api/v1/agents/recipient-1/messages/{message_id}/ack"))
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);

    let res = client
        .get(format!("/api/v1/messages/{message_id}/status"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let status: serde_json::Value = res.into_json().unwrap();
    assert_eq!(status["status"], "acked");
}

#[test]
fn pull_on_empty_inbox_returns_no_content() {
    let client = test_client();
    let recipient = register_agent(&client, "recipient-empty");

    let headers = sign_headers(&recipient, "POST", "/api/v1/agents/recipient-empty/inbox/pull");
    let mut req = client
        .post("/api/v1/agents/recipient-empty/inbox/pull")
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::NoContent);
}

#[test]
fn pull_requires_the_recipient_to_be_the_caller() {
    let client = test_client();
    register_agent(&client, "recipient-guard");
    let other = register_agent(&client, "not-the-recipient");

    let headers = sign_headers(&other, "POST", "/api/v1/agents/recipient-guard/inbox/pull");
    let mut req = client
        .post("/api/v1/agents/recipient-guard/inbox/pull")
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);
}

#[test]
fn idempotency_key_collision_returns_the_original_message() {
    let client = test_client();
    register_agent(&client, "sender-idem");
    register_agent(&client, "recipient-idem");

    let body = envelope_json("sender-idem", "recipient-idem", "greet", serde_json::json!({}));
    let res1 = client
        .post("/api/v1/agents/recipient-idem/messages")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("Idempotency-Key", "dup-key"))
        .body(body.clone())
        .dispatch();
    let id1: serde_json::Value = res1.into_json().unwrap();

    let res2 = client
        .post("/api/v1/agents/recipient-idem/messages")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("Idempotency-Key", "dup-key"))
        .body(body)
        .dispatch();
    let id2: serde_json::Value = res2.into_json().unwrap();

    assert_eq!(id1["message_id"], id2["message_id"]);
}

#[test]
fn nack_requeues_then_dead_letters_after_max_attempts() {
    let client = test_client();
    register_agent(&client, "sender-nack");
    let recipient = register_agent(&client, "recipient-nack");

    let res = client
        .post("/api/v1/agents/recipient-nack/messages")
        .header(ContentType::JSON)
        .body(envelope_json("sender-nack", "recipient-nack", "task", serde_json::json!({})))
        .dispatch();
    let send_body: serde_json::Value = res.into_json().unwrap();
    let message_id = send_body["message_id"].as_str().unwrap().to_string();

    // attempts increments on nack-requeue, not on pull, so dead-lettering
    // (attempts >= max_attempts == 5) is observed on the 6th cycle.
    for _ in 0..6 {
        let headers = sign_headers(&recipient, "POST", "/api/v1/agents/recipient-nack/inbox/pull");
        let mut req = client
            .post("/api/v1/agents/recipient-nack/inbox/pull")
            .header(ContentType::JSON)
            .body("{}");
        for h in headers {
            req = req.header(h);
        }
        req.dispatch();

        let nack_path = format!("/api/v1/agents/recipient-nack/messages/{message_id}/nack");
        let headers = sign_headers(&recipient, "POST", &nack_path);
        let mut req = client
            .post(nack_path)
            .header(ContentType::JSON)
            .body(r#"{"delay_secs": 0}"#);
        for h in headers {
            req = req.header(h);
        }
        assert_eq!(req.dispatch().status(), Status::Ok);
    }

    let res = client.get(format!("/api/v1/messages/{message_id}/status")).dispatch();
    let status: serde_json::Value = res.into_json().unwrap();
    assert_eq!(status["status"], "dead");
}

#[test]
fn reply_targets_the_original_sender() {
    let client = test_client();
    register_agent(&client, "alice-reply");
    let bob = register_agent(&client, "bob-reply");

    let res = client
        .post("/api/v1/agents/bob-reply/messages")
        .header(ContentType::JSON)
        .body(envelope_json("alice-reply", "bob-reply", "question", serde_json::json!({"q": "?"})))
        .dispatch();
    let send_body: serde_json::Value = res.into_json().unwrap();
    let message_id = send_body["message_id"].as_str().unwrap().to_string();

    let reply_path = format!("/api/v1/agents/bob-reply/messages/{message_id}/reply");
    let headers = sign_headers(&bob, "POST", &reply_path);
    let mut req = client
        .post(reply_path)
        .header(ContentType::JSON)
        .body(envelope_json("bob-reply", "alice-reply", "answer", serde_json::json!({"a": "!"})));
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let reply_body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(reply_body["status"], "delivered");
    assert_ne!(reply_body["message_id"], message_id);
}
