use crate::common::{register_agent, sign_headers, test_client};
use admp_relay::crypto::sha256_hex;
use rocket::http::{ContentType, Status};

#[test]
fn create_makes_the_creator_an_admin() {
    let client = test_client();
    let alice = register_agent(&client, "group-alice");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "crew", "created_by": "group-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let group: serde_json::Value = res.into_json().unwrap();
    assert_eq!(group["members"][0]["agent_id"], "group-alice");
    assert_eq!(group["members"][0]["role"], "admin");
}

#[test]
fn create_rejects_a_created_by_that_does_not_match_the_caller() {
    let client = test_client();
    let alice = register_agent(&client, "group-impersonator");
    register_agent(&client, "group-victim");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "crew", "created_by": "group-victim"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);
}

#[test]
fn open_group_join_succeeds_without_a_key() {
    let client = test_client();
    let alice = register_agent(&client, "open-alice");
    let bob = register_agent(&client, "open-bob");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "open-crew", "created_by": "open-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let join_path = format!("/api/v1/groups/{group_id}/join");
    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "open-bob"}"#);
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let group: serde_json::Value = res.into_json().unwrap();
    assert!(group["members"].as_array().unwrap().iter().any(|m| m["agent_id"] == "open-bob"));
}

#[test]
fn key_protected_group_requires_the_matching_key() {
    let client = test_client();
    let alice = register_agent(&client, "kp-alice");
    let bob = register_agent(&client, "kp-bob");

    let key_hash = sha256_hex(b"hunter2");
    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client.post("/api/v1/groups").header(ContentType::JSON).body(format!(
        r#"{{"name": "kp-crew", "created_by": "kp-alice", "access": {{"type": "key_protected", "join_key_hash": "{key_hash}"}}}}"#
    ));
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let join_path = format!("/api/v1/groups/{group_id}/join");
    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path.clone())
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "kp-bob", "key": "wrong"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);

    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "kp-bob", "key": "hunter2"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);
}

#[test]
fn invite_only_group_rejects_self_service_join() {
    let client = test_client();
    let alice = register_agent(&client, "invite-alice");
    let bob = register_agent(&client, "invite-bob");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client.post("/api/v1/groups").header(ContentType::JSON).body(
        r#"{"name": "invite-crew", "created_by": "invite-alice", "access": {"type": "invite_only"}}"#,
    );
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let join_path = format!("/api/v1/groups/{group_id}/join");
    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "invite-bob"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);
}

#[test]
fn add_member_requires_an_admin_caller() {
    let client = test_client();
    let alice = register_agent(&client, "admin-alice");
    let bob = register_agent(&client, "admin-bob");
    register_agent(&client, "admin-carol");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "admin-crew", "created_by": "admin-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    // Bob is not a member, let alone an admin: adding Carol must fail.
    let members_path = format!("/api/v1/groups/{group_id}/members");
    let headers = sign_headers(&bob, "POST", &members_path);
    let mut req = client
        .post(members_path.clone())
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "admin-carol"}"#);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);

    // Alice, the creator/admin, can add Carol.
    let headers = sign_headers(&alice, "POST", &members_path);
    let mut req = client
        .post(members_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "admin-carol"}"#);
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let group: serde_json::Value = res.into_json().unwrap();
    assert!(group["members"].as_array().unwrap().iter().any(|m| m["agent_id"] == "admin-carol"));
}

#[test]
fn leave_removes_the_caller_from_membership() {
    let client = test_client();
    let alice = register_agent(&client, "leave-alice");
    let bob = register_agent(&client, "leave-bob");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "leave-crew", "created_by": "leave-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let join_path = format!("/api/v1/groups/{group_id}/join");
    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "leave-bob"}"#);
    for h in headers {
        req = req.header(h);
    }
    req.dispatch();

    let leave_path = format!("/api/v1/groups/{group_id}/leave");
    let headers = sign_headers(&bob, "POST", &leave_path);
    let mut req = client.post(leave_path);
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let group: serde_json::Value = res.into_json().unwrap();
    assert!(!group["members"].as_array().unwrap().iter().any(|m| m["agent_id"] == "leave-bob"));
}

#[test]
fn post_fans_out_to_members_but_not_the_sender() {
    let client = test_client();
    let alice = register_agent(&client, "fanout-alice");
    let bob = register_agent(&client, "fanout-bob");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "fanout-crew", "created_by": "fanout-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let join_path = format!("/api/v1/groups/{group_id}/join");
    let headers = sign_headers(&bob, "POST", &join_path);
    let mut req = client
        .post(join_path)
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "fanout-bob"}"#);
    for h in headers {
        req = req.header(h);
    }
    req.dispatch();

    let post_path = format!("/api/v1/groups/{group_id}/messages");
    let headers = sign_headers(&alice, "POST", &post_path);
    let mut req = client.post(post_path).header(ContentType::JSON).body(
        r#"{"from": "fanout-alice", "subject": "announce", "body": {"text": "hi crew"}}"#,
    );
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Ok);

    // Bob, the only other member, should have a delivered message in his inbox.
    let pull_path = format!("/api/v1/agents/fanout-bob/inbox/pull");
    let headers = sign_headers(&bob, "POST", &pull_path);
    let mut req = client
        .post(pull_path)
        .header(ContentType::JSON)
        .body("{}");
    for h in headers {
        req = req.header(h);
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let pulled: serde_json::Value = res.into_json().unwrap();
    assert_eq!(pulled["subject"], "announce");
}

#[test]
fn history_is_hidden_when_history_visible_is_false() {
    let client = test_client();
    let alice = register_agent(&client, "hist-alice");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client.post("/api/v1/groups").header(ContentType::JSON).body(
        r#"{"name": "quiet-crew", "created_by": "hist-alice", "settings": {"history_visible": false, "max_members": 256}}"#,
    );
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let post_path = format!("/api/v1/groups/{group_id}/messages");
    let headers = sign_headers(&alice, "POST", &post_path);
    let mut req = client.post(post_path).header(ContentType::JSON).body(
        r#"{"from": "hist-alice", "subject": "note", "body": {}}"#,
    );
    for h in headers {
        req = req.header(h);
    }
    req.dispatch();

    let history_path = format!("/api/v1/groups/{group_id}/messages");
    let headers = sign_headers(&alice, "GET", &history_path);
    let mut req = client.get(history_path);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);
}

#[test]
fn history_requires_membership() {
    let client = test_client();
    let alice = register_agent(&client, "hist2-alice");
    let outsider = register_agent(&client, "hist2-outsider");

    let headers = sign_headers(&alice, "POST", "/api/v1/groups");
    let mut req = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "loud-crew", "created_by": "hist2-alice"}"#);
    for h in headers {
        req = req.header(h);
    }
    let group: serde_json::Value = req.dispatch().into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    let history_path = format!("/api/v1/groups/{group_id}/messages");
    let headers = sign_headers(&outsider, "GET", &history_path);
    let mut req = client.get(history_path);
    for h in headers {
        req = req.header(h);
    }
    assert_eq!(req.dispatch().status(), Status::Forbidden);
}
