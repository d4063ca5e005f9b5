use crate::common::{register_agent, test_client};
use rocket::http::Status;

#[test]
fn health_reports_ok() {
    let client = test_client();
    let res = client.get("/api/v1/healthz").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
}

#[test]
fn stats_reflects_registered_agents() {
    let client = test_client();
    register_agent(&client, "agent-1");
    register_agent(&client, "agent-2");

    let res = client.get("/api/v1/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_count"], 2);
    assert_eq!(body["stale_heartbeats"], 0);
}
