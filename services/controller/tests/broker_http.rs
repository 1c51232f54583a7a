//! HTTP broker client against a mock server.

use std::time::Duration;

use hostcycle_controller::broker::{
    BrokerApi, BrokerClient, BrokerError, RegistrationState, SessionState, UserMessage,
};
use hostcycle_fleet::{MachineId, SessionId};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> BrokerClient {
    BrokerClient::new(&server.uri(), Some("secret"), Duration::from_secs(5)).unwrap()
}

fn machine(s: &str) -> MachineId {
    MachineId::parse(s).unwrap()
}

#[tokio::test]
async fn test_list_machines_by_tag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/machines"))
        .and(query_param("tag", "wave-1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "CORP\\VDA-01", "in_maintenance": false},
            {"id": "CORP\\VDA-02", "in_maintenance": true}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let machines = client(&server).list_machines("wave-1").await.unwrap();

    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0].id.as_str(), "CORP\\VDA-01");
    assert!(machines[1].in_maintenance);
}

#[tokio::test]
async fn test_session_count_and_registration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/vda-01/sessions/count"))
        .and(query_param("active_only", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 3})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/vda-01"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"registration_state": "registered"})),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(client.session_count(&machine("vda-01"), true).await.unwrap(), 3);
    assert_eq!(
        client.registration_state(&machine("vda-01")).await.unwrap(),
        RegistrationState::Registered
    );
}

#[tokio::test]
async fn test_control_requests() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/machines/vda-01/maintenance"))
        .and(body_json(json!({"enabled": true})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/machines/vda-01/power"))
        .and(body_json(json!({"action": "restart"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.set_maintenance(&machine("vda-01"), true).await.unwrap();
    client.restart(&machine("vda-01")).await.unwrap();
}

#[tokio::test]
async fn test_sessions_and_messages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/vda-01/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "s-1", "user": "alice", "state": "active"},
            {"id": "s-2", "state": "connecting"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sessions/s-1/message"))
        .and(body_json(json!({"title": "Restart", "body": "Save your work"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let sessions = client.list_sessions(&machine("vda-01"), true).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].state, SessionState::Active);
    assert_eq!(sessions[1].state, SessionState::Other);
    assert_eq!(sessions[1].user, None);

    let message = UserMessage {
        title: "Restart".to_string(),
        body: "Save your work".to_string(),
    };
    client
        .send_message(&SessionId::parse("s-1").unwrap(), &message)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_error_status_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/machines/vda-01/power"))
        .respond_with(ResponseTemplate::new(409).set_body_string("power action pending"))
        .mount(&server)
        .await;

    let err = client(&server)
        .restart(&machine("vda-01"))
        .await
        .unwrap_err();

    match err {
        BrokerError::Status { status, body } => {
            assert_eq!(status, 409);
            assert_eq!(body, "power action pending");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_machine_names_are_path_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/CORP%5CVDA-01/sessions/count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let count = client(&server)
        .session_count(&machine("CORP\\VDA-01"), false)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
