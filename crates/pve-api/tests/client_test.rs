// Client transport tests: login session capture, envelope error mapping,
// and the bounded read retry.

use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pve_api::{Client, Error, VmKind, VmRef};

fn client_for(server: &MockServer) -> Client {
    let base = Url::parse(&server.uri()).expect("mock server uri");
    Client::with_client(reqwest::Client::new(), base)
}

#[tokio::test]
async fn login_captures_ticket_and_csrf_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .and(body_string_contains("username=root%40pam"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "ticket": "PVE:root@pam:4EEC61E2",
                "CSRFPreventionToken": "4EEC61E2:lwk7od06",
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    // a mutating request afterwards must carry both session artifacts
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/100/monitor"))
        .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:4EEC61E2"))
        .and(header("CSRFPreventionToken", "4EEC61E2:lwk7od06"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": "" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .login("root@pam", &SecretString::from("hunter2"))
        .await
        .expect("login succeeds");

    let vmr = VmRef::new(100, "pve1", VmKind::Qemu);
    client
        .monitor_cmd(&vmr, "info status")
        .await
        .expect("authenticated request succeeds");
}

#[tokio::test]
async fn wrong_credentials_surface_as_authentication_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(401).set_body_string("authentication failure"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .login("root@pam", &SecretString::from("wrong"))
        .await
        .expect_err("login must fail");
    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
}

#[tokio::test]
async fn expired_ticket_maps_to_authentication_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.next_vm_id(None).await.expect_err("must fail");
    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
}

#[tokio::test]
async fn server_error_body_is_folded_into_the_api_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(json!({ "errors": "unable to open database" })),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.next_vm_id(None).await.expect_err("must fail");
    match err {
        Error::Api { message } => {
            assert!(message.contains("500"), "status missing: {message}");
            assert!(
                message.contains("unable to open database"),
                "detail missing: {message}"
            );
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn multibyte_error_body_still_maps_to_an_api_error() {
    let server = MockServer::start().await;

    // 199 ASCII bytes followed by a 3-byte character straddling the
    // preview cut-off; the body is not JSON so the raw preview is used
    let body = format!("{}€ quota exceeded", "x".repeat(199));
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(ResponseTemplate::new(500).set_body_string(body))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.next_vm_id(None).await.expect_err("must fail");
    match err {
        Error::Api { message } => assert!(message.contains("500"), "got: {message}"),
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn multibyte_unparseable_body_still_maps_to_a_deserialization_error() {
    let server = MockServer::start().await;

    let body = format!("{}€ quota exceeded", "x".repeat(199));
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.next_vm_id(None).await.expect_err("must fail");
    assert!(matches!(err, Error::Deserialization { .. }), "got {err:?}");
}

#[tokio::test]
async fn retryable_read_recovers_after_transient_failures() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/storage"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api2/json/storage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "storage": "local-lvm", "type": "lvmthin" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let envelope = client
        .get_json_retryable_with("/storage", 3, Duration::from_millis(10))
        .await
        .expect("third attempt succeeds");

    let pools = envelope
        .get("data")
        .and_then(Value::as_array)
        .expect("data array");
    assert_eq!(pools.len(), 1);
}

#[tokio::test]
async fn retryable_read_gives_up_after_the_last_attempt() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/storage"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .get_json_retryable_with("/storage", 3, Duration::from_millis(10))
        .await
        .expect_err("all attempts fail");
    assert!(matches!(err, Error::Api { .. }), "got {err:?}");
}
