// Task lifecycle tests: submission-envelope transitions, polling to a
// terminal status, the deadline, and truncated-read tolerance.

use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pve_api::{Client, TaskOutcome, WaitOptions};

const UPID: &str = "UPID:pve1:00051234:1A2B3C4D:65CB0000:vzcreate:100:root@pam:";
const STATUS_PATH: &str =
    "/api2/json/nodes/pve1/tasks/UPID:pve1:00051234:1A2B3C4D:65CB0000:vzcreate:100:root@pam:/status";

fn client_for(server: &MockServer) -> Client {
    let base = Url::parse(&server.uri()).expect("mock server uri");
    Client::with_client(reqwest::Client::new(), base)
}

fn fast_wait() -> WaitOptions {
    WaitOptions {
        poll_interval: Duration::from_millis(10),
        deadline: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn submission_rejection_fails_without_any_poll() {
    let server = MockServer::start().await;
    let client = client_for(&server);

    let envelope = json!({ "data": null, "errors": "parameter verification failed" });
    let outcome = client
        .wait_for_task(&envelope, &fast_wait())
        .await
        .expect("wait itself succeeds");

    assert_eq!(
        outcome,
        TaskOutcome::Failure("parameter verification failed".into())
    );
    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests.is_empty(), "rejection must not trigger polling");
}

#[tokio::test]
async fn synchronous_completion_succeeds_without_any_poll() {
    let server = MockServer::start().await;
    let client = client_for(&server);

    let envelope = json!({ "data": null });
    let outcome = client
        .wait_for_task(&envelope, &fast_wait())
        .await
        .expect("wait itself succeeds");

    assert_eq!(outcome, TaskOutcome::Success(String::new()));
    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests.is_empty());
}

#[tokio::test]
async fn polling_continues_until_the_task_reports_ok() {
    let server = MockServer::start().await;

    // still running for the first two polls
    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": "running" }
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": "stopped", "exitstatus": "OK" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client
        .wait_for_task(&json!({ "data": UPID }), &fast_wait())
        .await
        .expect("wait succeeds");

    assert_eq!(outcome, TaskOutcome::Success("OK".into()));
}

#[tokio::test]
async fn non_ok_exit_status_is_a_failure_with_the_verbatim_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "status": "stopped",
                "exitstatus": "unable to create CT 100 - no such volume group",
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client
        .wait_for_task(&json!({ "data": UPID }), &fast_wait())
        .await
        .expect("wait succeeds");

    assert_eq!(
        outcome,
        TaskOutcome::Failure("unable to create CT 100 - no such volume group".into())
    );
}

#[tokio::test]
async fn deadline_elapsing_yields_a_timeout_carrying_the_upid() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": "running" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let opts = WaitOptions {
        poll_interval: Duration::from_millis(10),
        deadline: Duration::from_millis(50),
    };
    let outcome = client
        .wait_for_task(&json!({ "data": UPID }), &opts)
        .await
        .expect("wait succeeds");

    match outcome {
        TaskOutcome::Timeout(upid) => assert_eq!(upid.as_str(), UPID),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn truncated_status_read_is_tolerated_and_polling_continues() {
    let server = MockServer::start().await;

    // body cut off mid-object, as if the connection dropped
    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":{"exitst"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": "stopped", "exitstatus": "OK" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client
        .wait_for_task(&json!({ "data": UPID }), &fast_wait())
        .await
        .expect("truncated read must not abort the wait");

    assert_eq!(outcome, TaskOutcome::Success("OK".into()));
}

#[tokio::test]
async fn malformed_upid_in_the_envelope_is_an_error() {
    let server = MockServer::start().await;
    let client = client_for(&server);

    let err = client
        .wait_for_task(&json!({ "data": "not-a-upid" }), &fast_wait())
        .await
        .expect_err("must fail");
    assert!(matches!(err, pve_api::Error::InvalidUpid { .. }), "got {err:?}");
}
