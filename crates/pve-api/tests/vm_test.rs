// VM operation tests: resolution against cluster resources, the creation
// orchestrator with volume pre-creation and rollback, and config-update
// method selection.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pve_api::{Client, Error, Params, VmKind, VmRef, WaitOptions};

const UPID: &str = "UPID:pve1:00051234:1A2B3C4D:65CB0000:vzcreate:100:root@pam:";

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

async fn mount_resources(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .and(query_param("type", "vm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "vmid": 100, "node": "pve1", "type": "lxc", "name": "ct-web" },
                { "vmid": 101, "node": "pve2", "type": "qemu", "name": "vm-db" },
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn resolve_vm_yields_node_and_kind() {
    let server = MockServer::start().await;
    mount_resources(&server).await;

    let client = client_for(&server);
    let vmr = client.resolve_vm(101).await.expect("vm exists");

    assert_eq!(vmr.id(), 101);
    assert_eq!(vmr.node(), "pve2");
    assert_eq!(vmr.kind(), VmKind::Qemu);
}

#[tokio::test]
async fn resolving_an_unknown_id_is_not_found() {
    let server = MockServer::start().await;
    mount_resources(&server).await;

    let client = client_for(&server);
    let err = client.resolve_vm(999).await.expect_err("no such vm");
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn find_vm_resolves_by_name() {
    let server = MockServer::start().await;
    mount_resources(&server).await;

    let client = client_for(&server);
    let vmr = client.find_vm("ct-web").await.expect("name exists");
    assert_eq!(vmr.id(), 100);
    assert_eq!(vmr.kind(), VmKind::Lxc);
}

fn creation_params() -> Params {
    let mut params = Params::new();
    params.insert("vmid".into(), json!(100));
    params.insert("hostname".into(), json!("ct-web"));
    params.insert("rootfs".into(), json!("size=8G,local-lvm:8"));
    params.insert(
        "mp0".into(),
        json!("size=10G,volume=local-lvm:vm-100-disk-2,mp=/data"),
    );
    params.insert(
        "mp1".into(),
        json!("size=5G,volume=local-lvm:vm-100-disk-3,mp=/srv"),
    );
    params
}

async fn mount_volume_creation(server: &MockServer, volume: &str) {
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/storage/local-lvm/content"))
        .and(body_string_contains(volume))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": format!("local-lvm:{volume}")
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_vm_pre_creates_mount_volumes_then_creates_the_entity() {
    let server = MockServer::start().await;
    mount_volume_creation(&server, "vm-100-disk-2").await;
    mount_volume_creation(&server, "vm-100-disk-3").await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": UPID })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve1/tasks/.*/status$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": "stopped", "exitstatus": "OK" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(100, "pve1", VmKind::Lxc);
    client
        .create_vm(&vmr, &creation_params(), &fast_wait())
        .await
        .expect("creation succeeds");
}

#[tokio::test]
async fn failed_creation_rolls_back_every_pre_created_volume() {
    let server = MockServer::start().await;
    mount_volume_creation(&server, "vm-100-disk-2").await;
    mount_volume_creation(&server, "vm-100-disk-3").await;

    // submission rejected outright: no task to poll
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": "CT 100 already exists",
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path_regex(
            r"^/api2/json/nodes/pve1/storage/local-lvm/content/vm-100-disk-[23]$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(100, "pve1", VmKind::Lxc);
    let err = client
        .create_vm(&vmr, &creation_params(), &fast_wait())
        .await
        .expect_err("creation must fail");

    // the original creation failure surfaces, not the cleanup
    match err {
        Error::TaskFailed { status } => assert_eq!(status, "CT 100 already exists"),
        other => panic!("expected task failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_rollback_reports_both_failures() {
    let server = MockServer::start().await;
    mount_volume_creation(&server, "vm-100-disk-2").await;
    mount_volume_creation(&server, "vm-100-disk-3").await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": "CT 100 already exists",
        })))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api2/json/nodes/pve1/storage/.*$"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errors": "volume is in use"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(100, "pve1", VmKind::Lxc);
    let err = client
        .create_vm(&vmr, &creation_params(), &fast_wait())
        .await
        .expect_err("creation must fail");

    match &err {
        Error::Rollback { creation, cleanup } => {
            assert!(matches!(**creation, Error::TaskFailed { .. }));
            assert!(matches!(**cleanup, Error::Api { .. }));
        }
        other => panic!("expected rollback error, got {other:?}"),
    }
    assert!(matches!(
        err.creation_failure(),
        Error::TaskFailed { .. }
    ));
}

#[tokio::test]
async fn volume_creation_failure_aborts_before_the_entity_request() {
    let server = MockServer::start().await;

    // first volume fails; the entity endpoint must never be hit
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/storage/local-lvm/content"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errors": "no space left"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": UPID })))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(100, "pve1", VmKind::Lxc);
    let mut params = Params::new();
    params.insert(
        "mp0".into(),
        json!("size=10G,volume=local-lvm:vm-100-disk-2,mp=/data"),
    );
    let err = client
        .create_vm(&vmr, &params, &fast_wait())
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Api { .. }), "got {err:?}");
}

#[tokio::test]
async fn qemu_config_updates_use_post() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/101/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(101, "pve1", VmKind::Qemu);
    let mut params = Params::new();
    params.insert("memory".into(), json!(2048));
    client
        .set_vm_config(&vmr, &params)
        .await
        .expect("update succeeds");
}

#[tokio::test]
async fn lxc_config_updates_use_put() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api2/json/nodes/pve1/lxc/100/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vmr = VmRef::new(100, "pve1", VmKind::Lxc);
    let mut params = Params::new();
    params.insert("memory".into(), json!(1024));
    client
        .set_vm_config(&vmr, &params)
        .await
        .expect("update succeeds");
}
