use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::Engine as _;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use wiremock::matchers::{header as wire_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use haas_broker::{
    config::Config, dispenser::HttpDispenser, http::build_router, store::BrokerStore,
};

const SERVICE_ID: &str = "5a9b9f22-a08d-11e5-8062-7831c1d4f660";
const PLAN_ID: &str = "6a977311-a08d-11e5-8062-7831c1d4f660";

fn test_config(data_dir: PathBuf, dispenser_url: String) -> Config {
    Config {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        data_dir,
        dispenser_url,
        dispenser_api_key: "k-123".to_string(),
        dispenser_timeout_secs: 2,
        broker_username: "marketplace".to_string(),
        broker_password: "brokersecret".to_string(),
        service_id: SERVICE_ID.to_string(),
        service_name: "haas".to_string(),
        plan_id: PLAN_ID.to_string(),
        plan_name: "m1.small".to_string(),
        dashboard_url: "".to_string(),
        dashboard_client_id: "haas-broker-ui".to_string(),
        dashboard_client_secret: "".to_string(),
    }
}

fn broker_app(tmp: &tempfile::TempDir, dispenser_url: String) -> axum::Router {
    let config = test_config(tmp.path().to_path_buf(), dispenser_url);
    let store = Arc::new(Mutex::new(BrokerStore::load_or_init(tmp.path()).unwrap()));
    let dispenser = Arc::new(HttpDispenser::new(
        &config.dispenser_url,
        &config.dispenser_api_key,
        config.dispenser_timeout(),
    ));
    build_router(config, store, dispenser)
}

fn basic_auth() -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode("marketplace:brokersecret");
    format!("Basic {encoded}")
}

fn req_authed(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, basic_auth())
        .body(Body::empty())
        .unwrap()
}

fn req_authed_json(method: &str, uri: &str, value: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, basic_auth())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn full_lifecycle_against_a_scripted_dispenser() {
    let dispenser = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/leases"))
        .and(wire_header("x-api-key", "k-123"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "task_id": "prov-1" })))
        .mount(&dispenser)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks/prov-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "pending",
            "description": "racking hardware",
        })))
        .up_to_n_times(1)
        .mount(&dispenser)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks/prov-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "result": {
                "dashboard_url": "https://haas.example/instances/inst-1",
                "serial": "SM-2041",
                "ipmi_host": "10.4.0.17",
            },
        })))
        .mount(&dispenser)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let app = broker_app(&tmp, dispenser.uri());

    let res = app
        .clone()
        .oneshot(req_authed_json(
            "PUT",
            "/v2/service_instances/inst-1",
            json!({
                "service_id": SERVICE_ID,
                "plan_id": PLAN_ID,
                "organization_guid": "org-1",
                "space_guid": "space-1",
                "parameters": { "network": "lab-10" },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = app
        .clone()
        .oneshot(req_authed(
            "GET",
            "/v2/service_instances/inst-1/last_operation",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let op = body_json(res).await;
    assert_eq!(op["state"], "in progress");
    assert_eq!(op["description"], "racking hardware");

    let res = app
        .clone()
        .oneshot(req_authed(
            "GET",
            "/v2/service_instances/inst-1/last_operation",
        ))
        .await
        .unwrap();
    let op = body_json(res).await;
    assert_eq!(op["state"], "succeeded");
    assert_eq!(op["description"], "HaaS Instance is ready.");

    let res = app
        .clone()
        .oneshot(req_authed_json(
            "PUT",
            "/v2/service_instances/inst-1/service_bindings/bind-1",
            json!({ "parameters": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let bound = body_json(res).await;
    assert_eq!(bound["credentials"]["serial"], "SM-2041");
    assert_eq!(bound["credentials"]["ipmi_host"], "10.4.0.17");
    assert!(!bound["credentials"]["binding_token"]
        .as_str()
        .unwrap()
        .is_empty());

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/dashboard/inst-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        res.headers().get(header::LOCATION).unwrap(),
        "https://haas.example/instances/inst-1"
    );

    let res = app
        .clone()
        .oneshot(req_authed(
            "DELETE",
            "/v2/service_instances/inst-1/service_bindings/bind-1",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    Mock::given(method("DELETE"))
        .and(path("/v1/leases/prov-1"))
        .and(wire_header("x-api-key", "k-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "rel-1" })))
        .mount(&dispenser)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks/rel-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "complete" })))
        .mount(&dispenser)
        .await;

    let res = app
        .clone()
        .oneshot(req_authed("DELETE", "/v2/service_instances/inst-1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = app
        .clone()
        .oneshot(req_authed(
            "GET",
            "/v2/service_instances/inst-1/last_operation",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let op = body_json(res).await;
    assert_eq!(op["state"], "succeeded");
    assert_eq!(op["description"], "HaaS Instance released.");

    let res = app
        .clone()
        .oneshot(req_authed(
            "GET",
            "/v2/service_instances/inst-1/last_operation",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .oneshot(req_authed("DELETE", "/v2/service_instances/inst-1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GONE);
}

#[tokio::test]
async fn lease_rejection_surfaces_as_bad_gateway() {
    let dispenser = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/leases"))
        .respond_with(ResponseTemplate::new(409).set_body_string("no free hardware"))
        .mount(&dispenser)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let app = broker_app(&tmp, dispenser.uri());

    let res = app
        .clone()
        .oneshot(req_authed_json(
            "PUT",
            "/v2/service_instances/inst-1",
            json!({
                "service_id": SERVICE_ID,
                "plan_id": PLAN_ID,
                "organization_guid": "org-1",
                "space_guid": "space-1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let err = body_json(res).await;
    assert_eq!(err["error"], "dispenser_rejected");
    assert!(err["description"].as_str().unwrap().contains("no free hardware"));

    // The failed attempt leaves nothing behind, so the platform sees 410 on
    // cleanup and 404 on polling.
    let res = app
        .clone()
        .oneshot(req_authed(
            "GET",
            "/v2/service_instances/inst-1/last_operation",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .oneshot(req_authed("DELETE", "/v2/service_instances/inst-1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GONE);
}
