//! Standalone regression tests.
//!
//! Drives the full router in-process: package upload, space creation,
//! serving, capability execution, subscriptions, and event publication.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use spacegrid_api::{StaticTokenSigner, build_router};
use spacegrid_core::{SpaceGridConfig, UnconfiguredRuntime};
use spacegrid_engine::Engine;
use spacegrid_state::StateStore;

const OWNER: &str = "owner-token";
const STRANGER: &str = "stranger-token";

fn test_app() -> (Arc<Engine>, Router) {
    let engine = Arc::new(Engine::new(
        SpaceGridConfig::default(),
        StateStore::open_in_memory().unwrap(),
        Arc::new(UnconfiguredRuntime),
    ));
    let signer = Arc::new(StaticTokenSigner::new(HashMap::from([
        (OWNER.to_string(), 1),
        (STRANGER.to_string(), 2),
    ])));
    let router = build_router(engine.clone(), signer);
    (engine, router)
}

fn package_zip() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    let files = [
        (
            "manifest.json",
            r#"{"name":"site","version":"1.0.0","route_option":{"router_type":"simple","serve_folder":"www","on_not_found_file":"404.html"}}"#,
        ),
        ("www/index.html", "<h1>home</h1>"),
        ("www/css/site.css", "body{}"),
        ("www/404.html", "<h1>lost</h1>"),
    ];
    for (path, body) in files {
        zip.start_file(path, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(body).unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Upload the package and create a space on it; returns (install_id, space_id).
async fn install_and_create_space(router: &Router, namespace: &str) -> (i64, i64) {
    let resp = router
        .clone()
        .oneshot(request("POST", "/api/v1/packages", Some(OWNER), Body::from(package_zip())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let install_id = json_body(resp).await["data"]["id"].as_i64().unwrap();

    let body = serde_json::json!({ "install_id": install_id, "namespace_key": namespace });
    let resp = router
        .clone()
        .oneshot(request("POST", "/api/v1/spaces", Some(OWNER), Body::from(body.to_string())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let space_id = json_body(resp).await["data"]["id"].as_i64().unwrap();
    (install_id, space_id)
}

#[tokio::test]
async fn standalone_healthz() {
    let (_, router) = test_app();
    let resp = router
        .oneshot(request("GET", "/healthz", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn standalone_rejects_missing_and_unknown_tokens() {
    let (_, router) = test_app();
    let resp = router
        .clone()
        .oneshot(request("POST", "/api/v1/packages", None, Body::from(package_zip())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router
        .oneshot(request("POST", "/api/v1/packages", Some("forged"), Body::from(package_zip())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn standalone_serves_space_files() {
    let (engine, router) = test_app();
    install_and_create_space(&router, "site").await;
    engine.reload_routing_index().unwrap();

    let resp = router
        .clone()
        .oneshot(request("GET", "/z/site", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(text_body(resp).await, "<h1>home</h1>");

    let resp = router
        .clone()
        .oneshot(request("GET", "/z/site/css/site.css", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/css")
    );

    let resp = router
        .clone()
        .oneshot(request("GET", "/z/site/missing.html", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(text_body(resp).await, "<h1>lost</h1>");

    let resp = router
        .oneshot(request("GET", "/z/elsewhere", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_space_creation_checks_ownership() {
    let (_, router) = test_app();
    let (install_id, _) = install_and_create_space(&router, "mine").await;

    let body = serde_json::json!({ "install_id": install_id, "namespace_key": "theirs" });
    let resp = router
        .clone()
        .oneshot(request("POST", "/api/v1/spaces", Some(STRANGER), Body::from(body.to_string())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let body = serde_json::json!({ "install_id": install_id, "namespace_key": "mine" });
    let resp = router
        .oneshot(request("POST", "/api/v1/spaces", Some(OWNER), Body::from(body.to_string())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn standalone_capability_execute() {
    let (_, router) = test_app();
    let (_, space_id) = install_and_create_space(&router, "kv").await;
    let cap_uri = format!("/api/v1/spaces/{space_id}/capabilities/kv");

    let resp = router
        .clone()
        .oneshot(request("POST", &cap_uri, Some(STRANGER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = router
        .clone()
        .oneshot(request("POST", &cap_uri, Some(OWNER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(json_body(resp).await["data"]["name"], "kv");

    let uri = format!("/api/v1/spaces/{space_id}/capabilities/kv/set");
    let resp = router
        .clone()
        .oneshot(request("POST", &uri, Some(OWNER), Body::from(r#"{"key":"a","value":"1"}"#)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let uri = format!("/api/v1/spaces/{space_id}/capabilities/kv/get");
    let resp = router
        .clone()
        .oneshot(request("POST", &uri, Some(OWNER), Body::from(r#"{"key":"a"}"#)))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["data"]["value"], "1");

    let resp = router
        .clone()
        .oneshot(request("POST", &uri, Some(STRANGER), Body::from(r#"{"key":"a"}"#)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let uri = format!("/api/v1/spaces/{space_id}/capabilities/kv/explode");
    let resp = router
        .clone()
        .oneshot(request("POST", &uri, Some(OWNER), Body::from("{}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = router
        .clone()
        .oneshot(request("DELETE", &cap_uri, Some(OWNER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let uri = format!("/api/v1/spaces/{space_id}/capabilities/kv/get");
    let resp = router
        .oneshot(request("POST", &uri, Some(OWNER), Body::from(r#"{"key":"a"}"#)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_subscriptions_and_events() {
    let (engine, router) = test_app();
    let (install_id, _) = install_and_create_space(&router, "events").await;
    let subs_uri = format!("/api/v1/installs/{install_id}/subscriptions");
    let events_uri = format!("/api/v1/installs/{install_id}/events");
    let event = r#"{"name":"order.paid","payload":{"total":12}}"#;

    // Nothing listens yet.
    let resp = router
        .clone()
        .oneshot(request("POST", &events_uri, Some(OWNER), Body::from(event)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(json_body(resp).await["data"]["event_id"].is_null());

    let sub = serde_json::json!({
        "event_key": "order.paid",
        "target_type": "log",
        "rules": [{"id": 1, "variable": "total", "operator": "greater_than", "value": "10"}],
    });
    let resp = router
        .clone()
        .oneshot(request("POST", &subs_uri, Some(OWNER), Body::from(sub.to_string())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let sub_id = json_body(resp).await["data"]["id"].as_i64().unwrap();

    let resp = router
        .clone()
        .oneshot(request("GET", &subs_uri, Some(OWNER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["data"].as_array().unwrap().len(), 1);

    let resp = router
        .clone()
        .oneshot(request("GET", &subs_uri, Some(STRANGER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    engine.events().build_active_events_index().unwrap();
    let resp = router
        .clone()
        .oneshot(request("POST", &events_uri, Some(OWNER), Body::from(event)))
        .await
        .unwrap();
    let event_id = json_body(resp).await["data"]["event_id"].as_i64().unwrap();
    assert!(engine.store().get_event(event_id).unwrap().is_some());

    let resp = router
        .clone()
        .oneshot(request("DELETE", &format!("{subs_uri}/{sub_id}"), Some(OWNER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(request("DELETE", &format!("{subs_uri}/{sub_id}"), Some(OWNER), Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_rejects_bad_packages() {
    let (_, router) = test_app();
    let resp = router
        .oneshot(request("POST", "/api/v1/packages", Some(OWNER), Body::from("not a zip")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
