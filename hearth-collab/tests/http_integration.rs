//! Tests for the HTTP side channel, driven through the router with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use hearth_collab::http::router;
use hearth_collab::{Hearth, MemoryStore};
use serde_json::{json, Value};
use tower::ServiceExt;

const PASSWORD: &str = "secret";

async fn test_app() -> (Arc<Hearth>, Router) {
    let hearth = Arc::new(Hearth::open(Arc::new(MemoryStore::new()), PASSWORD).await.unwrap());
    let app = router(hearth.clone());
    (hearth, app)
}

fn request(method: &str, uri: &str, admin: bool) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    if admin {
        builder.header("authorization", format!("Bearer {PASSWORD}"))
    } else {
        builder
    }
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn create_folder(app: &Router, class: &str, path: &str) {
    let patch = request("PATCH", &format!("/{class}/"), true)
        .header("content-type", "text/plain")
        .body(Body::from(format!("createFolder\n{path}")))
        .unwrap();
    assert_eq!(send(app, patch).await.status(), StatusCode::OK);
}

async fn upload(app: &Router, path: &str, data: &'static [u8]) -> Value {
    let response = send(app, request("POST", path, true).body(Body::from(data)).unwrap()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

#[tokio::test]
async fn test_upload_then_guest_downloads_by_id() {
    let (hearth, app) = test_app().await;
    let (_admin, mut pushes) = hearth.connect(true);

    create_folder(&app, "images", "/tiles").await;
    let created = upload(&app, "/images/tiles/cave.png", b"\x89PNG").await;
    assert_eq!(created, json!({"id": 1, "path": "/tiles/cave.png"}));
    assert_eq!(hearth.images().item_id("/tiles/cave.png").await, Some(1));

    let mut saw_add = false;
    while let Ok(frame) = pushes.try_recv() {
        let frame: Value = serde_json::from_str(&frame).unwrap();
        saw_add |= frame["id"] == -10 && frame["result"]["path"] == "/tiles/cave.png";
    }
    assert!(saw_add, "connected admins hear about HTTP uploads");

    let response = send(&app, request("GET", "/images/1", false).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    assert_eq!(body_bytes(response).await, b"\x89PNG");

    let response = send(&app, request("GET", "/images/tiles/cave.png", false).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, request("GET", "/images/tiles/cave.png", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"\x89PNG");

    let response = send(&app, request("GET", "/images/9", false).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({"error": "item not found"}));
}

#[tokio::test]
async fn test_mutations_require_admin() {
    let (hearth, app) = test_app().await;

    let response = send(&app, request("POST", "/audio/theme.ogg", false).body(Body::from("ogg")).unwrap()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method("POST")
        .uri("/audio/theme.ogg")
        .header("authorization", "Bearer hunter2")
        .body(Body::from("ogg"))
        .unwrap();
    assert_eq!(send(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);
    assert!(hearth.audio().item_ids().await.is_empty());

    upload(&app, "/audio/theme.ogg", b"ogg").await;
    for (method, uri) in [("GET", "/audio/"), ("PATCH", "/audio/"), ("DELETE", "/audio/theme.ogg")] {
        let response = send(&app, request(method, uri, false).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
    }
    assert_eq!(hearth.audio().item_id("/theme.ogg").await, Some(1));

    let response = send(&app, request("GET", "/scrolls/", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_listing_negotiation() {
    let (hearth, app) = test_app().await;
    create_folder(&app, "images", "/a").await;
    upload(&app, "/images/a/x", b"x").await;

    let listing = request("GET", "/images/", true)
        .header("accept", "application/json")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, listing).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"folders": {"a": {"folders": {}, "items": {"x": 1}}}, "items": {}})
    );

    let listing = request("GET", "/images", true)
        .header("accept", "text/plain")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, listing).await;
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(text, hearth.images().list_text().await);

    let listing = request("GET", "/images/", true)
        .header("accept", "text/xml")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, listing).await;
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/xml"));
    let xml = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(xml.contains("<folder name=\"a\">"));
    assert!(xml.contains("<item name=\"x\" id=\"1\"/>"));
}

#[tokio::test]
async fn test_patch_runs_folder_methods() {
    let (hearth, app) = test_app().await;
    create_folder(&app, "images", "/a").await;
    upload(&app, "/images/a/x", b"x").await;

    let patch = request("PATCH", "/images/", true)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"method": "moveItem", "params": {"from": "/a/x", "to": "/b"}}).to_string(),
        ))
        .unwrap();
    let response = send(&app, patch).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!("/b"));
    assert_eq!(hearth.images().item_id("/b").await, Some(1));

    let patch = request("PATCH", "/images/", true)
        .header("content-type", "text/plain")
        .body(Body::from("createFolder\n/new folder\n"))
        .unwrap();
    assert_eq!(send(&app, patch).await.status(), StatusCode::OK);
    assert!(hearth.images().list().await.contains("\"new folder\""));

    let patch = request("PATCH", "/images/", true)
        .header("content-type", "text/xml")
        .body(Body::from("<createFolder path=\"/c\"/>"))
        .unwrap();
    assert_eq!(send(&app, patch).await.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let patch = request("PATCH", "/images/", true)
        .header("content-type", "application/json")
        .body(Body::from(json!({"method": "frobnicate"}).to_string()))
        .unwrap();
    let response = send(&app, patch).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({"error": "unknown method"}));
}

#[tokio::test]
async fn test_delete_item_and_folder() {
    let (hearth, app) = test_app().await;
    create_folder(&app, "images", "/a").await;
    upload(&app, "/images/a/x", b"x").await;
    upload(&app, "/images/a/y", b"y").await;

    let response = send(&app, request("DELETE", "/images/a/x", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!hearth.images().contains(1).await);
    assert!(hearth.images().read_item(1).await.is_err());

    let response = send(&app, request("DELETE", "/images/a/", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(&*hearth.images().list().await, r#"{"folders":{},"items":{}}"#);

    let response = send(&app, request("DELETE", "/images/a/x", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deleting_or_renaming_current_map_conflicts() {
    let (hearth, app) = test_app().await;
    let created = send(&app, request("POST", "/maps/Cave", true).body(Body::empty()).unwrap()).await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let cave = body_json(created).await["id"].as_u64().unwrap();
    let spare = upload(&app, "/maps/Spare", b"{\"width\": 10, \"height\": 10}").await["id"]
        .as_u64()
        .unwrap();
    hearth.maps().set_current_map(cave).await.unwrap();

    let response = send(&app, request("DELETE", "/maps/Cave", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await, json!({"error": "map in use"}));

    let rename = request("PATCH", "/maps/", true)
        .header("content-type", "text/plain")
        .body(Body::from("moveItem\n/Cave\n/Lair"))
        .unwrap();
    assert_eq!(send(&app, rename).await.status(), StatusCode::CONFLICT);
    assert!(hearth.maps().contains(cave).await);

    let response = send(&app, request("GET", &format!("/maps/{cave}"), false).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&app, request("GET", &format!("/maps/{spare}"), false).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({"error": "unknown map"}));

    let response = send(&app, request("DELETE", "/maps/Spare", true).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!hearth.maps().contains(spare).await);
}

#[tokio::test]
async fn test_character_bags_over_http() {
    let (_hearth, app) = test_app().await;
    create_folder(&app, "characters", "/Heroes").await;
    let bag = json!({
        "hp": {"data": 10, "user": true},
        "notes": {"data": "secret door", "user": false}
    });
    let create = request("POST", "/characters/Heroes/Ayla", true)
        .header("content-type", "application/json")
        .body(Body::from(bag.to_string()))
        .unwrap();
    let response = send(&app, create).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = body_json(response).await["id"].as_u64().unwrap();

    let response = send(&app, request("GET", &format!("/characters/{id}"), false).body(Body::empty()).unwrap()).await;
    assert_eq!(body_json(response).await, json!({"hp": {"data": 10, "user": true}}));

    let set = request("PUT", "/characters/Heroes/Ayla", true)
        .header("content-type", "application/json")
        .body(Body::from(json!({"hp": {"data": 7, "user": true}}).to_string()))
        .unwrap();
    assert_eq!(send(&app, set).await.status(), StatusCode::NO_CONTENT);

    let response = send(&app, request("GET", "/characters/Heroes/Ayla", true).body(Body::empty()).unwrap()).await;
    assert_eq!(
        body_json(response).await,
        json!({
            "hp": {"data": 7, "user": true},
            "notes": {"data": "secret door", "user": false}
        })
    );

    let put_image = request("PUT", "/images/1", true)
        .header("content-type", "application/json")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, put_image).await.status(), StatusCode::METHOD_NOT_ALLOWED);
}
