//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on a free port and talks to it with raw
//! tokio-tungstenite clients speaking the JSON-RPC envelope.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hearth_collab::{HearthServer, MemoryStore, ServerConfig};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = HearthServer::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    port
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pushes: VecDeque<Value>,
    next_id: i64,
}

impl Client {
    async fn connect(port: u16, password: Option<&str>) -> Self {
        let mut request = format!("ws://127.0.0.1:{port}").into_client_request().unwrap();
        if let Some(password) = password {
            request
                .headers_mut()
                .insert("Authorization", format!("Bearer {password}").parse().unwrap());
        }
        let (ws, _) = connect_async(request).await.expect("Should connect to server");
        Self {
            ws,
            pushes: VecDeque::new(),
            next_id: 1,
        }
    }

    async fn admin(port: u16) -> Self {
        let mut client = Self::connect(port, Some("admin")).await;
        assert_eq!(client.push().await, json!({"id": -3, "result": true}));
        client
    }

    async fn guest(port: u16) -> Self {
        let mut client = Self::connect(port, None).await;
        assert_eq!(client.push().await["id"], json!(-2));
        client
    }

    async fn recv(&mut self) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("Should receive a frame within timeout")
                .expect("Stream should stay open")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Send a request and wait for its response, queueing pushes that arrive
    /// in between.
    async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({"id": id, "method": method, "params": params});
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
        loop {
            let frame = self.recv().await;
            if frame["id"] == json!(id) {
                return frame;
            }
            self.pushes.push_back(frame);
        }
    }

    async fn result(&mut self, method: &str, params: Value) -> Value {
        let frame = self.call(method, params).await;
        assert!(frame.get("error").is_none(), "{method} failed: {frame}");
        frame["result"].clone()
    }

    async fn push(&mut self) -> Value {
        match self.pushes.pop_front() {
            Some(frame) => frame,
            None => self.recv().await,
        }
    }
}

#[tokio::test]
async fn test_greeting_depends_on_credentials() {
    let port = start_test_server().await;
    let mut guest = Client::connect(port, None).await;
    assert_eq!(guest.push().await, json!({"id": -2, "result": null}));

    let mut wrong = Client::connect(port, Some("nope")).await;
    assert_eq!(wrong.push().await, json!({"id": -2, "result": null}));

    let mut admin = Client::connect(port, Some("admin")).await;
    assert_eq!(admin.push().await, json!({"id": -3, "result": true}));
}

#[tokio::test]
async fn test_guest_follows_current_map() {
    let port = start_test_server().await;
    let mut admin = Client::admin(port).await;
    let mut guest = Client::guest(port).await;

    let map = admin.result("maps.new", json!({"path": "/Dungeon"})).await;
    let id = map["id"].clone();
    admin.result("maps.select", json!({"id": id})).await;
    admin.result("maps.setCurrentMap", json!({"id": id})).await;
    assert_eq!(guest.push().await, json!({"id": -2, "result": id}));

    let token = json!({"path": "/", "token": {"width": 10, "height": 10}});
    assert_eq!(admin.result("maps.addToken", token).await, json!(1));
    let added = guest.push().await;
    assert_eq!(added["id"], json!(-71));
    assert_eq!(added["result"]["token"]["id"], json!(1));

    admin.result("maps.setToken", json!({"id": 1, "x": 5, "y": 5})).await;
    assert_eq!(guest.push().await, json!({"id": -73, "result": {"id": 1, "x": 5, "y": 5}}));

    let view = guest.result("maps.get", Value::Null).await;
    assert_eq!(view["tokens"][0]["x"], json!(5));
}

#[tokio::test]
async fn test_guest_cannot_call_admin_methods() {
    let port = start_test_server().await;
    let mut guest = Client::guest(port).await;
    for method in ["maps.addLayer", "images.list", "auth.changePassword", "nowhere.at.all"] {
        let frame = guest.call(method, json!({"path": "/x"})).await;
        assert_eq!(frame["error"], json!("unknown method"), "{method}");
    }
}

#[tokio::test]
async fn test_folder_collision_renames_and_notifies_admins() {
    let port = start_test_server().await;
    let mut alice = Client::admin(port).await;
    let mut bob = Client::admin(port).await;

    let first = alice.result("maps.new", json!({"path": "/map"})).await;
    let second = alice.result("maps.new", json!({"path": "/map"})).await;
    assert_eq!(first["path"], json!("/map"));
    assert_eq!(second["path"], json!("/map.0"));

    assert_eq!(bob.push().await, json!({"id": -40, "result": {"id": first["id"], "path": "/map"}}));
    assert_eq!(bob.push().await, json!({"id": -40, "result": {"id": second["id"], "path": "/map.0"}}));

    let listing = bob.result("maps.list", Value::Null).await;
    assert_eq!(listing["items"]["map.0"], second["id"]);
}

#[tokio::test]
async fn test_changing_password_logs_out_other_admins() {
    let port = start_test_server().await;
    let mut alice = Client::admin(port).await;
    let mut bob = Client::admin(port).await;

    alice.result("auth.changePassword", json!({"password": "s3cret"})).await;
    assert_eq!(bob.push().await, json!({"id": -1, "result": null}));
    assert_eq!(bob.call("images.list", Value::Null).await["error"], json!("unknown method"));

    let bad = bob.call("auth.login", json!({"password": "admin"})).await;
    assert_eq!(bad["error"], json!("invalid password"));
    assert_eq!(bob.result("auth.login", json!({"password": "s3cret"})).await, json!(true));
    assert_eq!(bob.result("auth.status", Value::Null).await, json!(true));
    assert_eq!(alice.result("auth.status", Value::Null).await, json!(true));
}

#[tokio::test]
async fn test_removing_or_renaming_current_map_conflicts() {
    let port = start_test_server().await;
    let mut admin = Client::admin(port).await;
    let map = admin.result("maps.new", json!({"path": "/keep"})).await;
    admin.result("maps.setCurrentMap", json!({"id": map["id"]})).await;

    let frame = admin.call("maps.removeItem", json!({"path": "/keep"})).await;
    assert_eq!(frame["error"], json!("map in use"));
    let frame = admin.call("maps.moveItem", json!({"from": "/keep", "to": "/renamed"})).await;
    assert_eq!(frame["error"], json!("map in use"));
    let listing = admin.result("maps.list", Value::Null).await;
    assert_eq!(listing["items"]["keep"], map["id"]);
}

#[tokio::test]
async fn test_malformed_frames_get_error_replies() {
    let port = start_test_server().await;
    let mut guest = Client::guest(port).await;
    guest.ws.send(Message::text("{not json".to_string())).await.unwrap();
    let frame = guest.recv().await;
    assert_eq!(frame["id"], json!(0));
    assert!(frame["error"].as_str().unwrap().starts_with("invalid params"));

    let frame = guest.call("maps.get", json!({"id": "seven"})).await;
    assert!(frame["error"].as_str().unwrap().starts_with("invalid params"));
}
