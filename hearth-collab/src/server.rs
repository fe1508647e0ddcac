//! WebSocket front end.
//!
//! ```text
//! Client ── WS text ──► read loop ── spawn per request ──► Hearth::handle_frame
//!    ▲                                                          │
//!    └── writer task ◄── outbound queue ◄── replies + pushes ◄──┘
//! ```
//!
//! Each connection gets one read loop and one writer task. Requests are
//! handled on their own tasks so a slow call does not stall the reads behind
//! it; every frame for the client goes through the connection's outbound
//! queue, which the writer drains in order.
//!
//! [`HearthServer::run`] also serves the [`http`] side channel next to the
//! WebSocket listener when an HTTP address is configured.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::bearer;
use crate::hearth::Hearth;
use crate::http;
use crate::storage::{BlobStore, MemoryStore, RocksStore, StoreConfig};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub data_path: Option<PathBuf>,
    /// Address of the HTTP side channel (None = WebSocket only)
    pub http_addr: Option<String>,
    /// Admin password used until one is set at runtime
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            data_path: None,
            http_addr: Some("127.0.0.1:8081".to_string()),
            admin_password: "admin".to_string(),
        }
    }
}

/// The tabletop server.
pub struct HearthServer {
    config: ServerConfig,
    hearth: Arc<Hearth>,
}

impl HearthServer {
    /// Open the configured store and load all state from it.
    pub async fn new(config: ServerConfig) -> Result<Self, BoxError> {
        let store: Arc<dyn BlobStore> = match &config.data_path {
            Some(path) => {
                log::info!("Opening data directory {}", path.display());
                Arc::new(RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?)
            }
            None => {
                log::info!("No data directory configured, state is kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: ServerConfig, store: Arc<dyn BlobStore>) -> Result<Self, BoxError> {
        let hearth = Arc::new(Hearth::open(store, &config.admin_password).await?);
        Ok(Self { config, hearth })
    }

    pub fn hearth(&self) -> &Arc<Hearth> {
        &self.hearth
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured addresses and serve until a listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Hearth listening on {}", listener.local_addr()?);
        match &self.config.http_addr {
            Some(addr) => {
                let http_listener = TcpListener::bind(addr).await?;
                log::info!("HTTP side channel on {}", http_listener.local_addr()?);
                tokio::try_join!(self.serve(listener), self.serve_http(http_listener))?;
                Ok(())
            }
            None => self.serve(listener).await,
        }
    }

    /// Serve the HTTP side channel from an already bound listener.
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), BoxError> {
        axum::serve(listener, http::router(self.hearth.clone())).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let hearth = self.hearth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(hearth, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Deregisters the connection however the read loop ends.
struct Session {
    hearth: Arc<Hearth>,
    id: Uuid,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hearth.disconnect(&self.id);
    }
}

fn bearer_password(request: &Request) -> Option<String> {
    let value = request.headers().get("authorization")?.to_str().ok()?;
    bearer(value).map(str::to_owned)
}

async fn handle_connection(hearth: Arc<Hearth>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
    let mut password = None;
    let handshake = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        password = bearer_password(request);
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, handshake).await?;

    let admin = match password.as_deref() {
        Some(password) if hearth.auth().verify(password) => true,
        Some(_) => {
            log::warn!("Rejected bearer password from {addr}, continuing as guest");
            false
        }
        None => false,
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (conn, mut outbound) = hearth.connect(admin);
    let _session = Session {
        hearth: hearth.clone(),
        id: conn.id(),
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_sender.send(Message::text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let hearth = hearth.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let reply = hearth.handle_frame(&conn, text.as_str()).await;
                    conn.send(reply);
                });
            }
            Ok(Message::Close(_)) => {
                log::info!("Connection closed from {addr}");
                break;
            }
            Ok(Message::Binary(_)) => log::warn!("Ignoring binary frame from {addr}"),
            Ok(_) => {}
            Err(e) => {
                log::error!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }

    writer.abort();
    Ok(())
}
