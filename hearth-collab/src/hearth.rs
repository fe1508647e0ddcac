//! The assembled server state.
//!
//! [`Hearth`] is built once at startup from a [`BlobStore`] and handed to
//! every connection task behind an `Arc`. It owns the component services,
//! the connection registry and the method dispatcher.

use std::sync::Arc;

use hearth_core::IdAllocator;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::assets::{AssetClass, FolderCall, FolderDomain, Folders};
use crate::auth::{Auth, AuthDomain};
use crate::broadcast::{Connection, ConnectionRegistry};
use crate::characters::{CharacterDomain, Characters};
use crate::error::{Error, Result};
use crate::maps::{MapDomain, Maps};
use crate::protocol::{encode_error, encode_result, Reply, Request};
use crate::rpc::Dispatcher;
use crate::storage::BlobStore;

pub struct Hearth {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    auth: Arc<Auth>,
    images: Arc<Folders>,
    audio: Arc<Folders>,
    characters: Arc<Characters>,
    maps: Arc<Maps>,
}

impl Hearth {
    /// Load every component from `store`.
    pub async fn open(store: Arc<dyn BlobStore>, admin_password: &str) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids = Arc::new(IdAllocator::new());
        let folders = |class| -> Result<Arc<Folders>> {
            Ok(Arc::new(Folders::load(class, store.clone(), ids.clone(), registry.clone())?))
        };
        let images = folders(AssetClass::Images)?;
        let audio = folders(AssetClass::Audio)?;
        let characters = Arc::new(
            Characters::load(folders(AssetClass::Characters)?, images.clone(), store.clone(), registry.clone())
                .await?,
        );
        let maps = Arc::new(Maps::load(folders(AssetClass::Maps)?, store.clone(), registry.clone()).await?);
        let auth = Arc::new(Auth::load(store.clone(), registry.clone(), admin_password)?);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register("auth", Arc::new(AuthDomain::new(auth.clone())));
        dispatcher.register("images", Arc::new(FolderDomain::new(images.clone())));
        dispatcher.register("audio", Arc::new(FolderDomain::new(audio.clone())));
        dispatcher.register("characters", Arc::new(CharacterDomain::new(characters.clone())));
        dispatcher.register("maps", Arc::new(MapDomain::new(maps.clone())));

        info!("Hearth ready, last item ID {}", ids.last());
        Ok(Self {
            registry,
            dispatcher,
            auth,
            images,
            audio,
            characters,
            maps,
        })
    }

    /// Register a new connection. It starts on the current map and its
    /// greeting is already queued on the returned receiver.
    pub fn connect(&self, admin: bool) -> (Arc<Connection>, UnboundedReceiver<Arc<str>>) {
        let (conn, rx) = Connection::new(admin, self.registry.current_map());
        self.registry.register(conn.clone());
        info!(
            "Connection {} joined as {} ({} active)",
            conn.id(),
            if admin { "admin" } else { "guest" },
            self.registry.len()
        );
        (conn, rx)
    }

    pub fn disconnect(&self, id: &Uuid) {
        if self.registry.deregister(id) {
            info!("Connection {id} left ({} active)", self.registry.len());
        }
    }

    /// Answer one request frame. Failures become `error` responses.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, frame: &str) -> Arc<str> {
        let request = match Request::parse(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed frame from {}: {e}", conn.id());
                return encode_error(0, &e.public_message(conn.is_admin()));
            }
        };
        debug!("{} -> {} (id {})", conn.id(), request.method, request.id);
        match self.dispatcher.dispatch(conn, &request.method, request.params).await {
            Ok(reply) => encode_result(request.id, &reply),
            Err(e) => {
                if let Error::Storage(inner) = &e {
                    error!("{} failed to persist: {inner}", request.method);
                }
                encode_error(request.id, &e.public_message(conn.is_admin()))
            }
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<Auth> {
        &self.auth
    }

    pub fn images(&self) -> &Arc<Folders> {
        &self.images
    }

    pub fn audio(&self) -> &Arc<Folders> {
        &self.audio
    }

    pub fn characters(&self) -> &Arc<Characters> {
        &self.characters
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    pub fn folders(&self, class: AssetClass) -> &Arc<Folders> {
        match class {
            AssetClass::Images => &self.images,
            AssetClass::Audio => &self.audio,
            AssetClass::Characters => self.characters.folders(),
            AssetClass::Maps => self.maps.folders(),
        }
    }

    /// Run a folder method through the service that owns `class`, so the
    /// map veto and bag bookkeeping apply as they do over RPC.
    pub async fn folder_call(&self, class: AssetClass, conn: &Connection, call: FolderCall) -> Result<Reply> {
        match class {
            AssetClass::Characters => self.characters.folder_call(conn, call).await,
            AssetClass::Maps => self.maps.folder_call(conn, call).await,
            AssetClass::Images | AssetClass::Audio => self.folders(class).apply(conn, call, |_| false).await,
        }
    }
}
