//! Folder trees for every asset class.
//!
//! [`Folders`] owns one [`NameTree`] behind a tokio lock. A mutation runs
//! under the write lock and, before the lock is released:
//!
//! 1. regenerates the cached JSON listing,
//! 2. persists the tree and drops the blobs of items that lost their last
//!    link, in one store batch,
//! 3. pushes the folder event to admins.
//!
//! Items whose blobs could not be dropped stay pending in the tree and are
//! retried by the next successful save.
//!
//! The same folder methods (`list`, `createFolder`, `moveItem`, …) are
//! offered by every asset namespace; [`FolderCall`] parses them once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::{IdAllocator, ItemId, NameTree};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::{Audience, Connection, ConnectionRegistry, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{params, push, FolderEvent, Reply};
use crate::rpc::{require_admin, RpcDomain};
use crate::storage::BlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
    Images,
    Audio,
    Characters,
    Maps,
}

impl AssetClass {
    pub fn name(self) -> &'static str {
        match self {
            AssetClass::Images => "images",
            AssetClass::Audio => "audio",
            AssetClass::Characters => "characters",
            AssetClass::Maps => "maps",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "images" => Some(AssetClass::Images),
            "audio" => Some(AssetClass::Audio),
            "characters" => Some(AssetClass::Characters),
            "maps" => Some(AssetClass::Maps),
            _ => None,
        }
    }

    pub fn folders_key(self) -> String {
        format!("{}/folders", self.name())
    }

    pub fn item_key(self, id: ItemId) -> String {
        format!("{}/{id}", self.name())
    }

    pub fn push_base(self) -> i64 {
        match self {
            AssetClass::Images => push::IMAGES_BASE,
            AssetClass::Audio => push::AUDIO_BASE,
            AssetClass::Characters => push::CHARACTERS_BASE,
            AssetClass::Maps => push::MAPS_BASE,
        }
    }
}

struct FolderState {
    tree: NameTree,
    listing: Arc<str>,
}

type Event = Option<(FolderEvent, Value)>;

pub struct Folders {
    class: AssetClass,
    store: Arc<dyn BlobStore>,
    ids: Arc<IdAllocator>,
    registry: Arc<ConnectionRegistry>,
    state: RwLock<FolderState>,
}

impl Folders {
    /// Load the class's tree, or start empty when nothing is stored.
    pub fn load(
        class: AssetClass,
        store: Arc<dyn BlobStore>,
        ids: Arc<IdAllocator>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let tree = match store.get(&class.folders_key())? {
            Some(bytes) => NameTree::from_snapshot(&bytes)?,
            None => NameTree::new(),
        };
        for id in tree.links().ids() {
            ids.observe(id);
        }
        let listing = tree.to_json()?.into();
        info!("Loaded {} {} items", tree.links().ids().count(), class.name());
        Ok(Self {
            class,
            store,
            ids,
            registry,
            state: RwLock::new(FolderState { tree, listing }),
        })
    }

    pub fn class(&self) -> AssetClass {
        self.class
    }

    /// Cached JSON listing.
    pub async fn list(&self) -> Arc<str> {
        self.state.read().await.listing.clone()
    }

    pub async fn list_text(&self) -> String {
        self.state.read().await.tree.to_text()
    }

    pub async fn contains(&self, id: ItemId) -> bool {
        self.state.read().await.tree.contains(id)
    }

    pub async fn item_id(&self, path: &str) -> Option<ItemId> {
        self.state.read().await.tree.item_id(path)
    }

    pub async fn item_ids(&self) -> Vec<ItemId> {
        self.state.read().await.tree.links().ids().collect()
    }

    /// Store `data` under a new ID and file it at `path`. Returns the ID and
    /// the path actually used.
    pub async fn add_item(&self, except: Option<Uuid>, data: &[u8], path: &str) -> Result<(ItemId, String)> {
        let id = self.ids.next();
        let blob = vec![(self.class.item_key(id), data.to_vec())];
        let path = self
            .mutate(except, blob, |tree| {
                let path = tree.add_item(id, path)?;
                let event = json!({ "id": id, "path": path });
                Ok((path, Some((FolderEvent::ItemAdd, event))))
            })
            .await?;
        Ok((id, path))
    }

    /// Move the hidden link held by some other subsystem from `old` to `new`.
    pub async fn set_hidden_link(&self, old: Option<ItemId>, new: Option<ItemId>) -> Result<bool> {
        if old == new {
            return Ok(new.is_some());
        }
        self.mutate(None, Vec::new(), |tree| Ok((tree.set_hidden_link(old, new), None)))
            .await
    }

    /// Stored bytes of a filed item.
    pub async fn read_item(&self, id: ItemId) -> Result<Vec<u8>> {
        if !self.contains(id).await {
            return Err(hearth_core::Error::ItemNotFound.into());
        }
        Ok(self
            .store
            .get(&self.class.item_key(id))?
            .ok_or(hearth_core::Error::ItemNotFound)?)
    }

    /// Remove and return the entries of `items` that are no longer filed
    /// anywhere.
    pub async fn prune<V>(&self, items: &mut HashMap<ItemId, V>) -> Vec<(ItemId, V)> {
        let state = self.state.read().await;
        let dead: Vec<ItemId> = items.keys().copied().filter(|id| !state.tree.contains(*id)).collect();
        dead.into_iter()
            .filter_map(|id| items.remove(&id).map(|value| (id, value)))
            .collect()
    }

    /// Run a folder method. `in_use` vetoes calls that would purge, move or
    /// rename an item some other subsystem still depends on.
    pub async fn apply(
        &self,
        conn: &Connection,
        call: FolderCall,
        in_use: impl Fn(ItemId) -> bool + Send,
    ) -> Result<Reply> {
        match call {
            FolderCall::List => Ok(Reply::Raw(self.list().await)),
            FolderCall::ListText => Ok(Reply::Json(json!(self.list_text().await))),
            call => {
                let except = Some(conn.id());
                self.mutate(except, Vec::new(), |tree| {
                    if affected(tree, &call).into_iter().any(&in_use) {
                        return Err(Error::Conflict);
                    }
                    apply_call(tree, call)
                })
                .await
            }
        }
    }

    async fn mutate<R>(
        &self,
        except: Option<Uuid>,
        blobs: Vec<(String, Vec<u8>)>,
        f: impl FnOnce(&mut NameTree) -> Result<(R, Event)>,
    ) -> Result<R> {
        let mut state = self.state.write().await;
        let (value, event) = f(&mut state.tree)?;
        self.save(&mut state, blobs)?;
        if let Some((event, payload)) = event {
            let id = event.push_id(self.class.push_base());
            self.registry.push(Audience::new(Subscription::FOLDERS, except), id, &payload);
        }
        Ok(value)
    }

    fn save(&self, state: &mut FolderState, mut sets: Vec<(String, Vec<u8>)>) -> Result<()> {
        state.listing = state.tree.to_json()?.into();
        let garbage = state.tree.garbage();
        sets.push((self.class.folders_key(), state.tree.snapshot()?));
        let removes: Vec<String> = garbage.iter().map(|id| self.class.item_key(*id)).collect();
        self.store.write_batch(&sets, &removes)?;
        state.tree.clear_garbage(&garbage);
        if !garbage.is_empty() {
            debug!("Purged {} {} items", garbage.len(), self.class.name());
        }
        Ok(())
    }
}

/// A folder method with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderCall {
    List,
    ListText,
    CreateFolder { path: String },
    MoveItem { from: String, to: String },
    MoveFolder { from: String, to: String },
    RemoveItem { path: String },
    RemoveFolder { path: String },
    LinkItem { id: ItemId, path: String },
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct MoveParams {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct LinkParams {
    id: ItemId,
    path: String,
}

impl FolderCall {
    /// `None` when `method` is not a folder method.
    pub fn parse(method: &str, value: Value) -> Option<Result<Self>> {
        let call = match method {
            "list" => Ok(FolderCall::List),
            "listText" => Ok(FolderCall::ListText),
            "createFolder" => params::<PathParams>(value).map(|p| FolderCall::CreateFolder { path: p.path }),
            "moveItem" => params::<MoveParams>(value).map(|p| FolderCall::MoveItem { from: p.from, to: p.to }),
            "moveFolder" => params::<MoveParams>(value).map(|p| FolderCall::MoveFolder { from: p.from, to: p.to }),
            "removeItem" => params::<PathParams>(value).map(|p| FolderCall::RemoveItem { path: p.path }),
            "removeFolder" => params::<PathParams>(value).map(|p| FolderCall::RemoveFolder { path: p.path }),
            "linkItem" => params::<LinkParams>(value).map(|p| FolderCall::LinkItem { id: p.id, path: p.path }),
            _ => return None,
        };
        Some(call)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, FolderCall::List | FolderCall::ListText)
    }
}

/// Items a call would purge, move or rename.
fn affected(tree: &NameTree, call: &FolderCall) -> Vec<ItemId> {
    let mut counts: HashMap<ItemId, u32> = HashMap::new();
    match call {
        FolderCall::MoveItem { from, .. } => return tree.item_id(from).into_iter().collect(),
        FolderCall::MoveFolder { from, .. } => {
            let mut moved = Vec::new();
            if let Some(folder) = tree.folder(from) {
                folder.for_each_item(&mut |id| moved.push(id));
            }
            return moved;
        }
        FolderCall::RemoveItem { path } => {
            if let Some(id) = tree.item_id(path) {
                counts.insert(id, 1);
            }
        }
        FolderCall::RemoveFolder { path } => {
            if let Some(folder) = tree.folder(path) {
                folder.for_each_item(&mut |id| *counts.entry(id).or_default() += 1);
            }
        }
        _ => {}
    }
    counts
        .into_iter()
        .filter(|(id, n)| tree.links().refcount(*id) <= *n)
        .map(|(id, _)| id)
        .collect()
}

fn apply_call(tree: &mut NameTree, call: FolderCall) -> Result<(Reply, Event)> {
    let (reply, event) = match call {
        FolderCall::List | FolderCall::ListText => return Ok((Reply::null(), None)),
        FolderCall::CreateFolder { path } => {
            let path = tree.create_folder(&path)?;
            (json!(path), (FolderEvent::FolderAdd, json!(path)))
        }
        FolderCall::MoveItem { from, to } => {
            let to = tree.move_item(&from, &to)?;
            (json!(to), (FolderEvent::ItemMove, json!({ "from": from, "to": to })))
        }
        FolderCall::MoveFolder { from, to } => {
            let to = tree.move_folder(&from, &to)?;
            (json!(to), (FolderEvent::FolderMove, json!({ "from": from, "to": to })))
        }
        FolderCall::RemoveItem { path } => {
            tree.remove_item(&path)?;
            (Value::Null, (FolderEvent::ItemRemove, json!(path)))
        }
        FolderCall::RemoveFolder { path } => {
            tree.remove_folder(&path)?;
            (Value::Null, (FolderEvent::FolderRemove, json!(path)))
        }
        FolderCall::LinkItem { id, path } => {
            let path = tree.link_item(id, &path)?;
            (json!(path), (FolderEvent::ItemLink, json!({ "id": id, "path": path })))
        }
    };
    Ok((Reply::Json(reply), Some(event)))
}

/// `images` and `audio`: folder methods only, admins only.
pub struct FolderDomain {
    folders: Arc<Folders>,
}

impl FolderDomain {
    pub fn new(folders: Arc<Folders>) -> Self {
        Self { folders }
    }
}

#[async_trait]
impl RpcDomain for FolderDomain {
    async fn call(&self, conn: &Arc<Connection>, method: &str, params: Value) -> Result<Reply> {
        require_admin(conn)?;
        let call = FolderCall::parse(method, params).ok_or(Error::UnknownMethod)??;
        self.folders.apply(conn, call, |_| false).await
    }
}
