//! Character sheets: keyed attribute bags filed in the `characters` tree.
//!
//! Lock order: bags, then the characters tree, then the images tree (for
//! icon links).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::keystore::{decode_bag, encode_bag, get_keys, remove_keys, set_keys};
use hearth_core::{ItemId, KeyChange, KeyDelta, KeyMap};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::assets::{AssetClass, FolderCall, Folders};
use crate::broadcast::{Audience, Connection, ConnectionRegistry, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{params, push, Reply};
use crate::rpc::{require_admin, RpcDomain};
use crate::storage::BlobStore;

/// Key whose value is the image ItemID used as the character's icon.
pub const ICON_KEY: &str = "store-image-icon";

fn icon(bag: &KeyMap) -> Option<ItemId> {
    bag.get(ICON_KEY).and_then(|k| k.data.as_u64())
}

pub struct Characters {
    bags: RwLock<HashMap<ItemId, KeyMap>>,
    folders: Arc<Folders>,
    images: Arc<Folders>,
    store: Arc<dyn BlobStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Characters {
    /// Load a bag for every character in `folders`.
    pub async fn load(
        folders: Arc<Folders>,
        images: Arc<Folders>,
        store: Arc<dyn BlobStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let mut bags = HashMap::new();
        for id in folders.item_ids().await {
            let bag = match store.get(&AssetClass::Characters.item_key(id))? {
                Some(bytes) => decode_bag(&bytes)?,
                None => {
                    warn!("Character {id} has no stored data");
                    KeyMap::new()
                }
            };
            bags.insert(id, bag);
        }
        info!("Loaded {} characters", bags.len());
        Ok(Self {
            bags: RwLock::new(bags),
            folders,
            images,
            store,
            registry,
        })
    }

    pub fn folders(&self) -> &Arc<Folders> {
        &self.folders
    }

    /// File a new character at `path`.
    pub async fn create(&self, conn: &Connection, path: &str, data: KeyMap) -> Result<(ItemId, String)> {
        let mut bags = self.bags.write().await;
        let bytes = encode_bag(&data)?;
        let (id, path) = self.folders.add_item(Some(conn.id()), &bytes, path).await?;
        if let Some(image) = icon(&data) {
            self.images.set_hidden_link(None, Some(image)).await?;
        }
        bags.insert(id, data);
        debug!("Created character {id} at {path}");
        Ok((id, path))
    }

    pub async fn set_keys(&self, conn: &Connection, id: ItemId, updates: KeyMap) -> Result<()> {
        let mut bags = self.bags.write().await;
        let bag = bags.get_mut(&id).ok_or(hearth_core::Error::UnknownKey)?;
        let old_icon = icon(bag);
        let Some(delta) = set_keys(bag, updates) else {
            return Ok(());
        };
        self.store.set(&AssetClass::Characters.item_key(id), &encode_bag(bag)?)?;
        let new_icon = icon(bag);
        if old_icon != new_icon {
            self.images.set_hidden_link(old_icon, new_icon).await?;
        }
        self.publish(conn, push::CHARACTER_DATA_CHANGE, id, delta);
        Ok(())
    }

    pub async fn remove_keys(&self, conn: &Connection, id: ItemId, keys: &[String]) -> Result<()> {
        let mut bags = self.bags.write().await;
        let bag = bags.get_mut(&id).ok_or(hearth_core::Error::UnknownKey)?;
        let old_icon = icon(bag);
        let Some(delta) = remove_keys(bag, keys) else {
            return Ok(());
        };
        self.store.set(&AssetClass::Characters.item_key(id), &encode_bag(bag)?)?;
        if old_icon.is_some() && icon(bag).is_none() {
            self.images.set_hidden_link(old_icon, None).await?;
        }
        self.publish(conn, push::CHARACTER_DATA_REMOVE, id, delta);
        Ok(())
    }

    /// Read `keys`, or the whole bag when `None`.
    pub async fn get_keys(&self, id: ItemId, keys: Option<&[String]>, admin: bool) -> Result<KeyMap> {
        let bags = self.bags.read().await;
        let bag = bags.get(&id).ok_or(hearth_core::Error::UnknownKey)?;
        Ok(get_keys(bag, keys, admin))
    }

    /// Run a folder method, dropping the bags of characters no longer filed
    /// anywhere. Bags follow the tree even when the save failed.
    pub async fn folder_call(&self, conn: &Connection, call: FolderCall) -> Result<Reply> {
        if call.is_read_only() {
            return self.folders.apply(conn, call, |_| false).await;
        }
        let mut bags = self.bags.write().await;
        let result = self.folders.apply(conn, call, |_| false).await;
        for (id, bag) in self.folders.prune(&mut bags).await {
            debug!("Dropped character {id}");
            if let Some(image) = icon(&bag) {
                self.images.set_hidden_link(Some(image), None).await?;
            }
        }
        result
    }

    fn publish(&self, conn: &Connection, push_id: i64, id: ItemId, delta: KeyDelta) {
        let payload = |change: KeyChange| json!({ "id": id, "setting": change.setting, "removing": change.removing });
        let except = Some(conn.id());
        let guest = (!delta.guest.is_empty()).then(|| payload(delta.guest));
        self.registry
            .push(Audience::new(Subscription::ADMIN_KEYS, except), push_id, &payload(delta.admin));
        if let Some(guest) = guest {
            self.registry.push(Audience::new(Subscription::GUEST_KEYS, except), push_id, &guest);
        }
    }
}

#[derive(Deserialize)]
struct CreateParams {
    path: String,
    #[serde(default)]
    data: KeyMap,
}

#[derive(Deserialize)]
struct SetParams {
    id: ItemId,
    data: KeyMap,
}

#[derive(Deserialize)]
struct RemoveParams {
    id: ItemId,
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct GetParams {
    id: ItemId,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

/// The `characters` namespace. Only `get` is open to guests.
pub struct CharacterDomain {
    characters: Arc<Characters>,
}

impl CharacterDomain {
    pub fn new(characters: Arc<Characters>) -> Self {
        Self { characters }
    }
}

#[async_trait]
impl RpcDomain for CharacterDomain {
    async fn call(&self, conn: &Arc<Connection>, method: &str, value: Value) -> Result<Reply> {
        if method == "get" {
            let p: GetParams = params(value)?;
            let keys = self.characters.get_keys(p.id, p.keys.as_deref(), conn.is_admin()).await?;
            return Reply::json(&keys);
        }
        require_admin(conn)?;
        match method {
            "create" => {
                let p: CreateParams = params(value)?;
                let (id, path) = self.characters.create(conn, &p.path, p.data).await?;
                Ok(json!({ "id": id, "path": path }).into())
            }
            "set" => {
                let p: SetParams = params(value)?;
                self.characters.set_keys(conn, p.id, p.data).await?;
                Ok(Reply::null())
            }
            "removeKeys" => {
                let p: RemoveParams = params(value)?;
                self.characters.remove_keys(conn, p.id, &p.keys).await?;
                Ok(Reply::null())
            }
            _ => {
                let call = FolderCall::parse(method, value).ok_or(Error::UnknownMethod)??;
                self.characters.folder_call(conn, call).await
            }
        }
    }
}
