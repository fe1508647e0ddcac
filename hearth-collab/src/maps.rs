//! Map service: the collection of loaded scenes and the `maps` namespace.
//!
//! Every scene sits behind its own lock. All edits go through one of three
//! primitives ([`Maps::update_map_data`], [`Maps::update_map_layer`],
//! [`Maps::update_map_token`]) which resolve the target, run the edit and,
//! when it reports a [`Change`], persist the scene and broadcast before the
//! lock is released. Edits that change nothing write nothing.
//!
//! Lock order: collection, then a scene, then the maps tree.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::scene::{check_shape, Shape};
use hearth_core::{
    Change, Colour, ItemId, KeyMap, LayerFilter, LayerId, LevelMap, MapDetails, Mask, Token, TokenId, TokenUpdate,
    Wall, WallId,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::assets::{AssetClass, FolderCall, Folders};
use crate::broadcast::{Audience, Connection, ConnectionRegistry, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{params, push, Reply};
use crate::rpc::{require_admin, RpcDomain};
use crate::storage::BlobStore;

/// Store key of the map shown to guests.
pub const CURRENT_MAP_KEY: &str = "session/currentMap";

type Scene = Arc<RwLock<LevelMap>>;

pub struct Maps {
    maps: RwLock<HashMap<ItemId, Scene>>,
    folders: Arc<Folders>,
    store: Arc<dyn BlobStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Maps {
    /// Load every map filed in `folders` and restore the current map.
    pub async fn load(
        folders: Arc<Folders>,
        store: Arc<dyn BlobStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let mut maps = HashMap::new();
        for id in folders.item_ids().await {
            let level = match store.get(&AssetClass::Maps.item_key(id))? {
                Some(bytes) => LevelMap::from_bytes(&bytes)?,
                None => {
                    warn!("Map {id} has no stored scene, starting empty");
                    LevelMap::new(MapDetails::default())
                }
            };
            maps.insert(id, Arc::new(RwLock::new(level)));
        }
        let current = match store.get(CURRENT_MAP_KEY)? {
            Some(bytes) => serde_json::from_slice::<Option<ItemId>>(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable current map: {e}");
                None
            }),
            None => None,
        };
        if let Some(id) = current.filter(|id| maps.contains_key(id)) {
            registry.set_current_map(Some(id));
        }
        info!("Loaded {} maps", maps.len());
        Ok(Self {
            maps: RwLock::new(maps),
            folders,
            store,
            registry,
        })
    }

    async fn scene(&self, id: ItemId) -> Result<Scene> {
        self.maps.read().await.get(&id).cloned().ok_or(Error::UnknownMap)
    }

    /// Run `f` on the map under its write lock. A returned change is
    /// persisted and then pushed with `push_id` to everyone viewing the map
    /// except `except`.
    pub async fn update_map_data<R, F>(&self, map: ItemId, except: Option<Uuid>, push_id: i64, f: F) -> Result<R>
    where
        F: FnOnce(&mut LevelMap) -> hearth_core::Result<(R, Option<Change>)> + Send,
        R: Send,
    {
        let scene = self.scene(map).await?;
        let mut level = scene.write().await;
        let (value, change) = f(&mut level)?;
        if let Some(change) = change {
            self.store.set(&AssetClass::Maps.item_key(map), &level.to_bytes()?)?;
            let admin = Audience::new(Subscription::ADMIN_MAP, except).on_map(map);
            let guest = Audience::new(Subscription::GUEST_MAP, except).on_map(map);
            self.registry.push_change(push_id, &change, admin, guest);
        }
        Ok(value)
    }

    /// [`Maps::update_map_data`] with the layer at `path` resolved first.
    pub async fn update_map_layer<R, F>(
        &self,
        map: ItemId,
        except: Option<Uuid>,
        push_id: i64,
        path: &str,
        filter: LayerFilter,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut LevelMap, LayerId) -> hearth_core::Result<(R, Option<Change>)> + Send,
        R: Send,
    {
        self.update_map_data(map, except, push_id, |level| {
            let layer = level.resolve_layer(path, filter)?;
            f(level, layer)
        })
        .await
    }

    /// [`Maps::update_map_data`] with the token's layer resolved first.
    pub async fn update_map_token<R, F>(
        &self,
        map: ItemId,
        except: Option<Uuid>,
        push_id: i64,
        token: TokenId,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut LevelMap, LayerId) -> hearth_core::Result<(R, Option<Change>)> + Send,
        R: Send,
    {
        self.update_map_data(map, except, push_id, |level| {
            let layer = level.token_layer(token)?;
            f(level, layer)
        })
        .await
    }

    /// File a new empty map at `path`.
    pub async fn create(&self, except: Option<Uuid>, path: &str, details: MapDetails) -> Result<(ItemId, String)> {
        self.insert(except, path, LevelMap::new(details)).await
    }

    /// Deep copy of map `source`, filed at `path`.
    pub async fn copy(&self, except: Option<Uuid>, source: ItemId, path: &str) -> Result<(ItemId, String)> {
        let bytes = self.scene(source).await?.read().await.to_bytes()?;
        self.insert(except, path, LevelMap::from_bytes(&bytes)?).await
    }

    async fn insert(&self, except: Option<Uuid>, path: &str, level: LevelMap) -> Result<(ItemId, String)> {
        let bytes = level.to_bytes()?;
        let mut maps = self.maps.write().await;
        let (id, path) = self.folders.add_item(except, &bytes, path).await?;
        maps.insert(id, Arc::new(RwLock::new(level)));
        debug!("Filed map {id} at {path}");
        Ok((id, path))
    }

    /// The map as `admin` or a guest sees it.
    pub async fn view(&self, id: ItemId, admin: bool) -> Result<Value> {
        Ok(self.scene(id).await?.read().await.view(admin)?)
    }

    pub async fn contains(&self, id: ItemId) -> bool {
        self.maps.read().await.contains_key(&id)
    }

    pub fn folders(&self) -> &Arc<Folders> {
        &self.folders
    }

    /// Make `id` the map guests are shown.
    pub async fn set_current_map(&self, id: ItemId) -> Result<()> {
        let maps = self.maps.read().await;
        if !maps.contains_key(&id) {
            return Err(Error::UnknownMap);
        }
        if self.registry.current_map() == Some(id) {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&Some(id)).map_err(|e| hearth_core::Error::Codec(e.to_string()))?;
        self.store.set(CURRENT_MAP_KEY, &bytes)?;
        let guests = self.registry.set_current_map(Some(id));
        info!("Current map is now {id} ({guests} guests notified)");
        Ok(())
    }

    /// Run a folder method on the maps tree. Removing or renaming a map that
    /// is current or selected by a connection fails with [`Error::Conflict`].
    pub async fn folder_call(&self, conn: &Connection, call: FolderCall) -> Result<Reply> {
        if call.is_read_only() {
            return self.folders.apply(conn, call, |_| false).await;
        }
        let mut maps = self.maps.write().await;
        let registry = &self.registry;
        let result = self.folders.apply(conn, call, |id| registry.is_map_in_use(id)).await;
        for (id, _) in self.folders.prune(&mut maps).await {
            debug!("Dropped map {id}");
        }
        result
    }
}

#[derive(Deserialize)]
struct NewParams {
    path: String,
    #[serde(default)]
    details: MapDetails,
}

#[derive(Deserialize)]
struct CopyParams {
    id: ItemId,
    path: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: ItemId,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GetParams {
    id: Option<ItemId>,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct RenameParams {
    path: String,
    name: String,
}

#[derive(Deserialize)]
struct MoveLayerParams {
    from: String,
    to: String,
    #[serde(default)]
    position: usize,
}

#[derive(Deserialize)]
struct AddTokenParams {
    path: String,
    token: Token,
    #[serde(default)]
    pos: Option<usize>,
}

#[derive(Deserialize)]
struct TokenLayerPosParams {
    id: TokenId,
    path: String,
    pos: usize,
}

#[derive(Deserialize)]
struct AddWallParams {
    path: String,
    wall: Wall,
}

#[derive(Deserialize)]
struct MoveWallParams {
    id: WallId,
    path: String,
}

/// Methods that edit the caller's selected map.
const EDITS: &[&str] = &[
    "setMapDetails",
    "setLightColour",
    "setMapKeyData",
    "removeMapKeyData",
    "addLayer",
    "addLayerFolder",
    "renameLayer",
    "moveLayer",
    "showLayer",
    "hideLayer",
    "removeLayer",
    "addToken",
    "removeToken",
    "setToken",
    "setTokenMulti",
    "setTokenLayerPos",
    "addWall",
    "removeWall",
    "modifyWall",
    "moveWall",
    "addToMask",
    "removeFromMask",
    "setMask",
];

/// The `maps` namespace.
///
/// Guests may only `get` their current map and ask which map is current.
/// Admin edits apply to the map the admin has selected.
pub struct MapDomain {
    maps: Arc<Maps>,
}

impl MapDomain {
    pub fn new(maps: Arc<Maps>) -> Self {
        Self { maps }
    }

    async fn get(&self, conn: &Connection, p: GetParams) -> Result<Reply> {
        let id = p.id.or_else(|| conn.current_map()).ok_or(Error::UnknownMap)?;
        if !conn.is_admin() && conn.current_map() != Some(id) {
            return Err(Error::UnknownMap);
        }
        Ok(self.maps.view(id, conn.is_admin()).await?.into())
    }

    async fn edit(&self, conn: &Connection, method: &str, value: Value) -> Result<Reply> {
        if !EDITS.contains(&method) {
            return Err(Error::UnknownMethod);
        }
        let maps = &self.maps;
        let map = conn.current_map().ok_or(Error::UnknownMap)?;
        let except = Some(conn.id());
        let reply = match method {
            "setMapDetails" => {
                let details: MapDetails = params(value)?;
                maps.update_map_data(map, except, push::MAP_DETAILS, |l| Ok(((), l.set_details(details)?)))
                    .await?;
                Value::Null
            }
            "setLightColour" => {
                let colour: Colour = params(value)?;
                maps.update_map_data(map, except, push::MAP_LIGHT_COLOUR, |l| {
                    Ok(((), l.set_light_colour(colour)?))
                })
                .await?;
                Value::Null
            }
            "setMapKeyData" => {
                let data: KeyMap = params(value)?;
                maps.update_map_data(map, except, push::MAP_KEY_SET, |l| Ok(((), l.set_key_data(data)?)))
                    .await?;
                Value::Null
            }
            "removeMapKeyData" => {
                let keys: Vec<String> = params(value)?;
                maps.update_map_data(map, except, push::MAP_KEY_REMOVE, |l| {
                    Ok(((), l.remove_key_data(&keys)?))
                })
                .await?;
                Value::Null
            }
            "addLayer" | "addLayerFolder" => {
                let p: PathParams = params(value)?;
                let folder = method == "addLayerFolder";
                let push_id = if folder { push::LAYER_FOLDER_ADD } else { push::LAYER_ADD };
                let path = maps
                    .update_map_data(map, except, push_id, |l| {
                        let (path, change) = if folder {
                            l.add_layer_folder(&p.path)?
                        } else {
                            l.add_layer(&p.path)?
                        };
                        Ok((path, Some(change)))
                    })
                    .await?;
                json!(path)
            }
            "renameLayer" => {
                let p: RenameParams = params(value)?;
                let name = maps
                    .update_map_data(map, except, push::LAYER_RENAME, |l| l.rename_layer(&p.path, &p.name))
                    .await?;
                json!(name)
            }
            "moveLayer" => {
                let p: MoveLayerParams = params(value)?;
                let path = maps
                    .update_map_data(map, except, push::LAYER_MOVE, |l| l.move_layer(&p.from, &p.to, p.position))
                    .await?;
                json!(path)
            }
            "showLayer" | "hideLayer" => {
                let p: PathParams = params(value)?;
                let hidden = method == "hideLayer";
                let push_id = if hidden { push::LAYER_HIDE } else { push::LAYER_SHOW };
                maps.update_map_data(map, except, push_id, |l| Ok(((), l.set_layer_hidden(&p.path, hidden)?)))
                    .await?;
                Value::Null
            }
            "removeLayer" => {
                let p: PathParams = params(value)?;
                maps.update_map_data(map, except, push::LAYER_REMOVE, |l| Ok(((), Some(l.remove_layer(&p.path)?))))
                    .await?;
                Value::Null
            }
            "addToken" => {
                let p: AddTokenParams = params(value)?;
                let (token, pos) = (p.token, p.pos);
                let id = maps
                    .update_map_layer(map, except, push::TOKEN_ADD, &p.path, LayerFilter::Leaf, |l, layer| {
                        let (id, change) = l.add_token(layer, token, pos)?;
                        Ok((id, Some(change)))
                    })
                    .await?;
                json!(id)
            }
            "removeToken" => {
                let p: IdParams = params(value)?;
                maps.update_map_token(map, except, push::TOKEN_REMOVE, p.id, |l, _| {
                    Ok(((), Some(l.remove_token(p.id)?)))
                })
                .await?;
                Value::Null
            }
            "setToken" => {
                let update: TokenUpdate = params(value)?;
                maps.update_map_token(map, except, push::TOKEN_SET, update.id, |l, _| {
                    Ok(((), l.set_token(update)?))
                })
                .await?;
                Value::Null
            }
            "setTokenMulti" => {
                let updates: Vec<TokenUpdate> = params(value)?;
                maps.update_map_data(map, except, push::TOKEN_SET_MULTI, |l| Ok(((), l.set_token_multi(updates)?)))
                    .await?;
                Value::Null
            }
            "setTokenLayerPos" => {
                let p: TokenLayerPosParams = params(value)?;
                maps.update_map_layer(map, except, push::TOKEN_LAYER_POS, &p.path, LayerFilter::Leaf, |l, layer| {
                    Ok(((), l.set_token_layer_pos(p.id, layer, p.pos)?))
                })
                .await?;
                Value::Null
            }
            "addWall" => {
                let p: AddWallParams = params(value)?;
                let wall = p.wall;
                let id = maps
                    .update_map_layer(map, except, push::WALL_ADD, &p.path, LayerFilter::Leaf, |l, layer| {
                        let (id, change) = l.add_wall(layer, wall)?;
                        Ok((id, Some(change)))
                    })
                    .await?;
                json!(id)
            }
            "removeWall" => {
                let p: IdParams = params(value)?;
                maps.update_map_data(map, except, push::WALL_REMOVE, |l| Ok(((), Some(l.remove_wall(p.id)?))))
                    .await?;
                Value::Null
            }
            "modifyWall" => {
                let wall: Wall = params(value)?;
                maps.update_map_data(map, except, push::WALL_MODIFY, |l| Ok(((), l.modify_wall(wall)?)))
                    .await?;
                Value::Null
            }
            "moveWall" => {
                let p: MoveWallParams = params(value)?;
                maps.update_map_layer(map, except, push::WALL_MOVE, &p.path, LayerFilter::Leaf, |l, layer| {
                    Ok(((), l.move_wall(p.id, layer)?))
                })
                .await?;
                Value::Null
            }
            "addToMask" => {
                let shape: Shape = params(value)?;
                check_shape(&shape)?;
                maps.update_map_data(map, except, push::MASK_ADD, |l| Ok(((), Some(l.add_to_mask(shape)?))))
                    .await?;
                Value::Null
            }
            "removeFromMask" => {
                let index: usize = params(value)?;
                maps.update_map_data(map, except, push::MASK_REMOVE, |l| Ok(((), Some(l.remove_from_mask(index)?))))
                    .await?;
                Value::Null
            }
            "setMask" => {
                let mask: Mask = params(value)?;
                mask.validate()?;
                maps.update_map_data(map, except, push::MASK_SET, |l| Ok(((), l.set_mask(mask)?)))
                    .await?;
                Value::Null
            }
            _ => return Err(Error::UnknownMethod),
        };
        Ok(reply.into())
    }
}

#[async_trait]
impl RpcDomain for MapDomain {
    async fn call(&self, conn: &Arc<Connection>, method: &str, value: Value) -> Result<Reply> {
        match method {
            "get" => {
                let p: GetParams = if value.is_null() { GetParams::default() } else { params(value)? };
                return self.get(conn, p).await;
            }
            "getCurrentMap" => return Ok(json!(self.maps.registry.current_map()).into()),
            _ => {}
        }
        require_admin(conn)?;
        let except = Some(conn.id());
        match method {
            "new" => {
                let p: NewParams = params(value)?;
                let (id, path) = self.maps.create(except, &p.path, p.details).await?;
                Ok(json!({ "id": id, "path": path }).into())
            }
            "copy" => {
                let p: CopyParams = params(value)?;
                let (id, path) = self.maps.copy(except, p.id, &p.path).await?;
                Ok(json!({ "id": id, "path": path }).into())
            }
            "select" => {
                let p: IdParams = params(value)?;
                let view = self.maps.view(p.id, true).await?;
                conn.set_current_map(Some(p.id));
                Ok(view.into())
            }
            "setCurrentMap" => {
                let p: IdParams = params(value)?;
                self.maps.set_current_map(p.id).await?;
                Ok(Reply::null())
            }
            _ => match FolderCall::parse(method, value.clone()) {
                Some(call) => self.maps.folder_call(conn, call?).await,
                None => self.edit(conn, method, value).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use hearth_core::{IdAllocator, KeyData};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        maps: Arc<Maps>,
        domain: MapDomain,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let folders = Arc::new(
            Folders::load(AssetClass::Maps, store.clone(), Arc::new(IdAllocator::new()), registry.clone()).unwrap(),
        );
        let maps = Arc::new(Maps::load(folders, store.clone(), registry.clone()).await.unwrap());
        let domain = MapDomain::new(maps.clone());
        Fixture { store, registry, maps, domain }
    }

    fn drain(rx: &mut UnboundedReceiver<Arc<str>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    /// An admin with a fresh map selected, plus an observing admin and guest
    /// on the same map.
    async fn scene(f: &Fixture) -> (Arc<Connection>, UnboundedReceiver<Arc<str>>, UnboundedReceiver<Arc<str>>) {
        let (editor, _rx) = Connection::new(true, None);
        let (id, _) = f.maps.create(None, "/map", MapDetails::default()).await.unwrap();
        editor.set_current_map(Some(id));
        f.maps.set_current_map(id).await.unwrap();

        let (observer, mut admin_rx) = Connection::new(true, Some(id));
        let (guest, mut guest_rx) = Connection::new(false, Some(id));
        f.registry.register(editor.clone());
        f.registry.register(observer);
        f.registry.register(guest);
        drain(&mut admin_rx);
        drain(&mut guest_rx);
        (editor, admin_rx, guest_rx)
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let f = fixture().await;
        let (editor, mut admin_rx, _guest_rx) = scene(&f).await;

        let token = json!({"path": "/", "token": {"width": 10, "height": 10}});
        let id = f.domain.call(&editor, "addToken", token).await.unwrap();
        assert_eq!(id, Reply::Json(json!(1)));
        drain(&mut admin_rx);

        f.domain
            .call(&editor, "setToken", json!({"id": 1, "x": 5, "y": 5}))
            .await
            .unwrap();
        assert_eq!(drain(&mut admin_rx), vec![json!({"id": -73, "result": {"id": 1, "x": 5, "y": 5}})]);

        f.domain.call(&editor, "removeToken", json!({"id": 1})).await.unwrap();
        let err = f.domain.call(&editor, "setToken", json!({"id": 1, "x": 6})).await;
        assert_eq!(err, Err(hearth_core::Error::UnknownToken.into()));
    }

    #[tokio::test]
    async fn test_noop_set_token_is_silent() {
        let f = fixture().await;
        let (editor, mut admin_rx, mut guest_rx) = scene(&f).await;
        let token = json!({"path": "/Layer", "token": {"x": 3, "width": 1, "height": 1}});
        f.domain.call(&editor, "addToken", token).await.unwrap();
        drain(&mut admin_rx);
        drain(&mut guest_rx);
        let writes = f.store.writes();

        f.domain.call(&editor, "setToken", json!({"id": 1, "x": 3})).await.unwrap();
        assert_eq!(f.store.writes(), writes);
        assert!(drain(&mut admin_rx).is_empty());
        assert!(drain(&mut guest_rx).is_empty());
    }

    #[tokio::test]
    async fn test_guests_see_only_user_token_data() {
        let f = fixture().await;
        let (editor, mut admin_rx, mut guest_rx) = scene(&f).await;
        let mut data = KeyMap::new();
        data.insert("name".into(), KeyData::new(json!("Orc"), true));
        data.insert("hp".into(), KeyData::new(json!(7), false));
        let token = json!({"path": "/Layer", "token": {"width": 1, "height": 1, "tokenData": data}});
        f.domain.call(&editor, "addToken", token).await.unwrap();

        let admin = drain(&mut admin_rx);
        let guest = drain(&mut guest_rx);
        let keys = |frames: &[Value]| {
            frames[0]["result"]["token"]["tokenData"]
                .as_object()
                .map(|o| o.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        assert_eq!(keys(&admin), vec!["hp", "name"]);
        assert_eq!(keys(&guest), vec!["name"]);
    }

    #[tokio::test]
    async fn test_concurrent_add_token_serializes() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let domain = Arc::new(f.domain);
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let domain = domain.clone();
                let editor = editor.clone();
                tokio::spawn(async move {
                    let token = json!({"path": "/Layer", "token": {"width": 1, "height": 1}});
                    domain.call(&editor, "addToken", token).await
                })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().into_value().as_u64().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);

        let map = editor.current_map().unwrap();
        let view = f.maps.view(map, true).await.unwrap();
        assert_eq!(view["lastTokenId"], json!(32));
    }

    #[tokio::test]
    async fn test_lighting_arity_rejected() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let token = json!({"path": "/Layer", "token": {"width": 1, "height": 1}});
        f.domain.call(&editor, "addToken", token).await.unwrap();

        let colour = json!({"r": 1, "g": 2, "b": 3, "a": 255});
        let update = json!({"id": 1, "lightStages": [1, 2], "lightColours": [[colour]]});
        let err = f.domain.call(&editor, "setToken", update).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid lighting");
        let view = f.maps.view(editor.current_map().unwrap(), true).await.unwrap();
        assert_eq!(view["children"][0]["tokens"][0]["lightStages"], json!([]));
    }

    #[tokio::test]
    async fn test_fixed_layers_protected() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        f.domain
            .call(&editor, "addLayerFolder", json!({"path": "/SomeFolder"}))
            .await
            .unwrap();

        let err = f.domain.call(&editor, "removeLayer", json!({"path": "/Grid"})).await;
        assert_eq!(err, Err(hearth_core::Error::InvalidLayerPath.into()));
        let moved = json!({"from": "/Light", "to": "/SomeFolder"});
        let err = f.domain.call(&editor, "moveLayer", moved).await;
        assert_eq!(err, Err(hearth_core::Error::InvalidLayerPath.into()));
    }

    #[tokio::test]
    async fn test_layer_collision_reports_actual_name() {
        let f = fixture().await;
        let (editor, mut admin_rx, _guest_rx) = scene(&f).await;
        let path = f.domain.call(&editor, "addLayer", json!({"path": "/Layer"})).await.unwrap();
        assert_eq!(path, Reply::Json(json!("/Layer.0")));
        assert_eq!(drain(&mut admin_rx), vec![json!({"id": -64, "result": "/Layer.0"})]);
    }

    #[tokio::test]
    async fn test_failed_persist_reports_and_diverges() {
        let f = fixture().await;
        let (editor, mut admin_rx, _guest_rx) = scene(&f).await;
        let map = editor.current_map().unwrap();
        f.store.set_fail_writes(true);

        let token = json!({"path": "/Layer", "token": {"width": 1, "height": 1}});
        let err = f.domain.call(&editor, "addToken", token).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(drain(&mut admin_rx).is_empty());

        let memory = f.maps.view(map, true).await.unwrap();
        assert_eq!(memory["lastTokenId"], json!(1));
        f.store.set_fail_writes(false);
        let stored = f.store.get(&AssetClass::Maps.item_key(map)).unwrap().unwrap();
        assert_eq!(LevelMap::from_bytes(&stored).unwrap().last_token_id(), 0);
    }

    #[tokio::test]
    async fn test_removing_map_in_use_conflicts() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let map = editor.current_map().unwrap();
        let err = f.domain.call(&editor, "removeItem", json!({"path": "/map"})).await;
        assert_eq!(err, Err(Error::Conflict));
        assert!(f.maps.contains(map).await);
        let err = f.domain.call(&editor, "moveItem", json!({"from": "/map", "to": "/renamed"})).await;
        assert_eq!(err, Err(Error::Conflict));

        let copy = f.domain.call(&editor, "copy", json!({"id": map, "path": "/map"})).await.unwrap();
        let copy = copy.into_value();
        assert_eq!(copy["path"], json!("/map.0"));
        let moved = f.domain.call(&editor, "moveItem", json!({"from": "/map.0", "to": "/spare"})).await;
        assert_eq!(moved, Ok(Reply::Json(json!("/spare"))));
        f.domain.call(&editor, "removeItem", json!({"path": "/spare"})).await.unwrap();
        assert!(!f.maps.contains(copy["id"].as_u64().unwrap()).await);
    }

    #[tokio::test]
    async fn test_copy_is_independent() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let source = editor.current_map().unwrap();
        let copy = f.domain.call(&editor, "copy", json!({"id": source, "path": "/copy"})).await.unwrap();
        let copy = copy.into_value()["id"].as_u64().unwrap();

        f.domain.call(&editor, "addLayer", json!({"path": "/Extra"})).await.unwrap();
        let source_view = f.maps.view(source, true).await.unwrap();
        let copy_view = f.maps.view(copy, true).await.unwrap();
        assert_eq!(source_view["children"].as_array().unwrap().len(), 4);
        assert_eq!(copy_view["children"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_guest_access_is_limited() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let current = editor.current_map().unwrap();
        let (other, _) = f.maps.create(None, "/other", MapDetails::default()).await.unwrap();
        let (guest, _rx) = Connection::new(false, Some(current));

        assert!(f.domain.call(&guest, "get", Value::Null).await.is_ok());
        assert_eq!(f.domain.call(&guest, "get", json!({"id": other})).await, Err(Error::UnknownMap));
        assert_eq!(
            f.domain.call(&guest, "getCurrentMap", Value::Null).await,
            Ok(Reply::Json(json!(current)))
        );
        let err = f.domain.call(&guest, "addLayer", json!({"path": "/x"})).await;
        assert_eq!(err, Err(Error::UnknownMethod));
    }

    #[tokio::test]
    async fn test_current_map_survives_reload() {
        let f = fixture().await;
        let (editor, _admin_rx, _guest_rx) = scene(&f).await;
        let current = editor.current_map().unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let folders = Arc::new(
            Folders::load(AssetClass::Maps, f.store.clone(), Arc::new(IdAllocator::new()), registry.clone())
                .unwrap(),
        );
        let reloaded = Maps::load(folders, f.store.clone(), registry.clone()).await.unwrap();
        assert_eq!(registry.current_map(), Some(current));
        assert!(reloaded.contains(current).await);
    }
}
