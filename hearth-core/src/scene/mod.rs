//! Layered scenes.
//!
//! A [`LevelMap`] keeps its layer tree in an arena keyed by [`LayerId`] and
//! maintains two side indexes, token ID → layer and wall ID → layer, so that
//! every token or wall operation resolves in O(1). The root layer is a folder
//! that can also hold tokens and walls directly.
//!
//! Every mutation either fails without touching the map, returns `None`
//! when the request matched the current state, or returns a [`Change`]
//! carrying the payloads to broadcast.

mod layer;
mod mask;
mod token;
mod wall;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec;
use crate::error::{Error, Result};
use crate::folders::{segments, split_path, unique_name};
use crate::keystore::{self, KeyMap};

pub use layer::{Layer, LayerFilter, LayerId, LayerKind, LayerSnapshot, GRID, LIGHT};
pub use mask::{check_shape, Mask, Shape};
pub use token::{check_lighting, Colour, Token, TokenId, TokenUpdate};
pub use wall::{Wall, WallId};

use layer::ROOT;

/// Name of the token layer every new map starts with.
pub const DEFAULT_LAYER: &str = "Layer";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapDetails {
    pub width: u64,
    pub height: u64,
    pub grid_type: u8,
    pub grid_size: u64,
    pub grid_stroke: u64,
    pub grid_colour: Colour,
}

/// Broadcast payloads for a committed mutation. `guest` is `None` when
/// guests have nothing to learn from the change.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub admin: Value,
    pub guest: Option<Value>,
}

impl Change {
    /// Admins and guests see the same payload.
    pub fn shared(payload: Value) -> Self {
        Self {
            guest: Some(payload.clone()),
            admin: payload,
        }
    }

    pub fn split(admin: Value, guest: Option<Value>) -> Self {
        Self { admin, guest }
    }
}

/// Serialized form of a whole map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSnapshot {
    pub details: MapDetails,
    #[serde(default)]
    pub light_colour: Colour,
    #[serde(default)]
    pub mask: Mask,
    #[serde(default)]
    pub data: KeyMap,
    #[serde(default)]
    pub last_token_id: TokenId,
    #[serde(default)]
    pub last_wall_id: WallId,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub walls: Vec<Wall>,
    #[serde(default)]
    pub children: Vec<LayerSnapshot>,
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Codec(e.to_string()))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidLayerPath);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LevelMap {
    details: MapDetails,
    light_colour: Colour,
    mask: Mask,
    data: KeyMap,
    layers: HashMap<LayerId, Layer>,
    next_layer: LayerId,
    root_tokens: Vec<TokenId>,
    root_walls: Vec<WallId>,
    tokens: HashMap<TokenId, (LayerId, Token)>,
    walls: HashMap<WallId, (LayerId, Wall)>,
    last_token_id: TokenId,
    last_wall_id: WallId,
}

impl LevelMap {
    fn bare(details: MapDetails) -> Self {
        let mut layers = HashMap::new();
        layers.insert(
            ROOT,
            Layer {
                name: String::new(),
                hidden: false,
                parent: None,
                kind: LayerKind::Folder(Vec::new()),
            },
        );
        Self {
            details,
            light_colour: Colour::default(),
            mask: Mask::default(),
            data: KeyMap::new(),
            layers,
            next_layer: ROOT + 1,
            root_tokens: Vec::new(),
            root_walls: Vec::new(),
            tokens: HashMap::new(),
            walls: HashMap::new(),
            last_token_id: 0,
            last_wall_id: 0,
        }
    }

    /// A fresh map with one token layer plus the fixed Light and Grid layers.
    pub fn new(details: MapDetails) -> Self {
        let mut map = Self::bare(details);
        map.attach(ROOT, DEFAULT_LAYER.to_owned(), LayerKind::tokens(), false, None);
        map.attach(ROOT, LIGHT.to_owned(), LayerKind::Light, false, None);
        map.attach(ROOT, GRID.to_owned(), LayerKind::Grid, false, None);
        map
    }

    pub fn details(&self) -> &MapDetails {
        &self.details
    }

    pub fn light_colour(&self) -> Colour {
        self.light_colour
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn data(&self) -> &KeyMap {
        &self.data
    }

    pub fn last_token_id(&self) -> TokenId {
        self.last_token_id
    }

    pub fn last_wall_id(&self) -> WallId {
        self.last_wall_id
    }

    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(&id).map(|(_, token)| token)
    }

    pub fn wall(&self, id: WallId) -> Option<&Wall> {
        self.walls.get(&id).map(|(_, wall)| wall)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(&id)
    }

    /// Layer holding a token.
    pub fn token_layer(&self, id: TokenId) -> Result<LayerId> {
        self.tokens
            .get(&id)
            .map(|(layer, _)| *layer)
            .ok_or(Error::UnknownToken)
    }

    pub fn wall_layer(&self, id: WallId) -> Result<LayerId> {
        self.walls
            .get(&id)
            .map(|(layer, _)| *layer)
            .ok_or(Error::UnknownWall)
    }

    /// Token IDs of a layer in draw order.
    pub fn layer_tokens(&self, id: LayerId) -> Result<&[TokenId]> {
        self.leaf(id).map(|(tokens, _)| tokens)
    }

    pub fn layer_walls(&self, id: LayerId) -> Result<&[WallId]> {
        self.leaf(id).map(|(_, walls)| walls)
    }

    pub fn layer_by_path(&self, path: &str) -> Option<LayerId> {
        let mut current = ROOT;
        for name in segments(path) {
            current = self.child_named(current, name)?;
        }
        Some(current)
    }

    /// Resolve `path`, failing `UnknownLayer` when nothing is there and
    /// `InvalidLayerPath` when the layer is the wrong kind.
    pub fn resolve_layer(&self, path: &str, filter: LayerFilter) -> Result<LayerId> {
        let id = self.layer_by_path(path).ok_or(Error::UnknownLayer)?;
        if id == ROOT && filter != LayerFilter::Folder {
            return Ok(id);
        }
        if filter.accepts(&self.get_layer(id)?.kind) {
            Ok(id)
        } else {
            Err(Error::InvalidLayerPath)
        }
    }

    pub fn layer_path(&self, id: LayerId) -> String {
        let mut names = Vec::new();
        let mut node = id;
        while let Some(layer) = self.layers.get(&node) {
            match layer.parent {
                Some(parent) => {
                    names.push(layer.name.as_str());
                    node = parent;
                }
                None => break,
            }
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    fn get_layer(&self, id: LayerId) -> Result<&Layer> {
        self.layers.get(&id).ok_or(Error::UnknownLayer)
    }

    fn children(&self, id: LayerId) -> &[LayerId] {
        match self.layers.get(&id).map(|l| &l.kind) {
            Some(LayerKind::Folder(children)) => children.as_slice(),
            _ => &[],
        }
    }

    fn children_mut(&mut self, id: LayerId) -> Result<&mut Vec<LayerId>> {
        match self.layers.get_mut(&id).map(|l| &mut l.kind) {
            Some(LayerKind::Folder(children)) => Ok(children),
            Some(_) => Err(Error::InvalidLayerPath),
            None => Err(Error::UnknownLayer),
        }
    }

    fn child_named(&self, parent: LayerId, name: &str) -> Option<LayerId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.layers.get(c).is_some_and(|l| l.name == name))
    }

    fn unique_child_name(&self, parent: LayerId, name: &str, except: Option<LayerId>) -> String {
        unique_name(name, |candidate| {
            self.children(parent).iter().any(|c| {
                Some(*c) != except && self.layers.get(c).is_some_and(|l| l.name == candidate)
            })
        })
    }

    fn leaf(&self, id: LayerId) -> Result<(&[TokenId], &[WallId])> {
        if id == ROOT {
            return Ok((self.root_tokens.as_slice(), self.root_walls.as_slice()));
        }
        match &self.get_layer(id)?.kind {
            LayerKind::Tokens { tokens, walls } => Ok((tokens.as_slice(), walls.as_slice())),
            _ => Err(Error::InvalidLayerPath),
        }
    }

    fn leaf_mut(&mut self, id: LayerId) -> Result<(&mut Vec<TokenId>, &mut Vec<WallId>)> {
        if id == ROOT {
            return Ok((&mut self.root_tokens, &mut self.root_walls));
        }
        match self.layers.get_mut(&id).map(|l| &mut l.kind) {
            Some(LayerKind::Tokens { tokens, walls }) => Ok((tokens, walls)),
            Some(_) => Err(Error::InvalidLayerPath),
            None => Err(Error::UnknownLayer),
        }
    }

    /// Insert a layer under `parent`, which must be a folder.
    fn attach(
        &mut self,
        parent: LayerId,
        name: String,
        kind: LayerKind,
        hidden: bool,
        position: Option<usize>,
    ) -> LayerId {
        let id = self.next_layer;
        self.next_layer += 1;
        self.layers.insert(
            id,
            Layer {
                name,
                hidden,
                parent: Some(parent),
                kind,
            },
        );
        if let Ok(children) = self.children_mut(parent) {
            let at = position.unwrap_or(children.len()).min(children.len());
            children.insert(at, id);
        }
        id
    }

    fn detach(&mut self, id: LayerId) {
        let parent = self.layers.get(&id).and_then(|l| l.parent);
        if let Some(children) = parent.and_then(|p| self.children_mut(p).ok()) {
            children.retain(|c| *c != id);
        }
    }

    /// True when `node` is `ancestor` or sits below it.
    fn is_within(&self, mut node: LayerId, ancestor: LayerId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.layers.get(&node).and_then(|l| l.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    pub fn set_details(&mut self, details: MapDetails) -> Result<Option<Change>> {
        if self.details == details {
            return Ok(None);
        }
        let change = Change::shared(to_json(&details)?);
        self.details = details;
        Ok(Some(change))
    }

    pub fn set_light_colour(&mut self, colour: Colour) -> Result<Option<Change>> {
        if self.light_colour == colour {
            return Ok(None);
        }
        self.light_colour = colour;
        Ok(Some(Change::shared(to_json(&colour)?)))
    }

    pub fn set_key_data(&mut self, updates: KeyMap) -> Result<Option<Change>> {
        keystore::set_keys(&mut self.data, updates)
            .map(|delta| key_change(&delta))
            .transpose()
    }

    pub fn remove_key_data(&mut self, keys: &[String]) -> Result<Option<Change>> {
        keystore::remove_keys(&mut self.data, keys)
            .map(|delta| key_change(&delta))
            .transpose()
    }

    /// Add an empty token layer at `path`; returns the path actually used.
    pub fn add_layer(&mut self, path: &str) -> Result<(String, Change)> {
        self.add_layer_kind(path, LayerKind::tokens())
    }

    pub fn add_layer_folder(&mut self, path: &str) -> Result<(String, Change)> {
        self.add_layer_kind(path, LayerKind::Folder(Vec::new()))
    }

    fn add_layer_kind(&mut self, path: &str, kind: LayerKind) -> Result<(String, Change)> {
        let (dir, name) = split_path(path);
        check_name(name)?;
        let parent = self.resolve_layer(dir, LayerFilter::Folder)?;
        let name = self.unique_child_name(parent, name, None);
        let id = self.attach(parent, name, kind, false, None);
        let path = self.layer_path(id);
        let change = Change::shared(json!(path));
        Ok((path, change))
    }

    /// Rename a layer in place; returns the name actually assigned.
    pub fn rename_layer(&mut self, path: &str, name: &str) -> Result<(String, Option<Change>)> {
        check_name(name)?;
        let id = self.resolve_layer(path, LayerFilter::Any)?;
        let layer = self.get_layer(id)?;
        let parent = match layer.parent {
            Some(parent) if !layer.kind.is_fixed() => parent,
            _ => return Err(Error::InvalidLayerPath),
        };
        if layer.name == name {
            return Ok((name.to_owned(), None));
        }
        let actual = self.unique_child_name(parent, name, Some(id));
        let old_path = self.layer_path(id);
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.name = actual.clone();
        }
        let change = Change::shared(json!({ "path": old_path, "name": actual }));
        Ok((actual, Some(change)))
    }

    /// Move a layer into the folder at `to`, at `position` among its
    /// children. Returns the layer's new path.
    pub fn move_layer(&mut self, from: &str, to: &str, position: usize) -> Result<(String, Option<Change>)> {
        let id = self.resolve_layer(from, LayerFilter::Any)?;
        let target = self.layer_by_path(to).ok_or(Error::UnknownLayer)?;
        if !matches!(self.get_layer(target)?.kind, LayerKind::Folder(_)) {
            return Err(Error::UnknownLayer);
        }
        let layer = self.get_layer(id)?;
        let parent = layer.parent.ok_or(Error::InvalidLayerPath)?;
        if layer.kind.is_fixed() && target != ROOT {
            return Err(Error::InvalidLayerPath);
        }
        if self.is_within(target, id) {
            return Err(Error::InvalidLayerPath);
        }

        let old_path = self.layer_path(id);
        let name = if parent == target {
            layer.name.clone()
        } else {
            self.unique_child_name(target, &layer.name, Some(id))
        };

        let position = if parent == target {
            let siblings = self.children(parent);
            let position = position.min(siblings.len().saturating_sub(1));
            if siblings.get(position) == Some(&id) {
                return Ok((old_path, None));
            }
            position
        } else {
            position.min(self.children(target).len())
        };

        self.detach(id);
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.name = name.clone();
            layer.parent = Some(target);
        }
        self.children_mut(target)?.insert(position, id);

        let change = Change::shared(json!({
            "from": old_path,
            "to": self.layer_path(target),
            "position": position,
            "name": name,
        }));
        Ok((self.layer_path(id), Some(change)))
    }

    pub fn set_layer_hidden(&mut self, path: &str, hidden: bool) -> Result<Option<Change>> {
        let id = self.resolve_layer(path, LayerFilter::Any)?;
        if id == ROOT {
            return Err(Error::InvalidLayerPath);
        }
        let path = self.layer_path(id);
        match self.layers.get_mut(&id) {
            Some(layer) if layer.hidden != hidden => {
                layer.hidden = hidden;
                Ok(Some(Change::shared(json!(path))))
            }
            Some(_) => Ok(None),
            None => Err(Error::UnknownLayer),
        }
    }

    /// Remove a layer with everything below it.
    pub fn remove_layer(&mut self, path: &str) -> Result<Change> {
        let id = self.resolve_layer(path, LayerFilter::Any)?;
        if id == ROOT || self.get_layer(id)?.kind.is_fixed() {
            return Err(Error::InvalidLayerPath);
        }
        let path = self.layer_path(id);
        self.detach(id);
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let Some(layer) = self.layers.remove(&next) else {
                continue;
            };
            match layer.kind {
                LayerKind::Folder(children) => pending.extend(children),
                LayerKind::Tokens { tokens, walls } => {
                    for token in tokens {
                        self.tokens.remove(&token);
                    }
                    for wall in walls {
                        self.walls.remove(&wall);
                    }
                }
                LayerKind::Grid | LayerKind::Light => {}
            }
        }
        Ok(Change::shared(json!(path)))
    }

    /// Place a token on a layer. A zero or already used ID is replaced by a
    /// freshly minted one; the ID actually used is returned.
    pub fn add_token(&mut self, layer: LayerId, mut token: Token, position: Option<usize>) -> Result<(TokenId, Change)> {
        token.check_lighting()?;
        let count = self.leaf(layer)?.0.len();
        if token.id == 0 || self.tokens.contains_key(&token.id) {
            token.id = self.last_token_id.checked_add(1).ok_or(Error::IdsExhausted)?;
        }
        let position = position.unwrap_or(count).min(count);
        let path = self.layer_path(layer);
        let change = Change::split(
            json!({ "path": path, "pos": position, "token": to_json(&token)? }),
            Some(json!({ "path": path, "pos": position, "token": to_json(&token.guest_view())? })),
        );

        self.leaf_mut(layer)?.0.insert(position, token.id);
        self.last_token_id = self.last_token_id.max(token.id);
        let id = token.id;
        self.tokens.insert(id, (layer, token));
        Ok((id, change))
    }

    pub fn remove_token(&mut self, id: TokenId) -> Result<Change> {
        let layer = self.token_layer(id)?;
        self.leaf_mut(layer)?.0.retain(|t| *t != id);
        self.tokens.remove(&id);
        Ok(Change::shared(json!(id)))
    }

    /// Apply a partial update. Lighting is checked before any field changes.
    pub fn set_token(&mut self, update: TokenUpdate) -> Result<Option<Change>> {
        let (_, token) = self.tokens.get_mut(&update.id).ok_or(Error::UnknownToken)?;
        update.check(token)?;
        match token.apply(update) {
            Some((admin, guest)) => Ok(Some(token_change(to_json(&admin)?, &guest)?)),
            None => Ok(None),
        }
    }

    /// Apply several partial updates, all or none.
    pub fn set_token_multi(&mut self, updates: Vec<TokenUpdate>) -> Result<Option<Change>> {
        let mut staged: HashMap<TokenId, Token> = HashMap::new();
        let mut admin = Vec::new();
        let mut guest = Vec::new();
        for update in updates {
            let token = match staged.entry(update.id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let (_, current) = self.tokens.get(&update.id).ok_or(Error::UnknownToken)?;
                    entry.insert(current.clone())
                }
            };
            update.check(token)?;
            if let Some((a, g)) = token.apply(update) {
                admin.push(to_json(&a)?);
                if !g.is_empty() {
                    guest.push(to_json(&g)?);
                }
            }
        }
        if admin.is_empty() {
            return Ok(None);
        }
        for (id, token) in staged {
            if let Some(entry) = self.tokens.get_mut(&id) {
                entry.1 = token;
            }
        }
        let guest = (!guest.is_empty()).then(|| Value::Array(guest));
        Ok(Some(Change::split(Value::Array(admin), guest)))
    }

    /// Move a token to `position` on `layer`, possibly a different layer.
    pub fn set_token_layer_pos(&mut self, id: TokenId, layer: LayerId, position: usize) -> Result<Option<Change>> {
        let from = self.token_layer(id)?;
        let count = self.leaf(layer)?.0.len();
        let position = if from == layer {
            let position = position.min(count.saturating_sub(1));
            if self.leaf(layer)?.0.get(position) == Some(&id) {
                return Ok(None);
            }
            position
        } else {
            position.min(count)
        };

        self.leaf_mut(from)?.0.retain(|t| *t != id);
        self.leaf_mut(layer)?.0.insert(position, id);
        if let Some(entry) = self.tokens.get_mut(&id) {
            entry.0 = layer;
        }
        let path = self.layer_path(layer);
        Ok(Some(Change::shared(json!({ "id": id, "path": path, "pos": position }))))
    }

    /// Add a wall; ID handling follows [`LevelMap::add_token`].
    pub fn add_wall(&mut self, layer: LayerId, mut wall: Wall) -> Result<(WallId, Change)> {
        self.leaf(layer)?;
        if wall.id == 0 || self.walls.contains_key(&wall.id) {
            wall.id = self.last_wall_id.checked_add(1).ok_or(Error::IdsExhausted)?;
        }
        let path = self.layer_path(layer);
        let change = Change::shared(json!({ "path": path, "wall": to_json(&wall)? }));
        self.leaf_mut(layer)?.1.push(wall.id);
        self.last_wall_id = self.last_wall_id.max(wall.id);
        self.walls.insert(wall.id, (layer, wall));
        Ok((wall.id, change))
    }

    pub fn remove_wall(&mut self, id: WallId) -> Result<Change> {
        let layer = self.wall_layer(id)?;
        self.leaf_mut(layer)?.1.retain(|w| *w != id);
        self.walls.remove(&id);
        Ok(Change::shared(json!(id)))
    }

    pub fn modify_wall(&mut self, wall: Wall) -> Result<Option<Change>> {
        let (_, current) = self.walls.get_mut(&wall.id).ok_or(Error::UnknownWall)?;
        if *current == wall {
            return Ok(None);
        }
        *current = wall;
        Ok(Some(Change::shared(to_json(&wall)?)))
    }

    /// Move a wall to the end of another layer's wall list.
    pub fn move_wall(&mut self, id: WallId, layer: LayerId) -> Result<Option<Change>> {
        let from = self.wall_layer(id)?;
        self.leaf(layer)?;
        if from == layer {
            return Ok(None);
        }
        self.leaf_mut(from)?.1.retain(|w| *w != id);
        self.leaf_mut(layer)?.1.push(id);
        if let Some(entry) = self.walls.get_mut(&id) {
            entry.0 = layer;
        }
        let path = self.layer_path(layer);
        Ok(Some(Change::shared(json!({ "id": id, "path": path }))))
    }

    pub fn add_to_mask(&mut self, shape: Shape) -> Result<Change> {
        check_shape(&shape)?;
        let change = Change::shared(json!(shape));
        self.mask.masks.push(shape);
        Ok(change)
    }

    pub fn remove_from_mask(&mut self, index: usize) -> Result<Change> {
        if index >= self.mask.masks.len() {
            return Err(Error::InvalidMask);
        }
        self.mask.masks.remove(index);
        Ok(Change::shared(json!(index)))
    }

    pub fn set_mask(&mut self, mask: Mask) -> Result<Option<Change>> {
        mask.validate()?;
        if self.mask == mask {
            return Ok(None);
        }
        let change = Change::shared(to_json(&mask)?);
        self.mask = mask;
        Ok(Some(change))
    }

    /// The map as seen by an admin, or by a guest with admin-only data
    /// removed.
    pub fn snapshot(&self, admin: bool) -> MapSnapshot {
        let (tokens, walls) = self.leaf_snapshot(&self.root_tokens, &self.root_walls, admin);
        MapSnapshot {
            details: self.details.clone(),
            light_colour: self.light_colour,
            mask: self.mask.clone(),
            data: if admin {
                self.data.clone()
            } else {
                keystore::user_visible(&self.data)
            },
            last_token_id: self.last_token_id,
            last_wall_id: self.last_wall_id,
            tokens,
            walls,
            children: self.children_snapshot(ROOT, admin),
        }
    }

    fn children_snapshot(&self, id: LayerId, admin: bool) -> Vec<LayerSnapshot> {
        self.children(id)
            .iter()
            .filter_map(|child| self.layers.get(child).map(|layer| (child, layer)))
            .map(|(child, layer)| match &layer.kind {
                LayerKind::Folder(_) => LayerSnapshot::Folder {
                    name: layer.name.clone(),
                    hidden: layer.hidden,
                    children: self.children_snapshot(*child, admin),
                },
                LayerKind::Tokens { tokens, walls } => {
                    let (tokens, walls) = self.leaf_snapshot(tokens, walls, admin);
                    LayerSnapshot::Tokens {
                        name: layer.name.clone(),
                        hidden: layer.hidden,
                        tokens,
                        walls,
                    }
                }
                LayerKind::Grid => LayerSnapshot::Grid { hidden: layer.hidden },
                LayerKind::Light => LayerSnapshot::Light { hidden: layer.hidden },
            })
            .collect()
    }

    fn leaf_snapshot(&self, tokens: &[TokenId], walls: &[WallId], admin: bool) -> (Vec<Token>, Vec<Wall>) {
        let tokens = tokens
            .iter()
            .filter_map(|id| self.token(*id))
            .map(|token| if admin { token.clone() } else { token.guest_view() })
            .collect();
        let walls = walls.iter().filter_map(|id| self.wall(*id)).copied().collect();
        (tokens, walls)
    }

    pub fn from_snapshot(snapshot: MapSnapshot) -> Result<Self> {
        let mut map = Self::bare(snapshot.details);
        map.light_colour = snapshot.light_colour;
        snapshot.mask.validate()?;
        map.mask = snapshot.mask;
        map.data = snapshot.data;
        map.last_token_id = snapshot.last_token_id;
        map.last_wall_id = snapshot.last_wall_id;
        map.restore_leaf(ROOT, snapshot.tokens, snapshot.walls)?;
        for child in snapshot.children {
            map.restore(ROOT, child)?;
        }
        for (name, kind) in [(LIGHT, LayerKind::Light), (GRID, LayerKind::Grid)] {
            if map.child_named(ROOT, name).is_none() {
                warn!("map snapshot without a {name} layer, adding one");
                map.attach(ROOT, name.to_owned(), kind, false, None);
            }
        }
        Ok(map)
    }

    fn restore(&mut self, parent: LayerId, snapshot: LayerSnapshot) -> Result<()> {
        match snapshot {
            LayerSnapshot::Folder { name, hidden, children } => {
                let name = self.restored_name(parent, &name)?;
                let id = self.attach(parent, name, LayerKind::Folder(Vec::new()), hidden, None);
                for child in children {
                    self.restore(id, child)?;
                }
            }
            LayerSnapshot::Tokens {
                name,
                hidden,
                tokens,
                walls,
            } => {
                let name = self.restored_name(parent, &name)?;
                let id = self.attach(parent, name, LayerKind::tokens(), hidden, None);
                self.restore_leaf(id, tokens, walls)?;
            }
            LayerSnapshot::Grid { hidden } => self.restore_fixed(parent, GRID, LayerKind::Grid, hidden)?,
            LayerSnapshot::Light { hidden } => self.restore_fixed(parent, LIGHT, LayerKind::Light, hidden)?,
        }
        Ok(())
    }

    fn restored_name(&self, parent: LayerId, name: &str) -> Result<String> {
        check_name(name).map_err(|_| Error::Codec(format!("bad layer name {name:?}")))?;
        Ok(self.unique_child_name(parent, name, None))
    }

    fn restore_fixed(&mut self, parent: LayerId, name: &str, kind: LayerKind, hidden: bool) -> Result<()> {
        if parent != ROOT || self.child_named(ROOT, name).is_some() {
            return Err(Error::Codec(format!("misplaced {name} layer")));
        }
        self.attach(ROOT, name.to_owned(), kind, hidden, None);
        Ok(())
    }

    fn restore_leaf(&mut self, layer: LayerId, tokens: Vec<Token>, walls: Vec<Wall>) -> Result<()> {
        for token in tokens {
            token.check_lighting()?;
            if token.id == 0 || self.tokens.contains_key(&token.id) {
                return Err(Error::Codec(format!("duplicate token id {}", token.id)));
            }
            self.last_token_id = self.last_token_id.max(token.id);
            self.leaf_mut(layer)?.0.push(token.id);
            self.tokens.insert(token.id, (layer, token));
        }
        for wall in walls {
            if wall.id == 0 || self.walls.contains_key(&wall.id) {
                return Err(Error::Codec(format!("duplicate wall id {}", wall.id)));
            }
            self.last_wall_id = self.last_wall_id.max(wall.id);
            self.leaf_mut(layer)?.1.push(wall.id);
            self.walls.insert(wall.id, (layer, wall));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::pack_json(&self.snapshot(true))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_snapshot(codec::unpack_json(bytes)?)
    }

    pub fn view(&self, admin: bool) -> Result<Value> {
        to_json(&self.snapshot(admin))
    }
}

fn key_change(delta: &keystore::KeyDelta) -> Result<Change> {
    let guest = if delta.guest.is_empty() {
        None
    } else {
        Some(to_json(&delta.guest)?)
    };
    Ok(Change::split(to_json(&delta.admin)?, guest))
}

fn token_change(admin: Value, guest: &TokenUpdate) -> Result<Change> {
    let guest = if guest.is_empty() { None } else { Some(to_json(guest)?) };
    Ok(Change::split(admin, guest))
}
