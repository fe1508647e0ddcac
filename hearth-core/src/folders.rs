//! Hierarchical, reference-counted naming layer.
//!
//! A [`NameTree`] maps slash-separated paths onto [`ItemId`]s without caring
//! what the IDs denote. The same item may appear under several paths
//! (links); the [`LinkTable`] counts those appearances plus any hidden
//! links, and an item whose count drops to zero becomes garbage that the
//! owner purges from the blob store on its next save.
//!
//! ```text
//! /                      LinkTable
//! ├── dungeons/          ┌────┬─────────┬────────┐
//! │   ├── cellar  ──► 7  │ id │ visible │ hidden │
//! │   └── crypt   ──► 9  ├────┼─────────┼────────┤
//! └── cellar-copy ──► 7  │  7 │    2    │   0    │
//!                        │  9 │    1    │   1    │
//!                        └────┴─────────┴────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::ids::ItemId;

/// One folder level. Serializes as `{"folders":{…},"items":{…}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub folders: BTreeMap<String, Folder>,
    pub items: BTreeMap<String, ItemId>,
}

impl Folder {
    /// Visit every item ID in this folder and all subfolders.
    pub fn for_each_item(&self, f: &mut impl FnMut(ItemId)) {
        for folder in self.folders.values() {
            folder.for_each_item(f);
        }
        for id in self.items.values() {
            f(*id);
        }
    }

    fn write_text(&self, out: &mut String, depth: usize) {
        for (name, folder) in &self.folders {
            let _ = writeln!(out, "{:indent$}{name}/", "", indent = depth * 2);
            folder.write_text(out, depth + 1);
        }
        for (name, id) in &self.items {
            let _ = writeln!(out, "{:indent$}{name}\t{id}", "", indent = depth * 2);
        }
    }
}

/// Reference counts for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    /// Appearances in the folder tree.
    pub visible: u32,
    /// Weak occupancy links held by other subsystems.
    pub hidden: u32,
}

impl Links {
    pub fn count(&self) -> u32 {
        self.visible + self.hidden
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    links: BTreeMap<ItemId, Links>,
}

impl LinkTable {
    pub fn get(&self, id: ItemId) -> Links {
        self.links.get(&id).copied().unwrap_or_default()
    }

    pub fn refcount(&self, id: ItemId) -> u32 {
        self.get(id).count()
    }

    /// All IDs with a non-zero count.
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.links.keys().copied()
    }

    fn link(&mut self, id: ItemId) {
        self.links.entry(id).or_default().visible += 1;
    }

    fn link_hidden(&mut self, id: ItemId) {
        self.links.entry(id).or_default().hidden += 1;
    }

    /// Drop one visible link. Returns true when the item is now unreferenced.
    fn unlink(&mut self, id: ItemId) -> bool {
        self.release(id, |l| &mut l.visible)
    }

    fn unlink_hidden(&mut self, id: ItemId) -> bool {
        self.release(id, |l| &mut l.hidden)
    }

    fn release(&mut self, id: ItemId, counter: impl FnOnce(&mut Links) -> &mut u32) -> bool {
        let Some(links) = self.links.get_mut(&id) else {
            return false;
        };
        let c = counter(links);
        if *c == 0 {
            return false;
        }
        *c -= 1;
        if links.count() == 0 {
            self.links.remove(&id);
            return true;
        }
        false
    }
}

/// Persisted form: visible counts are rebuilt from the tree on load.
#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    root: Folder,
    hidden: Vec<(ItemId, u32)>,
}

/// Path → ID namespace with link counting.
#[derive(Debug, Clone, Default)]
pub struct NameTree {
    root: Folder,
    links: LinkTable,
    garbage: BTreeSet<ItemId>,
}

impl NameTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from bytes produced by [`NameTree::snapshot`].
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        let snapshot: TreeSnapshot = codec::unpack(bytes)?;
        let mut links = LinkTable::default();
        snapshot.root.for_each_item(&mut |id| links.link(id));
        for (id, hidden) in snapshot.hidden {
            if hidden > 0 {
                links.links.entry(id).or_default().hidden = hidden;
            }
        }
        Ok(Self {
            root: snapshot.root,
            links,
            garbage: BTreeSet::new(),
        })
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let hidden = self
            .links
            .links
            .iter()
            .filter(|(_, l)| l.hidden > 0)
            .map(|(id, l)| (*id, l.hidden))
            .collect();
        codec::pack(&TreeSnapshot {
            root: self.root.clone(),
            hidden,
        })
    }

    pub fn root(&self) -> &Folder {
        &self.root
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Whether `id` is still referenced from anywhere.
    pub fn contains(&self, id: ItemId) -> bool {
        self.links.refcount(id) > 0
    }

    pub fn folder(&self, path: &str) -> Option<&Folder> {
        segments(path).try_fold(&self.root, |f, name| f.folders.get(name))
    }

    fn folder_mut(&mut self, path: &str) -> Option<&mut Folder> {
        segments(path).try_fold(&mut self.root, |f, name| f.folders.get_mut(name))
    }

    /// The item stored at `path`, if any.
    pub fn item_id(&self, path: &str) -> Option<ItemId> {
        let (dir, name) = split_path(path);
        self.folder(dir)?.items.get(name).copied()
    }

    pub fn create_folder(&mut self, path: &str) -> Result<String> {
        let (dir, name) = split_path(path.trim_end_matches('/'));
        if name.is_empty() {
            return Err(Error::InvalidPath);
        }
        let parent = self.folder_mut(dir).ok_or(Error::FolderNotFound)?;
        let name = unique_name(name, |n| parent.folders.contains_key(n));
        parent.folders.insert(name.clone(), Folder::default());
        Ok(join(dir, &name))
    }

    /// Register a freshly minted item at `path`. An empty final segment
    /// names the item after its ID.
    pub fn add_item(&mut self, id: ItemId, path: &str) -> Result<String> {
        let (dir, name) = split_path(path);
        let name = if name.is_empty() { id.to_string() } else { name.to_owned() };
        let parent = self.folder_mut(dir).ok_or(Error::FolderNotFound)?;
        let name = unique_name(&name, |n| parent.items.contains_key(n));
        parent.items.insert(name.clone(), id);
        self.links.link(id);
        Ok(join(dir, &name))
    }

    pub fn move_item(&mut self, from: &str, to: &str) -> Result<String> {
        let (from_dir, from_name) = split_path(from);
        let id = self.item_id(from).ok_or(Error::ItemNotFound)?;
        let (to_dir, to_name) = split_path(to);
        if self.folder(to_dir).is_none() {
            return Err(Error::FolderNotFound);
        }
        let name = if to_name.is_empty() { from_name } else { to_name }.to_owned();
        if let Some(source) = self.folder_mut(from_dir) {
            source.items.remove(from_name);
        }
        let dest = self.folder_mut(to_dir).ok_or(Error::FolderNotFound)?;
        let name = unique_name(&name, |n| dest.items.contains_key(n));
        dest.items.insert(name.clone(), id);
        Ok(join(to_dir, &name))
    }

    pub fn move_folder(&mut self, from: &str, to: &str) -> Result<String> {
        let from_segs: Vec<&str> = segments(from).collect();
        let (from_dir, from_name) = split_path(from.trim_end_matches('/'));
        if from_segs.is_empty() || self.folder(from).is_none() {
            return Err(Error::FolderNotFound);
        }
        let (to_dir, to_name) = split_path(to);
        if self.folder(to_dir).is_none() {
            return Err(Error::FolderNotFound);
        }
        let to_segs: Vec<&str> = segments(to_dir).collect();
        if to_segs.starts_with(&from_segs) {
            return Err(Error::InvalidPath);
        }
        let name = if to_name.is_empty() { from_name } else { to_name }.to_owned();
        let folder = self
            .folder_mut(from_dir)
            .and_then(|parent| parent.folders.remove(from_name))
            .ok_or(Error::FolderNotFound)?;
        let dest = self.folder_mut(to_dir).ok_or(Error::FolderNotFound)?;
        let name = unique_name(&name, |n| dest.folders.contains_key(n));
        dest.folders.insert(name.clone(), folder);
        Ok(join(to_dir, &name))
    }

    /// Remove the entry at `path`, returning the ID it pointed to.
    pub fn remove_item(&mut self, path: &str) -> Result<ItemId> {
        let (dir, name) = split_path(path);
        let id = self
            .folder_mut(dir)
            .and_then(|f| f.items.remove(name))
            .ok_or(Error::ItemNotFound)?;
        self.unlink(id);
        Ok(id)
    }

    /// Remove a folder and unlink everything below it.
    pub fn remove_folder(&mut self, path: &str) -> Result<()> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = split_path(trimmed);
        if name.is_empty() {
            return Err(Error::FolderNotFound);
        }
        let folder = self
            .folder_mut(dir)
            .and_then(|f| f.folders.remove(name))
            .ok_or(Error::FolderNotFound)?;
        folder.for_each_item(&mut |id| self.unlink(id));
        Ok(())
    }

    /// Add another visible reference to an existing item.
    pub fn link_item(&mut self, id: ItemId, path: &str) -> Result<String> {
        if !self.contains(id) {
            return Err(Error::ItemNotFound);
        }
        self.add_item(id, path)
    }

    /// Move a hidden link from `old` to `new`. Links to items that are not
    /// referenced anywhere are refused; returns whether `new` was linked.
    pub fn set_hidden_link(&mut self, old: Option<ItemId>, new: Option<ItemId>) -> bool {
        let linked = match new {
            Some(id) if self.contains(id) => {
                self.links.link_hidden(id);
                true
            }
            _ => false,
        };
        if let Some(id) = old {
            if self.links.unlink_hidden(id) {
                self.garbage.insert(id);
            }
        }
        linked
    }

    /// IDs that lost their last reference since the previous call.
    pub fn take_garbage(&mut self) -> Vec<ItemId> {
        std::mem::take(&mut self.garbage).into_iter().collect()
    }

    /// Unreferenced IDs whose blobs have not been purged yet.
    pub fn garbage(&self) -> Vec<ItemId> {
        self.garbage.iter().copied().collect()
    }

    /// Forget `purged` once their blobs are gone.
    pub fn clear_garbage(&mut self, purged: &[ItemId]) {
        for id in purged {
            self.garbage.remove(id);
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.root).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Indented text rendering: folders end in `/`, items are `name\tid`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.root.write_text(&mut out, 0);
        out
    }

    fn unlink(&mut self, id: ItemId) {
        if self.links.unlink(id) {
            self.garbage.insert(id);
        }
    }
}

/// First free name among `name`, `name.0`, `name.1`, …
pub fn unique_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_owned();
    }
    let mut n = 0u64;
    loop {
        let candidate = format!("{name}.{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub(crate) fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// `"/a/b/c"` → `("/a/b", "c")`; a trailing slash yields an empty name.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

pub(crate) fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir.starts_with('/') {
        format!("{dir}/{name}")
    } else {
        format!("/{dir}/{name}")
    }
}
