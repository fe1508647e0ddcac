//! # hearth-collab: real-time layer of the Hearth tabletop server
//!
//! Serves the [`hearth_core`] data model to many WebSocket clients at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ admin/guest │ ◄─────────────────► │ HearthServer │
//! │   client    │     JSON-RPC        └──────┬───────┘
//! └─────────────┘                            │
//!                                     ┌──────┴───────┐
//!                                     │  Dispatcher  │──► auth · images · audio
//!                                     └──────┬───────┘    characters · maps
//!                                            │
//!                          ┌─────────────────┼─────────────────┐
//!                          ▼                 ▼                 ▼
//!                   ┌────────────┐   ┌──────────────┐  ┌──────────────┐
//!                   │  Folders   │   │  Characters  │  │     Maps     │
//!                   │ (NameTree) │   │  (KeyMaps)   │  │  (LevelMap)  │
//!                   └─────┬──────┘   └──────┬───────┘  └──────┬───────┘
//!                         └────────── BlobStore ──────────────┘
//!                                   (RocksDB / memory)
//! ```
//!
//! Every mutation persists first and then broadcasts through the
//! [`ConnectionRegistry`], still under the lock of the component it changed.
//!
//! ## Modules
//!
//! - [`protocol`]: request/response envelopes and push IDs
//! - [`broadcast`]: connections, subscription masks, filtered fan-out
//! - [`rpc`]: namespace dispatch
//! - [`assets`]: folder trees for images, audio, characters and maps
//! - [`characters`]: character keystore
//! - [`maps`]: scene service
//! - [`auth`]: admin password and login
//! - [`storage`]: `BlobStore` backends
//! - [`server`]: WebSocket front end
//! - [`http`]: REST side channel for blobs and folder maintenance

pub mod assets;
pub mod auth;
pub mod broadcast;
pub mod characters;
pub mod error;
pub mod hearth;
pub mod http;
pub mod maps;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod storage;

pub use assets::{AssetClass, FolderCall, FolderDomain, Folders};
pub use auth::{bearer, Auth, AuthDomain};
pub use broadcast::{Audience, BroadcastStats, Connection, ConnectionRegistry, Subscription};
pub use characters::{CharacterDomain, Characters};
pub use error::{Error, Result};
pub use hearth::Hearth;
pub use maps::{MapDomain, Maps};
pub use protocol::{FolderEvent, Reply, Request};
pub use rpc::{Dispatcher, RpcDomain};
pub use server::{BoxError, HearthServer, ServerConfig};
pub use storage::{BlobStore, MemoryStore, RocksStore, StoreConfig, StoreError};
