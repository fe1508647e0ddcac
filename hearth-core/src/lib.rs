//! # hearth-core: data model for the Hearth tabletop server
//!
//! Pure, synchronous building blocks. Nothing in this crate performs I/O or
//! takes locks; the collaboration layer wraps each structure in its own lock
//! and persists the encoded bytes.
//!
//! ## Modules
//!
//! - [`folders`]: reference-counted folder namespace shared by every asset class
//! - [`keystore`]: keyed attribute bags with guest visibility
//! - [`scene`]: layered maps of tokens, walls and masks
//! - [`codec`]: LZ4-framed bincode and JSON blob encodings
//! - [`ids`]: monotonic item ID allocation

pub mod codec;
pub mod error;
pub mod folders;
pub mod ids;
pub mod keystore;
pub mod scene;

pub use error::{Error, ErrorKind, Result};
pub use folders::{unique_name, Folder, LinkTable, Links, NameTree};
pub use ids::{IdAllocator, ItemId};
pub use keystore::{KeyChange, KeyData, KeyDelta, KeyMap};
pub use scene::{
    Change, Colour, Layer, LayerFilter, LayerId, LayerKind, LevelMap, MapDetails, MapSnapshot, Mask, Token,
    TokenId, TokenUpdate, Wall, WallId,
};
