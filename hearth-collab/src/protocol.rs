//! JSON-RPC envelopes carried in WebSocket text frames.
//!
//! ```text
//! client → server   {"id": 7, "method": "maps.setToken", "params": {...}}
//! server → client   {"id": 7, "result": ...}  |  {"id": 7, "error": "unknown token"}
//! server push       {"id": -73, "result": {...}}
//! ```
//!
//! Positive IDs belong to the client. Negative IDs are server pushes; the
//! ID alone tells the client what happened (see [`push`]).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Inbound call.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn parse(frame: &str) -> Result<Self, Error> {
        serde_json::from_str(frame).map_err(|e| Error::InvalidParams(e.to_string()))
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Value),
    /// Pre-serialized JSON, written into the envelope as is.
    Raw(Arc<str>),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Json(value)
    }
}

impl Reply {
    pub fn null() -> Self {
        Reply::Json(Value::Null)
    }

    /// Serialize a typed result.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value)
            .map(Reply::Json)
            .map_err(|e| Error::Domain(hearth_core::Error::Codec(e.to_string())))
    }

    /// Parsed form, for callers that want to inspect a reply.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Json(value) => value,
            Reply::Raw(raw) => serde_json::from_str(&raw).unwrap_or(Value::Null),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    id: i64,
    error: &'a str,
}

#[derive(Serialize)]
struct ResultEnvelope<'a> {
    id: i64,
    result: &'a Value,
}

/// Encode a response frame.
pub fn encode_result(id: i64, reply: &Reply) -> Arc<str> {
    match reply {
        Reply::Json(value) => serde_json::to_string(&ResultEnvelope { id, result: value })
            .unwrap_or_else(|e| encode_error_string(id, &e.to_string()))
            .into(),
        Reply::Raw(raw) => format!(r#"{{"id":{id},"result":{raw}}}"#).into(),
    }
}

pub fn encode_error(id: i64, message: &str) -> Arc<str> {
    encode_error_string(id, message).into()
}

fn encode_error_string(id: i64, message: &str) -> String {
    serde_json::to_string(&ErrorEnvelope { id, error: message })
        .unwrap_or_else(|_| format!(r#"{{"id":{id},"error":"internal error"}}"#))
}

/// Encode a server push.
pub fn encode_push(id: i64, payload: &Value) -> Arc<str> {
    encode_result(id, &Reply::Json(payload.clone()))
}

/// Decode call parameters into a typed request.
pub fn params<T: DeserializeOwned>(params: Value) -> Result<T, Error> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

/// Server push IDs.
pub mod push {
    pub const LOGGED_OUT: i64 = -1;
    pub const CURRENT_MAP: i64 = -2;
    pub const ADMIN_STATUS: i64 = -3;

    pub const IMAGES_BASE: i64 = -10;
    pub const AUDIO_BASE: i64 = -20;
    pub const CHARACTERS_BASE: i64 = -30;
    pub const MAPS_BASE: i64 = -40;

    pub const CHARACTER_DATA_CHANGE: i64 = -50;
    pub const CHARACTER_DATA_REMOVE: i64 = -51;

    pub const MAP_DETAILS: i64 = -60;
    pub const MAP_LIGHT_COLOUR: i64 = -61;
    pub const MAP_KEY_SET: i64 = -62;
    pub const MAP_KEY_REMOVE: i64 = -63;
    pub const LAYER_ADD: i64 = -64;
    pub const LAYER_FOLDER_ADD: i64 = -65;
    pub const LAYER_RENAME: i64 = -66;
    pub const LAYER_MOVE: i64 = -67;
    pub const LAYER_SHOW: i64 = -68;
    pub const LAYER_HIDE: i64 = -69;
    pub const LAYER_REMOVE: i64 = -70;
    pub const TOKEN_ADD: i64 = -71;
    pub const TOKEN_REMOVE: i64 = -72;
    pub const TOKEN_SET: i64 = -73;
    pub const TOKEN_SET_MULTI: i64 = -74;
    pub const TOKEN_LAYER_POS: i64 = -75;
    pub const WALL_ADD: i64 = -76;
    pub const WALL_REMOVE: i64 = -77;
    pub const WALL_MODIFY: i64 = -78;
    pub const WALL_MOVE: i64 = -79;
    pub const MASK_ADD: i64 = -80;
    pub const MASK_REMOVE: i64 = -81;
    pub const MASK_SET: i64 = -82;
}

/// Folder events, offset from a class's push base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FolderEvent {
    ItemAdd = 0,
    ItemMove = 1,
    ItemRemove = 2,
    ItemLink = 3,
    FolderAdd = 4,
    FolderMove = 5,
    FolderRemove = 6,
}

impl FolderEvent {
    pub fn push_id(self, base: i64) -> i64 {
        base - self as i64
    }
}
