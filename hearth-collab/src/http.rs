//! HTTP side channel.
//!
//! A thin REST surface over the same components the WebSocket serves, for
//! blobs that do not belong in JSON-RPC frames and for scripted folder
//! maintenance:
//!
//! ```text
//! GET    /<class>/             folder listing, by Accept: JSON, text/plain or XML
//! PATCH  /<class>/             folder method, JSON {"method", "params"} or text
//! GET    /<class>/<path|id>    blob bytes, character bag or map view
//! POST   /<class>/<path>       file a new item built from the body
//! PUT    /characters/<path|id> set character keys
//! DELETE /<class>/<path>       remove an item, or a folder when path ends in /
//! ```
//!
//! Everything except item reads needs `Authorization: Bearer <password>`.
//! Guests read items by numeric ID only, see guest-visible character keys,
//! and may only fetch the current map.
//!
//! Requests run as a detached admin session that is never registered, so
//! every connected admin receives the resulting folder and data pushes.

use std::fmt::Write;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hearth_core::{ErrorKind, Folder, ItemId, KeyMap, MapDetails};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::assets::{AssetClass, FolderCall};
use crate::auth::bearer;
use crate::broadcast::Connection;
use crate::error::{Error, Result};
use crate::hearth::Hearth;
use crate::protocol::Reply;

/// Largest accepted request body.
pub const MAX_BODY: usize = 64 * 1024 * 1024;

/// Routes for every asset class.
pub fn router(hearth: Arc<Hearth>) -> Router {
    Router::new()
        .route("/:class", get(list).patch(patch))
        .route("/:class/", get(list).patch(patch))
        .route("/:class/*path", get(read).post(create).put(update).delete(remove))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(hearth)
}

/// Body and listing formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Json,
    Text,
    Xml,
}

impl Media {
    /// First recognised type in an `Accept` or `Content-Type` value.
    pub fn negotiate(value: &str) -> Option<Self> {
        value.split(',').find_map(|part| {
            let essence = part.split(';').next().unwrap_or_default().trim();
            match essence {
                "application/json" => Some(Media::Json),
                "text/plain" => Some(Media::Text),
                "text/xml" | "application/xml" => Some(Media::Xml),
                _ => None,
            }
        })
    }

    fn from_header(headers: &HeaderMap, name: HeaderName) -> Self {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(Media::negotiate)
            .unwrap_or(Media::Json)
    }
}

/// An error answered as `{"error": message}`.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(error: Error, admin: bool) -> Self {
        let status = match &error {
            Error::Domain(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::InvalidState => StatusCode::CONFLICT,
            },
            Error::Storage(inner) => {
                error!("HTTP request failed to persist: {inner}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::UnknownMethod | Error::UnknownMap => StatusCode::NOT_FOUND,
            Error::Conflict => StatusCode::CONFLICT,
            Error::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Error::InvalidPassword => StatusCode::UNAUTHORIZED,
        };
        Self {
            status,
            message: error.public_message(admin),
        }
    }

    fn with_status(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            message: message.to_owned(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type HttpResult = std::result::Result<Response, HttpError>;

fn is_admin(hearth: &Hearth, headers: &HeaderMap) -> bool {
    let Some(password) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer)
    else {
        return false;
    };
    let verified = hearth.auth().verify(password);
    if !verified {
        warn!("Rejected bearer password on HTTP request");
    }
    verified
}

fn require_admin(hearth: &Hearth, headers: &HeaderMap) -> std::result::Result<(), HttpError> {
    if is_admin(hearth, headers) {
        Ok(())
    } else {
        Err(HttpError::with_status(StatusCode::UNAUTHORIZED, "admin password required"))
    }
}

fn asset_class(name: &str) -> std::result::Result<AssetClass, HttpError> {
    AssetClass::from_name(name).ok_or_else(|| HttpError::with_status(StatusCode::NOT_FOUND, "unknown asset class"))
}

fn require_json(headers: &HeaderMap) -> std::result::Result<(), HttpError> {
    match Media::from_header(headers, CONTENT_TYPE) {
        Media::Json => Ok(()),
        _ => Err(HttpError::with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type")),
    }
}

async fn list(State(hearth): State<Arc<Hearth>>, Path(class): Path<String>, headers: HeaderMap) -> HttpResult {
    require_admin(&hearth, &headers)?;
    let folders = hearth.folders(asset_class(&class)?);
    let listing = folders.list().await;
    match Media::from_header(&headers, ACCEPT) {
        Media::Json => Ok(json_response(&listing)),
        Media::Text => Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], folders.list_text().await).into_response()),
        Media::Xml => {
            let root: Folder = serde_json::from_str(&listing)
                .map_err(|e| HttpError::new(hearth_core::Error::Codec(e.to_string()).into(), true))?;
            Ok(([(CONTENT_TYPE, "text/xml; charset=utf-8")], listing_xml(&root)).into_response())
        }
    }
}

async fn patch(
    State(hearth): State<Arc<Hearth>>,
    Path(class): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult {
    require_admin(&hearth, &headers)?;
    let class = asset_class(&class)?;
    let call = match Media::from_header(&headers, CONTENT_TYPE) {
        Media::Json => json_call(&body),
        Media::Text => text_call(&body),
        Media::Xml => {
            return Err(HttpError::with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type"));
        }
    };
    let reply = match call {
        Ok(call) => folder_call(&hearth, class, call).await,
        Err(e) => Err(e),
    };
    match reply.map_err(|e| HttpError::new(e, true))? {
        Reply::Json(value) => Ok(Json(value).into_response()),
        Reply::Raw(raw) => Ok(json_response(&raw)),
    }
}

async fn read(
    State(hearth): State<Arc<Hearth>>,
    Path((class, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> HttpResult {
    let admin = is_admin(&hearth, &headers);
    let class = asset_class(&class)?;
    read_item(&hearth, class, &path, admin)
        .await
        .map_err(|e| HttpError::new(e, admin))
}

async fn create(
    State(hearth): State<Arc<Hearth>>,
    Path((class, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult {
    require_admin(&hearth, &headers)?;
    let class = asset_class(&class)?;
    if matches!(class, AssetClass::Characters | AssetClass::Maps) {
        require_json(&headers)?;
    }
    let (id, path) = create_item(&hearth, class, &format!("/{path}"), &body)
        .await
        .map_err(|e| HttpError::new(e, true))?;
    debug!("HTTP filed {} {id} at {path}", class.name());
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "path": path }))).into_response())
}

async fn update(
    State(hearth): State<Arc<Hearth>>,
    Path((class, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult {
    require_admin(&hearth, &headers)?;
    if asset_class(&class)? != AssetClass::Characters {
        return Err(HttpError::with_status(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    require_json(&headers)?;
    set_character(&hearth, &path, &body)
        .await
        .map_err(|e| HttpError::new(e, true))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn remove(
    State(hearth): State<Arc<Hearth>>,
    Path((class, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> HttpResult {
    require_admin(&hearth, &headers)?;
    let class = asset_class(&class)?;
    let call = match path.strip_suffix('/') {
        Some(folder) => FolderCall::RemoveFolder {
            path: format!("/{folder}"),
        },
        None => FolderCall::RemoveItem {
            path: format!("/{path}"),
        },
    };
    folder_call(&hearth, class, call)
        .await
        .map_err(|e| HttpError::new(e, true))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn folder_call(hearth: &Hearth, class: AssetClass, call: FolderCall) -> Result<Reply> {
    let (session, _outbound) = Connection::new(true, None);
    hearth.folder_call(class, &session, call).await
}

/// Admins may name an item by path; everyone may use its ID.
async fn resolve(hearth: &Hearth, class: AssetClass, path: &str, admin: bool) -> Result<ItemId> {
    let folders = hearth.folders(class);
    if admin {
        if let Some(id) = folders.item_id(&format!("/{path}")).await {
            return Ok(id);
        }
    }
    if let Ok(id) = path.parse::<ItemId>() {
        if folders.contains(id).await {
            return Ok(id);
        }
    }
    Err(match class {
        AssetClass::Maps => Error::UnknownMap,
        _ => hearth_core::Error::ItemNotFound.into(),
    })
}

async fn read_item(hearth: &Hearth, class: AssetClass, path: &str, admin: bool) -> Result<Response> {
    let id = resolve(hearth, class, path, admin).await?;
    match class {
        AssetClass::Images | AssetClass::Audio => {
            let bytes = hearth.folders(class).read_item(id).await?;
            Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
        }
        AssetClass::Characters => Ok(Json(hearth.characters().get_keys(id, None, admin).await?).into_response()),
        AssetClass::Maps => {
            if !admin && hearth.registry().current_map() != Some(id) {
                return Err(Error::UnknownMap);
            }
            Ok(Json(hearth.maps().view(id, admin).await?).into_response())
        }
    }
}

async fn create_item(hearth: &Hearth, class: AssetClass, path: &str, body: &[u8]) -> Result<(ItemId, String)> {
    match class {
        AssetClass::Images | AssetClass::Audio => hearth.folders(class).add_item(None, body, path).await,
        AssetClass::Characters => {
            let data: KeyMap = json_body(body)?;
            let (session, _outbound) = Connection::new(true, None);
            hearth.characters().create(&session, path, data).await
        }
        AssetClass::Maps => {
            let details: MapDetails = json_body(body)?;
            hearth.maps().create(None, path, details).await
        }
    }
}

async fn set_character(hearth: &Hearth, path: &str, body: &[u8]) -> Result<()> {
    let id = resolve(hearth, AssetClass::Characters, path, true).await?;
    let data: KeyMap = json_body(body)?;
    let (session, _outbound) = Connection::new(true, None);
    hearth.characters().set_keys(&session, id, data).await
}

/// An empty body decodes as the default value.
fn json_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::InvalidParams(e.to_string()))
}

#[derive(Deserialize)]
struct PatchBody {
    method: String,
    #[serde(default)]
    params: Value,
}

fn json_call(body: &[u8]) -> Result<FolderCall> {
    let patch: PatchBody = serde_json::from_slice(body).map_err(|e| Error::InvalidParams(e.to_string()))?;
    FolderCall::parse(&patch.method, patch.params).ok_or(Error::UnknownMethod)?
}

/// The method on the first line, then one argument per line: a path,
/// `from` and `to`, or an ID and a path for `linkItem`.
fn text_call(body: &[u8]) -> Result<FolderCall> {
    let text = std::str::from_utf8(body).map_err(|e| Error::InvalidParams(e.to_string()))?;
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let method = lines.next().ok_or_else(|| Error::InvalidParams("missing method".to_owned()))?;
    let args: Vec<&str> = lines.collect();
    let params = match (method, args.as_slice()) {
        ("moveItem" | "moveFolder", [from, to]) => json!({ "from": from, "to": to }),
        ("linkItem", [id, path]) => json!({ "id": id.parse::<ItemId>().ok(), "path": path }),
        (_, [path]) => json!({ "path": path }),
        _ => json!({}),
    };
    FolderCall::parse(method, params).ok_or(Error::UnknownMethod)?
}

fn json_response(body: &str) -> Response {
    ([(CONTENT_TYPE, "application/json")], body.to_owned()).into_response()
}

/// XML rendering of a folder listing.
pub fn listing_xml(root: &Folder) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<folder>\n");
    write_xml_children(&mut out, root, 1);
    out.push_str("</folder>\n");
    out
}

fn write_xml_children(out: &mut String, folder: &Folder, depth: usize) {
    for (name, sub) in &folder.folders {
        let _ = writeln!(out, "{:indent$}<folder name=\"{}\">", "", escape_xml(name), indent = depth * 2);
        write_xml_children(out, sub, depth + 1);
        let _ = writeln!(out, "{:indent$}</folder>", "", indent = depth * 2);
    }
    for (name, id) in &folder.items {
        let _ = writeln!(out, "{:indent$}<item name=\"{}\" id=\"{id}\"/>", "", escape_xml(name), indent = depth * 2);
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(Media::negotiate("text/plain"), Some(Media::Text));
        assert_eq!(Media::negotiate("text/xml; charset=utf-8"), Some(Media::Xml));
        assert_eq!(Media::negotiate("image/png, application/xml;q=0.9, text/plain"), Some(Media::Xml));
        assert_eq!(Media::negotiate("*/*"), None);
    }

    #[test]
    fn test_text_call() {
        assert_eq!(
            text_call(b"moveItem\n/a b\n/c\n").unwrap(),
            FolderCall::MoveItem {
                from: "/a b".into(),
                to: "/c".into()
            }
        );
        assert_eq!(
            text_call(b"linkItem\n4\n/x").unwrap(),
            FolderCall::LinkItem {
                id: 4,
                path: "/x".into()
            }
        );
        assert!(matches!(text_call(b"linkItem\nfour\n/x"), Err(Error::InvalidParams(_))));
        assert_eq!(text_call(b"frobnicate\n/x"), Err(Error::UnknownMethod));
        assert!(matches!(text_call(b"  \n"), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_listing_xml_escapes_names() {
        let mut root = Folder::default();
        let mut sub = Folder::default();
        sub.items.insert("R&D <draft>".into(), 3);
        root.folders.insert("a\"b".into(), sub);
        root.items.insert("x".into(), 1);
        assert_eq!(
            listing_xml(&root),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<folder>\n  <folder name=\"a&quot;b\">\n    <item name=\"R&amp;D &lt;draft&gt;\" id=\"3\"/>\n  </folder>\n  <item name=\"x\" id=\"1\"/>\n</folder>\n"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(HttpError::new(Error::Conflict, true).status, StatusCode::CONFLICT);
        assert_eq!(HttpError::new(Error::UnknownMap, false).status, StatusCode::NOT_FOUND);
        assert_eq!(
            HttpError::new(hearth_core::Error::ItemNotFound.into(), true).status,
            StatusCode::NOT_FOUND
        );
        let err = HttpError::new(crate::storage::StoreError::Database("disk full".into()).into(), false);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "storage error");
    }
}
