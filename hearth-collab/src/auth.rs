//! Admin authentication.
//!
//! One shared admin password, kept as a SHA-256 hex digest. Until it is
//! first changed the digest of the configured default is used and nothing is
//! stored.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::broadcast::{Connection, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::protocol::{params, push, Reply};
use crate::rpc::{require_admin, RpcDomain};
use crate::storage::BlobStore;

pub const PASSWORD_KEY: &str = "auth/password";

pub fn digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Password carried by an `Authorization: Bearer …` header value.
pub fn bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}

pub struct Auth {
    digest: RwLock<String>,
    store: Arc<dyn BlobStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Auth {
    pub fn load(store: Arc<dyn BlobStore>, registry: Arc<ConnectionRegistry>, default_password: &str) -> Result<Self> {
        let digest = match store.get(PASSWORD_KEY)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => digest(default_password),
        };
        Ok(Self {
            digest: RwLock::new(digest),
            store,
            registry,
        })
    }

    pub fn verify(&self, password: &str) -> bool {
        *self.digest.read() == digest(password)
    }

    /// Promote `conn` to admin.
    pub fn login(&self, conn: &Connection, password: &str) -> Result<()> {
        if !self.verify(password) {
            log::warn!("Rejected admin login for connection {}", conn.id());
            return Err(Error::InvalidPassword);
        }
        if !conn.is_admin() {
            self.registry.set_role(conn, true);
            log::info!("Connection {} logged in as admin", conn.id());
        }
        Ok(())
    }

    /// Drop `conn` back to guest; it is pushed the current map.
    pub fn logout(&self, conn: &Connection) {
        if conn.is_admin() {
            self.registry.set_role(conn, false);
            conn.push(push::CURRENT_MAP, &json!(conn.current_map()));
        }
    }

    /// Replace the password and log out every other admin.
    pub fn change_password(&self, conn: &Connection, password: &str) -> Result<usize> {
        if password.is_empty() {
            return Err(Error::InvalidPassword);
        }
        let mut current = self.digest.write();
        let next = digest(password);
        self.store.set(PASSWORD_KEY, next.as_bytes())?;
        *current = next;
        let kicked = self.registry.kick_admins(conn.id());
        log::info!("Admin password changed, {kicked} other admin sessions logged out");
        Ok(kicked)
    }
}

#[derive(Deserialize)]
struct PasswordParams {
    password: String,
}

/// The `auth` namespace.
pub struct AuthDomain {
    auth: Arc<Auth>,
}

impl AuthDomain {
    pub fn new(auth: Arc<Auth>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl RpcDomain for AuthDomain {
    async fn call(&self, conn: &Arc<Connection>, method: &str, value: Value) -> Result<Reply> {
        match method {
            "status" => Ok(json!(conn.is_admin()).into()),
            "login" => {
                let p: PasswordParams = params(value)?;
                self.auth.login(conn, &p.password)?;
                Ok(json!(true).into())
            }
            "logout" => {
                self.auth.logout(conn);
                Ok(Reply::null())
            }
            "changePassword" => {
                require_admin(conn)?;
                let p: PasswordParams = params(value)?;
                self.auth.change_password(conn, &p.password)?;
                Ok(Reply::null())
            }
            _ => Err(Error::UnknownMethod),
        }
    }
}
