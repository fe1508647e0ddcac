//! Method dispatch.
//!
//! A method name is `<namespace>.<method>`. The namespace selects an
//! [`RpcDomain`]; the domain decides what the method means and who may call
//! it. Guests calling admin methods get [`Error::UnknownMethod`], the same
//! answer as for a method that does not exist.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::broadcast::Connection;
use crate::error::{Error, Result};
use crate::protocol::Reply;

#[async_trait]
pub trait RpcDomain: Send + Sync {
    async fn call(&self, conn: &Arc<Connection>, method: &str, params: Value) -> Result<Reply>;
}

/// Fail as if the method did not exist unless `conn` is an admin.
pub fn require_admin(conn: &Connection) -> Result<()> {
    if conn.is_admin() {
        Ok(())
    } else {
        Err(Error::UnknownMethod)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    domains: HashMap<&'static str, Arc<dyn RpcDomain>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, namespace: &'static str, domain: Arc<dyn RpcDomain>) {
        self.domains.insert(namespace, domain);
    }

    pub async fn dispatch(&self, conn: &Arc<Connection>, method: &str, params: Value) -> Result<Reply> {
        let (namespace, name) = method.split_once('.').ok_or(Error::UnknownMethod)?;
        let domain = self.domains.get(namespace).ok_or(Error::UnknownMethod)?;
        domain.call(conn, name, params).await
    }
}
