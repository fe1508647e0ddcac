//! Hearth server binary.
//!
//! Configuration comes from the environment:
//!
//! | Variable                | Default          |
//! |-------------------------|------------------|
//! | `HEARTH_BIND`           | `127.0.0.1:8080` |
//! | `HEARTH_HTTP_BIND`      | `127.0.0.1:8081` |
//! | `HEARTH_DATA`           | unset (memory)   |
//! | `HEARTH_ADMIN_PASSWORD` | `admin`          |
//!
//! Setting `HEARTH_HTTP_BIND` to `off` disables the HTTP side channel.
//!
//! Logging follows `RUST_LOG` and defaults to `info`.

use std::env;
use std::path::PathBuf;

use hearth_collab::{BoxError, HearthServer, ServerConfig};
use log::info;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = env::var("HEARTH_BIND") {
        config.bind_addr = addr;
    }
    match env::var("HEARTH_HTTP_BIND").as_deref() {
        Ok("off") => config.http_addr = None,
        Ok(addr) => config.http_addr = Some(addr.to_owned()),
        Err(_) => {}
    }
    config.data_path = env::var_os("HEARTH_DATA").map(PathBuf::from);
    if let Ok(password) = env::var("HEARTH_ADMIN_PASSWORD") {
        config.admin_password = password;
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Hearth...");
    let server = HearthServer::new(config_from_env()).await?;
    server.run().await
}
