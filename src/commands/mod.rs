pub mod daemon;
pub mod mesh;
pub mod monitor;
pub mod node;
mod output;

use std::path::Path;

use anyhow::Result;

use crate::client::TrellisClient;
use crate::config;

/// Client for the daemon named by `controller_url` in the loaded config.
fn client(config_path: Option<&Path>) -> Result<TrellisClient> {
    let cfg = config::load(config_path)?;
    TrellisClient::new(cfg.controller_url())
}
