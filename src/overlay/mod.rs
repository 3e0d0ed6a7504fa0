pub mod config;
pub mod keys;

pub use config::{fingerprint, mesh_members, render_mesh_config, InterfaceConfig};
