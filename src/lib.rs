pub mod asset_path;
pub mod config;
pub mod error;
pub mod metrics;
pub mod origin;
pub mod resolver;
pub mod server;
pub mod store;
