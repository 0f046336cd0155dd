//! Proxmox VE API surface: wire types, HTTP client and the [`PveApi`]
//! trait the engine consumes.

pub mod api;
pub mod client;
pub mod types;

pub use api::PveApi;
pub use client::{PveClient, PveConfig};
