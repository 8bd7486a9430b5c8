//! Daemon wiring: configuration loading and the external API surface
//!
//! The incident pipeline itself lives in `sentinel-lib`; this crate binds it
//! to the environment and exposes it over HTTP/WebSocket.

pub mod api;
pub mod config;
