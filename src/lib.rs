//! Kiosk signage pipeline: catalog mirror, playlist query service, client
//! asset cache and double-buffered playback scheduler.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod media;
pub mod mirror;
pub mod playback;
pub mod player;
pub mod query;
pub mod renderer;
pub mod scheduler;
pub mod server;
pub mod store;
