//! Arcade kiosk photo pipeline
//!
//! Sends each session's captured photo to a remote image-generation server
//! for stylization through an isolated worker, then composes a memorial card
//! from the stylized photo and the game result with an external raster tool.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
