//! # Kiosk Common Library
//!
//! Shared code for the kiosk signage agent:
//! - Data model (playlists, manifests, database versions, alerts)
//! - Event types (trigger events in, agent events out)
//! - Bootstrap configuration loading
//! - Atomic JSON persistence and SHA-256 hashing
//! - SSE helpers

pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod models;
pub mod persist;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
