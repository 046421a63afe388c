//! kiosk-agent library
//!
//! Edge agent for a digital signage kiosk. Keeps local media, playlists and
//! match databases in step with the remote authority, decides what plays
//! next, and queues safety alerts for delivery while offline.

pub mod agent;
pub mod alerts;
pub mod api;
pub mod authority;
pub mod connectivity;
pub mod dispatch;
pub mod error;
pub mod matching;
pub mod mode;
pub mod pairing;
pub mod player;
pub mod playlist;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod store;
pub mod sync;

pub use error::{AgentError, Result};
