//! Playlist selection
//!
//! - [`rules`]: trigger rule predicates
//! - [`engine`]: the decision engine that owns both playlist cursors

pub mod engine;
pub mod rules;

pub use engine::{PlaylistDecisionEngine, PlaylistInfo, Selection, TriggerOutcome};
