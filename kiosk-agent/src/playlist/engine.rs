//! Playlist decision engine
//!
//! Turns trigger events into a gapless sequence of playable URIs.
//!
//! Two cursors are kept: the circular default cursor and the cursor of the
//! active triggered playlist. A triggered detour never moves the default
//! cursor, so when it ends playback resumes exactly where it left off.
//!
//! All operations take one short mutex and touch only the local filesystem
//! (existence checks); none of them perform network I/O.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::Utc;
use kiosk_common::events::{AgentEvent, PlaybackMode, TriggerEvent};
use kiosk_common::models::{PlaylistItem, SyncManifest, TriggeredPlaylist};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::rules::rule_matches;
use crate::state::SharedState;

/// Observer invoked when the engine switches playlist
pub type PlaylistObserver = Box<dyn Fn(PlaybackMode, Option<&str>) + Send + Sync>;

/// What `handle_trigger` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A triggered playlist became active (possibly pre-empting another)
    Activated { playlist_id: String },
    /// The matching playlist was already running
    AlreadyActive { playlist_id: String },
    /// No configured rule matched; nothing changed
    NoMatch,
    /// Event kind never affects playback (safety alerts)
    Ignored,
}

impl TriggerOutcome {
    /// True only when a new playlist was activated
    pub fn activated(&self) -> bool {
        matches!(self, TriggerOutcome::Activated { .. })
    }
}

/// Item chosen for playback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub uri: String,
    pub content_id: String,
    pub filename: String,
    pub duration_seconds: f64,
    /// Triggered playlist id, `None` for the default playlist
    pub playlist_id: Option<String>,
}

/// Snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistInfo {
    pub playlist_version: u64,
    pub mode: PlaybackMode,
    pub active_playlist_id: Option<String>,
    pub active_position: Option<usize>,
    pub active_length: Option<usize>,
    pub default_length: usize,
    pub default_cursor: usize,
    pub triggered_playlists: usize,
}

struct ActivePlaylist {
    id: String,
    items: Arc<Vec<PlaylistItem>>,
    cursor: usize,
}

#[derive(Default)]
struct EngineState {
    playlist_version: u64,
    default_items: Vec<PlaylistItem>,
    default_cursor: usize,
    triggered: Vec<TriggeredPlaylist>,
    active: Option<ActivePlaylist>,
}

impl EngineState {
    fn mode(&self) -> PlaybackMode {
        if self.active.is_some() {
            PlaybackMode::Triggered
        } else {
            PlaybackMode::Default
        }
    }
}

/// Trigger matching and gapless sequencing
pub struct PlaylistDecisionEngine {
    media_dir: PathBuf,
    inner: Mutex<EngineState>,
    observers: RwLock<Vec<PlaylistObserver>>,
    state: Option<Arc<SharedState>>,
}

impl PlaylistDecisionEngine {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            inner: Mutex::new(EngineState::default()),
            observers: RwLock::new(Vec::new()),
            state: None,
        }
    }

    /// Build an engine already loaded with `manifest`
    pub fn with_manifest(media_dir: impl Into<PathBuf>, manifest: &SyncManifest) -> Self {
        let engine = Self::new(media_dir);
        engine.reload(manifest);
        engine
    }

    /// Also publish playlist changes on the agent event channel
    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn subscribe(&self, observer: PlaylistObserver) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn mode(&self) -> PlaybackMode {
        self.lock().mode()
    }

    pub fn active_playlist_id(&self) -> Option<String> {
        self.lock().active.as_ref().map(|a| a.id.clone())
    }

    /// React to a trigger event
    ///
    /// Triggered playlists are checked in configured order; the first match
    /// wins. A new match pre-empts a different playlist already in progress.
    pub fn handle_trigger(&self, event: &TriggerEvent) -> TriggerOutcome {
        if let TriggerEvent::SafetyAlert { case_ref, .. } = event {
            info!(case_ref = %case_ref, "Safety alert received; playback unchanged");
            return TriggerOutcome::Ignored;
        }

        let outcome = {
            let mut st = self.lock();
            let Some(playlist) = st
                .triggered
                .iter()
                .find(|p| rule_matches(&p.rule, event))
                .cloned()
            else {
                debug!(kind = event.kind_name(), "No triggered playlist matched");
                return TriggerOutcome::NoMatch;
            };

            if let Some(active) = &st.active {
                if active.id == playlist.id {
                    return TriggerOutcome::AlreadyActive {
                        playlist_id: playlist.id,
                    };
                }
                info!(
                    previous = %active.id,
                    next = %playlist.id,
                    "Pre-empting active triggered playlist"
                );
            }

            info!(
                playlist_id = %playlist.id,
                kind = event.kind_name(),
                items = playlist.items.len(),
                "Activating triggered playlist"
            );
            st.active = Some(ActivePlaylist {
                id: playlist.id.clone(),
                items: Arc::new(playlist.items),
                cursor: 0,
            });
            TriggerOutcome::Activated {
                playlist_id: playlist.id,
            }
        };

        if let TriggerOutcome::Activated { playlist_id } = &outcome {
            self.notify(PlaybackMode::Triggered, Some(playlist_id));
        }
        outcome
    }

    /// Next item to play; `None` when no content file is available
    pub fn next_item(&self) -> Option<Selection> {
        let mut reverted = false;
        let selection = {
            let mut st = self.lock();

            if let Some(active) = st.active.as_mut() {
                while active.cursor < active.items.len() {
                    let item = &active.items[active.cursor];
                    active.cursor += 1;
                    if self.is_present(item) {
                        return Some(self.select(item, Some(active.id.clone())));
                    }
                    warn!(
                        playlist_id = %active.id,
                        filename = %item.filename,
                        "Skipping missing triggered item"
                    );
                }
                debug!(playlist_id = %active.id, "Triggered playlist finished");
                st.active = None;
                reverted = true;
            }

            self.next_default(&mut st)
        };

        if reverted {
            self.notify(PlaybackMode::Default, None);
        }
        if selection.is_none() {
            warn!("No content available");
        }
        selection
    }

    /// URI of the next item
    pub fn next_uri(&self) -> Option<String> {
        self.next_item().map(|s| s.uri)
    }

    /// Cold start: rewind the default cursor, then behave like `next_uri`
    pub fn first_uri(&self) -> Option<String> {
        self.lock().default_cursor = 0;
        self.next_uri()
    }

    /// Swap in a new manifest
    ///
    /// The default playlist and rule set are replaced. A triggered playlist
    /// already running keeps its own copy of the items and runs to completion.
    /// The default cursor survives when the default sequence is unchanged and
    /// is rewound otherwise.
    pub fn reload(&self, manifest: &SyncManifest) {
        let mut st = self.lock();
        let same_sequence = st.default_items.len() == manifest.default_playlist.len()
            && st
                .default_items
                .iter()
                .zip(&manifest.default_playlist)
                .all(|(a, b)| a.content_id == b.content_id);

        if !same_sequence {
            st.default_cursor = 0;
        }
        st.default_items = manifest.default_playlist.clone();
        st.triggered = manifest.triggered_playlists.clone();
        st.playlist_version = manifest.playlist_version;

        info!(
            playlist_version = manifest.playlist_version,
            default_items = st.default_items.len(),
            triggered_playlists = st.triggered.len(),
            kept_position = same_sequence,
            "Playlist manifest loaded"
        );
    }

    pub fn info(&self) -> PlaylistInfo {
        let st = self.lock();
        PlaylistInfo {
            playlist_version: st.playlist_version,
            mode: st.mode(),
            active_playlist_id: st.active.as_ref().map(|a| a.id.clone()),
            active_position: st.active.as_ref().map(|a| a.cursor),
            active_length: st.active.as_ref().map(|a| a.items.len()),
            default_length: st.default_items.len(),
            default_cursor: st.default_cursor,
            triggered_playlists: st.triggered.len(),
        }
    }

    fn next_default(&self, st: &mut EngineState) -> Option<Selection> {
        let len = st.default_items.len();
        for _ in 0..len {
            let index = st.default_cursor % len;
            st.default_cursor = (index + 1) % len;
            let item = &st.default_items[index];
            if self.is_present(item) {
                return Some(self.select(item, None));
            }
            warn!(filename = %item.filename, "Skipping missing default item");
        }
        None
    }

    fn is_present(&self, item: &PlaylistItem) -> bool {
        self.media_dir.join(&item.filename).is_file()
    }

    fn select(&self, item: &PlaylistItem, playlist_id: Option<String>) -> Selection {
        Selection {
            uri: uri_for(&self.media_dir, &item.filename),
            content_id: item.content_id.clone(),
            filename: item.filename.clone(),
            duration_seconds: item.duration_seconds,
            playlist_id,
        }
    }

    fn notify(&self, mode: PlaybackMode, playlist_id: Option<&str>) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(mode, playlist_id))).is_err() {
                error!(?mode, "Playlist observer panicked");
            }
        }

        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::PlaylistChanged {
                mode,
                playlist_id: playlist_id.map(str::to_string),
                timestamp: Utc::now(),
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `file://` URI for a media file
pub fn uri_for(media_dir: &Path, filename: &str) -> String {
    format!("file://{}", media_dir.join(filename).display())
}
