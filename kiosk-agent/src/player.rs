//! Playback driver
//!
//! Connects the decision engine to a video pipeline. The pipeline itself is
//! behind [`VideoSink`]; it calls back into the driver when the current item
//! is about to finish, has ended, or failed.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use kiosk_common::events::{AgentEvent, PlayerMode};
use tracing::{debug, info, warn};

use crate::mode::ModeObserver;
use crate::playlist::PlaylistDecisionEngine;
use crate::state::SharedState;

/// Video pipeline contract
pub trait VideoSink: Send + Sync {
    fn play(&self, uri: &str);
    fn stop(&self);
}

/// Sink that only logs; used when no display pipeline is attached
pub struct TracingSink;

impl VideoSink for TracingSink {
    fn play(&self, uri: &str) {
        info!(uri, "play");
    }

    fn stop(&self) {
        info!("stop");
    }
}

pub struct PlaybackDriver {
    sink: Arc<dyn VideoSink>,
    engine: Arc<PlaylistDecisionEngine>,
    now_playing: Mutex<Option<String>>,
    state: Option<Arc<SharedState>>,
}

impl PlaybackDriver {
    pub fn new(sink: Arc<dyn VideoSink>, engine: Arc<PlaylistDecisionEngine>) -> Self {
        Self {
            sink,
            engine,
            now_playing: Mutex::new(None),
            state: None,
        }
    }

    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn now_playing(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Start from the top of the default playlist
    pub fn start(&self) -> Option<String> {
        let uri = self.engine.first_uri();
        self.play(uri)
    }

    /// Start playback unless something is already on screen
    ///
    /// Used when content arrives while the driver sits stopped for lack of it.
    pub fn resume_if_idle(&self) -> Option<String> {
        if self.now_playing().is_some() {
            return None;
        }
        info!("Content available, starting playback");
        self.start()
    }

    pub fn stop(&self) {
        self.sink.stop();
        *self.lock() = None;
    }

    /// Gapless hand-off: the pipeline queues the returned URI itself
    pub fn on_about_to_finish(&self) -> Option<String> {
        let uri = self.engine.next_uri();
        match &uri {
            Some(uri) => self.set_now_playing(uri),
            None => warn!("No content available for gapless hand-off"),
        }
        uri
    }

    pub fn on_end_of_stream(&self) -> Option<String> {
        let uri = self.engine.next_uri();
        self.play(uri)
    }

    /// Skip the failed item
    pub fn on_error(&self, message: &str) -> Option<String> {
        warn!(error = message, current = ?self.now_playing(), "Playback error, skipping");
        let uri = self.engine.next_uri();
        self.play(uri)
    }

    /// Start on entering PLAYBACK, stop on leaving it
    pub fn mode_observer(self: &Arc<Self>) -> ModeObserver {
        let driver = Arc::clone(self);
        Box::new(move |from, to| {
            if to == PlayerMode::Playback {
                driver.start();
            } else if from == PlayerMode::Playback {
                driver.stop();
            }
        })
    }

    fn play(&self, uri: Option<String>) -> Option<String> {
        match &uri {
            Some(uri) => {
                self.sink.play(uri);
                self.set_now_playing(uri);
            }
            None => {
                warn!("No content available");
                self.stop();
            }
        }
        uri
    }

    fn set_now_playing(&self, uri: &str) {
        debug!(uri, "Now playing");
        *self.lock() = Some(uri.to_string());
        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::NowPlaying {
                uri: uri.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.now_playing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use kiosk_common::models::{Metadata, PlaylistItem, SyncManifest};
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl VideoSink for Recorder {
        fn play(&self, uri: &str) {
            self.0.lock().unwrap().push(uri.to_string());
        }
        fn stop(&self) {
            self.0.lock().unwrap().push("stop".into());
        }
    }

    fn engine(dir: &TempDir, names: &[&str]) -> Arc<PlaylistDecisionEngine> {
        for name in names {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let manifest = SyncManifest {
            playlist_version: 1,
            default_playlist: names
                .iter()
                .map(|n| PlaylistItem {
                    content_id: n.to_string(),
                    filename: n.to_string(),
                    duration_seconds: 5.0,
                    file_hash: None,
                    metadata: Metadata::new(),
                })
                .collect(),
            ..Default::default()
        };
        Arc::new(PlaylistDecisionEngine::with_manifest(dir.path(), &manifest))
    }

    #[test]
    fn test_start_and_advance() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recorder::default());
        let driver = PlaybackDriver::new(sink.clone(), engine(&dir, &["a.mp4", "b.mp4"]));

        assert!(driver.start().unwrap().ends_with("a.mp4"));
        assert!(driver.on_end_of_stream().unwrap().ends_with("b.mp4"));
        assert!(driver.on_error("decoder").unwrap().ends_with("a.mp4"));
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_about_to_finish_does_not_call_play() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recorder::default());
        let driver = PlaybackDriver::new(sink.clone(), engine(&dir, &["a.mp4", "b.mp4"]));
        driver.start();

        let next = driver.on_about_to_finish().unwrap();
        assert!(next.ends_with("b.mp4"));
        assert_eq!(driver.now_playing(), Some(next));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mode_observer_starts_and_stops() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recorder::default());
        let driver = Arc::new(PlaybackDriver::new(sink.clone(), engine(&dir, &["a.mp4"])));
        let observer = driver.mode_observer();

        observer(PlayerMode::Pairing, PlayerMode::Playback);
        observer(PlayerMode::Playback, PlayerMode::Menu);
        assert_eq!(*sink.0.lock().unwrap(), vec![
            crate::playlist::engine::uri_for(dir.path(), "a.mp4"),
            "stop".to_string()
        ]);
        assert!(driver.now_playing().is_none());
    }

    #[test]
    fn test_resume_if_idle_starts_once_content_exists() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recorder::default());
        let engine = engine(&dir, &[]);
        let driver = PlaybackDriver::new(sink.clone(), engine.clone());
        assert!(driver.start().is_none());

        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        engine.reload(&SyncManifest {
            playlist_version: 2,
            default_playlist: vec![PlaylistItem {
                content_id: "a".into(),
                filename: "a.mp4".into(),
                duration_seconds: 5.0,
                file_hash: None,
                metadata: Metadata::new(),
            }],
            ..Default::default()
        });

        assert!(driver.resume_if_idle().unwrap().ends_with("a.mp4"));
        assert!(driver.now_playing().is_some());
        // Already playing: no restart
        assert!(driver.resume_if_idle().is_none());
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_playlist_stops() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recorder::default());
        let driver = PlaybackDriver::new(sink.clone(), engine(&dir, &[]));
        assert!(driver.start().is_none());
        assert_eq!(*sink.0.lock().unwrap(), vec!["stop".to_string()]);
    }
}
