//! Decision engine behaviour over a real media directory

mod helpers;

use std::sync::{Arc, Mutex};

use kiosk_agent::playlist::{PlaylistDecisionEngine, TriggerOutcome};
use kiosk_common::events::{PlaybackMode, TriggerEvent};
use tempfile::TempDir;

use helpers::{demographic_playlist, item, manifest, touch_all};

fn young_adult() -> TriggerEvent {
    TriggerEvent::Demographic {
        age: Some(25),
        gender: Some("female".into()),
        confidence: 0.91,
    }
}

fn setup(dir: &TempDir) -> PlaylistDecisionEngine {
    touch_all(dir.path(), &["a.mp4", "b.mp4", "c.mp4", "x.mp4", "y.mp4"]);
    let manifest = manifest(
        3,
        vec![
            item("a", "a.mp4", None),
            item("b", "b.mp4", None),
            item("c", "c.mp4", None),
        ],
        vec![demographic_playlist(
            "young",
            18,
            35,
            None,
            vec![item("x", "x.mp4", None), item("y", "y.mp4", None)],
        )],
    );
    PlaylistDecisionEngine::with_manifest(dir.path(), &manifest)
}

fn names(engine: &PlaylistDecisionEngine, n: usize) -> Vec<String> {
    (0..n)
        .map(|_| engine.next_item().map(|s| s.filename).unwrap_or_default())
        .collect()
}

#[test]
fn test_default_playlist_is_periodic() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);

    assert_eq!(
        names(&engine, 7),
        vec!["a.mp4", "b.mp4", "c.mp4", "a.mp4", "b.mp4", "c.mp4", "a.mp4"]
    );
    assert_eq!(engine.mode(), PlaybackMode::Default);
}

#[test]
fn test_triggered_playlist_then_default_resumes_in_place() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    let modes = Arc::new(Mutex::new(Vec::new()));
    let seen = modes.clone();
    engine.subscribe(Box::new(move |mode: PlaybackMode, id: Option<&str>| {
        seen.lock().unwrap().push((mode, id.map(str::to_string)));
    }));

    assert_eq!(names(&engine, 2), vec!["a.mp4", "b.mp4"]);

    let outcome = engine.handle_trigger(&young_adult());
    assert_eq!(
        outcome,
        TriggerOutcome::Activated {
            playlist_id: "young".into()
        }
    );
    assert_eq!(engine.mode(), PlaybackMode::Triggered);

    let x = engine.next_item().unwrap();
    assert_eq!(x.filename, "x.mp4");
    assert_eq!(x.playlist_id.as_deref(), Some("young"));
    assert_eq!(names(&engine, 4), vec!["y.mp4", "c.mp4", "a.mp4", "b.mp4"]);
    assert_eq!(engine.mode(), PlaybackMode::Default);

    assert_eq!(
        *modes.lock().unwrap(),
        vec![
            (PlaybackMode::Triggered, Some("young".to_string())),
            (PlaybackMode::Default, None),
        ]
    );
}

#[test]
fn test_unmatched_event_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    engine.next_item();

    let senior = TriggerEvent::Demographic {
        age: Some(70),
        gender: None,
        confidence: 0.8,
    };
    assert_eq!(engine.handle_trigger(&senior), TriggerOutcome::NoMatch);
    assert_eq!(engine.mode(), PlaybackMode::Default);
    assert_eq!(names(&engine, 1), vec!["b.mp4"]);
}

#[test]
fn test_safety_alert_never_touches_playback() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    let alert = TriggerEvent::SafetyAlert {
        case_ref: "C-1".into(),
        confidence: 0.99,
    };
    assert_eq!(engine.handle_trigger(&alert), TriggerOutcome::Ignored);
    assert!(engine.active_playlist_id().is_none());
}

#[test]
fn test_missing_files_are_skipped() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    std::fs::remove_file(dir.path().join("b.mp4")).unwrap();
    std::fs::remove_file(dir.path().join("x.mp4")).unwrap();

    assert_eq!(names(&engine, 3), vec!["a.mp4", "c.mp4", "a.mp4"]);

    engine.handle_trigger(&young_adult());
    assert_eq!(names(&engine, 2), vec!["y.mp4", "c.mp4"]);
}

#[test]
fn test_no_content_at_all() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        std::fs::remove_file(dir.path().join(name)).unwrap();
    }
    assert!(engine.next_item().is_none());
    assert!(engine.next_uri().is_none());
}

#[test]
fn test_reload_with_new_sequence_rewinds() {
    let dir = TempDir::new().unwrap();
    let engine = setup(&dir);
    engine.next_item();
    engine.next_item();

    let replacement = manifest(
        4,
        vec![item("c", "c.mp4", None), item("a", "a.mp4", None)],
        Vec::new(),
    );
    engine.reload(&replacement);

    assert_eq!(engine.info().playlist_version, 4);
    assert_eq!(names(&engine, 2), vec!["c.mp4", "a.mp4"]);
    assert_eq!(engine.handle_trigger(&young_adult()), TriggerOutcome::NoMatch);
}
