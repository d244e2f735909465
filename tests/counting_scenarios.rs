use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};

use visitor_counter::{
    CountingEngine, Detection, DetectorBackend, EngineConfig, EventStore, Frame, HistogramExtractor,
    ManualClock, ObjectState, ReplayBackend, ScriptedBackend, SqliteEventStore, TrackerConfig,
};

const WIDTH: u32 = 300;
const HEIGHT: u32 = 240;
const RED: [u8; 3] = [200, 30, 30];
const BLUE: [u8; 3] = [30, 30, 200];

fn config(max_disappeared: u32) -> EngineConfig {
    EngineConfig {
        frame_width: WIDTH,
        line_position: 0.5,
        tracker: TrackerConfig {
            max_disappeared,
            max_distance: 100.0,
            ..TrackerConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Person-sized box spanning x1..x1+40, rows 100..220.
fn person(x1: f32) -> Detection {
    Detection::new(x1, 100.0, x1 + 40.0, 220.0, 0.9)
}

fn scene(people: &[(f32, [u8; 3])]) -> RgbImage {
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([128, 128, 128]));
    for &(x1, colour) in people {
        for x in x1 as u32..(x1 as u32 + 40) {
            for y in 100..220 {
                image.put_pixel(x, y, Rgb(colour));
            }
        }
    }
    image
}

#[test]
fn end_to_end_crossing_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("visitors.db");
    let store = SqliteEventStore::open(&db).unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000.0));
    let mut engine = CountingEngine::new(config(40), Box::new(store), clock, None);

    let mut backend = ScriptedBackend::new(vec![
        vec![Detection::new(100.0, 100.0, 140.0, 220.0, 0.9)],
        vec![Detection::new(160.0, 100.0, 200.0, 220.0, 0.9)],
        vec![Detection::new(90.0, 100.0, 130.0, 220.0, 0.9)],
    ]);

    let mut per_frame = Vec::new();
    while let Some(output) = backend.next_output().unwrap() {
        let report = engine
            .process_frame(&output.detections, output.frame.as_ref())
            .unwrap();
        per_frame.push(report.events.len());
    }

    assert_eq!(per_frame, vec![0, 0, 1]);
    assert_eq!(engine.stats().total, 1);
    assert_eq!(engine.tracker().get(0).unwrap().state, ObjectState::Scanned);

    engine.shutdown().unwrap();

    let mut reader = SqliteEventStore::open(&db).unwrap();
    let events = reader.events_after(0, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction, "left");
    assert_eq!(events[0].timestamp, 1_700_000_000.0);
    assert_eq!(reader.track_count().unwrap(), 1);
}

#[test]
fn counted_person_reentering_is_not_counted_again() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("visitors.db");
    let store = SqliteEventStore::open(&db).unwrap();
    let clock = Arc::new(ManualClock::new(0.0));
    let mut engine = CountingEngine::new(
        config(1),
        Box::new(store),
        clock,
        Some(Box::new(HistogramExtractor::new())),
    );

    // (detections, people painted into the frame)
    let script: Vec<Vec<(f32, [u8; 3])>> = vec![
        // Red person crosses right to left.
        vec![(160.0, RED)],
        vec![(90.0, RED)],
        // Leaves view long enough to be retired.
        vec![],
        vec![],
        // Comes back on the right under a new track and crosses again.
        vec![(220.0, RED)],
        vec![(150.0, RED)],
        vec![(90.0, RED)],
        vec![],
        vec![],
        // Someone else crosses.
        vec![(220.0, BLUE)],
        vec![(150.0, BLUE)],
        vec![(90.0, BLUE)],
    ];

    let mut totals = Vec::new();
    for people in &script {
        let frame = Frame::new(scene(people));
        let detections: Vec<Detection> = people.iter().map(|&(x1, _)| person(x1)).collect();
        engine.process_frame(&detections, Some(&frame)).unwrap();
        totals.push(engine.stats().total);

        if people.first().map(|p| p.0) == Some(220.0) && people[0].1 == RED {
            let returning = engine.tracker().get(1).unwrap();
            assert_eq!(returning.person_id, Some(1));
            assert_eq!(returning.state, ObjectState::Scanned);
            assert!(engine.tracker().is_already_counted(1));
        }
    }

    assert_eq!(totals, vec![0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2]);
    let blue = engine.tracker().get(2).unwrap();
    assert_eq!(blue.person_id, Some(2));

    engine.shutdown().unwrap();
    let mut reader = SqliteEventStore::open(&db).unwrap();
    assert_eq!(reader.event_count().unwrap(), 2);
    assert_eq!(reader.track_count().unwrap(), 3);
}

#[test]
fn replayed_detection_log_with_frames() {
    let dir = tempfile::tempdir().unwrap();
    let frames = [(170.0, "f0.png"), (100.0, "f1.png")];
    for (x1, name) in frames {
        scene(&[(x1, RED)]).save(dir.path().join(name)).unwrap();
    }
    let log_path = dir.path().join("detections.jsonl");
    std::fs::write(
        &log_path,
        concat!(
            "{\"frame\": \"f0.png\", \"detections\": [[170, 100, 210, 220, 0.9]]}\n",
            "\n",
            "{\"frame\": \"f1.png\", \"detections\": [[100, 100, 140, 220, 0.9]]}\n",
            "[[100, 100, 140, 220, 0.2]]\n",
        ),
    )
    .unwrap();

    let store = SqliteEventStore::open(dir.path().join("visitors.db")).unwrap();
    let mut engine = CountingEngine::new(
        config(40),
        Box::new(store),
        Arc::new(ManualClock::new(0.0)),
        Some(Box::new(HistogramExtractor::new())),
    );
    let mut backend = ReplayBackend::open(&log_path).unwrap();

    let mut frames_seen = 0;
    while let Some(output) = backend.next_output().unwrap() {
        if frames_seen < 2 {
            assert!(output.frame.is_some());
        } else {
            assert!(output.frame.is_none());
        }
        engine
            .process_frame(&output.detections, output.frame.as_ref())
            .unwrap();
        frames_seen += 1;
    }

    assert_eq!(frames_seen, 3);
    assert_eq!(engine.stats().total, 1);
    assert_eq!(engine.tracker().get(0).unwrap().person_id, Some(1));
    // Low-confidence box on the last line was filtered; the track aged.
    assert_eq!(engine.tracker().get(0).unwrap().disappeared_frames, 1);
}

#[test]
fn scanned_visitor_lingering_out_of_view_exits_on_timeout() {
    let store = visitor_counter::InMemoryEventStore::new();
    let clock = Arc::new(ManualClock::new(0.0));
    let mut engine = CountingEngine::new(config(1_000), Box::new(store.clone()), clock.clone(), None);

    engine.process_frame(&[person(160.0)], None).unwrap();
    engine.process_frame(&[person(90.0)], None).unwrap();
    for _ in 0..9 {
        clock.advance(Duration::from_secs(1));
        engine.process_frame(&[], None).unwrap();
    }
    assert!(engine.tracker().get(0).is_some());

    clock.advance(Duration::from_millis(1_500));
    let report = engine.process_frame(&[], None).unwrap();
    assert_eq!(report.exited, vec![0]);

    let tracks = store.tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].state, ObjectState::Exited);
    assert_eq!(tracks[0].exit_time, Some(10.5));
    assert_eq!(store.events().len(), 1);
}
