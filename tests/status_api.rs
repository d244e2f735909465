use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use visitor_counter::api::{ApiConfig, ApiServer};
use visitor_counter::{
    CountingEngine, Detection, EngineConfig, Exporter, InMemoryEventStore, ManualClock,
    TrackerConfig,
};

fn request(addr: SocketAddr, method: &str, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        method, path
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("");
    let body = parts.next().unwrap_or("").to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    Ok((status, body))
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).expect("json body")
}

#[test]
fn serves_status_history_and_exports() -> Result<()> {
    let dir = tempdir()?;
    let store = InMemoryEventStore::new();
    let clock = Arc::new(ManualClock::new(1_000.0));
    let cfg = EngineConfig {
        frame_width: 300,
        tracker: TrackerConfig {
            max_distance: 100.0,
            ..TrackerConfig::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = CountingEngine::new(cfg, Box::new(store.clone()), clock.clone(), None);
    let exporter = Arc::new(Mutex::new(Exporter::new(
        Box::new(store.clone()),
        dir.path().join("export.json"),
        clock,
    )));

    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        engine.status_handle(),
        exporter,
    )
    .spawn()?;
    let addr = handle.addr;

    let (status, body) = request(addr, "GET", "/health")?;
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "ok");

    let (status, body) = request(addr, "GET", "/status")?;
    assert_eq!(status, 503);
    assert_eq!(json(&body)["error"], "not_ready");

    let (status, body) = request(addr, "GET", "/download")?;
    assert_eq!(status, 404);
    assert_eq!(json(&body)["error"], "no_data_yet");

    engine.process_frame(&[Detection::new(160.0, 100.0, 200.0, 220.0, 0.9)], None)?;
    engine.process_frame(&[Detection::new(90.0, 100.0, 130.0, 220.0, 0.9)], None)?;

    let (status, body) = request(addr, "GET", "/status")?;
    assert_eq!(status, 200);
    let snapshot = json(&body);
    assert_eq!(snapshot["total"], 1);
    assert_eq!(snapshot["total_left"], 1);
    assert_eq!(snapshot["total_right"], 0);
    assert_eq!(snapshot["frames_processed"], 2);
    assert_eq!(snapshot["active_objects"][0]["state"], "scanned");

    let (status, body) = request(addr, "GET", "/history?limit=10&offset=0")?;
    assert_eq!(status, 200);
    let page = json(&body);
    assert_eq!(page["count"], 1);
    assert_eq!(page["history"][0]["direction"], "left");
    assert_eq!(page["history"][0]["note"], "Object ID: 0 - Right to Left");

    let (status, _) = request(addr, "GET", "/history?limit=many")?;
    assert_eq!(status, 400);

    let (status, body) = request(addr, "POST", "/export")?;
    assert_eq!(status, 200);
    assert_eq!(json(&body)["new_events"], 1);

    let (status, body) = request(addr, "GET", "/download")?;
    assert_eq!(status, 200);
    let artifact = json(&body);
    assert_eq!(artifact["total"], 1);
    assert_eq!(artifact["events"][0]["id"], 1);

    let (status, _) = request(addr, "GET", "/export")?;
    assert_eq!(status, 405);
    let (status, _) = request(addr, "GET", "/visitors")?;
    assert_eq!(status, 404);

    handle.stop()?;
    Ok(())
}
