//! Status/history/export HTTP API.
//!
//! Runs on its own thread. It reads status through a [`StatusHandle`] and
//! never touches tracker state; history and exports go through the
//! exporter's own store connection.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::export::Exporter;
use crate::status::StatusHandle;
use crate::storage::StoredEvent;
use crate::CounterError;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    status: StatusHandle,
    exporter: Arc<Mutex<Exporter>>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, status: StatusHandle, exporter: Arc<Mutex<Exporter>>) -> Self {
        Self {
            cfg,
            status,
            exporter,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &self.status, &self.exporter, shutdown_thread) {
                log::error!("status api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    status: &StatusHandle,
    exporter: &Mutex<Exporter>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, status, exporter) {
                    log::warn!("status api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct HistoryPage<'a> {
    count: usize,
    limit: usize,
    offset: usize,
    history: &'a [StoredEvent],
}

fn handle_connection(
    mut stream: TcpStream,
    status: &StatusHandle,
    exporter: &Mutex<Exporter>,
) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking flag.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let expected_method = match request.path.as_str() {
        "/health" | "/status" | "/history" | "/download" => "GET",
        "/export" => "POST",
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    };
    if request.method != expected_method {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/status" => match status.snapshot() {
            Ok(snapshot) => {
                let payload = serde_json::to_vec(&snapshot)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            Err(err) => write_error(&mut stream, err),
        },
        "/history" => {
            let (Some(limit), Some(offset)) = (
                request.usize_param("limit", DEFAULT_HISTORY_LIMIT),
                request.usize_param("offset", 0),
            ) else {
                return write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#);
            };
            let limit = limit.min(MAX_HISTORY_LIMIT);
            let history = lock_exporter(exporter)?.history(limit, offset)?;
            let payload = serde_json::to_vec(&HistoryPage {
                count: history.len(),
                limit,
                offset,
                history: &history,
            })?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/export" => {
            let result = lock_exporter(exporter)?.export();
            match result {
                Ok(summary) => {
                    let payload = serde_json::to_vec(&summary)?;
                    write_response(&mut stream, 200, "application/json", &payload)
                }
                Err(err) => write_error(&mut stream, err),
            }
        }
        _ => {
            let result = lock_exporter(exporter)?.download();
            match result {
                Ok(bytes) => write_response(&mut stream, 200, "application/json", &bytes),
                Err(err) => write_error(&mut stream, err),
            }
        }
    }
}

fn lock_exporter(exporter: &Mutex<Exporter>) -> Result<std::sync::MutexGuard<'_, Exporter>> {
    exporter
        .lock()
        .map_err(|_| anyhow!("exporter lock poisoned"))
}

fn write_error(stream: &mut TcpStream, err: anyhow::Error) -> Result<()> {
    match err.downcast_ref::<CounterError>() {
        Some(CounterError::NotReady) => {
            write_json_response(stream, 503, r#"{"error":"not_ready"}"#)
        }
        Some(CounterError::NoDataYet) => {
            write_json_response(stream, 404, r#"{"error":"no_data_yet"}"#)
        }
        _ => {
            log::error!("status api internal error: {}", err);
            write_json_response(stream, 500, r#"{"error":"internal"}"#)
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    /// `default` when absent, `None` when present but not a number.
    fn usize_param(&self, name: &str, default: usize) -> Option<usize> {
        match self.query.get(name) {
            Some(raw) => raw.parse().ok(),
            None => Some(default),
        }
    }
}
