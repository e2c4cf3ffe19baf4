use crate::error::IngestError;
use crate::hub::Hub;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const VIDEO_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Live preview parts per second.
    pub stream_fps: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            stream_fps: 30.0,
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
    hub: Arc<Hub>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, hub: Arc<Hub>) -> Self {
        Self { cfg, hub }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("hub api listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let hub = self.hub;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, hub, shutdown_thread) {
                log::error!("hub api stopped: {}", err);
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
    cfg: ApiConfig,
    hub: Arc<Hub>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let hub = hub.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &hub, &cfg, &shutdown) {
                        log::warn!("hub api request failed: {}", err);
                    }
                });
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

fn handle_connection(
    mut stream: TcpStream,
    hub: &Hub,
    cfg: &ApiConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &error_body("bad_request"))?;
            return Err(err);
        }
    };

    let route = Route::parse(&request.path);
    match (request.method.as_str(), route) {
        ("GET", Route::Health) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", Route::ProcessFrame(device)) => {
            let device = device.unwrap_or(&hub.config().default_device);
            process_frame(&mut stream, hub, device, &request.body)
        }
        ("GET", Route::Stream(device)) => {
            let device = device.unwrap_or(&hub.config().default_device);
            stream_preview(&mut stream, hub, device, cfg.stream_fps, shutdown)
        }
        ("GET", Route::Status(None)) => write_serialized(&mut stream, &hub.status()),
        ("GET", Route::Status(Some(device))) => match hub.device_status(device) {
            Some(status) => write_serialized(&mut stream, &status),
            None => write_json_response(&mut stream, 404, &error_body("unknown_device")),
        },
        ("GET", Route::Events) => write_serialized(&mut stream, &hub.events()),
        ("GET", Route::Video(rel)) => serve_video(&mut stream, &hub.config().events_root, rel),
        (_, Route::NotFound) => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)
        }
        _ => write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#),
    }
}

#[derive(Debug, PartialEq)]
enum Route<'a> {
    Health,
    ProcessFrame(Option<&'a str>),
    Stream(Option<&'a str>),
    Status(Option<&'a str>),
    Events,
    Video(&'a str),
    NotFound,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Self {
        let optional_id = |rest: &'a str| -> Option<Option<&'a str>> {
            match rest {
                "" | "/" => Some(None),
                _ => {
                    let id = rest.strip_prefix('/')?.trim_end_matches('/');
                    (!id.is_empty() && !id.contains('/')).then_some(Some(id))
                }
            }
        };
        if path == "/health" {
            return Route::Health;
        }
        if path == "/events" || path == "/events/" {
            return Route::Events;
        }
        if let Some(rel) = path.strip_prefix("/video/") {
            return Route::Video(rel);
        }
        if let Some(id) = path.strip_prefix("/process_frame").and_then(optional_id) {
            return Route::ProcessFrame(id);
        }
        if let Some(id) = path.strip_prefix("/stream").and_then(optional_id) {
            return Route::Stream(id);
        }
        if let Some(id) = path.strip_prefix("/status").and_then(optional_id) {
            return Route::Status(id);
        }
        Route::NotFound
    }
}

fn process_frame(stream: &mut TcpStream, hub: &Hub, device: &str, body: &[u8]) -> Result<()> {
    match hub.handle_message(device, body) {
        Ok(_) => write_json_response(stream, 200, r#"{"status":"processed"}"#),
        Err(err) => {
            let status = match err {
                IngestError::UnknownDevice(_) => 404,
                IngestError::Decode(_) => 400,
                IngestError::Annotate(_) => 500,
            };
            write_json_response(stream, status, &error_body(&err.to_string()))
        }
    }
}

fn stream_preview(
    stream: &mut TcpStream,
    hub: &Hub,
    device: &str,
    stream_fps: f64,
    shutdown: &AtomicBool,
) -> Result<()> {
    let Some(feed) = hub.feed(device) else {
        return write_json_response(stream, 404, &error_body("unknown_device"));
    };
    let interval = Duration::from_secs_f64(1.0 / stream_fps.max(0.1));
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
    )?;
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = feed.latest_frame() {
            let part = format!(
                "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                frame.len()
            );
            let sent = stream
                .write_all(part.as_bytes())
                .and_then(|_| stream.write_all(&frame))
                .and_then(|_| stream.write_all(b"\r\n"))
                .and_then(|_| stream.flush());
            if sent.is_err() {
                log::debug!("[{}] preview client disconnected", device);
                break;
            }
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

fn serve_video(stream: &mut TcpStream, events_root: &Path, rel: &str) -> Result<()> {
    let Some(path) = resolve_clip_path(events_root, rel) else {
        return write_json_response(stream, 400, &error_body("invalid_path"));
    };
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => return write_json_response(stream, 404, &error_body("video_not_found")),
    };
    let meta = file.metadata()?;
    if !meta.is_file() {
        return write_json_response(stream, 404, &error_body("video_not_found"));
    }
    let len = meta.len();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nCache-Control: public, max-age=3600\r\nConnection: close\r\n\r\n",
        video_content_type(&path),
        len
    );
    stream.write_all(header.as_bytes())?;
    let mut buf = vec![0u8; VIDEO_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n])?;
    }
    stream.flush()?;
    Ok(())
}

/// Joins `rel` onto `root`, refusing anything that could escape it.
fn resolve_clip_path(root: &Path, rel: &str) -> Option<PathBuf> {
    if rel.is_empty() || rel.contains('\\') || rel.contains('\0') {
        return None;
    }
    let rel = Path::new(rel);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

fn video_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn write_serialized<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, 200, "application/json", &payload)
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
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
    body: Vec<u8>,
}
