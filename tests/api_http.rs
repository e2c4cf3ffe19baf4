use anyhow::Result;
use base64::Engine;
use image::RgbImage;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use safezone_hub::api::{ApiConfig, ApiHandle, ApiServer};
use safezone_hub::{encode_jpeg, Hub, HubConfig, Point, Rect};

fn hub_config(root: &std::path::Path) -> HubConfig {
    let mut cfg = HubConfig::default();
    cfg.events_root = root.to_path_buf();
    cfg.transcode.enabled = false;
    cfg.devices = vec!["pi1".to_string(), "pi2".to_string()];
    cfg.frame.width = 160;
    cfg.frame.height = 120;
    cfg.zone = Rect::new(Point::new(100, 60), Point::new(160, 120));
    cfg
}

fn frame_body(invading: bool) -> String {
    let jpeg = encode_jpeg(&RgbImage::new(160, 120), 80).expect("encode");
    let detections = if invading {
        serde_json::json!([{"bbox": {"x": 110, "y": 70, "width": 20, "height": 20},
                            "category": "person", "score": 0.9}])
    } else {
        serde_json::json!([])
    };
    serde_json::json!({
        "frame": base64::engine::general_purpose::STANDARD.encode(jpeg),
        "detections": detections,
        "timestamp": "October18/2026 14:03:05",
        "fps": 24.0
    })
    .to_string()
}

fn send(api: &TestApi, request: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

fn get(api: &TestApi, path: &str) -> Result<(String, Vec<u8>)> {
    send(
        api,
        &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"),
    )
}

fn post(api: &TestApi, path: &str, body: &str) -> Result<(String, Vec<u8>)> {
    send(
        api,
        &format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    )
}

struct TestApi {
    dir: tempfile::TempDir,
    hub: Arc<Hub>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let hub = Arc::new(Hub::new(hub_config(dir.path())));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream_fps: 50.0,
        };
        let api_handle = ApiServer::new(api_config, hub.clone()).spawn()?;
        Ok(Self {
            dir,
            hub,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_endpoint_responds() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = get(&api, "/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, br#"{"status":"ok"}"#);
    Ok(())
}

#[test]
fn process_frame_routes_to_default_and_named_devices() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = post(&api, "/process_frame", &frame_body(true))?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, br#"{"status":"processed"}"#);

    let (headers, _) = post(&api, "/process_frame/pi2", &frame_body(false))?;
    assert!(headers.contains("200 OK"));

    let (headers, body) = get(&api, "/status")?;
    assert!(headers.contains("200 OK"));
    let status: Value = serde_json::from_slice(&body)?;
    assert_eq!(status["feeds"][0]["device_id"], "pi1");
    assert_eq!(status["feeds"][0]["frames_received"], 1);
    assert_eq!(status["feeds"][0]["recording"], true);
    assert_eq!(status["feeds"][0]["current_buffer_size"], 1);
    assert_eq!(status["feeds"][1]["recording"], false);
    assert_eq!(status["storage_capacity_gb"], 3.0);

    let (_, body) = get(&api, "/status/pi2")?;
    let status: Value = serde_json::from_slice(&body)?;
    assert_eq!(status["device_id"], "pi2");
    assert_eq!(status["has_current_frame"], true);
    assert!(status.get("storage_used_gb").is_some());
    Ok(())
}

#[test]
fn bad_messages_and_unknown_devices_are_rejected() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = post(&api, "/process_frame", r#"{"frame":"!!","timestamp":"x"}"#)?;
    assert!(headers.contains("400 Bad Request"));
    let err: Value = serde_json::from_slice(&body)?;
    assert!(err["error"].is_string());

    let (headers, _) = post(&api, "/process_frame/pi9", &frame_body(true))?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = get(&api, "/status/pi9")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = get(&api, "/process_frame")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = get(&api, "/nowhere")?;
    assert!(headers.contains("404 Not Found"));

    let status = api.hub.device_status("pi1").expect("pi1");
    assert_eq!(status.feed.frames_dropped, 1);
    Ok(())
}

#[test]
fn events_and_video_serve_archived_clips() -> Result<()> {
    let api = TestApi::new()?;
    let clip_dir = api.dir.path().join("pi1/October18/14hr");
    std::fs::create_dir_all(&clip_dir)?;
    let payload = vec![42u8; 200_000];
    std::fs::write(clip_dir.join("pi1_October18_14hr_03min05sec.avi"), &payload)?;
    std::fs::write(clip_dir.join("pi1_October18_14hr_09min00sec.mp4.tmp.avi"), b"partial")?;

    let (headers, body) = get(&api, "/events")?;
    assert!(headers.contains("200 OK"));
    let events: Value = serde_json::from_slice(&body)?;
    assert_eq!(events["total_events"], 1);
    let clip = &events["events_by_device"]["pi1"][0]["hours"][0]["videos"][0];
    assert_eq!(clip["display_name"], "03min05sec");
    assert_eq!(clip["size"], 200_000);
    let path = clip["path"].as_str().expect("clip path").to_string();
    assert_eq!(path, "pi1/October18/14hr/pi1_October18_14hr_03min05sec.avi");
    assert_eq!(events["events_by_device"]["pi2"], serde_json::json!([]));

    let (headers, body) = get(&api, &format!("/video/{path}"))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: video/x-msvideo"));
    assert!(headers.contains("Content-Length: 200000"));
    assert!(headers.contains("Accept-Ranges: bytes"));
    assert!(headers.contains("Cache-Control: public, max-age=3600"));
    assert_eq!(body, payload);

    let (headers, _) = get(&api, "/video/../secret.avi")?;
    assert!(headers.contains("400 Bad Request"));
    let (headers, _) = get(&api, "/video/pi1/October18/14hr/missing.avi")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn stream_sends_multipart_jpeg_parts() -> Result<()> {
    let api = TestApi::new()?;
    post(&api, "/process_frame", &frame_body(false))?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.windows(7).any(|w| w == b"--frame")
        || !received.windows(2).any(|w| w == [0xFF, 0xD8])
    {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("Content-Type: image/jpeg"));
    Ok(())
}
