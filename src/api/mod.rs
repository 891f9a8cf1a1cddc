//! Stills API.
//!
//! A small HTTP/1.1 shim over `StreamHub`:
//! - `GET /health`
//! - `GET /api/streams`
//! - `GET /api/streams/{index}`
//! - `GET /api/frame/{index}` (base64 JPEG in a JSON body)
//!
//! Everything except `/health` requires HTTP Basic credentials.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ApiSettings;
use crate::error::FrameError;
use crate::hub::{StreamHub, StreamSummary};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub login: String,
    pub password: String,
}

impl ApiConfig {
    pub fn from_settings(settings: &ApiSettings) -> Self {
        Self {
            addr: settings.addr.clone(),
            login: settings.login.clone(),
            password: settings.password.clone(),
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
    hub: Arc<StreamHub>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, hub: Arc<StreamHub>) -> Self {
        Self { cfg, hub }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        if self.cfg.login.is_empty() || self.cfg.password.is_empty() {
            return Err(anyhow!("api credentials are not configured"));
        }
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("stills api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let hub = self.hub;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, hub, shutdown_thread) {
                log::error!("stills api stopped: {}", err);
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
    cfg: Arc<ApiConfig>,
    hub: Arc<StreamHub>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = Arc::clone(&cfg);
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &hub) {
                        log::warn!("stills api request failed: {}", err);
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

#[derive(Serialize)]
struct FrameBody {
    frame: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Streams,
    Stream(usize),
    Frame(usize),
    NotFound,
}

fn route(path: &str) -> Route {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').skip(1).collect();
    match segments.as_slice() {
        ["health"] => Route::Health,
        ["api", "streams"] => Route::Streams,
        ["api", "streams", index] => index.parse().map_or(Route::NotFound, Route::Stream),
        ["api", "frame", index] => index.parse().map_or(Route::NotFound, Route::Frame),
        _ => Route::NotFound,
    }
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, hub: &StreamHub) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method == "OPTIONS" {
        write_response(&mut stream, 204, "text/plain", b"")?;
        return Ok(());
    }
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    let route = route(&request.path);
    if route != Route::Health && !request.authorized(cfg) {
        write_json_response(&mut stream, 401, r#"{"error":"unauthorized"}"#)?;
        return Ok(());
    }

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?,
        Route::Streams => {
            let payload = serde_json::to_vec(&hub.list_streams())?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        Route::Stream(index) => match (hub.stream_status(index), hub.streams().get(index)) {
            (Ok(status), Some(descriptor)) => {
                let summary = StreamSummary {
                    index,
                    name: descriptor.name.clone(),
                    status,
                };
                let payload = serde_json::to_vec(&summary)?;
                write_response(&mut stream, 200, "application/json", &payload)?;
            }
            (Err(err), _) => write_json_response(
                &mut stream,
                err.status_code(),
                r#"{"error":"stream_not_found"}"#,
            )?,
            (Ok(_), None) => {
                write_json_response(&mut stream, 404, r#"{"error":"stream_not_found"}"#)?
            }
        },
        Route::Frame(index) => match hub.frame(index) {
            Ok(frame) => {
                let body = FrameBody {
                    frame: BASE64.encode(frame.bytes()),
                };
                let payload = serde_json::to_vec(&body)?;
                write_response(&mut stream, 200, "application/json", &payload)?;
            }
            Err(err @ FrameError::NotFound { .. }) => write_json_response(
                &mut stream,
                err.status_code(),
                r#"{"error":"stream_not_found"}"#,
            )?,
            Err(err @ FrameError::Unavailable { .. }) => {
                log::debug!("stills api: {}", err);
                write_json_response(
                    &mut stream,
                    err.status_code(),
                    r#"{"error":"frame_unavailable"}"#,
                )?
            }
        },
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?,
    }
    Ok(())
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
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
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
        204 => "HTTP/1.1 204 No Content",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let challenge = if status == 401 {
        "WWW-Authenticate: Basic realm=\"stillframe\"\r\n"
    } else {
        ""
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Headers: Authorization\r\n{challenge}Connection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len(),
        challenge = challenge
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn basic_credentials(&self) -> Option<(String, String)> {
        let value = self.headers.get("authorization")?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (login, password) = decoded.split_once(':')?;
        Some((login.to_string(), password.to_string()))
    }

    fn authorized(&self, cfg: &ApiConfig) -> bool {
        match self.basic_credentials() {
            Some((login, password)) => {
                // Evaluate both so timing does not reveal which one was wrong.
                let login_ok = constant_time_eq(login.as_bytes(), cfg.login.as_bytes());
                let password_ok = constant_time_eq(password.as_bytes(), cfg.password.as_bytes());
                login_ok & password_ok
            }
            None => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_parse_indices() {
        assert_eq!(route("/health"), Route::Health);
        assert_eq!(route("/api/streams"), Route::Streams);
        assert_eq!(route("/api/streams/"), Route::Streams);
        assert_eq!(route("/api/streams/2"), Route::Stream(2));
        assert_eq!(route("/api/frame/0"), Route::Frame(0));
        assert_eq!(route("/api/frame/-1"), Route::NotFound);
        assert_eq!(route("/api/frame/abc"), Route::NotFound);
        assert_eq!(route("/"), Route::NotFound);
    }

    #[test]
    fn basic_credentials_are_checked() {
        let cfg = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            login: "admin".to_string(),
            password: "secret".to_string(),
        };
        let mut headers = HashMap::new();
        headers.insert(
            "authorization".to_string(),
            format!("Basic {}", BASE64.encode("admin:secret")),
        );
        let request = HttpRequest {
            method: "GET".to_string(),
            path: "/api/streams".to_string(),
            headers,
        };
        assert!(request.authorized(&cfg));

        let wrong = ApiConfig {
            password: "other".to_string(),
            ..cfg
        };
        assert!(!request.authorized(&wrong));
    }

    #[test]
    fn constant_time_eq_compares_length_and_content() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
