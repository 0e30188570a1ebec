//! HTTP server and WebSocket control endpoint.
//!
//! Every client command arrives as one short text frame on `/ws`; state
//! changes are re-broadcast to all connected clients through a registry of
//! detached senders. The PWA shells and the song list are the only HTTP
//! payloads — everything live goes over the socket.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use embedded_svc::io::Write;
use esp_idf_svc::http::server::ws::EspHttpWsConnection;
use esp_idf_svc::http::server::{Configuration as HttpConfig, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::sys::{EspError, ESP_ERR_INVALID_SIZE};
use esp_idf_svc::ws::FrameType;
use log::{info, warn};

use crate::app::App;
use crate::config::SERVER_PORT;
use crate::control::Command;
use crate::worker;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const GENERATE_HTML: &str = include_str!("../assets/generate.html");
const MANIFEST_JSON: &str = include_str!("../assets/manifest.json");
const ICON_SVG: &str = include_str!("../assets/icon.svg");

/// Longest accepted incoming frame. Commands are tiny.
const WS_MAX_FRAME: usize = 32;

// ── Broadcast hub ──────────────────────────────────────────────────────────

type DetachedSender = esp_idf_svc::http::server::ws::EspHttpWsDetachedSender;

/// Registry of connected WebSocket clients, keyed by httpd session id.
pub struct WsHub {
    clients: Mutex<Vec<(i32, DetachedSender)>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, session: i32, sender: DetachedSender) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|(s, _)| *s != session);
        clients.push((session, sender));
    }

    fn remove(&self, session: i32) {
        self.clients.lock().unwrap().retain(|(s, _)| *s != session);
    }

    /// Send a text frame to every connected client, dropping any that fail.
    pub fn broadcast(&self, msg: &str) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain_mut(|(session, sender)| {
            match sender.send(FrameType::Text(false), msg.as_bytes()) {
                Ok(()) => true,
                Err(_) => {
                    info!("ws client #{session} dropped from broadcast list");
                    false
                }
            }
        });
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Server ─────────────────────────────────────────────────────────────────

/// Bring up the HTTP server with every route and the `/ws` endpoint.
/// The returned server must stay alive for as long as it should serve.
pub fn start(app: Arc<App>) -> Result<EspHttpServer<'static>> {
    let mut server = EspHttpServer::new(&HttpConfig {
        http_port: SERVER_PORT,
        uri_match_wildcard: true,
        ..Default::default()
    })?;

    server.fn_handler("/", Method::Get, |req| -> Result<()> {
        let mut resp = req.into_response(
            200,
            Some("OK"),
            &[
                ("Content-Type", "text/html"),
                ("Cache-Control", "no-cache, no-store, must-revalidate"),
            ],
        )?;
        resp.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler("/generate", Method::Get, |req| -> Result<()> {
        let mut resp = req.into_response(
            200,
            Some("OK"),
            &[
                ("Content-Type", "text/html"),
                ("Cache-Control", "no-cache, no-store, must-revalidate"),
            ],
        )?;
        resp.write_all(GENERATE_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler("/manifest.json", Method::Get, |req| -> Result<()> {
        let mut resp =
            req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?;
        resp.write_all(MANIFEST_JSON.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler("/icon.svg", Method::Get, |req| -> Result<()> {
        let mut resp =
            req.into_response(200, Some("OK"), &[("Content-Type", "image/svg+xml")])?;
        resp.write_all(ICON_SVG.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler("/favicon.ico", Method::Get, |req| -> Result<()> {
        req.into_response(302, Some("Found"), &[("Location", "/icon.svg")])?;
        Ok(())
    })?;

    let songs_app = app.clone();
    server.fn_handler("/songs.json", Method::Get, move |req| -> Result<()> {
        let json = {
            let shared = songs_app.shared.lock().unwrap();
            serde_json::to_string(&shared.control.catalog.song_rows())?
        };
        let mut resp =
            req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?;
        resp.write_all(json.as_bytes())?;
        Ok(())
    })?;

    let ws_app = app.clone();
    server.ws_handler("/ws", move |ws| handle_ws(&ws_app, ws))?;

    // Wildcard must register last; everything unmatched is a 404.
    server.fn_handler("/*", Method::Get, |req| -> Result<()> {
        let mut resp = req.into_response(404, Some("Not Found"), &[("Content-Type", "text/plain")])?;
        resp.write_all(b"Not found")?;
        Ok(())
    })?;

    info!("http server listening on :{SERVER_PORT}");
    Ok(server)
}

// ── WebSocket ──────────────────────────────────────────────────────────────

fn handle_ws(app: &Arc<App>, ws: &mut EspHttpWsConnection) -> Result<(), EspError> {
    if ws.is_new() {
        on_connect(app, ws)?;
        return Ok(());
    }
    if ws.is_closed() {
        app.hub.remove(ws.session());
        info!("ws client #{} disconnected", ws.session());
        return Ok(());
    }

    // The IDF API wants two recv calls: first for the length, then the
    // payload. No command is anywhere near WS_MAX_FRAME; an oversized frame
    // is a broken client and closes the session.
    let (_, len) = ws.recv(&mut [])?;
    if len > WS_MAX_FRAME {
        warn!("ws frame too long ({len}), closing");
        ws.send(FrameType::Close, &[])?;
        return Err(EspError::from_infallible::<ESP_ERR_INVALID_SIZE>());
    }
    let mut buf = [0u8; WS_MAX_FRAME];
    let (frame_type, len) = ws.recv(buf.as_mut())?;
    if !matches!(frame_type, FrameType::Text(false)) {
        return Ok(());
    }

    let Ok(frame) = core::str::from_utf8(&buf[..len]) else {
        return Ok(());
    };
    let frame = frame.trim_end_matches('\0');

    // Malformed frames are dropped silently.
    let Some(cmd) = Command::parse(frame) else {
        return Ok(());
    };
    on_command(app, ws, cmd);
    Ok(())
}

/// Register the client and unicast the current status, mirroring what a
/// long-connected client would already know.
fn on_connect(app: &Arc<App>, ws: &mut EspHttpWsConnection) -> Result<(), EspError> {
    let session = ws.session();
    info!("ws client #{session} connected");

    let (playing, volume) = {
        let shared = app.shared.lock().unwrap();
        (
            shared.control.playing_name().map(|n| format!("playing:{n}")),
            shared.control.volume(),
        )
    };

    if let Some(msg) = playing {
        ws.send(FrameType::Text(false), msg.as_bytes())?;
    }
    ws.send(FrameType::Text(false), format!("vol:{volume}").as_bytes())?;
    let loaded = app.gen.loaded.load(Ordering::Relaxed);
    ws.send(
        FrameType::Text(false),
        format!("status:gpt:{}", u8::from(loaded)).as_bytes(),
    )?;

    match ws.create_detached_sender() {
        Ok(sender) => app.hub.add(session, sender),
        Err(e) => warn!("detached sender for #{session} failed: {e}"),
    }
    Ok(())
}

fn on_command(app: &Arc<App>, ws: &mut EspHttpWsConnection, cmd: Command) {
    let now = app.now_ms();
    match cmd {
        Command::Play(index) => {
            let msgs = {
                let mut shared = app.shared.lock().unwrap();
                let crate::app::Shared { control, audio } = &mut *shared;
                control.start_song(index, now, audio.as_mut())
            };
            broadcast_all(app, msgs);
        }
        Command::Stop => {
            let msgs = {
                let mut shared = app.shared.lock().unwrap();
                if shared.control.state() != crate::control::PlayerState::Playing {
                    Vec::new()
                } else {
                    let crate::app::Shared { control, audio } = &mut *shared;
                    control.enter_idle(now, audio.as_mut())
                }
            };
            broadcast_all(app, msgs);
        }
        Command::Volume(percent) => {
            let msgs = {
                let mut shared = app.shared.lock().unwrap();
                let crate::app::Shared { control, audio } = &mut *shared;
                control.set_volume(percent, audio.as_mut())
            };
            broadcast_all(app, msgs);
        }
        Command::Gen => start_generation(app, ws),
        Command::GenTemp(temp) => {
            app.shared.lock().unwrap().control.set_temperature(temp);
        }
        Command::GenStop => {
            app.gen.abort.store(true, Ordering::Relaxed);
        }
    }
}

/// `gen`: reply with an error straight to the requester, or claim the
/// `generating` flag and hand off to the worker.
fn start_generation(app: &Arc<App>, ws: &mut EspHttpWsConnection) {
    let reply = |ws: &mut EspHttpWsConnection, msg: &str| {
        if let Err(e) = ws.send(FrameType::Text(false), msg.as_bytes()) {
            warn!("ws reply failed: {e}");
        }
    };

    if !app.gen.loaded.load(Ordering::Relaxed) {
        reply(ws, "gen:err:no model");
        return;
    }
    if app
        .gen
        .generating
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        reply(ws, "gen:err:busy");
        return;
    }

    app.gen.abort.store(false, Ordering::Relaxed);
    let temperature = app.shared.lock().unwrap().control.temperature();
    if let Err(e) = worker::spawn(app.clone(), temperature) {
        warn!("worker spawn failed: {e}");
        app.gen.generating.store(false, Ordering::Relaxed);
        reply(ws, "gen:err:failed");
    }
}

fn broadcast_all(app: &Arc<App>, msgs: Vec<String>) {
    for msg in msgs {
        app.hub.broadcast(&msg);
    }
}
