use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::messages::decode_command;
use crate::player::ControlRequest;

/// Per-client outbound buffer; a client this far behind starts losing
/// events and resyncs on reconnect.
const CLIENT_BUFFER: usize = 64;

pub struct ServerState {
    pub control_tx: mpsc::Sender<ControlRequest>,
    pub downloads_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// HTTP front
// ---------------------------------------------------------------------------

pub async fn run_server(
    port: u16,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
        .route("/downloads/{name}", get(download))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("[http] listening on 0.0.0.0:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("[http] shutting down");
        })
        .await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| client_loop(socket, state))
}

/// One connected client: shovel broadcast events out and decoded commands
/// in until either side hangs up. Malformed frames are logged and dropped,
/// never fatal to the connection.
async fn client_loop(socket: WebSocket, state: Arc<ServerState>) {
    let id = Uuid::new_v4();
    let (tx, mut events) = mpsc::channel::<String>(CLIENT_BUFFER);
    if state
        .control_tx
        .send(ControlRequest::Subscribe { id, tx })
        .await
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = events.recv() => {
                let Some(text) = outbound else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match decode_command(&text) {
                        Ok(cmd) => {
                            let req = ControlRequest::Command { from: id, cmd };
                            if state.control_tx.send(req).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[ws] dropping bad frame from {id}: {e}");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the library; binary is ignored.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("[ws] client {id} socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state
        .control_tx
        .send(ControlRequest::Unsubscribe { id })
        .await
        .ok();
}

// ---------------------------------------------------------------------------
// Cached file serving
// ---------------------------------------------------------------------------

/// Serve a cached audio file to the session page. Names are flat cache
/// entries; anything that could traverse outside the directory is rejected.
async fn download(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Response {
    if !safe_file_name(&name) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let path = state.downloads_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&name))],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\'])
}

fn content_type(name: &str) -> &'static str {
    match name.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("opus") | Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><meta charset="utf-8"><title>meetjam</title></head>
  <body style="font-family: sans-serif">
    <h1>meetjam</h1>
    <p>The control channel is at <code>/ws</code>. Connect a client to
    queue tracks and drive playback.</p>
  </body>
</html>
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_name_rejects_traversal() {
        assert!(safe_file_name("ab12cd34ef.mp3"));
        assert!(!safe_file_name(""));
        assert!(!safe_file_name("../etc/passwd"));
        assert!(!safe_file_name("a/b.mp3"));
        assert!(!safe_file_name("a\\b.mp3"));
        assert!(!safe_file_name(".hidden"));
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type("x.mp3"), "audio/mpeg");
        assert_eq!(content_type("x.m4a"), "audio/mp4");
        assert_eq!(content_type("x.opus"), "audio/ogg");
        assert_eq!(content_type("x.webm"), "audio/webm");
        assert_eq!(content_type("x"), "application/octet-stream");
    }
}
