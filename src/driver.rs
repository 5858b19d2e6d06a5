use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Round-trip bound for ordinary protocol calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Round-trip bound for script evaluation. The mixing graph's `play` waits
/// up to 30s for the media to become playable, so this must sit above it.
const EVAL_TIMEOUT: Duration = Duration::from_secs(35);
/// How long to wait for a freshly launched browser to expose its port.
const LAUNCH_WAIT_TRIES: u32 = 60;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum DriverError {
    /// Remote round-trip exceeded its bound.
    Timeout,
    /// The remote context rejected or failed the script.
    Execution(String),
    /// A command was issued with no active session.
    NotReady,
    /// Devtools socket plumbing failed.
    Transport(String),
    /// The browser could not be launched or attached.
    Browser(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Timeout => write!(f, "bridge timeout"),
            DriverError::Execution(msg) => write!(f, "bridge execution: {msg}"),
            DriverError::NotReady => write!(f, "session not ready"),
            DriverError::Transport(msg) => write!(f, "driver transport: {msg}"),
            DriverError::Browser(msg) => write!(f, "driver browser: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

// ---------------------------------------------------------------------------
// Collaborator contract
// ---------------------------------------------------------------------------

/// Session automation driver: executes scripts and performs coarse UI
/// actions inside the live session's execution context.
///
/// The orchestrator only depends on this contract; the production
/// implementation below speaks the Chrome DevTools protocol, tests use a
/// recording mock.
pub trait SessionDriver: Send + Sync + 'static {
    /// Establish (or re-establish) the connection to the execution context.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;
    fn navigate(&self, url: &str) -> impl Future<Output = Result<()>> + Send;
    /// Evaluate a script, awaiting its promise, and return its value.
    fn execute(&self, script: &str) -> impl Future<Output = Result<Value>> + Send;
    /// Register a script that runs before any document in the context loads.
    fn install_init_script(&self, script: &str) -> impl Future<Output = Result<()>> + Send;
    /// Find a visible element by role and (partial) label and click it.
    /// Returns false if nothing matched within the timeout.
    fn locate_and_click(
        &self,
        role: &str,
        label: &str,
        timeout_ms: u64,
    ) -> impl Future<Output = Result<bool>> + Send;
    fn press_key(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
    fn close(&self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// Chrome DevTools implementation
// ---------------------------------------------------------------------------

pub struct CdpDriver {
    cdp_port: u16,
    browser_path: Option<String>,
    profile_dir: PathBuf,
    silence_wav: PathBuf,
    http: reqwest::Client,
    conn: tokio::sync::Mutex<Option<CdpConn>>,
    child: Mutex<Option<tokio::process::Child>>,
}

struct CdpConn {
    next_id: u64,
    sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        WsMessage,
    >,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl CdpDriver {
    pub fn new(cdp_port: u16, browser_path: Option<String>, state_dir: PathBuf) -> Self {
        Self {
            cdp_port,
            browser_path,
            profile_dir: state_dir.join("browser_profile"),
            silence_wav: state_dir.join("silence.wav"),
            http: reqwest::Client::new(),
            conn: tokio::sync::Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    async fn endpoint_alive(&self) -> bool {
        let url = format!("http://127.0.0.1:{}/json/version", self.cdp_port);
        self.http
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn resolve_browser(&self) -> Result<String> {
        if let Some(path) = &self.browser_path {
            return Ok(path.clone());
        }
        const CANDIDATES: &[&str] = &[
            "/usr/bin/google-chrome",
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/usr/bin/microsoft-edge",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ];
        CANDIDATES
            .iter()
            .find(|p| Path::new(p).exists())
            .map(|p| p.to_string())
            .ok_or_else(|| DriverError::Browser("no chrome/chromium binary found".into()))
    }

    /// Launch the browser in headless debug mode with the synthetic capture
    /// device fed from a silence file (the mixing graph supplies the real
    /// audio by patching getUserMedia).
    async fn launch_browser(&self) -> Result<()> {
        let bin = self.resolve_browser()?;

        std::fs::create_dir_all(&self.profile_dir)
            .map_err(|e| DriverError::Browser(format!("profile dir: {e}")))?;
        if !self.silence_wav.exists() {
            write_silence_wav(&self.silence_wav)
                .map_err(|e| DriverError::Browser(format!("silence wav: {e}")))?;
        }

        tracing::info!("[driver] launching {bin} (devtools port {})", self.cdp_port);
        let child = tokio::process::Command::new(&bin)
            .arg(format!("--remote-debugging-port={}", self.cdp_port))
            .arg(format!("--user-data-dir={}", self.profile_dir.display()))
            .arg("--use-fake-ui-for-media-stream")
            .arg("--use-fake-device-for-media-stream")
            .arg(format!(
                "--use-file-for-fake-audio-capture={}",
                self.silence_wav.display()
            ))
            .arg("--allow-file-access-from-files")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--headless=new")
            .arg("about:blank")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Browser(format!("spawn {bin}: {e}")))?;
        *self.child.lock().unwrap() = Some(child);

        for _ in 0..LAUNCH_WAIT_TRIES {
            if self.endpoint_alive().await {
                tracing::info!("[driver] browser ready");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(DriverError::Browser(
            "browser did not expose the devtools port".into(),
        ))
    }

    /// Find the debugger websocket of an existing page target, creating one
    /// when the browser has none.
    async fn page_ws_url(&self) -> Result<String> {
        let base = format!("http://127.0.0.1:{}", self.cdp_port);

        let list: Vec<Value> = self
            .http
            .get(format!("{base}/json/list"))
            .send()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        if let Some(url) = list
            .iter()
            .filter(|t| t["type"] == "page")
            .filter_map(|t| t["webSocketDebuggerUrl"].as_str())
            .next()
        {
            return Ok(url.to_string());
        }

        // Newer Chrome requires PUT for target creation.
        let created: Value = self
            .http
            .put(format!("{base}/json/new?about:blank"))
            .send()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        created["webSocketDebuggerUrl"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Browser("no page target available".into()))
    }

    /// One devtools protocol round-trip.
    async fn call(&self, method: &str, params: Value, bound: Duration) -> Result<Value> {
        let (id, rx, pending) = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(DriverError::NotReady)?;
            conn.next_id += 1;
            let id = conn.next_id;

            let (tx, rx) = oneshot::channel();
            conn.pending.lock().unwrap().insert(id, tx);

            let msg = json!({ "id": id, "method": method, "params": params });
            if let Err(e) = conn.sink.send(WsMessage::Text(msg.to_string())).await {
                conn.pending.lock().unwrap().remove(&id);
                return Err(DriverError::Transport(e.to_string()));
            }
            (id, rx, conn.pending.clone())
        };

        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(value)) => {
                if let Some(err) = value.get("error") {
                    let msg = err["message"].as_str().unwrap_or("unknown devtools error");
                    return Err(DriverError::Execution(msg.to_string()));
                }
                Ok(value)
            }
            Ok(Err(_)) => Err(DriverError::Transport("devtools connection closed".into())),
            Err(_) => {
                pending.lock().unwrap().remove(&id);
                Err(DriverError::Timeout)
            }
        }
    }
}

impl SessionDriver for CdpDriver {
    async fn connect(&self) -> Result<()> {
        {
            let guard = self.conn.lock().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        if !self.endpoint_alive().await {
            self.launch_browser().await?;
        } else {
            tracing::info!(
                "[driver] devtools port {} already in use, attaching",
                self.cdp_port
            );
        }

        let ws_url = self.page_ws_url().await?;
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        let (sink, mut stream) = ws.split();

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(WsMessage::Text(text)) = msg else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                // Protocol events carry no id and are ignored: remote state
                // is reconciled by polling, not by push notifications.
                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending_reader.lock().unwrap().remove(&id) {
                        tx.send(value).ok();
                    }
                }
            }
            tracing::warn!("[driver] devtools socket closed");
        });

        *self.conn.lock().await = Some(CdpConn {
            next_id: 0,
            sink,
            pending,
            reader,
        });

        self.call("Page.enable", json!({}), CALL_TIMEOUT).await.ok();
        tracing::info!("[driver] attached to page target");
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.call("Page.navigate", json!({ "url": url }), Duration::from_secs(30))
            .await?;
        Ok(())
    }

    async fn execute(&self, script: &str) -> Result<Value> {
        let value = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
                EVAL_TIMEOUT,
            )
            .await?;

        let result = &value["result"];
        if let Some(exception) = result.get("exceptionDetails") {
            let msg = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("script exception");
            return Err(DriverError::Execution(msg.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn install_init_script(&self, script: &str) -> Result<()> {
        self.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": script }),
            CALL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn locate_and_click(&self, role: &str, label: &str, timeout_ms: u64) -> Result<bool> {
        let script = click_script(role, label);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if self.execute(&script).await?.as_bool() == Some(true) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        for kind in ["keyDown", "keyUp"] {
            self.call(
                "Input.dispatchKeyEvent",
                json!({ "type": kind, "key": key }),
                CALL_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.reader.abort();
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            child.start_kill().ok();
        }
        tracing::info!("[driver] closed");
    }
}

/// Build the find-and-click snippet for a role + partial label match.
fn click_script(role: &str, label: &str) -> String {
    // to_string on a &str always yields valid JSON.
    let role_json = serde_json::to_string(role).unwrap_or_else(|_| "\"button\"".into());
    let label_json =
        serde_json::to_string(&label.to_lowercase()).unwrap_or_else(|_| "\"\"".into());
    format!(
        r#"(() => {{
  const role = {role_json};
  const label = {label_json};
  const nodes = Array.from(document.querySelectorAll('[role="' + role + '"], ' + role));
  const matches = (el) => {{
    const aria = (el.getAttribute("aria-label") || "").toLowerCase();
    const text = (el.innerText || "").toLowerCase();
    return aria.includes(label) || text.includes(label);
  }};
  const visible = (el) => {{
    const r = el.getBoundingClientRect();
    return r.width > 0 && r.height > 0;
  }};
  const hit = nodes.find((el) => matches(el) && visible(el));
  if (hit) {{ hit.click(); return true; }}
  return false;
}})()"#
    )
}

/// Write one second of 16-bit mono PCM silence. Fed to the browser's fake
/// capture device so the baseline microphone input is silent, not a beep.
fn write_silence_wav(path: &Path) -> io::Result<()> {
    const SAMPLE_RATE: u32 = 44_100;
    let data_len = SAMPLE_RATE * 2; // 1s * 16-bit * mono

    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVEfmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    buf.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.resize(44 + data_len as usize, 0);

    std::fs::write(path, &buf)
}

// ---------------------------------------------------------------------------
// Recording mock (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct MockDriver {
    pub scripts: Mutex<Vec<String>>,
    pub clicks: Mutex<Vec<(String, String)>>,
    pub navigations: Mutex<Vec<String>>,
    pub response: Mutex<Value>,
}

#[cfg(test)]
impl MockDriver {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            response: Mutex::new(Value::Null),
        }
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl SessionDriver for MockDriver {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn execute(&self, script: &str) -> Result<Value> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(self.response.lock().unwrap().clone())
    }

    async fn install_init_script(&self, script: &str) -> Result<()> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(())
    }

    async fn locate_and_click(&self, role: &str, label: &str, _timeout_ms: u64) -> Result<bool> {
        self.clicks
            .lock()
            .unwrap()
            .push((role.to_string(), label.to_string()));
        Ok(true)
    }

    async fn press_key(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
