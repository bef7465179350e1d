//! Headless Chromium driven over the DevTools protocol.
//!
//! The browser is spawned with a throwaway profile and `--remote-debugging-port=0`;
//! the WebSocket endpoint is read from its stderr. One connection carries every
//! command, pages are addressed through flattened target sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::engine::{BrowserInstance, BrowserLauncher, BrowserPage};
use super::ChallengeError;

/// How long to wait for the DevTools endpoint after spawning.
const LAUNCH_TIMEOUT_SECS: u64 = 20;

/// Grace period for `Browser.close` before the process is killed.
const CLOSE_GRACE_SECS: u64 = 5;

/// Bounded wait for the process to exit when the browser is dropped unclosed.
const REAP_ATTEMPTS: u32 = 20;
const REAP_INTERVAL_MS: u64 = 25;

/// Interval between `document.readyState` checks after navigation.
const LOAD_POLL_INTERVAL_MS: u64 = 100;

const DEVTOOLS_BANNER: &str = "DevTools listening on ";

const CHROMIUM_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

const MACOS_CHROME: &str = "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

const CHROMIUM_ARGS: &[&str] = &[
    "--headless=new",
    "--remote-debugging-port=0",
    "--no-first-run",
    "--no-default-browser-check",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
];

const LOADED_EXPRESSION: &str =
    "document.readyState === 'complete' && location.href !== 'about:blank'";

type Reply = Result<Value, ChallengeError>;

/// Launches a local Chromium binary.
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    launch_timeout: Duration,
}

impl ChromiumLauncher {
    /// `executable` overrides the PATH lookup (`CHROME_PATH`).
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self {
            executable,
            launch_timeout: Duration::from_secs(LAUNCH_TIMEOUT_SECS),
        }
    }

    fn resolve_executable(&self) -> Result<PathBuf, ChallengeError> {
        if let Some(path) = &self.executable {
            return Ok(path.clone());
        }

        let search = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&search) {
            for name in CHROMIUM_CANDIDATES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        let mac = Path::new(MACOS_CHROME);
        if mac.is_file() {
            return Ok(mac.to_path_buf());
        }

        Err(ChallengeError::Launch(
            "no Chromium executable found; set CHROME_PATH".to_string(),
        ))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, ChallengeError> {
        let executable = self.resolve_executable()?;
        let profile = tempfile::Builder::new()
            .prefix("hevy-broker-chromium-")
            .tempdir()
            .map_err(|e| ChallengeError::Launch(format!("profile directory: {}", e)))?;

        debug!(executable = %executable.display(), "Spawning Chromium");
        let mut child = Command::new(&executable)
            .args(CHROMIUM_ARGS)
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChallengeError::Launch(format!("{}: {}", executable.display(), e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChallengeError::Launch("stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();

        let endpoint = tokio::time::timeout(self.launch_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = parse_devtools_url(&line) {
                    return Ok(url);
                }
                trace!(line = %line, "chromium");
            }
            Err(ChallengeError::Launch(
                "browser exited before exposing a DevTools endpoint".to_string(),
            ))
        })
        .await
        .map_err(|_| ChallengeError::Timeout(self.launch_timeout))??;

        // Keep the pipe drained so the browser never blocks on a full stderr.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(line = %line, "chromium");
            }
        });

        let connection = Connection::open(&endpoint).await?;
        debug!(endpoint = %endpoint, "Connected to DevTools");

        Ok(Arc::new(ChromiumBrowser {
            connection: Arc::new(connection),
            child: tokio::sync::Mutex::new(Some(child)),
            _profile: profile,
        }))
    }
}

/// A multiplexed DevTools connection.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl Connection {
    async fn open(endpoint: &str) -> Result<Self, ChallengeError> {
        let (stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| ChallengeError::Protocol(format!("connect {}: {}", endpoint, e)))?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>> = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = ws_write.send(message).await {
                    warn!(error = %e, "DevTools write failed");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "DevTools connection error");
                        break;
                    }
                };
                let Ok(payload) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                // Events carry no id and are not needed.
                if let Some((id, reply)) = classify_reply(&payload) {
                    let waiter = lock(&reader_pending).remove(&id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(reply);
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            let waiters: Vec<_> = lock(&reader_pending).drain().collect();
            for (_, waiter) in waiters {
                let _ = waiter.send(Err(ChallengeError::Disconnected(
                    "DevTools connection closed".to_string(),
                )));
            }
        });

        Ok(Self {
            outbound,
            pending,
            connected,
            next_id: AtomicU64::new(1),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Reply {
        if !self.is_connected() {
            return Err(ChallengeError::Disconnected(format!("{} not sent", method)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let frame = command_frame(id, method, params, session_id);
        if self.outbound.send(Message::Text(frame.to_string().into())).is_err() {
            lock(&self.pending).remove(&id);
            return Err(ChallengeError::Disconnected(format!("{} not sent", method)));
        }

        trace!(id, method, "DevTools command sent");
        rx.await
            .map_err(|_| ChallengeError::Disconnected(format!("no reply to {}", method)))?
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A launched Chromium process.
///
/// Prefer [`BrowserInstance::close`] (the broker's `shutdown`): it lets the
/// browser exit on its own. Dropping without closing kills the process and
/// waits briefly for it before the profile directory is removed.
struct ChromiumBrowser {
    connection: Arc<Connection>,
    child: tokio::sync::Mutex<Option<Child>>,
    // Removed on drop, after the process is gone.
    _profile: TempDir,
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.get_mut().take() {
            if !reap(&mut child) {
                warn!("Chromium did not exit before its profile was removed");
            }
        }
    }
}

/// Kill the process and wait up to `REAP_ATTEMPTS * REAP_INTERVAL_MS` for it to
/// exit. Returns whether it did.
fn reap(child: &mut Child) -> bool {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill on drop failed");
    }
    for _ in 0..REAP_ATTEMPTS {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => std::thread::sleep(Duration::from_millis(REAP_INTERVAL_MS)),
            Err(e) => {
                debug!(error = %e, "Waiting for Chromium failed");
                return false;
            }
        }
    }
    false
}

#[async_trait]
impl BrowserInstance for ChromiumBrowser {
    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn new_page(&self, user_agent: &str) -> Result<Box<dyn BrowserPage>, ChallengeError> {
        let context = self
            .connection
            .call("Target.createBrowserContext", json!({ "disposeOnDetach": true }), None)
            .await?;
        let context_id = string_field(&context, "browserContextId")?;

        let page = async {
            let target = self
                .connection
                .call(
                    "Target.createTarget",
                    json!({ "url": "about:blank", "browserContextId": context_id }),
                    None,
                )
                .await?;
            let target_id = string_field(&target, "targetId")?;

            let attached = self
                .connection
                .call(
                    "Target.attachToTarget",
                    json!({ "targetId": target_id, "flatten": true }),
                    None,
                )
                .await?;

            let page = ChromiumPage {
                connection: Arc::clone(&self.connection),
                context_id: context_id.clone(),
                session_id: string_field(&attached, "sessionId")?,
            };
            page.send("Emulation.setUserAgentOverride", json!({ "userAgent": user_agent }))
                .await?;
            page.send("Page.enable", json!({})).await?;
            Ok::<_, ChallengeError>(page)
        }
        .await;

        match page {
            Ok(page) => Ok(Box::new(page)),
            Err(e) => {
                if let Err(dispose) = self
                    .connection
                    .call(
                        "Target.disposeBrowserContext",
                        json!({ "browserContextId": context_id }),
                        None,
                    )
                    .await
                {
                    warn!(error = %dispose, context_id = %context_id, "Failed to dispose browser context");
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), ChallengeError> {
        let grace = Duration::from_secs(CLOSE_GRACE_SECS);
        if self.connection.is_connected() {
            match tokio::time::timeout(grace, self.connection.call("Browser.close", json!({}), None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Browser.close failed"),
                Err(_) => warn!(grace_secs = CLOSE_GRACE_SECS, "Browser.close timed out"),
            }
        }
        self.connection.connected.store(false, Ordering::SeqCst);

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(%status, "Chromium exited");
            return Ok(());
        }
        child
            .kill()
            .await
            .map_err(|e| ChallengeError::Protocol(format!("failed to kill browser: {}", e)))
    }
}

struct ChromiumPage {
    connection: Arc<Connection>,
    context_id: String,
    session_id: String,
}

impl ChromiumPage {
    async fn send(&self, method: &str, params: Value) -> Reply {
        self.connection
            .call(method, params, Some(&self.session_id))
            .await
    }

    async fn eval(&self, expression: &str) -> Reply {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        evaluation_result(reply)
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ChallengeError> {
        let load = async {
            let navigation = self.send("Page.navigate", json!({ "url": url })).await?;
            if let Some(reason) = navigation
                .get("errorText")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            {
                return Err(ChallengeError::Navigation(format!("{}: {}", url, reason)));
            }

            while self.eval(LOADED_EXPRESSION).await? != Value::Bool(true) {
                tokio::time::sleep(Duration::from_millis(LOAD_POLL_INTERVAL_MS)).await;
            }
            Ok::<(), ChallengeError>(())
        };

        tokio::time::timeout(timeout, load)
            .await
            .map_err(|_| ChallengeError::Timeout(timeout))?
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value, ChallengeError> {
        self.eval(expression).await
    }

    async fn close(self: Box<Self>) -> Result<(), ChallengeError> {
        self.connection
            .call(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
                None,
            )
            .await
            .map(|_| ())
    }
}

/// Extract the WebSocket URL from Chromium's startup banner.
fn parse_devtools_url(line: &str) -> Option<String> {
    let rest = line.split_once(DEVTOOLS_BANNER)?.1.trim();
    rest.starts_with("ws://").then(|| rest.to_string())
}

fn command_frame(id: u64, method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut frame = json!({ "id": id, "method": method, "params": params });
    if let Some(session_id) = session_id {
        frame["sessionId"] = Value::String(session_id.to_string());
    }
    frame
}

/// Match a reply to its command id. Returns `None` for events.
fn classify_reply(payload: &Value) -> Option<(u64, Reply)> {
    let id = payload.get("id")?.as_u64()?;
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Some((id, Err(ChallengeError::Protocol(message.to_string()))));
    }
    Some((id, Ok(payload.get("result").cloned().unwrap_or(Value::Null))))
}

fn evaluation_result(reply: Value) -> Reply {
    if let Some(details) = reply.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("uncaught exception");
        return Err(ChallengeError::Evaluation(message.to_string()));
    }
    Ok(reply.pointer("/result/value").cloned().unwrap_or(Value::Null))
}

fn string_field(value: &Value, field: &str) -> Result<String, ChallengeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ChallengeError::Protocol(format!("reply is missing {}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devtools_url() {
        let line = "DevTools listening on ws://127.0.0.1:41235/devtools/browser/5f1c-44";
        assert_eq!(
            parse_devtools_url(line).as_deref(),
            Some("ws://127.0.0.1:41235/devtools/browser/5f1c-44")
        );
        assert_eq!(parse_devtools_url("[0101/000000.000:ERROR:gpu_init.cc] nope"), None);
        assert_eq!(parse_devtools_url("DevTools listening on http://x"), None);
    }

    #[test]
    fn test_command_frame_with_session() {
        let frame = command_frame(7, "Page.enable", json!({}), Some("S1"));
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["method"], "Page.enable");
        assert_eq!(frame["sessionId"], "S1");

        let frame = command_frame(8, "Browser.close", json!({}), None);
        assert!(frame.get("sessionId").is_none());
    }

    #[test]
    fn test_classify_reply() {
        let (id, reply) = classify_reply(&json!({"id": 3, "result": {"targetId": "T"}})).unwrap();
        assert_eq!(id, 3);
        assert_eq!(reply.unwrap()["targetId"], "T");

        let (_, reply) =
            classify_reply(&json!({"id": 4, "error": {"code": -32000, "message": "No target"}}))
                .unwrap();
        assert_eq!(reply, Err(ChallengeError::Protocol("No target".into())));

        assert!(classify_reply(&json!({"method": "Page.loadEventFired", "params": {}})).is_none());
    }

    #[test]
    fn test_evaluation_result() {
        let ok = evaluation_result(json!({"result": {"type": "string", "value": "tok"}}));
        assert_eq!(ok, Ok(Value::String("tok".into())));

        let undefined = evaluation_result(json!({"result": {"type": "undefined"}}));
        assert_eq!(undefined, Ok(Value::Null));

        let thrown = evaluation_result(json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: x"}}
        }));
        assert_eq!(thrown, Err(ChallengeError::Evaluation("ReferenceError: x".into())));
    }

    #[test]
    fn test_missing_string_field() {
        assert_eq!(string_field(&json!({"sessionId": "S"}), "sessionId"), Ok("S".into()));
        assert!(string_field(&json!({}), "sessionId").is_err());
    }

    #[test]
    fn test_configured_executable_wins() {
        let launcher = ChromiumLauncher::new(Some(PathBuf::from("/opt/chrome/chrome")));
        assert_eq!(
            launcher.resolve_executable(),
            Ok(PathBuf::from("/opt/chrome/chrome"))
        );
    }

    #[tokio::test]
    async fn test_reap_kills_unclosed_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("sleep spawns");

        assert!(reap(&mut child));
        assert!(child.try_wait().unwrap().is_some());
    }
}
