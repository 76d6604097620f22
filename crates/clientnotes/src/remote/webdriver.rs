//! Production target driving a browser through the W3C WebDriver protocol.
//!
//! Talks plain HTTP+JSON to a chromedriver/geckodriver endpoint. All page
//! knowledge (URLs, selectors, field mapping) comes from `RemoteConfig`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use super::{RemoteError, RemoteTarget, TargetConnector};
use crate::config::RemoteConfig;
use crate::records::{Fields, RecordIdentity};
use crate::secrets::{expand_home, Credentials};
use crate::worker::job::DateRange;

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Suffixes of files the browser is still writing.
const PARTIAL_DOWNLOAD_SUFFIXES: &[&str] = &[".crdownload", ".part", ".tmp"];

pub struct WebDriverConnector {
    config: Arc<RemoteConfig>,
    client: Client,
}

impl WebDriverConnector {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        // Leave headroom over the in-page wait so the driver reports the
        // timeout rather than the HTTP client.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.operation_timeout_secs + 10))
            .build()
            .map_err(map_http_error)?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    fn capabilities(&self, download_dir: &Path) -> Value {
        let mut args = vec!["--window-size=1920,1080", "--disable-gpu"];
        if self.config.headless {
            args.push("--headless=new");
        }

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": self.config.browser,
                    "goog:chromeOptions": {
                        "args": args,
                        "prefs": {
                            "download.default_directory": download_dir.to_string_lossy(),
                            "download.prompt_for_download": false,
                        }
                    }
                }
            }
        })
    }
}

impl TargetConnector for WebDriverConnector {
    fn connect(&self) -> Result<Box<dyn RemoteTarget>, RemoteError> {
        let download_dir = PathBuf::from(expand_home(&self.config.download_directory));
        fs::create_dir_all(&download_dir).map_err(|e| {
            RemoteError::Transport(format!(
                "cannot create download directory '{}': {}",
                download_dir.display(),
                e
            ))
        })?;

        let base = self.config.webdriver_url.trim_end_matches('/').to_string();
        let value = send(
            self.client
                .post(format!("{}/session", base))
                .json(&self.capabilities(&download_dir)),
        )?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Malformed("new session response has no sessionId".into()))?
            .to_string();

        log::debug!("Opened WebDriver session {}", session_id);

        Ok(Box::new(WebDriverTarget {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            base,
            session_id: Some(session_id),
            download_dir,
        }))
    }
}

pub struct WebDriverTarget {
    client: Client,
    config: Arc<RemoteConfig>,
    base: String,
    session_id: Option<String>,
    download_dir: PathBuf,
}

impl WebDriverTarget {
    fn session_url(&self, path: &str) -> Result<String, RemoteError> {
        let id = self.session_id.as_deref().ok_or(RemoteError::Closed)?;
        Ok(format!("{}/session/{}{}", self.base, id, path))
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.operation_timeout_secs)
    }

    fn navigate(&self, url: &str) -> Result<(), RemoteError> {
        send(self.client.post(self.session_url("/url")?).json(&json!({ "url": url })))?;
        Ok(())
    }

    fn current_url(&self) -> Result<String, RemoteError> {
        let value = send(self.client.get(self.session_url("/url")?))?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Malformed("current url is not a string".into()))
    }

    fn find(&self, selector: &str) -> Result<String, RemoteError> {
        let value = send(
            self.client
                .post(self.session_url("/element")?)
                .json(&json!({ "using": "css selector", "value": selector })),
        )
        .map_err(|e| match e {
            RemoteError::NotFound(_) => RemoteError::NotFound(selector.to_string()),
            other => other,
        })?;

        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Malformed(format!("no element reference for '{}'", selector)))
    }

    /// Polls for `selector` until it appears or the operation timeout passes.
    fn wait_for(&self, selector: &str) -> Result<String, RemoteError> {
        let deadline = Instant::now() + self.operation_timeout();
        loop {
            match self.find(selector) {
                Ok(element) => return Ok(element),
                Err(RemoteError::NotFound(_)) | Err(RemoteError::StaleHandle(_))
                    if Instant::now() < deadline =>
                {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(RemoteError::NotFound(_)) => {
                    return Err(RemoteError::Timeout(format!("waiting for '{}'", selector)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn element_url(&self, element: &str, action: &str) -> Result<String, RemoteError> {
        self.session_url(&format!("/element/{}/{}", element, action))
    }

    fn click(&self, selector: &str) -> Result<(), RemoteError> {
        let element = self.wait_for(selector)?;
        send(self.client.post(self.element_url(&element, "click")?).json(&json!({})))?;
        Ok(())
    }

    fn fill(&self, selector: &str, text: &str) -> Result<(), RemoteError> {
        let element = self.wait_for(selector)?;
        send(self.client.post(self.element_url(&element, "clear")?).json(&json!({})))?;
        send(
            self.client
                .post(self.element_url(&element, "value")?)
                .json(&json!({ "text": text })),
        )?;
        Ok(())
    }

    fn read_value(&self, selector: &str) -> Result<String, RemoteError> {
        let element = self.find(selector)?;
        let value = send(self.client.get(self.element_url(&element, "property/value")?))?;
        Ok(match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    fn execute(&self, script: &str) -> Result<Value, RemoteError> {
        send(
            self.client
                .post(self.session_url("/execute/sync")?)
                .json(&json!({ "script": script, "args": [] })),
        )
    }

    fn completed_downloads(&self) -> Result<HashSet<PathBuf>, RemoteError> {
        let entries = fs::read_dir(&self.download_dir).map_err(|e| {
            RemoteError::Transport(format!(
                "cannot read download directory '{}': {}",
                self.download_dir.display(),
                e
            ))
        })?;

        Ok(entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                let name = path.to_string_lossy();
                !PARTIAL_DOWNLOAD_SUFFIXES.iter().any(|s| name.ends_with(s))
            })
            .collect())
    }

    /// Waits for a file that was not in `before` and returns its bytes. The
    /// file is removed afterwards so the next export starts clean.
    fn await_download(&self, before: &HashSet<PathBuf>) -> Result<Vec<u8>, RemoteError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.download_timeout_secs);
        loop {
            let now = self.completed_downloads()?;
            if let Some(path) = now.difference(before).next() {
                let bytes = fs::read(path).map_err(|e| {
                    RemoteError::Transport(format!("cannot read export '{}': {}", path.display(), e))
                })?;
                if let Err(e) = fs::remove_file(path) {
                    log::warn!("Failed to remove downloaded export {}: {}", path.display(), e);
                }
                return Ok(bytes);
            }
            if Instant::now() >= deadline {
                return Err(RemoteError::Timeout(format!(
                    "no export appeared in '{}' within {}s",
                    self.download_dir.display(),
                    self.config.download_timeout_secs
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl RemoteTarget for WebDriverTarget {
    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError> {
        let selectors = &self.config.selectors;
        self.navigate(&self.config.login_url)?;
        self.fill(&selectors.agency_id, credentials.agency_id.expose_secret())?;
        self.fill(&selectors.email, credentials.email.expose_secret())?;
        self.fill(&selectors.password, credentials.password.expose_secret())?;
        self.click(&selectors.submit)?;

        let deadline = Instant::now() + self.operation_timeout();
        loop {
            if self.find(&selectors.logged_in).is_ok() {
                return Ok(());
            }
            if let Ok(element) = self.find(&selectors.login_error) {
                let text = send(self.client.get(self.element_url(&element, "text")?))?;
                return Err(RemoteError::Rejected(
                    text.as_str().unwrap_or("login refused").trim().to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(RemoteError::Timeout("waiting for login to complete".into()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn export_dataset(&mut self, range: &DateRange) -> Result<Vec<u8>, RemoteError> {
        let selectors = &self.config.selectors;
        let format = self.config.date_format.as_str();
        let before = self.completed_downloads()?;

        self.navigate(&self.config.report_url)?;
        self.fill(&selectors.start_date, &range.start().format(format).to_string())?;
        self.fill(&selectors.end_date, &range.end().format(format).to_string())?;
        self.click(&selectors.export_button)?;

        self.await_download(&before)
    }

    fn refresh_view(&mut self) -> Result<(), RemoteError> {
        self.navigate(&self.config.search_url)?;
        self.wait_for(&self.config.selectors.client_list)?;
        Ok(())
    }

    fn lookup_record(&mut self, identity: &RecordIdentity) -> Result<Fields, RemoteError> {
        let selectors = &self.config.selectors;
        self.fill(&selectors.search_box, &identity.display_name())?;
        self.click(&selectors.search_button)?;
        self.click(&selectors.search_result)?;
        self.wait_for(&selectors.record_loaded)?;

        let mut fields = Fields::new();
        for (column, selector) in &self.config.record_fields {
            let value = match self.read_value(selector) {
                Ok(value) => value,
                Err(RemoteError::NotFound(_)) => String::new(),
                Err(e) => return Err(e),
            };
            fields.insert(column.clone(), value);
        }

        self.navigate(&self.config.search_url)?;
        Ok(fields)
    }

    fn probe_liveness(&mut self) -> Result<(), RemoteError> {
        let state = self.execute("return document.readyState")?;
        if state.as_str().is_none() {
            return Err(RemoteError::Malformed("readyState is not a string".into()));
        }
        let url = self.current_url()?;
        if url.starts_with(&self.config.login_url) {
            return Err(RemoteError::SessionLost("redirected to the login page".into()));
        }
        Ok(())
    }

    fn close(&mut self) {
        let Some(id) = self.session_id.take() else {
            return;
        };
        match self
            .client
            .delete(format!("{}/session/{}", self.base, id))
            .send()
        {
            Ok(_) => log::debug!("Closed WebDriver session {}", id),
            Err(e) => log::warn!("Failed to close WebDriver session {}: {}", id, e),
        }
    }
}

impl Drop for WebDriverTarget {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends a WebDriver command and unwraps the `value` member of the reply.
fn send(request: RequestBuilder) -> Result<Value, RemoteError> {
    let response = request.send().map_err(map_http_error)?;
    let status = response.status();
    let mut body: Value = response.json().map_err(|e| {
        RemoteError::Malformed(format!("WebDriver reply (HTTP {}) is not JSON: {}", status, e))
    })?;
    let value = body.get_mut("value").map(Value::take).unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or("");
    Err(map_webdriver_error(code, message))
}

fn map_webdriver_error(code: &str, message: &str) -> RemoteError {
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, message)
    };
    match code {
        "stale element reference" | "element click intercepted" | "element not interactable" => {
            RemoteError::StaleHandle(detail)
        }
        "timeout" | "script timeout" => RemoteError::Timeout(detail),
        "no such element" | "no such frame" | "no such window" => RemoteError::NotFound(detail),
        "invalid session id" => RemoteError::SessionLost(detail),
        "session not created" => RemoteError::Transport(detail),
        _ => RemoteError::Protocol(detail),
    }
}

fn map_http_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(e.to_string())
    } else {
        RemoteError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webdriver_error_mapping() {
        assert!(matches!(
            map_webdriver_error("stale element reference", "node detached"),
            RemoteError::StaleHandle(_)
        ));
        assert!(matches!(
            map_webdriver_error("no such element", ""),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            map_webdriver_error("invalid session id", ""),
            RemoteError::SessionLost(_)
        ));
        assert!(matches!(
            map_webdriver_error("script timeout", ""),
            RemoteError::Timeout(_)
        ));
        assert!(matches!(
            map_webdriver_error("unknown command", ""),
            RemoteError::Protocol(_)
        ));
    }

    #[test]
    fn test_mapped_errors_classify_for_retry() {
        assert!(map_webdriver_error("stale element reference", "").is_transient());
        assert!(!map_webdriver_error("invalid argument", "").is_transient());
    }

    #[test]
    fn test_error_detail_includes_message() {
        let err = map_webdriver_error("no such element", "#btnSearch");
        assert_eq!(err, RemoteError::NotFound("no such element: #btnSearch".into()));
    }

    #[test]
    fn test_connect_fails_without_driver() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RemoteConfig {
            webdriver_url: "http://127.0.0.1:9".into(),
            download_directory: dir.path().to_string_lossy().into_owned(),
            operation_timeout_secs: 1,
            ..Default::default()
        };

        let connector = WebDriverConnector::new(config).unwrap();
        let err = connector.connect().err().unwrap();
        assert!(err.is_transient());
    }
}
