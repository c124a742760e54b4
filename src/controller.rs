use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;

use crate::dashboard::read_token;
use crate::error::{AppError, Result};
use crate::logbuf::LogEntry;
use crate::logfile;
use crate::registry::{Registry, RegistryEntry};
use crate::supervisor::ServiceView;

/// How long the dashboard gets to answer the liveness ping.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Cross-invocation facade for every subcommand that is not `run`: reads
/// the registry and, when a supervisor is live, talks to its dashboard.
/// Without one it degrades to offline mode (registry listings only;
/// state-changing operations fail with `NotRunning`).
pub struct Controller {
    project_dir: PathBuf,
    registry: Registry,
    client: reqwest::Client,
    dashboard_url: Option<String>,
    token: Option<String>,
}

impl Controller {
    pub async fn connect(project_dir: &Path) -> Controller {
        let registry = Registry::new(project_dir);
        let client = reqwest::Client::new();

        let published = registry
            .load()
            .ok()
            .and_then(|doc| doc.dashboard)
            .map(|d| d.url);
        let dashboard_url = match published {
            Some(url) => {
                let alive = client
                    .get(format!("{url}/health"))
                    .timeout(PING_TIMEOUT)
                    .send()
                    .await
                    .is_ok_and(|r| r.status().is_success());
                alive.then_some(url)
            }
            None => None,
        };

        Controller {
            project_dir: project_dir.to_path_buf(),
            registry,
            client,
            token: read_token(project_dir),
            dashboard_url,
        }
    }

    pub fn online(&self) -> bool {
        self.dashboard_url.is_some()
    }

    pub fn dashboard_url(&self) -> Option<&str> {
        self.dashboard_url.as_deref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry listing; works with or without a live supervisor.
    pub fn list(&self) -> Result<Vec<RegistryEntry>> {
        self.registry.list()
    }

    /// Live supervisor view. `NotRunning` offline.
    pub async fn views(&self) -> Result<Vec<ServiceView>> {
        let url = self.require_online()?;
        let resp = self
            .client
            .get(format!("{url}/services"))
            .send()
            .await
            .map_err(|_| AppError::NotRunning)?;
        resp.json().await.map_err(|e| {
            AppError::Registry(format!("bad dashboard response: {e}"))
        })
    }

    pub async fn stop(&self, service: &str) -> Result<()> {
        self.post(&format!("services/{service}/stop")).await
    }

    pub async fn start(&self, service: &str) -> Result<()> {
        self.post(&format!("services/{service}/start")).await
    }

    pub async fn restart(&self, service: &str) -> Result<()> {
        self.post(&format!("services/{service}/restart")).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.post("services/stop-all").await
    }

    /// One page of logs. Online, the supervisor's ring is the source; in
    /// offline mode the written log file is read back instead.
    pub async fn logs(&self, service: &str, tail: usize) -> Result<Vec<LogEntry>> {
        match &self.dashboard_url {
            Some(url) => {
                let resp = self
                    .client
                    .get(format!("{url}/services/{service}/logs?tail={tail}"))
                    .send()
                    .await
                    .map_err(|_| AppError::NotRunning)?;
                let page: serde_json::Value = resp.json().await.map_err(|e| {
                    AppError::Registry(format!("bad dashboard response: {e}"))
                })?;
                serde_json::from_value(page["entries"].clone()).map_err(|e| {
                    AppError::Registry(format!("bad dashboard response: {e}"))
                })
            }
            None => {
                let path = logfile::log_path(&self.project_dir, service);
                if !path.exists() {
                    return Ok(Vec::new());
                }
                let entries = logfile::read_log_file(&path, service)?;
                let skip = entries.len().saturating_sub(tail);
                Ok(entries[skip..].to_vec())
            }
        }
    }

    /// Follow the SSE log stream, invoking the callback per entry until the
    /// connection drops.
    pub async fn follow_logs(
        &self,
        service: &str,
        mut on_entry: impl FnMut(LogEntry),
    ) -> Result<()> {
        let url = self.require_online()?;
        let resp = self
            .client
            .get(format!("{url}/services/{service}/logs/stream"))
            .send()
            .await
            .map_err(|_| AppError::NotRunning)?;

        let mut stream = resp.bytes_stream();
        let mut pending = String::new();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find("\n\n") {
                let event: String = pending.drain(..pos + 2).collect();
                for line in event.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(entry) = serde_json::from_str::<LogEntry>(data) {
                            on_entry(entry);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn require_online(&self) -> Result<&str> {
        self.dashboard_url.as_deref().ok_or(AppError::NotRunning)
    }

    async fn post(&self, path: &str) -> Result<()> {
        let url = self.require_online()?;
        let mut req = self.client.post(format!("{url}/{path}"));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|_| AppError::NotRunning)?;
        if resp.status().is_success() {
            return Ok(());
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Err(remote_error(&body))
    }
}

/// Reconstruct a typed error from a dashboard error body.
fn remote_error(body: &serde_json::Value) -> AppError {
    let message = body["error"].as_str().unwrap_or("dashboard call failed");
    match body["code"].as_str() {
        Some("auth_error") => AppError::Auth,
        Some("unknown_service") => {
            let name = message
                .rsplit('\'')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            AppError::UnknownService(name)
        }
        Some("rate_limited") => AppError::RateLimited,
        _ => AppError::Registry(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = Controller::connect(dir.path()).await;
        assert!(!ctl.online());
        assert!(ctl.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_mutations_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = Controller::connect(dir.path()).await;
        assert!(matches!(ctl.stop("api").await, Err(AppError::NotRunning)));
        assert!(matches!(ctl.restart("api").await, Err(AppError::NotRunning)));
        assert!(matches!(ctl.stop_all().await, Err(AppError::NotRunning)));
        assert!(matches!(ctl.views().await, Err(AppError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stale_dashboard_url_treated_offline() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        // A published dashboard whose pid is live but whose port is closed.
        let port = crate::ports::free_port().unwrap();
        registry
            .set_dashboard(format!("http://127.0.0.1:{port}"), std::process::id())
            .unwrap();
        let ctl = Controller::connect(dir.path()).await;
        assert!(!ctl.online());
    }

    #[tokio::test]
    async fn test_offline_logs_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = logfile::logs_dir(dir.path());
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("api.log"),
            "[2024-03-01 10:00:00.000] [INFO] [stdout] one\n[2024-03-01 10:00:01.000] [ERROR] [stderr] two\n",
        )
        .unwrap();
        let ctl = Controller::connect(dir.path()).await;
        let entries = ctl.logs("api", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].line, "two");
        let tailed = ctl.logs("api", 1).await.unwrap();
        assert_eq!(tailed.len(), 1);
        assert_eq!(tailed[0].line, "two");
    }

    #[test]
    fn test_remote_error_mapping() {
        let auth = serde_json::json!({"success": false, "error": "missing or invalid dashboard token", "code": "auth_error"});
        assert!(matches!(remote_error(&auth), AppError::Auth));
        let unknown = serde_json::json!({"success": false, "error": "unknown service: 'ghost'", "code": "unknown_service"});
        match remote_error(&unknown) {
            AppError::UnknownService(name) => assert_eq!(name, "ghost"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
