use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::health::HealthStatus;
use crate::state::ServiceStatus;

pub const REGISTRY_FILE: &str = "services.json";

/// How long a reader/writer waits for the advisory lock before failing.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub fn azure_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".azure")
}

/// One persisted service record. A superset of the runtime plan, so other
/// CLI invocations can render state without a live supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardInfo {
    pub url: String,
    pub pid: u32,
}

/// The whole on-disk document: the services map plus the published
/// dashboard endpoint of the owning supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDoc {
    #[serde(default)]
    pub dashboard: Option<DashboardInfo>,
    #[serde(default)]
    pub services: BTreeMap<String, RegistryEntry>,
}

/// Cross-process service catalog at `<project>/.azure/services.json`.
///
/// Reads take a shared advisory lock, writes an exclusive one; writes are
/// whole-file atomic (temp file + rename). Every access first drops entries
/// whose pid is no longer alive on this host.
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Registry {
    pub fn new(project_dir: &Path) -> Self {
        let dir = azure_dir(project_dir);
        Self {
            path: dir.join(REGISTRY_FILE),
            lock_path: dir.join(format!("{REGISTRY_FILE}.lock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry. Entries whose process is gone are reported as
    /// `stopped` with the pid cleared; the cleanup is persisted on the next
    /// write.
    pub fn load(&self) -> Result<RegistryDoc> {
        let _lock = self.acquire_lock(false)?;
        let mut doc = self.read_doc()?;
        purge_dead(&mut doc);
        Ok(doc)
    }

    /// Read-modify-write under the exclusive lock.
    pub fn mutate<F>(&self, f: F) -> Result<RegistryDoc>
    where
        F: FnOnce(&mut RegistryDoc),
    {
        let _lock = self.acquire_lock(true)?;
        let mut doc = self.read_doc()?;
        purge_dead(&mut doc);
        f(&mut doc);
        self.write_doc(&doc)?;
        Ok(doc)
    }

    /// Upsert one entry keyed by service name.
    pub fn register(&self, entry: RegistryEntry) -> Result<()> {
        self.mutate(|doc| {
            doc.services.insert(entry.name.clone(), entry);
        })?;
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.services.remove(name);
        })?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<RegistryEntry>> {
        Ok(self.load()?.services.get(name).cloned())
    }

    pub fn list(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.load()?.services.into_values().collect())
    }

    pub fn list_running(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .load()?
            .services
            .into_values()
            .filter(|e| e.status.is_running())
            .collect())
    }

    pub fn update_status(
        &self,
        name: &str,
        status: ServiceStatus,
        health: Option<HealthStatus>,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(|doc| {
            if let Some(entry) = doc.services.get_mut(name) {
                entry.status = status;
                entry.last_checked = Some(Utc::now());
                if health.is_some() {
                    entry.health = health;
                }
                if error.is_some() {
                    entry.error = error;
                }
                if !status.is_running() {
                    entry.pid = None;
                }
            }
        })?;
        Ok(())
    }

    pub fn set_dashboard(&self, url: String, pid: u32) -> Result<()> {
        self.mutate(|doc| doc.dashboard = Some(DashboardInfo { url, pid }))?;
        Ok(())
    }

    pub fn clear_dashboard(&self) -> Result<()> {
        self.mutate(|doc| doc.dashboard = None)?;
        Ok(())
    }

    fn read_doc(&self) -> Result<RegistryDoc> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Registry(format!("corrupt {}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDoc::default()),
            Err(e) => Err(AppError::Registry(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_doc(&self, doc: &RegistryDoc) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| AppError::Registry("registry path has no parent".into()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| AppError::Registry(format!("cannot create {}: {e}", dir.display())))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| AppError::Registry(format!("cannot create temp file: {e}")))?;
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| AppError::Registry(format!("cannot serialize registry: {e}")))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.flush())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| AppError::Registry(format!("cannot write registry: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| AppError::Registry(format!("cannot persist registry: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    fn acquire_lock(&self, exclusive: bool) -> Result<File> {
        let dir = self
            .lock_path
            .parent()
            .ok_or_else(|| AppError::Registry("registry path has no parent".into()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| AppError::Registry(format!("cannot create {}: {e}", dir.display())))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| AppError::Registry(format!("cannot open registry lock: {e}")))?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let locked = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match locked {
                Ok(()) => return Ok(file),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(AppError::Registry(format!(
                        "registry lock timed out after {}s: {e}",
                        LOCK_TIMEOUT.as_secs()
                    )))
                }
            }
        }
    }
}

/// Treat entries whose process is gone as stopped. The dashboard pointer is
/// purged the same way.
fn purge_dead(doc: &mut RegistryDoc) {
    for entry in doc.services.values_mut() {
        if entry.status.is_running() {
            let alive = entry.pid.is_some_and(pid_alive);
            if !alive {
                entry.status = ServiceStatus::Stopped;
                entry.pid = None;
            }
        }
    }
    if let Some(dash) = &doc.dashboard {
        if !pid_alive(dash.pid) {
            doc.dashboard = None;
        }
    }
}

/// Signal 0 probes existence without touching the process.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: ServiceStatus, pid: Option<u32>) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            kind: "process".into(),
            pid,
            port: Some(3000),
            debug_port: None,
            url: Some("http://127.0.0.1:3000".into()),
            status,
            health: None,
            command: Some("npm start".into()),
            working_dir: None,
            start_time: Some(Utc::now()),
            last_checked: None,
            error: None,
        }
    }

    #[test]
    fn test_register_then_list_contains_entry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        reg.register(entry("api", ServiceStatus::Ready, Some(std::process::id())))
            .unwrap();
        let listed = reg.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "api");
        assert_eq!(listed[0].status, ServiceStatus::Ready);
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        let pid = std::process::id();
        reg.register(entry("api", ServiceStatus::Starting, Some(pid)))
            .unwrap();
        reg.register(entry("api", ServiceStatus::Ready, Some(pid)))
            .unwrap();
        let listed = reg.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ServiceStatus::Ready);
    }

    #[test]
    fn test_unregister_removes() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        reg.register(entry("api", ServiceStatus::Ready, Some(std::process::id())))
            .unwrap();
        reg.unregister("api").unwrap();
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn test_dead_pid_reported_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        // A pid far above pid_max never refers to a live process.
        reg.register(entry("api", ServiceStatus::Ready, Some(u32::MAX - 1)))
            .unwrap();
        let got = reg.get("api").unwrap().unwrap();
        assert_eq!(got.status, ServiceStatus::Stopped);
        assert_eq!(got.pid, None);
    }

    #[test]
    fn test_list_running_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        let live = std::process::id();
        reg.register(entry("a", ServiceStatus::Ready, Some(live))).unwrap();
        reg.register(entry("b", ServiceStatus::Starting, Some(live))).unwrap();
        reg.register(entry("c", ServiceStatus::Stopped, None)).unwrap();
        let running = reg.list_running().unwrap();
        let names: Vec<&str> = running.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_update_status_clears_pid_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        reg.register(entry("api", ServiceStatus::Ready, Some(std::process::id())))
            .unwrap();
        reg.update_status("api", ServiceStatus::Stopped, None, None)
            .unwrap();
        let got = reg.get("api").unwrap().unwrap();
        assert_eq!(got.status, ServiceStatus::Stopped);
        assert_eq!(got.pid, None);
        assert!(got.last_checked.is_some());
    }

    #[test]
    fn test_dashboard_roundtrip_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        reg.set_dashboard("http://127.0.0.1:8079".into(), std::process::id())
            .unwrap();
        assert!(reg.load().unwrap().dashboard.is_some());
        reg.set_dashboard("http://127.0.0.1:8079".into(), u32::MAX - 1)
            .unwrap();
        assert!(reg.load().unwrap().dashboard.is_none());
        reg.clear_dashboard().unwrap();
        assert!(reg.load().unwrap().dashboard.is_none());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        assert!(reg.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        reg.register(entry("api", ServiceStatus::Ready, Some(std::process::id())))
            .unwrap();
        let mode = std::fs::metadata(reg.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
