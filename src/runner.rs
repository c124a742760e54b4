use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::logbuf::{read_into, LogBuffer, LogStream};
use crate::registry::pid_alive;

/// Default grace between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
pub const MAX_GRACE: Duration = Duration::from_secs(30);

/// Everything needed to spawn a service process.
pub struct SpawnSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: IndexMap<String, String>,
}

/// A live child process plus its pipe reader tasks.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    child: AsyncMutex<Child>,
    readers: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl ProcessHandle {
    /// Block until the child exits and return its exit code (None when
    /// killed by signal). Only one caller may wait; the supervisor's child
    /// watcher owns this.
    pub async fn wait(&self) -> Option<i32> {
        let mut child = self.child.lock().await;
        match child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    /// Signal the whole process group (the child and its descendants).
    #[cfg(unix)]
    pub fn signal_group(&self, sig: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Negative pid addresses the group the child leads.
        let _ = kill(Pid::from_raw(-(self.pid as i32)), sig);
    }

    async fn force_kill(&self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.start_kill();
        }
    }

    async fn join_readers(&self) {
        let mut readers = self.readers.lock().await;
        for handle in readers.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

/// Spawn the child with piped I/O in its own process group and attach both
/// pipes to the service's log buffer.
pub async fn start(spec: &SpawnSpec, buffer: Arc<LogBuffer>) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&spec.dir);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| AppError::Spawn {
        service: spec.name.clone(),
        msg: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| AppError::Spawn {
        service: spec.name.clone(),
        msg: "child exited before pid could be read".into(),
    })?;

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let buf = buffer.clone();
        readers.push(tokio::spawn(async move {
            read_into(buf, LogStream::Stdout, stdout).await;
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let buf = buffer.clone();
        readers.push(tokio::spawn(async move {
            read_into(buf, LogStream::Stderr, stderr).await;
        }));
    }

    Ok(ProcessHandle {
        pid,
        started_at: Utc::now(),
        child: AsyncMutex::new(child),
        readers: AsyncMutex::new(readers),
    })
}

/// Graceful-then-forceful teardown of the whole process group. Closes the
/// I/O pipes and joins the reader tasks before returning.
pub async fn stop(handle: &ProcessHandle, grace: Duration) {
    let grace = grace.min(MAX_GRACE);
    #[cfg(unix)]
    handle.signal_group(nix::sys::signal::Signal::SIGTERM);

    if !wait_gone(handle.pid, grace).await {
        handle.force_kill().await;
        wait_gone(handle.pid, Duration::from_secs(2)).await;
    }
    handle.join_readers().await;
}

/// Poll until the pid is gone or the deadline passes. The child watcher
/// reaps the zombie, so a dead pid stops answering promptly.
async fn wait_gone(pid: u32, deadline: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    !pid_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuf::SequenceSource;

    fn sh(name: &str, script: &str) -> SpawnSpec {
        SpawnSpec {
            name: name.to_string(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            dir: std::env::temp_dir(),
            env: IndexMap::new(),
        }
    }

    fn buffer() -> Arc<LogBuffer> {
        Arc::new(LogBuffer::new("svc", Arc::new(SequenceSource::default())))
    }

    #[tokio::test]
    async fn test_spawn_captures_both_streams() {
        let buf = buffer();
        let handle = start(&sh("svc", "echo out; echo err 1>&2"), buf.clone())
            .await
            .unwrap();
        let code = handle.wait().await;
        assert_eq!(code, Some(0));
        handle.join_readers().await;

        let entries = buf.snapshot();
        assert!(entries
            .iter()
            .any(|e| e.line == "out" && e.stream == LogStream::Stdout));
        assert!(entries
            .iter()
            .any(|e| e.line == "err" && e.stream == LogStream::Stderr));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let buf = buffer();
        let spec = SpawnSpec {
            name: "ghost".into(),
            program: "definitely-not-a-real-binary-xyz".into(),
            args: vec![],
            dir: std::env::temp_dir(),
            env: IndexMap::new(),
        };
        let err = start(&spec, buf).await.unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
        assert_eq!(err.code(), "spawn_error");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_reported() {
        let buf = buffer();
        let handle = start(&sh("svc", "exit 3"), buf).await.unwrap();
        assert_eq!(handle.wait().await, Some(3));
    }

    #[tokio::test]
    async fn test_stop_terminates_group() {
        let buf = buffer();
        // A shell that ignores nothing: SIGTERM ends it within the grace.
        let handle = start(&sh("svc", "sleep 30"), buf).await.unwrap();
        let pid = handle.pid;
        assert!(pid_alive(pid));

        let waiter = {
            let h = Arc::new(handle);
            let h2 = h.clone();
            tokio::spawn(async move { h2.wait().await });
            h
        };
        stop(&waiter, Duration::from_secs(2)).await;
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_env_and_cwd_applied() {
        let buf = buffer();
        let dir = tempfile::tempdir().unwrap();
        let mut env = IndexMap::new();
        env.insert("PORT".to_string(), "4567".to_string());
        let spec = SpawnSpec {
            name: "svc".into(),
            program: "sh".into(),
            args: vec!["-c".into(), "echo $PORT; pwd".into()],
            dir: dir.path().to_path_buf(),
            env,
        };
        let handle = start(&spec, buf.clone()).await.unwrap();
        handle.wait().await;
        handle.join_readers().await;

        let lines: Vec<String> = buf.snapshot().iter().map(|e| e.line.clone()).collect();
        assert!(lines.iter().any(|l| l == "4567"));
        let cwd = dir.path().canonicalize().unwrap();
        assert!(lines.iter().any(|l| PathBuf::from(l).canonicalize().ok() == Some(cwd.clone())));
    }
}
