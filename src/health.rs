use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{AppError, Result};
use crate::manifest::{HealthSpec, Language, ProbeKind, ServiceKind, ServiceSpec};
use crate::registry::pid_alive;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Window after startup in which a failing probe reads as `starting`
/// rather than `unhealthy`.
const STARTING_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Starting,
    Unknown,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    Process,
}

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub check: CheckType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

impl HealthResult {
    fn new(status: HealthStatus, check: CheckType) -> Self {
        Self {
            status,
            check,
            endpoint: None,
            response_time_ms: None,
            status_code: None,
            port: None,
            error: None,
            uptime_secs: None,
            details: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, HealthStatus::Unhealthy)
    }
}

/// Clamp a requested probe timeout into [1s, 60s].
pub fn clamp_timeout(t: Duration) -> Duration {
    t.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT)
}

/// `health --stream` requires room for the probe to finish between ticks.
pub fn validate_stream_params(interval: Duration, probe_timeout: Duration) -> Result<()> {
    if interval <= probe_timeout {
        return Err(AppError::Config(
            "interval must be greater than timeout".into(),
        ));
    }
    Ok(())
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, timeout: Duration) -> HealthResult;
}

pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    port: u16,
    slow_threshold: Duration,
}

impl HttpProbe {
    pub fn new(port: u16, path: &str, slow_threshold: Duration) -> Self {
        // Redirects are never followed: a 3xx from the service is already an
        // answer.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            client,
            url: format!("http://127.0.0.1:{port}{path}"),
            port,
            slow_threshold,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, probe_timeout: Duration) -> HealthResult {
        let started = Instant::now();
        let mut result = HealthResult::new(HealthStatus::Unknown, CheckType::Http);
        result.endpoint = Some(self.url.clone());
        result.port = Some(self.port);

        match self
            .client
            .get(&self.url)
            .timeout(probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let elapsed = started.elapsed();
                result.response_time_ms = Some(elapsed.as_millis() as u64);
                result.status_code = Some(resp.status().as_u16());
                let code = resp.status().as_u16();
                result.status = if (200..400).contains(&code) {
                    if elapsed > self.slow_threshold {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    }
                } else {
                    HealthStatus::Unhealthy
                };
            }
            Err(e) => {
                result.response_time_ms = Some(started.elapsed().as_millis() as u64);
                result.status = HealthStatus::Unhealthy;
                result.error = Some(e.to_string());
            }
        }
        result
    }
}

pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, probe_timeout: Duration) -> HealthResult {
        let started = Instant::now();
        let mut result = HealthResult::new(HealthStatus::Unknown, CheckType::Tcp);
        result.port = Some(self.port);
        let addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        match timeout(probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                result.status = HealthStatus::Healthy;
                result.response_time_ms = Some(started.elapsed().as_millis() as u64);
            }
            Ok(Err(e)) => {
                result.status = HealthStatus::Unhealthy;
                result.error = Some(e.to_string());
            }
            Err(_) => {
                result.status = HealthStatus::Unhealthy;
                result.error = Some(format!("connect timed out after {probe_timeout:?}"));
            }
        }
        result
    }
}

pub struct ProcessProbe {
    pid: u32,
}

impl ProcessProbe {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[async_trait]
impl Probe for ProcessProbe {
    async fn check(&self, _probe_timeout: Duration) -> HealthResult {
        let mut result = HealthResult::new(HealthStatus::Unknown, CheckType::Process);
        if pid_alive(self.pid) {
            result.status = HealthStatus::Healthy;
        } else {
            result.status = HealthStatus::Unhealthy;
            result.error = Some(format!("process {} is gone", self.pid));
        }
        result
    }
}

/// Frameworks that are expected to answer HTTP on their port.
pub fn is_http_service(spec: &ServiceSpec) -> bool {
    match &spec.kind {
        ServiceKind::Container { .. } => false,
        ServiceKind::Process {
            language,
            framework,
        } => {
            let fw = framework.as_deref().unwrap_or("").to_ascii_lowercase();
            matches!(
                fw.as_str(),
                "express" | "fastify" | "next" | "vite" | "react" | "angular"
                    | "flask" | "fastapi" | "django" | "uvicorn" | "aspnet" | "webapi"
            ) || (*language == Language::Dotnet && fw.is_empty())
        }
    }
}

/// Pick the probe for a service at plan time, in preference order: explicit
/// HTTP path, auto `/health`, TCP connect, process liveness.
pub fn choose_probe(spec: &ServiceSpec, port: u16, pid: u32) -> Box<dyn Probe> {
    let slow = spec
        .health
        .as_ref()
        .map(|h| h.slow_threshold)
        .unwrap_or(Duration::from_secs(1));

    if let Some(health) = &spec.health {
        match health.probe {
            Some(ProbeKind::Tcp) => return Box::new(TcpProbe::new(port)),
            Some(ProbeKind::Process) => return Box::new(ProcessProbe::new(pid)),
            Some(ProbeKind::Http) | None => {
                let path = health.path.as_deref().unwrap_or("/health");
                return Box::new(HttpProbe::new(port, path, slow));
            }
        }
    }
    if is_http_service(spec) {
        return Box::new(HttpProbe::new(port, "/health", slow));
    }
    if !spec.requested_ports.is_empty() || matches!(spec.kind, ServiceKind::Container { .. }) {
        return Box::new(TcpProbe::new(port));
    }
    Box::new(ProcessProbe::new(pid))
}

struct Breaker {
    threshold: u32,
    open_for: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<HealthResult>,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_sec: f64,
    refilled: Instant,
}

impl TokenBucket {
    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.capacity);
        self.refilled = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One prober per service: the chosen probe plus the opt-in protection
/// layers (result cache, rate limit, circuit breaker) and the `starting`
/// grace window.
pub struct HealthProber {
    probe: Box<dyn Probe>,
    started: Instant,
    start_time: DateTime<Utc>,
    breaker: Option<Mutex<Breaker>>,
    limiter: Option<Mutex<TokenBucket>>,
    cache_ttl: Option<Duration>,
    last: Mutex<Option<HealthResult>>,
    had_success: Mutex<bool>,
}

impl HealthProber {
    pub fn new(spec: &ServiceSpec, port: u16, pid: u32, start_time: DateTime<Utc>) -> Self {
        Self::with_probe(choose_probe(spec, port, pid), spec.health.as_ref(), start_time)
    }

    pub fn with_probe(
        probe: Box<dyn Probe>,
        health: Option<&HealthSpec>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let breaker = health.and_then(|h| h.circuit_breaker.as_ref()).map(|b| {
            Mutex::new(Breaker {
                threshold: b.failures,
                open_for: b.open_for,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
            })
        });
        let limiter = health.and_then(|h| h.rate_limit).filter(|&r| r > 0).map(|r| {
            Mutex::new(TokenBucket {
                capacity: f64::from(r).max(1.0),
                tokens: f64::from(r).max(1.0),
                per_sec: f64::from(r),
                refilled: Instant::now(),
            })
        });
        let cache_ttl = health.and_then(|h| h.cache_ttl).filter(|t| !t.is_zero());
        Self {
            probe,
            started: Instant::now(),
            start_time,
            breaker,
            limiter,
            cache_ttl,
            last: Mutex::new(None),
            had_success: Mutex::new(false),
        }
    }

    pub async fn probe(&self, probe_timeout: Duration) -> HealthResult {
        let probe_timeout = clamp_timeout(probe_timeout);

        if let Some(ttl) = self.cache_ttl {
            if let Some(last) = self.last_result() {
                let age = Utc::now().signed_duration_since(last.checked_at);
                if age.to_std().is_ok_and(|a| a < ttl) {
                    return last;
                }
            }
        }

        if let Some(limiter) = &self.limiter {
            if !lock(limiter).try_take() {
                return self.last_result().unwrap_or_else(|| {
                    let mut r = HealthResult::new(HealthStatus::Unknown, CheckType::Process);
                    r.error = Some("probe rate limit exceeded".into());
                    r
                });
            }
        }

        if let Some(breaker) = &self.breaker {
            let short_circuit = {
                let mut b = lock(breaker);
                match b.opened_at {
                    Some(at) if at.elapsed() < b.open_for => b.last_failure.clone(),
                    Some(_) => {
                        // Half-open: let exactly this call through.
                        b.opened_at = None;
                        None
                    }
                    None => None,
                }
            };
            if let Some(result) = short_circuit {
                return result;
            }
        }

        let mut result = self.probe.check(probe_timeout).await;
        result.uptime_secs = Some(
            Utc::now()
                .signed_duration_since(self.start_time)
                .num_seconds()
                .max(0) as u64,
        );

        if result.is_failure() && !*lock(&self.had_success) && self.started.elapsed() < STARTING_GRACE
        {
            result.status = HealthStatus::Starting;
        }
        if result.status == HealthStatus::Healthy || result.status == HealthStatus::Degraded {
            *lock(&self.had_success) = true;
        }

        if let Some(breaker) = &self.breaker {
            let mut b = lock(breaker);
            if result.is_failure() {
                b.consecutive_failures += 1;
                b.last_failure = Some(result.clone());
                if b.consecutive_failures >= b.threshold && b.opened_at.is_none() {
                    b.opened_at = Some(Instant::now());
                }
            } else {
                b.consecutive_failures = 0;
                b.opened_at = None;
                b.last_failure = None;
            }
        }

        *lock(&self.last) = Some(result.clone());
        result
    }

    pub fn last_result(&self) -> Option<HealthResult> {
        lock(&self.last).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let probe = TcpProbe::new(port);
        let result = probe.check(Duration::from_secs(1)).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.check, CheckType::Tcp);
        assert_eq!(result.port, Some(port));
    }

    #[tokio::test]
    async fn test_tcp_probe_failure() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        }; // listener dropped, port closed
        let probe = TcpProbe::new(port);
        let result = probe.check(Duration::from_millis(200)).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_process_probe() {
        let alive = ProcessProbe::new(std::process::id());
        assert_eq!(
            alive.check(Duration::from_secs(1)).await.status,
            HealthStatus::Healthy
        );
        let dead = ProcessProbe::new(u32::MAX - 1);
        assert_eq!(
            dead.check(Duration::from_secs(1)).await.status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_timeout_clamp() {
        assert_eq!(clamp_timeout(Duration::from_millis(10)), MIN_PROBE_TIMEOUT);
        assert_eq!(clamp_timeout(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(clamp_timeout(Duration::from_secs(600)), MAX_PROBE_TIMEOUT);
    }

    #[test]
    fn test_stream_params_validated() {
        assert!(validate_stream_params(Duration::from_secs(2), Duration::from_secs(5)).is_err());
        assert!(validate_stream_params(Duration::from_secs(5), Duration::from_secs(5)).is_err());
        assert!(validate_stream_params(Duration::from_secs(6), Duration::from_secs(5)).is_ok());
    }

    struct FlakyProbe {
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Probe for FlakyProbe {
        async fn check(&self, _t: Duration) -> HealthResult {
            let healthy = self.healthy.load(std::sync::atomic::Ordering::SeqCst);
            HealthResult::new(
                if healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
                CheckType::Tcp,
            )
        }
    }

    fn breaker_spec(failures: u32, open_for: Duration) -> HealthSpec {
        HealthSpec {
            path: None,
            probe: None,
            slow_threshold: Duration::from_secs(1),
            circuit_breaker: Some(crate::manifest::BreakerSpec { failures, open_for }),
            rate_limit: None,
            cache_ttl: None,
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_after_consecutive_failures() {
        let probe = Box::new(FlakyProbe {
            healthy: std::sync::atomic::AtomicBool::new(false),
        });
        let spec = breaker_spec(2, Duration::from_secs(60));
        let prober = HealthProber::with_probe(probe, Some(&spec), Utc::now());
        // Get past the starting grace by forcing a success first.
        {
            *lock(&prober.had_success) = true;
        }
        prober.probe(Duration::from_secs(1)).await;
        prober.probe(Duration::from_secs(1)).await;
        // Breaker is now open: the probe is skipped and the last failure
        // comes back.
        let skipped = prober.probe(Duration::from_secs(1)).await;
        assert_eq!(skipped.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_cache_short_circuits_probes() {
        let probe = Box::new(FlakyProbe {
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let spec = HealthSpec {
            path: None,
            probe: None,
            slow_threshold: Duration::from_secs(1),
            circuit_breaker: None,
            rate_limit: None,
            cache_ttl: Some(Duration::from_secs(30)),
        };
        let prober = HealthProber::with_probe(probe, Some(&spec), Utc::now());
        let first = prober.probe(Duration::from_secs(1)).await;
        let second = prober.probe(Duration::from_secs(1)).await;
        assert_eq!(first.checked_at, second.checked_at);
    }

    #[tokio::test]
    async fn test_starting_grace_masks_early_failures() {
        let probe = Box::new(FlakyProbe {
            healthy: std::sync::atomic::AtomicBool::new(false),
        });
        let prober = HealthProber::with_probe(probe, None, Utc::now());
        let result = prober.probe(Duration::from_secs(1)).await;
        assert_eq!(result.status, HealthStatus::Starting);
    }

    #[test]
    fn test_choose_probe_preference_order() {
        use crate::manifest::{ServiceKind, ServiceSpec};
        let base = ServiceSpec {
            name: "api".into(),
            kind: ServiceKind::Process {
                language: Language::Node,
                framework: Some("express".into()),
            },
            working_dir: ".".into(),
            requested_ports: vec![3000],
            env: Default::default(),
            command: None,
            health: None,
            debug: None,
            depends_on: vec![],
        };
        // http framework without a health block still gets an HTTP probe
        let probe = choose_probe(&base, 3000, 1);
        drop(probe);

        let mut worker = base.clone();
        worker.kind = ServiceKind::Process {
            language: Language::Other("rust".into()),
            framework: None,
        };
        worker.requested_ports = vec![];
        // no port, no framework: process probe (asserted via behavior)
        let probe = choose_probe(&worker, 0, std::process::id());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(probe.check(Duration::from_secs(1)));
        assert_eq!(result.check, CheckType::Process);
    }
}
