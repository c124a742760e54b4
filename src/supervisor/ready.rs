use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::health::{is_http_service, HealthProber, HealthStatus};
use crate::logbuf::LogBuffer;
use crate::manifest::{Language, ServiceKind};
use crate::supervisor::plan::ServiceRuntime;

pub const DEFAULT_READY_DEADLINE: Duration = Duration::from_secs(60);

/// Settle time for services with no probe basis at all.
const SETTLE: Duration = Duration::from_secs(2);

const POLL_STEP: Duration = Duration::from_millis(250);

/// What convinced us the service is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySignal {
    Health,
    Tcp,
    LogPattern,
    Settle,
}

#[derive(Debug)]
pub enum ReadyOutcome {
    Ready(ReadySignal),
    Cancelled,
}

/// Log lines that announce readiness, checked case-insensitively.
fn ready_patterns(runtime: &ServiceRuntime) -> Vec<&'static str> {
    let mut patterns = vec![
        "listening on",
        "now listening on",
        "compiled successfully",
        "running at",
        "running on",
        "started server",
        "server running",
        "application started",
    ];
    if let ServiceKind::Process {
        language,
        framework,
    } = &runtime.spec.kind
    {
        let fw = framework.as_deref().unwrap_or("").to_ascii_lowercase();
        match fw.as_str() {
            "vite" | "astro" => patterns.push("ready in"),
            "next" => patterns.push("started server on"),
            "fastapi" | "uvicorn" => patterns.push("application startup complete"),
            _ => {}
        }
        if *language == Language::Dotnet {
            patterns.push("application started");
        }
    }
    patterns
}

/// Wait until the service is ready: the first of a passing health probe, a
/// TCP accept on its port, a framework "ready" log line, or a short settle
/// time when it has none of those. Bounded by `deadline`. Only log entries
/// with a sequence above `after_seq` count, so a restart never reads the
/// previous process's lines as readiness.
pub async fn wait_ready(
    runtime: &ServiceRuntime,
    buffer: &Arc<LogBuffer>,
    after_seq: u64,
    prober: &HealthProber,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<ReadyOutcome> {
    let expect_http = is_http_service(&runtime.spec) || runtime.spec.health.is_some();
    let expect_tcp = !runtime.spec.requested_ports.is_empty()
        || matches!(runtime.spec.kind, ServiceKind::Container { .. });
    let patterns = ready_patterns(runtime);

    let mut sub = buffer.subscribe();
    let mut log_open = true;
    // Lines the child printed before we subscribed still count.
    let matches_pattern = |line: &str| {
        let line = line.to_ascii_lowercase();
        patterns.iter().any(|p| line.contains(p))
    };
    if buffer
        .snapshot()
        .iter()
        .any(|e| e.sequence > after_seq && matches_pattern(&e.line))
    {
        return Ok(ReadyOutcome::Ready(ReadySignal::LogPattern));
    }
    let started = tokio::time::Instant::now();
    let mut tick = tokio::time::interval(POLL_STEP);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(ReadyOutcome::Cancelled),

            () = &mut timeout => {
                return Err(AppError::ReadinessTimeout {
                    service: runtime.name().to_string(),
                    secs: deadline.as_secs(),
                })
            }

            entry = sub.rx.recv(), if log_open => {
                match entry {
                    Some(entry) => {
                        if matches_pattern(&entry.line) {
                            return Ok(ReadyOutcome::Ready(ReadySignal::LogPattern));
                        }
                    }
                    None => log_open = false,
                }
            }

            _ = tick.tick() => {
                if expect_http {
                    let result = prober.probe(Duration::from_secs(1)).await;
                    if matches!(result.status, HealthStatus::Healthy | HealthStatus::Degraded) {
                        return Ok(ReadyOutcome::Ready(ReadySignal::Health));
                    }
                } else if expect_tcp {
                    let addr: SocketAddr = ([127, 0, 0, 1], runtime.port).into();
                    let connect = tokio::time::timeout(POLL_STEP, TcpStream::connect(addr)).await;
                    if matches!(connect, Ok(Ok(_))) {
                        return Ok(ReadyOutcome::Ready(ReadySignal::Tcp));
                    }
                } else if started.elapsed() >= SETTLE {
                    return Ok(ReadyOutcome::Ready(ReadySignal::Settle));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthProber;
    use crate::logbuf::{LogStream, SequenceSource};
    use crate::manifest::{ServiceKind, ServiceSpec};
    use crate::supervisor::plan::ServiceRuntime;
    use chrono::Utc;
    use indexmap::IndexMap;

    fn runtime(ports: Vec<u16>, port: u16) -> ServiceRuntime {
        ServiceRuntime {
            spec: ServiceSpec {
                name: "api".into(),
                kind: ServiceKind::Process {
                    language: Language::Other("rust".into()),
                    framework: None,
                },
                working_dir: std::env::temp_dir(),
                requested_ports: ports,
                env: IndexMap::new(),
                command: Some("true".into()),
                health: None,
                debug: None,
                depends_on: vec![],
            },
            program: "true".into(),
            args: vec![],
            working_dir: std::env::temp_dir(),
            env: IndexMap::new(),
            port,
            debug_port: None,
        }
    }

    fn prober(rt: &ServiceRuntime) -> HealthProber {
        HealthProber::new(&rt.spec, rt.port, std::process::id(), Utc::now())
    }

    #[tokio::test]
    async fn test_log_pattern_signals_ready() {
        let rt = runtime(vec![], 1);
        let buf = Arc::new(LogBuffer::new("api", Arc::new(SequenceSource::default())));
        let p = prober(&rt);
        let cancel = CancellationToken::new();

        let buf2 = buf.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            buf2.append(LogStream::Stdout, "Server listening on :3000".into(), false, None);
        });

        let out = wait_ready(&rt, &buf, 0, &p, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(matches!(out, ReadyOutcome::Ready(ReadySignal::LogPattern)));
    }

    #[tokio::test]
    async fn test_tcp_accept_signals_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let rt = runtime(vec![port], port);
        let buf = Arc::new(LogBuffer::new("api", Arc::new(SequenceSource::default())));
        let p = prober(&rt);
        let cancel = CancellationToken::new();
        let out = wait_ready(&rt, &buf, 0, &p, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(matches!(out, ReadyOutcome::Ready(ReadySignal::Tcp)));
    }

    #[tokio::test]
    async fn test_settle_for_probeless_service() {
        let rt = runtime(vec![], 1);
        let buf = Arc::new(LogBuffer::new("api", Arc::new(SequenceSource::default())));
        let p = prober(&rt);
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let out = wait_ready(&rt, &buf, 0, &p, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
        assert!(matches!(out, ReadyOutcome::Ready(ReadySignal::Settle)));
        assert!(started.elapsed() >= SETTLE);
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let rt = runtime(vec![65533], 65533);
        let buf = Arc::new(LogBuffer::new("api", Arc::new(SequenceSource::default())));
        let p = prober(&rt);
        let cancel = CancellationToken::new();
        let err = wait_ready(&rt, &buf, 0, &p, Duration::from_millis(600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let rt = runtime(vec![65532], 65532);
        let buf = Arc::new(LogBuffer::new("api", Arc::new(SequenceSource::default())));
        let p = prober(&rt);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = wait_ready(&rt, &buf, 0, &p, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(matches!(out, ReadyOutcome::Cancelled));
    }
}
