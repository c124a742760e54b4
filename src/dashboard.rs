use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_util::rt::TokioIo;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::net::TcpListener;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::logbuf::LogLevel;
use crate::logfilter::LogFilter;
use crate::manifest::parse_duration;
use crate::registry::azure_dir;
use crate::supervisor::Supervisor;

pub const TOKEN_FILE: &str = "dashboard-token";
pub const DEFAULT_DASHBOARD_PORT: u16 = 8079;

/// Heartbeat cadence on log streams so idle connections stay alive.
const STREAM_HEARTBEAT: Duration = Duration::from_secs(15);

type BoxResp = Response<BoxBody<Bytes, Infallible>>;

/// A running dashboard server: loopback HTTP facade over the supervisor.
pub struct Dashboard {
    pub url: String,
    pub port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Dashboard {
    /// Bind through the port broker, mint the bearer token, publish the URL
    /// to the registry, and start serving.
    pub async fn start(sup: Arc<Supervisor>) -> Result<Dashboard> {
        let port = sup.broker().acquire("dashboard", &[DEFAULT_DASHBOARD_PORT])?;
        let token = mint_token(&sup.project_dir().join(".azure"))?;
        let url = format!("http://127.0.0.1:{port}");

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AppError::Config(format!("dashboard bind failed on :{port}: {e}")))?;

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let serve_sup = sup.clone();
        let serve_token = token.clone();
        let task = tokio::spawn(async move {
            serve(listener, serve_sup, serve_token, serve_cancel).await;
        });

        // Publish the endpoint so other CLI invocations can find us.
        sup.registry()
            .set_dashboard(url.clone(), std::process::id())?;

        tracing::info!("dashboard at {url}");
        Ok(Dashboard {
            url,
            port,
            cancel,
            task,
        })
    }

    /// Stop accepting connections and drop the published URL. Runs after
    /// every service is down; the supervisor stops the dashboard last.
    pub async fn stop(self, sup: &Supervisor) {
        self.cancel.cancel();
        self.task.abort();
        let _ = self.task.await;
        let _ = sup.registry().clear_dashboard();
        sup.broker().release(self.port);
    }
}

fn mint_token(azure_dir: &Path) -> Result<String> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AppError::Config("token generation failed".into()))?;
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

    std::fs::create_dir_all(azure_dir)?;
    let path = azure_dir.join(TOKEN_FILE);
    std::fs::write(&path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(token)
}

/// Read the token another invocation published.
pub fn read_token(project_dir: &Path) -> Option<String> {
    std::fs::read_to_string(azure_dir(project_dir).join(TOKEN_FILE))
        .ok()
        .map(|s| s.trim().to_string())
}

async fn serve(
    listener: TcpListener,
    sup: Arc<Supervisor>,
    token: String,
    cancel: CancellationToken,
) {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("dashboard accept error: {e}");
                    continue;
                }
            },
        };
        let sup = sup.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = hyper::service::service_fn(move |req| {
                handle(req, sup.clone(), token.clone())
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!("dashboard connection error: {e}");
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    sup: Arc<Supervisor>,
    token: String,
) -> std::result::Result<BoxResp, Infallible> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let method = req.method().clone();
    let authorized = bearer_of(&req).is_some_and(|t| t == token);

    let resp = match (method, path.as_str()) {
        (Method::GET, "/health") => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),

        (Method::GET, "/services") => {
            let views = sup.views().await;
            json_response(StatusCode::OK, &views)
        }

        (Method::POST, "/services/stop-all") => {
            if !authorized {
                unauthorized()
            } else {
                let names: Vec<String> = sup.service_names().await;
                for name in names.iter().rev() {
                    let _ = sup.stop_service(name).await;
                }
                json_response(StatusCode::OK, &serde_json::json!({"success": true}))
            }
        }

        (Method::GET, p) if p.starts_with("/services/") && p.ends_with("/logs/stream") => {
            let name = urldecode(strip_segment(p, "/services/", "/logs/stream"));
            stream_logs(&sup, &name, &query).await
        }

        (Method::GET, p) if p.starts_with("/services/") && p.ends_with("/logs") => {
            let name = urldecode(strip_segment(p, "/services/", "/logs"));
            logs_page(&sup, &name, &query).await
        }

        (Method::POST, p) if p.starts_with("/services/") && p.ends_with("/stop") => {
            let name = urldecode(strip_segment(p, "/services/", "/stop"));
            if !authorized {
                unauthorized()
            } else {
                action_response(sup.stop_service(&name).await)
            }
        }

        (Method::POST, p) if p.starts_with("/services/") && p.ends_with("/start") => {
            let name = urldecode(strip_segment(p, "/services/", "/start"));
            if !authorized {
                unauthorized()
            } else {
                action_response(sup.start_service(&name).await)
            }
        }

        (Method::POST, p) if p.starts_with("/services/") && p.ends_with("/restart") => {
            let name = urldecode(strip_segment(p, "/services/", "/restart"));
            if !authorized {
                unauthorized()
            } else {
                action_response(sup.restart_service(&name).await)
            }
        }

        (Method::GET, p) if p.starts_with("/services/") => {
            let name = urldecode(&p["/services/".len()..]);
            match sup.view(&name).await {
                Some(view) => json_response(StatusCode::OK, &view),
                None => error_response(StatusCode::NOT_FOUND, &AppError::UnknownService(name)),
            }
        }

        _ => not_found(),
    };

    Ok(resp)
}

async fn logs_page(sup: &Arc<Supervisor>, name: &str, query: &str) -> BoxResp {
    let Some(buffer) = sup.log_buffer(name).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            &AppError::UnknownService(name.to_string()),
        );
    };
    let params = parse_query(query);
    let tail: usize = param(&params, "tail")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let filter = filter_from(&params);
    let since = param(&params, "since").and_then(|v| parse_duration(&v).ok());

    let cutoff = since.map(|d| chrono::Utc::now() - chrono::Duration::from_std(d).unwrap_or_default());
    let entries: Vec<_> = buffer
        .snapshot()
        .into_iter()
        .filter(|e| filter.allow(e))
        .filter(|e| cutoff.is_none_or(|c| e.timestamp >= c))
        .collect();
    let skip = entries.len().saturating_sub(tail);
    let stats = buffer.stats();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "service": name,
            "entries": &entries[skip..],
            "total_appended": stats.total_appended,
            "dropped": stats.dropped,
        }),
    )
}

/// Relay the service's log buffer as an SSE stream with a periodic
/// heartbeat; the subscription dies with the connection.
async fn stream_logs(sup: &Arc<Supervisor>, name: &str, query: &str) -> BoxResp {
    let Some(buffer) = sup.log_buffer(name).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            &AppError::UnknownService(name.to_string()),
        );
    };
    let filter = filter_from(&parse_query(query));
    let sub = buffer.subscribe();

    let entries = ReceiverStream::new(sub.rx).filter_map(move |entry| {
        if !filter.allow(&entry) {
            return None;
        }
        let payload = serde_json::to_string(&entry).unwrap_or_default();
        Some(Ok::<_, Infallible>(Frame::data(Bytes::from(format!(
            "data: {payload}\n\n"
        )))))
    });
    let heartbeats = IntervalStream::new(tokio::time::interval(STREAM_HEARTBEAT))
        .map(|_| Ok::<_, Infallible>(Frame::data(Bytes::from_static(b": keepalive\n\n"))));
    let stream = futures_util::stream::select(entries, heartbeats);

    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_default()
}

fn filter_from(params: &[(String, String)]) -> LogFilter {
    let mut filter = LogFilter::new();
    if params.iter().any(|(k, _)| k == "builtins") {
        filter = filter.with_builtins();
    }
    let excludes: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "exclude")
        .map(|(_, v)| v.clone())
        .collect();
    filter = filter.exclude(excludes);
    if let Some(level) = param(params, "level").and_then(|v| LogLevel::parse(&v)) {
        filter = filter.min_level(level);
    }
    filter
}

fn bearer_of(req: &Request<hyper::body::Incoming>) -> Option<&str> {
    req.headers()
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn strip_segment<'a>(path: &'a str, prefix: &str, suffix: &str) -> &'a str {
    path[prefix.len()..path.len() - suffix.len()].trim_end_matches('/')
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (urldecode(k), urldecode(v)),
            None => (urldecode(p), String::new()),
        })
        .collect()
}

fn param(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> BoxResp {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)).boxed())
        .unwrap_or_default()
}

fn error_response(status: StatusCode, err: &AppError) -> BoxResp {
    json_response(
        status,
        &serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "code": err.code(),
        }),
    )
}

fn action_response(result: Result<()>) -> BoxResp {
    match result {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"success": true})),
        Err(e @ AppError::UnknownService(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn unauthorized() -> BoxResp {
    error_response(StatusCode::UNAUTHORIZED, &AppError::Auth)
}

fn not_found() -> BoxResp {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"not found")).boxed())
        .unwrap_or_default()
}

fn urldecode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b as char);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urldecode_plain() {
        assert_eq!(urldecode("hello"), "hello");
    }

    #[test]
    fn test_urldecode_space() {
        assert_eq!(urldecode("hello%20world"), "hello world");
    }

    #[test]
    fn test_urldecode_incomplete_sequence_passthrough() {
        assert_eq!(urldecode("a%2"), "a%2");
        assert_eq!(urldecode("a%"), "a%");
    }

    #[test]
    fn test_urldecode_service_name() {
        assert_eq!(urldecode("my-service"), "my-service");
        assert_eq!(urldecode("svc%5F1"), "svc_1");
    }

    #[test]
    fn test_parse_query_pairs_and_repeats() {
        let params = parse_query("tail=50&exclude=a&exclude=b%20c&level=error");
        assert_eq!(param(&params, "tail").as_deref(), Some("50"));
        assert_eq!(param(&params, "level").as_deref(), Some("error"));
        let excludes: Vec<&str> = params
            .iter()
            .filter(|(k, _)| k == "exclude")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(excludes, vec!["a", "b c"]);
    }

    #[test]
    fn test_strip_segment() {
        assert_eq!(strip_segment("/services/api/logs", "/services/", "/logs"), "api");
        assert_eq!(
            strip_segment("/services/api/logs/stream", "/services/", "/logs/stream"),
            "api"
        );
    }

    #[test]
    fn test_filter_from_params() {
        let params = parse_query("level=warn&exclude=noise");
        let filter = filter_from(&params);
        let buf = crate::logbuf::LogBuffer::new(
            "api",
            std::sync::Arc::new(crate::logbuf::SequenceSource::default()),
        );
        let warn = buf.append(crate::logbuf::LogStream::Stdout, "[WARN] x".into(), false, None);
        let info = buf.append(crate::logbuf::LogStream::Stdout, "plain".into(), false, None);
        let noisy = buf.append(
            crate::logbuf::LogStream::Stdout,
            "[WARN] noise here".into(),
            false,
            None,
        );
        assert!(filter.allow(&warn));
        assert!(!filter.allow(&info));
        assert!(!filter.allow(&noisy));
    }

    #[test]
    fn test_token_is_urlsafe_base64_of_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let token = mint_token(&dir.path().join(".azure")).unwrap();
        // 32 bytes -> 43 unpadded base64url chars
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        let read_back = read_token(dir.path()).unwrap();
        assert_eq!(read_back, token);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        mint_token(&dir.path().join(".azure")).unwrap();
        let mode = std::fs::metadata(dir.path().join(".azure").join(TOKEN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
