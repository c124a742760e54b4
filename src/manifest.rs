use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{AppError, Result};

pub const MANIFEST_NAME: &str = "azure.yaml";

/// Maximum accepted length of a service name.
const MAX_NAME_LEN: usize = 128;

/// A parsed, validated project manifest.
#[derive(Debug)]
pub struct Project {
    pub name: String,
    pub dir: PathBuf,
    pub services: IndexMap<String, ServiceSpec>,
}

/// Declarative description of one service, resolved from the manifest.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub kind: ServiceKind,
    pub working_dir: PathBuf,
    pub requested_ports: Vec<u16>,
    pub env: IndexMap<String, String>,
    /// Explicit command override; otherwise derived from language/framework.
    pub command: Option<String>,
    pub health: Option<HealthSpec>,
    pub debug: Option<DebugSpec>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ServiceKind {
    Process {
        language: Language,
        framework: Option<String>,
    },
    Container {
        image: String,
        container_port: Option<u16>,
    },
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Process { .. } => "process",
            ServiceKind::Container { .. } => "container",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Language {
    Node,
    Python,
    Go,
    Dotnet,
    Other(String),
}

impl Language {
    pub fn parse(s: &str) -> Language {
        match s.to_ascii_lowercase().as_str() {
            "node" | "js" | "ts" | "javascript" | "typescript" => Language::Node,
            "python" | "py" => Language::Python,
            "go" | "golang" => Language::Go,
            "dotnet" | "csharp" | "c#" => Language::Dotnet,
            other => Language::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSpec {
    #[serde(default)]
    pub path: Option<String>,
    /// Explicit probe override; otherwise chosen by preference order.
    #[serde(default)]
    pub probe: Option<ProbeKind>,
    #[serde(default = "default_slow_threshold", with = "duration_serde")]
    pub slow_threshold: Duration,
    #[serde(default)]
    pub circuit_breaker: Option<BreakerSpec>,
    /// Probes per second; 0 disables the limiter.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default, with = "opt_duration_serde")]
    pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
    Process,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSpec {
    #[serde(default = "default_breaker_failures")]
    pub failures: u32,
    #[serde(default = "default_breaker_open_for", with = "duration_serde")]
    pub open_for: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub wait_for_debugger: bool,
}

fn default_true() -> bool {
    true
}
fn default_slow_threshold() -> Duration {
    Duration::from_secs(1)
}
fn default_breaker_failures() -> u32 {
    5
}
fn default_breaker_open_for() -> Duration {
    Duration::from_secs(60)
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Parse `500ms` / `2s` / `5m` style durations.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(v) = s.strip_suffix("ms") {
        return v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| e.to_string());
    }
    if let Some(v) = s.strip_suffix('m') {
        return v
            .trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|e| e.to_string());
    }
    if let Some(v) = s.strip_suffix('s') {
        return v
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| e.to_string());
    }
    Err(format!("unknown duration format: '{s}' (use '500ms', '2s' or '5m')"))
}

// ---------------------------------------------------------------------------
// Raw on-disk document
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: String,
    #[serde(default)]
    services: IndexMap<String, RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    project: Option<PathBuf>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    ports: Vec<u32>,
    #[serde(default)]
    env: IndexMap<String, String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    docker: Option<RawDocker>,
    #[serde(default)]
    health: Option<HealthSpec>,
    #[serde(default)]
    debug: Option<DebugSpec>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocker {
    #[serde(default)]
    container_port: Option<u16>,
}

/// Load and validate `azure.yaml`.
pub fn load(path: &Path) -> Result<Project> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let raw: RawManifest = serde_yaml::from_str(&src)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut services = IndexMap::new();
    for (name, svc) in raw.services {
        validate_name(&name)?;

        let kind = match (&svc.image, &svc.language) {
            (Some(image), _) => ServiceKind::Container {
                image: image.clone(),
                container_port: svc.docker.as_ref().and_then(|d| d.container_port),
            },
            (None, Some(lang)) => ServiceKind::Process {
                language: Language::parse(lang),
                framework: svc.framework.clone(),
            },
            (None, None) => {
                return Err(AppError::Config(format!(
                    "service '{name}' declares neither a language nor an image"
                )))
            }
        };

        let mut requested_ports = Vec::with_capacity(svc.ports.len());
        for p in &svc.ports {
            if !(1..=65535).contains(p) {
                return Err(AppError::Config(format!(
                    "service '{name}' requests invalid port {p} (must be 1..65535)"
                )));
            }
            requested_ports.push(*p as u16);
        }

        let working_dir = match &svc.project {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => dir.join(p),
            None => dir.clone(),
        };

        services.insert(
            name.clone(),
            ServiceSpec {
                name,
                kind,
                working_dir,
                requested_ports,
                env: svc.env,
                command: svc.command,
                health: svc.health,
                debug: svc.debug,
                depends_on: svc.depends_on,
            },
        );
    }

    // Unknown depends_on references
    for (name, svc) in &services {
        for dep in &svc.depends_on {
            if !services.contains_key(dep) {
                return Err(AppError::Config(format!(
                    "service '{name}' depends_on unknown service '{dep}'"
                )));
            }
        }
    }

    Ok(Project {
        name: raw.name,
        dir,
        services,
    })
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !head_ok || !tail_ok || name.len() > MAX_NAME_LEN {
        return Err(AppError::Config(format!(
            "invalid service name '{name}' (alphanumeric start, [A-Za-z0-9_-], max {MAX_NAME_LEN} chars)"
        )));
    }
    Ok(())
}

/// Persist an assigned port back to the manifest so the next run is stable.
pub fn update_service_port(path: &Path, service: &str, port: u16) -> Result<()> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&src)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let entry = doc
        .get_mut("services")
        .and_then(|s| s.get_mut(service))
        .ok_or_else(|| AppError::UnknownService(service.to_string()))?;
    let mapping = entry
        .as_mapping_mut()
        .ok_or_else(|| AppError::Config(format!("service '{service}' is not a mapping")))?;
    mapping.insert(
        serde_yaml::Value::from("ports"),
        serde_yaml::Value::Sequence(vec![serde_yaml::Value::from(u64::from(port))]),
    );

    let out = serde_yaml::to_string(&doc)
        .map_err(|e| AppError::Config(format!("cannot serialize {}: {e}", path.display())))?;
    std::fs::write(path, out)
        .map_err(|e| AppError::Config(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Resolve the project directory: CLI override, then `AZD_APP_PROJECT_DIR`,
/// then the current directory.
pub fn project_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(p) = cli_override {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("AZD_APP_PROJECT_DIR") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_NAME);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_minimal() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  api:\n    language: node\n    ports: [3000]\n",
        );
        let project = load(&path).unwrap();
        assert_eq!(project.name, "demo");
        let api = &project.services["api"];
        assert_eq!(api.requested_ports, vec![3000]);
        assert!(matches!(
            api.kind,
            ServiceKind::Process {
                language: Language::Node,
                ..
            }
        ));
    }

    #[test]
    fn test_load_container() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  db:\n    image: postgres:16\n    ports: [5432]\n    docker:\n      container_port: 5432\n",
        );
        let project = load(&path).unwrap();
        match &project.services["db"].kind {
            ServiceKind::Container {
                image,
                container_port,
            } => {
                assert_eq!(image, "postgres:16");
                assert_eq!(*container_port, Some(5432));
            }
            other => panic!("expected container, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  web:\n    language: node\n    depends_on: [api]\n",
        );
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("unknown service 'api'"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  api:\n    language: node\n    ports: [0]\n",
        );
        assert!(load(&path).is_err());
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  api:\n    language: node\n    ports: [70000]\n",
        );
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  -bad:\n    language: node\n",
        );
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_neither_language_nor_image_rejected() {
        let (_dir, path) = write_manifest("name: demo\nservices:\n  api: {}\n");
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_update_service_port_roundtrip() {
        let (_dir, path) = write_manifest(
            "name: demo\nservices:\n  api:\n    language: node\n    ports: [3000]\n",
        );
        update_service_port(&path, "api", 3001).unwrap();
        let project = load(&path).unwrap();
        assert_eq!(project.services["api"].requested_ports, vec![3001]);
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("2 fortnights").is_err());
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!(Language::parse("TypeScript"), Language::Node);
        assert_eq!(Language::parse("py"), Language::Python);
        assert_eq!(Language::parse("golang"), Language::Go);
        assert_eq!(Language::parse("csharp"), Language::Dotnet);
        assert_eq!(Language::parse("ruby"), Language::Other("ruby".into()));
    }
}
