use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("dependency graph error: {0}")]
    DependencyGraph(String),

    #[error("no usable port for '{service}': requested {requested:?} and the OS refused to allocate one")]
    PortUnavailable { service: String, requested: Vec<u16> },

    #[error("failed to start '{service}': {msg}")]
    Spawn { service: String, msg: String },

    #[error("'{service}' did not become ready within {secs}s")]
    ReadinessTimeout { service: String, secs: u64 },

    #[error("'{service}' exited with code {code}")]
    ChildFailure { service: String, code: i32 },

    #[error("health check error: {0}")]
    HealthCheck(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("unknown service: '{0}'")]
    UnknownService(String),

    #[error("no supervisor is running for this project (start one with `azd-app run`)")]
    NotRunning,

    #[error("missing or invalid dashboard token")]
    Auth,

    #[error("rate limited")]
    RateLimited,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Stable machine-readable code for `--format json` error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::DependencyGraph(_) => "dependency_graph_error",
            AppError::PortUnavailable { .. } => "port_unavailable",
            AppError::Spawn { .. } => "spawn_error",
            AppError::ReadinessTimeout { .. } => "readiness_timeout",
            AppError::ChildFailure { .. } => "child_failure",
            AppError::HealthCheck(_) => "health_check_error",
            AppError::Registry(_) => "registry_error",
            AppError::UnknownService(_) => "unknown_service",
            AppError::NotRunning => "not_running",
            AppError::Auth => "auth_error",
            AppError::RateLimited => "rate_limited",
            AppError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
