use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Planned,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceStatus::Planned => "planned",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }

    /// States in which the service has (or should have) a live process.
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Ready)
    }

    /// Terminal unless an explicit restart is requested.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }

    /// Legal transitions of the per-service state machine.
    pub fn can_transition(&self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, to) {
            (Planned, Starting) | (Planned, Stopping) => true,
            (Starting, Ready) | (Starting, Failed) | (Starting, Stopping) => true,
            (Ready, Stopping) | (Ready, Failed) => true,
            (Stopping, Stopped) => true,
            // Restart re-enters the machine from a terminal state.
            (Stopped, Starting) | (Failed, Starting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
