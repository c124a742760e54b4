use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};

/// A runtime record of one allocated port.
#[derive(Debug, Clone)]
pub struct PortClaim {
    pub service: String,
    pub port: u16,
    pub since: DateTime<Utc>,
}

/// Allocates free loopback TCP ports and tracks claims for the lifetime of a
/// supervisor run, so no two services are ever handed the same port.
#[derive(Default)]
pub struct PortBroker {
    claims: Mutex<HashMap<u16, PortClaim>>,
}

impl PortBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe `requested` in order and claim the first bindable candidate;
    /// with no usable candidate, ask the OS for any free port.
    pub fn acquire(&self, service: &str, requested: &[u16]) -> Result<u16> {
        let mut claims = lock(&self.claims);

        for &port in requested {
            if !claims.contains_key(&port) && bindable(port) {
                claims.insert(port, claim(service, port));
                return Ok(port);
            }
        }

        // The OS can briefly re-offer a port we already claimed but have not
        // bound yet, so retry a few times before giving up.
        for _ in 0..16 {
            if let Some(port) = free_port() {
                if !claims.contains_key(&port) {
                    claims.insert(port, claim(service, port));
                    return Ok(port);
                }
            }
        }

        Err(AppError::PortUnavailable {
            service: service.to_string(),
            requested: requested.to_vec(),
        })
    }

    pub fn release(&self, port: u16) {
        lock(&self.claims).remove(&port);
    }

    /// Drop every claim held by one service (primary and debug ports alike).
    pub fn release_service(&self, service: &str) {
        lock(&self.claims).retain(|_, c| c.service != service);
    }

    pub fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.claims).keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn claims(&self) -> Vec<PortClaim> {
        lock(&self.claims).values().cloned().collect()
    }
}

fn claim(service: &str, port: u16) -> PortClaim {
    PortClaim {
        service: service.to_string(),
        port,
        since: Utc::now(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A port is free iff a short-lived listener can bind it on loopback.
fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Bind to port 0 and return the OS-assigned free port.
pub fn free_port() -> Option<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").ok()?;
    Some(listener.local_addr().ok()?.port())
}
