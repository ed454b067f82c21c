//! Agent Handle - echte oder degradierte Verbindung

use crate::signaling::{AgentNotification, SignalingError, Transport, UserAgent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Betriebsmodus des Agent Controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Noch nicht initialisiert
    Uninitialized,
    /// Live-Verbindung zum Signaling-Server
    Real,
    /// Ohne Transport, Calls werden lokal simuliert
    Degraded,
}

/// Registrierungsstatus des Agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Terminated,
}

/// Die aktive Verbindung. Wird beim Moduswechsel ersetzt, nie verändert.
pub enum AgentHandle {
    Real {
        agent: Arc<dyn UserAgent>,
        transport: Transport,
    },
    /// Platzhalter ohne Transport
    Degraded,
}

impl AgentHandle {
    /// Transport der Verbindung; fehlt im degradierten Modus
    pub fn transport(&self) -> Option<&Transport> {
        match self {
            Self::Real { transport, .. } => Some(transport),
            Self::Degraded => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.transport().is_none()
    }

    pub fn mode(&self) -> AgentMode {
        if self.is_degraded() {
            AgentMode::Degraded
        } else {
            AgentMode::Real
        }
    }

    pub fn user_agent(&self) -> Option<&Arc<dyn UserAgent>> {
        match self {
            Self::Real { agent, .. } => Some(agent),
            Self::Degraded => None,
        }
    }

    pub async fn start(&self) -> Result<(), SignalingError> {
        match self {
            Self::Real { agent, .. } => agent.start().await,
            Self::Degraded => Ok(()),
        }
    }

    pub async fn stop(&self) {
        if let Self::Real { agent, .. } = self {
            agent.stop().await;
        }
    }

    /// Zustandsmeldungen; der degradierte Handle meldet nichts
    pub fn subscribe(&self) -> Option<broadcast::Receiver<AgentNotification>> {
        self.user_agent().map(|agent| agent.subscribe())
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real { agent, transport } => f
                .debug_struct("Real")
                .field("uri", &agent.uri().to_string())
                .field("endpoint", &transport.endpoint().as_str())
                .finish(),
            Self::Degraded => f.write_str("Degraded"),
        }
    }
}
